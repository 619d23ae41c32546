//! Checked 64-bit arithmetic for money amounts.
//!
//! Amounts are plain `u64`. Nothing here uses floating point: exchange rates
//! are exact [`Ratio`]s and scaling goes through 128-bit intermediates so that
//! `a * b / c` never overflows before the division.

use crate::error::ArithmeticError;
use std::cmp::Ordering;
use std::fmt;

/// `floor(a * b / c)` with a 128-bit intermediate.
///
/// # Errors
/// Returns `ArithmeticError::DivisionByZero` if `c == 0`, or
/// `ArithmeticError::Overflow` if the quotient does not fit in a `u64`.
pub fn multiply_divide_floor(a: u64, b: u64, c: u64) -> Result<u64, ArithmeticError> {
    if c == 0 {
        return Err(ArithmeticError::DivisionByZero);
    }
    let q = u128::from(a) * u128::from(b) / u128::from(c);
    u64::try_from(q).map_err(|_| ArithmeticError::Overflow)
}

/// `ceil(a * b / c)` with a 128-bit intermediate.
///
/// # Errors
/// Same as [`multiply_divide_floor`].
pub fn multiply_divide_ceil(a: u64, b: u64, c: u64) -> Result<u64, ArithmeticError> {
    if c == 0 {
        return Err(ArithmeticError::DivisionByZero);
    }
    let q = (u128::from(a) * u128::from(b)).div_ceil(u128::from(c));
    u64::try_from(q).map_err(|_| ArithmeticError::Overflow)
}

/// `floor(a * b / c)`, saturating to `u64::MAX` on overflow or a zero divisor.
#[must_use]
pub fn multiply_divide_saturating(a: u64, b: u64, c: u64) -> u64 {
    multiply_divide_floor(a, b, c).unwrap_or(u64::MAX)
}

/// Number of decimal digits in `value` (`0` has none).
#[must_use]
pub fn count_digits(value: u64) -> u32 {
    if value == 0 { 0 } else { value.ilog10() + 1 }
}

/// An exact non-negative rational number, used for exchange rates.
///
/// The denominator is never zero.
#[derive(Clone, Copy)]
pub struct Ratio {
    numerator: u64,
    denominator: u64,
}

impl Ratio {
    /// One.
    pub const ONE: Self = Self {
        numerator: 1,
        denominator: 1,
    };

    /// Create `numerator / denominator`.
    ///
    /// # Errors
    /// Returns `ArithmeticError::DivisionByZero` if `denominator == 0`.
    pub fn new(numerator: u64, denominator: u64) -> Result<Self, ArithmeticError> {
        if denominator == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Numerator.
    #[must_use]
    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    /// Denominator.
    #[must_use]
    pub fn denominator(&self) -> u64 {
        self.denominator
    }

    /// Whether the ratio is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.numerator == 0
    }

    /// `floor(amount * self)`, saturating.
    #[must_use]
    pub fn multiply_floor(&self, amount: u64) -> u64 {
        multiply_divide_saturating(amount, self.numerator, self.denominator)
    }

    /// `ceil(amount * self)`, saturating.
    #[must_use]
    pub fn multiply_ceil(&self, amount: u64) -> u64 {
        multiply_divide_ceil(amount, self.numerator, self.denominator).unwrap_or(u64::MAX)
    }

    /// `floor(amount / self)`, saturating. Dividing by zero yields `u64::MAX`.
    #[must_use]
    pub fn divide_floor(&self, amount: u64) -> u64 {
        multiply_divide_saturating(amount, self.denominator, self.numerator)
    }

    /// `self * (1 - slippage)`, with `slippage` clamped to `[0, 1]`.
    ///
    /// Precision is reduced if the exact product does not fit in 64 bits,
    /// always rounding the result down.
    #[must_use]
    pub fn reduce_by(&self, slippage: Ratio) -> Ratio {
        let kept = slippage.denominator.saturating_sub(slippage.numerator);
        let mut num = u128::from(self.numerator) * u128::from(kept);
        let mut den = u128::from(self.denominator) * u128::from(slippage.denominator);
        while num > u128::from(u64::MAX) || den > u128::from(u64::MAX) {
            num >>= 1;
            den = (den + 1) >> 1;
        }
        Ratio {
            numerator: num as u64,
            denominator: (den as u64).max(1),
        }
    }
}

impl Default for Ratio {
    fn default() -> Self {
        Self::ONE
    }
}

impl PartialEq for Ratio {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ratio {}

impl Ord for Ratio {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = u128::from(self.numerator) * u128::from(other.denominator);
        let rhs = u128::from(other.numerator) * u128::from(self.denominator);
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ratio({}/{})", self.numerator, self.denominator)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_multiply_divide_no_intermediate_overflow() {
        // 2^64-1 * 1500 would overflow a u64 before dividing
        assert_eq!(multiply_divide_floor(u64::MAX, 1500, 3000), Ok(u64::MAX / 2));
        assert_eq!(multiply_divide_floor(2000, 1500, 2000), Ok(1500));
        assert_eq!(multiply_divide_floor(7, 1, 2), Ok(3));
        assert_eq!(multiply_divide_ceil(7, 1, 2), Ok(4));
        assert_eq!(multiply_divide_ceil(8, 1, 2), Ok(4));
    }

    #[test]
    fn test_multiply_divide_errors() {
        assert_eq!(multiply_divide_floor(1, 1, 0), Err(ArithmeticError::DivisionByZero));
        assert_eq!(multiply_divide_floor(u64::MAX, 2, 1), Err(ArithmeticError::Overflow));
        assert_eq!(multiply_divide_saturating(u64::MAX, 2, 1), u64::MAX);
    }

    #[test]
    fn test_count_digits() {
        assert_eq!(count_digits(0), 0);
        assert_eq!(count_digits(9), 1);
        assert_eq!(count_digits(10), 2);
        assert_eq!(count_digits(500), 3);
        assert_eq!(count_digits(u64::MAX), 20);
    }

    #[test]
    fn test_ratio_scaling() {
        let half = Ratio::new(1, 2).unwrap();
        assert_eq!(half.multiply_floor(1001), 500);
        assert_eq!(half.multiply_ceil(1001), 501);
        assert_eq!(half.divide_floor(500), 1000);
        assert!(Ratio::new(1, 0).is_err());
        assert_eq!(Ratio::new(0, 1).unwrap().divide_floor(5), u64::MAX);
    }

    #[test]
    fn test_ratio_ordering() {
        let a = Ratio::new(1, 2).unwrap();
        let b = Ratio::new(2, 4).unwrap();
        let c = Ratio::new(2, 3).unwrap();
        assert_eq!(a, b);
        assert!(a < c);
    }

    #[test]
    fn test_reduce_by_slippage() {
        let rate = Ratio::new(1, 2).unwrap();
        let min = rate.reduce_by(Ratio::new(1, 100).unwrap());
        assert_eq!(min.multiply_floor(1000), 495);

        let huge = Ratio::new(u64::MAX, 3).unwrap();
        let reduced = huge.reduce_by(Ratio::new(1, 100).unwrap());
        assert!(reduced < huge);
        assert!(reduced.denominator() > 0);

        // slippage above 100% clamps to zero
        let none = rate.reduce_by(Ratio::new(3, 2).unwrap());
        assert!(none.is_zero());
    }

    proptest! {
        #[test]
        fn floor_never_exceeds_ceil(a in any::<u64>(), b in any::<u64>(), c in 1u64..) {
            if let (Ok(f), Ok(ce)) = (multiply_divide_floor(a, b, c), multiply_divide_ceil(a, b, c)) {
                prop_assert!(f <= ce);
                prop_assert!(ce - f <= 1);
            }
        }

        #[test]
        fn reduced_rate_never_exceeds_rate(n in any::<u64>(), d in 1u64.., s in 0u64..100) {
            let rate = Ratio::new(n, d).unwrap();
            let reduced = rate.reduce_by(Ratio::new(s, 100).unwrap());
            prop_assert!(reduced <= rate);
        }
    }
}
