//! Test fixtures.

mod two_party;

pub use two_party::{CLIENT_ACCOUNT, SERVER_ACCOUNT, TwoParty, fast_config};
