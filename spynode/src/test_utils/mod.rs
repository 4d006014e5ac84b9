//! Builders and mocks shared by unit tests and downstream test suites.

mod chain;
mod handler;

pub use chain::{block_on, chain_of, coinbase, next_header, p2pkh_script, tx_paying, tx_spending};
pub use handler::{Event, MockOutputFetcher, MockTxFetcher, RecordingHandler};
