//! Testing infrastructure.
//!
//! Scriptable mock implementations of the chain seam so every dispatch
//! property can be exercised without a network: probe failures, nonce
//! counts, receipt schedules, captured raw transactions.

pub mod mock_chain;

pub use mock_chain::{
    mock_pipeline, mock_pool, MockChainClient, MockChainFactory, ReceiptBehavior,
    TEST_PRIVATE_KEY,
};
