pub mod chain;
pub mod config;
pub mod error;
pub mod explorer;
pub mod jobs;
pub mod limiter;
pub mod nonce;
pub mod pipeline;
pub mod store;
pub mod testing; // Testing infrastructure (mock chain seam)
pub mod token;
pub mod utils;

// Re-export the components a front-end wires together.
pub use chain::{ChainClient, ClientFactory, EndpointPool, EvmClientFactory};
pub use error::{DispatchError, Result, RetryPolicy};
pub use jobs::{EngineSettings, JobEngine, JobMode, JobProgress, JobState};
pub use limiter::ApiRateLimiter;
pub use nonce::{NonceAuthority, NonceTicket};
pub use pipeline::{CallSpec, GasPolicy, SenderAccount, TransactionPipeline};
pub use store::{JobStore, MemoryJobStore};
pub use token::TokenService;
