//! Chain access layer.
//!
//! The network is consumed through the [`ChainClient`] capability: the
//! handful of node operations the dispatch core needs, nothing more. The
//! [`EndpointPool`] owns endpoint health state and hands out connected
//! clients with failover.

pub mod client;
pub mod pool;

pub use client::{ChainClient, ClientFactory, EvmChainClient, EvmClientFactory};
pub use pool::{Endpoint, EndpointPool, EndpointProbe, PoolStats};
