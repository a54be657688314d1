//! EVM chain access for passport anchoring.
//!
//! [`EvmAnchorChain`] implements [`passport_anchor_service::AnchorChain`] on top of alloy. Reads go
//! through a typed provider with a raw JSON-RPC fallback, endpoints are picked from a priority
//! ordered pool with a cooldown for failing ones, and fees are derived from node estimates clamped
//! to configured floors.
mod chain;
mod client;
mod config;
mod contract;
mod endpoints;
mod fees;
mod metrics;
mod raw_rpc;
mod transport;


pub use chain::{block_ranges, EvmAnchorChain};
pub use client::{ChainLog, HttpConnector, RpcClient};
pub use config::{ConfirmationConfig, EndpointConfig, EvmConfig, Network};
pub use contract::{anchor_calldata, Anchored};
pub use endpoints::{Connector, Endpoint, EndpointSelector};
pub use fees::{FeeConfig, FeePlan, FeeSnapshot, GWEI};
pub use metrics::Metrics;
pub use raw_rpc::RawRpcClient;
pub use transport::with_raw_fallback;
