//! Rust client for the flow streaming service.
//!
//! The crate is organized by transport surface:
//! - `session_api`: HTTP exchange of account credentials for a session id.
//! - `stream`: websocket session with subscriptions and searches multiplexed
//!   over one socket.
//! - `retry`: backoff, retry and reconnect policies.

/// Retry and reconnect policies used across the SDK.
pub mod retry;
/// Credentials and the session acquisition client.
pub mod session_api;
/// Realtime flow client, protocol frames, and correlation state.
pub mod stream;

pub use session_api::{Credentials, SessionId};
pub use stream::client::{
    ConnectionState, FlowApi, FlowClient, FlowClientError, FlowClientOptions, FlowConnection,
    SearchHandle,
};
pub use stream::correlator::SearchError;
