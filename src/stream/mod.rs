//! Realtime flow modules.
//!
//! - `client`: websocket worker, heartbeats, reconnects and the public facade.
//! - `proto`: frames exchanged with the flow service.
//! - `registry`: one listener per subscribed flow.
//! - `correlator`: search ids and pending replies with deadlines.
//! - `normalize`: tagged wire values to plain JSON.

/// Websocket connection worker and flow operations.
pub mod client;
/// Search request/reply correlation.
pub mod correlator;
/// Tagged value normalization.
pub mod normalize;
/// Flow protocol frames.
pub mod proto;
/// Subscription listener registry.
pub mod registry;
