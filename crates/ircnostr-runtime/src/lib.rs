//! Bridging engine
//!
//! Builds the per-bridge pipelines on top of process-wide shared resources:
//! - `registry`: reference-counted, lazily started shared resources
//! - `multiplexer`: one IRC connection per connection identity
//! - `session`: one joined channel per connection and channel
//! - `subscription`: restartable relay subscriptions
//! - `profile`: cached profile resolution
//! - `forward`: the Nostr to IRC and IRC to Nostr pipelines
//! - `bridge` and `orchestrator`: wiring and lifecycle

pub mod bridge;
pub mod forward;
pub mod multiplexer;
pub mod orchestrator;
pub mod profile;
pub mod registry;
pub mod session;
pub mod subscription;

pub use bridge::{Bridge, BridgeServices};
pub use forward::BridgeContext;
pub use multiplexer::{ConnectionLease, ConnectionMultiplexer, SharedConnection};
pub use orchestrator::Orchestrator;
pub use profile::{ProfileResolver, ProfileStore};
pub use registry::{wait_ready, Lease, Shared, SharedRegistry, SharedWatch};
pub use session::{ChannelSession, SessionLease, SessionManager};
pub use subscription::{EventSubscription, SeenEvents};
