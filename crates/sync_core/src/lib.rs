//! Console side of the station event synchronization layer.
//!
//! [`SyncFacade`] owns mirror copies of the status registry, dialog arbiter
//! and terminal feed, fed by a reconnecting [`ChannelTransport`]. The same
//! components back the orchestrator hub, which is the single writer.

pub mod dialog_arbiter;
pub mod facade;
pub mod settings;
pub mod status_registry;
pub mod subscription;
pub mod terminal;
pub mod transport;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use dialog_arbiter::{DialogArbiter, DialogNotice, PendingDialog};
pub use facade::SyncFacade;
pub use settings::{load_settings, load_settings_from, SyncSettings};
pub use status_registry::{StatusChange, StatusNotice, StatusRegistry, StatusWrite};
pub use subscription::{Subscription, SubscriptionId};
pub use terminal::{TerminalChunk, TerminalItem, TerminalMultiplexer};
pub use transport::{
    ChannelTransport, ConnectionHandle, ConnectionState, Connector, EpochTransition, InboundFrame,
    Link, WsConnector,
};
