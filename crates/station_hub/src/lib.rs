//! Orchestrator side of the station event synchronization layer.

pub mod config;
pub mod demo;
pub mod hub;
pub mod routes;

pub use config::{load_settings, HubSettings};
pub use hub::{Attachment, DialogOutcome, DialogTicket, HubConnector, OrchestratorHub};
pub use routes::build_router;
