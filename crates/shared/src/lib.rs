//! Message shapes shared by the orchestrator hub and its consoles.

pub mod domain;
pub mod error;
pub mod protocol;
