//! lbsd — the coordinator's bootstrap server.
//!
//! `engine` is the synchronous join/rekey state machine, `service` runs it
//! as a tokio task, and `bridge` connects it to a PLC modem adapter over UDP.

pub mod bridge;
pub mod engine;
pub mod service;

pub use engine::{BootstrapEngine, EngineError, ParamAttribute, ParamStatus};
pub use service::{BootstrapService, Command, ServiceError, ServiceHandle};
