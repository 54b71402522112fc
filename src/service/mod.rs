//! Service orchestration: request handling and the server lifecycle

pub mod pserver;
pub mod server;

pub use pserver::{PserverService, ServiceState};
pub use server::PserverServer;
