//! Gateway wiring: shared state, listener and accept loop

mod server;
mod state;

pub use server::{Gateway, shutdown_signal};
pub use state::{CallError, GatewaySettings, GatewayState};
