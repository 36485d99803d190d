mod server;
mod state;
pub mod websocket;

pub use server::{make_app, run_server};
pub use state::{GuardedChangeLog, GuardedCoordinator, GuardedHub, ServerState};
