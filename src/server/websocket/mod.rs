//! WebSocket change feed.

mod handler;
pub mod messages;

pub use handler::ws_handler;
