//! WebSocket module for upstream connection management

mod client;
mod interest;
mod manager;

pub use client::{Frame, WebSocketClient};
pub use interest::{Action, ControlMessage, LiveInterest};
pub(crate) use manager::Command;
pub use manager::{backoff_delay, CommandSink, ConnectionManager};
