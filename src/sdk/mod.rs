//! High-level session API over the streaming protocol.
//!
//! A [`Session`] owns one connection plus its audio, video and tool pipelines.
//! The low-level protocol types stay accessible through `crate::protocol`.

mod builder;
pub mod events;
mod session;
mod tools;
pub mod transport;

pub use builder::{Realtime, RealtimeBuilder};
pub use events::{EventStream, SessionEvent, SessionState};
pub use session::{Session, SessionHandle, SessionOptions};
pub use tools::{BoxFuture as ToolFuture, ToolCall, ToolDefinition, ToolRegistry, ToolResult};
pub use transport::Transport;
