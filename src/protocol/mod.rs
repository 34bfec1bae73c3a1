//! Wire types exchanged with the streaming service.

pub mod client_events;
pub mod models;
pub mod server_events;
