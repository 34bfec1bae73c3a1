//! Network transports: the streaming WebSocket and the relay store REST API.

pub mod rest;
pub mod ws;
