use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerMessage;
use crate::{RealtimeClient, Result};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Bidirectional message channel to the streaming service.
///
/// `next_event` must be cancel-safe: the session polls it inside `select!`.
pub trait Transport: Send {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>>;
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

pub(crate) struct WsTransport {
    client: RealtimeClient,
}

impl WsTransport {
    pub(crate) const fn new(client: RealtimeClient) -> Self {
        Self { client }
    }
}

impl Transport for WsTransport {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.client.send(event).await })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>>> {
        Box::pin(async move { self.client.next_message().await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.client.close().await })
    }
}
