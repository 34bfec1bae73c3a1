use crate::error::Result;
use reqwest::header::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Establish a WebSocket connection to the streaming service.
///
/// The API key is sent both as the `key` query parameter and as a bearer header.
///
/// # Errors
/// Returns an error if the endpoint is invalid or the handshake fails.
pub async fn connect(endpoint: &str, api_key: &str) -> Result<WsStream> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut().append_pair("key", api_key);

    let auth_header = HeaderValue::from_str(&format!("Bearer {api_key}"))?;

    let mut req = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
        url.as_str(),
    )?;
    let h = req.headers_mut();
    h.insert(reqwest::header::AUTHORIZATION, auth_header);
    let (ws_stream, _) = connect_async(req).await?;

    tracing::info!(host = url.host_str().unwrap_or_default(), "Connected to streaming service");

    Ok(ws_stream)
}
