use crate::call::relay::RelayStore;
use crate::error::{Error, Result, ServerError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt as _};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

/// Body of a rejected request, e.g. `{"error": "Permission denied"}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Turn a non-success reply into [`Error::Api`], keeping the relay's message
/// when the body carries one.
fn api_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body).map_or_else(
        |_| {
            let body = body.trim();
            if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.to_string()
            }
        },
        |parsed| parsed.error,
    );
    Error::Api(ServerError {
        code: Some(i32::from(status.as_u16())),
        message,
        status: status.canonical_reason().map(str::to_string),
    })
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status, &body))
}

/// Relay store over a JSON REST database (`{base}/{path}.json`).
///
/// Writes map to `PUT`, appends to `POST` and deletes to `DELETE`. Watching
/// polls the path and yields only when its value changes.
#[derive(Clone, Debug)]
pub struct RestRelay {
    client: Client,
    base: Url,
    auth: Option<String>,
    poll_interval: Duration,
}

impl RestRelay {
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: &str, auth: Option<String>) -> Result<Self> {
        Self::new_with_timeouts(base_url, auth, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        base_url: &str,
        auth: Option<String>,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client,
            base,
            auth,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[allow(clippy::result_large_err)]
    fn url(&self, path: &str) -> Result<Url> {
        let path = path.trim_matches('/');
        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(Error::Relay(format!("invalid relay path: {path:?}")));
        }
        let mut url = self.base.join(&format!("{path}.json"))?;
        if let Some(auth) = &self.auth {
            url.query_pairs_mut().append_pair("auth", auth);
        }
        Ok(url)
    }

    async fn fetch(&self, path: &str) -> Result<Option<Value>> {
        let response = self.client.get(self.url(path)?).send().await?;
        let value: Value = check(response).await?.json().await?;
        Ok((!value.is_null()).then_some(value))
    }
}

#[async_trait]
impl RelayStore for RestRelay {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.fetch(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let response = self.client.put(self.url(path)?).json(&value).send().await?;
        check(response).await.map(|_| ())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let response = self.client.post(self.url(path)?).json(&value).send().await?;
        let res: PushResponse = check(response).await?.json().await?;
        Ok(res.name)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let response = self.client.delete(self.url(path)?).send().await?;
        check(response).await.map(|_| ())
    }

    fn watch(&self, path: &str) -> BoxStream<'static, Result<Option<Value>>> {
        let relay = self.clone();
        let path = path.to_string();

        // `last` is `None` until the first successful read, so the current
        // value is always yielded once.
        stream::unfold(
            (relay, path, true, None::<Option<Value>>),
            |(relay, path, mut first, mut last)| async move {
                loop {
                    if !first {
                        tokio::time::sleep(relay.poll_interval).await;
                    }
                    first = false;
                    match relay.fetch(&path).await {
                        Ok(current) if last.as_ref() == Some(&current) => {}
                        Ok(current) => {
                            last = Some(current.clone());
                            return Some((Ok(current), (relay, path, first, last)));
                        }
                        Err(err) => {
                            tracing::debug!(path = %path, "Relay poll failed: {err}");
                            return Some((Err(err), (relay, path, first, last)));
                        }
                    }
                }
            },
        )
        .boxed()
    }
}
