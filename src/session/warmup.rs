use std::time::Duration;

use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, Request};
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;

/// Handle to a warmup ping. Cloning shares the same request.
pub type Warmup = Shared<BoxFuture<'static, ()>>;

/// Best-effort HTTP ping that wakes a cold backend before the socket opens.
///
/// At most one ping is sent per manager. Every outcome is logged and swallowed, so awaiting
/// a [`Warmup`] never fails.
#[derive(Debug)]
pub struct ServerWarmupManager {
    health_url: Url,
    client: ReqwestClient,
    timeout: Duration,
    warmup: Option<Warmup>,
}

impl ServerWarmupManager {
    /// Build a warmup manager for the backend serving `socket_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP address cannot be derived or the HTTP client cannot be
    /// created.
    pub fn new(socket_url: &Url, config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();

        headers.insert("User-Agent", HeaderValue::from_static("tabletop_realtime"));
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        Ok(Self {
            health_url: health_url_for(socket_url, &config.warmup_path)?,
            client,
            timeout: config.warmup_timeout,
            warmup: None,
        })
    }

    /// Address the ping is sent to.
    #[must_use]
    pub fn health_url(&self) -> &Url {
        &self.health_url
    }

    /// Whether a ping is currently outstanding.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.warmup
            .as_ref()
            .is_some_and(|warmup| warmup.peek().is_none())
    }

    /// Start the ping on first call. Later calls return the same ping, settled or not.
    ///
    /// The returned future does nothing until polled; callers that do not want to wait for
    /// it should spawn it.
    pub fn ensure_warmup(&mut self) -> Warmup {
        if let Some(warmup) = &self.warmup {
            #[cfg(feature = "tracing")]
            tracing::trace!(settled = warmup.peek().is_some(), "Reusing warmup ping");
            return warmup.clone();
        }

        let client = self.client.clone();
        let request = Request::new(Method::GET, self.health_url.clone());
        let timeout = self.timeout;

        let warmup = async move {
            match tokio::time::timeout(timeout, ping(&client, request)).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Server warmup complete");
                }
                Ok(Err(e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Server warmup failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
                Err(_elapsed) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(?timeout, "Server warmup timed out");
                }
            }
        }
        .boxed()
        .shared();

        self.warmup = Some(warmup.clone());
        warmup
    }
}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip(client, request),
        fields(url = %request.url(), status_code)
    )
)]
async fn ping(client: &ReqwestClient, request: Request) -> Result<()> {
    let method = request.method().clone();
    let path = request.url().path().to_owned();

    let response = client.execute(request).await?;
    let status_code = response.status();

    #[cfg(feature = "tracing")]
    tracing::Span::current().record("status_code", status_code.as_u16());

    if !status_code.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::status(status_code, method, path, message));
    }

    Ok(())
}

/// Map a socket address to the health-check address on the same host.
///
/// `ws` becomes `http` and `wss` becomes `https`. Path and query are replaced.
pub fn health_url_for(socket_url: &Url, path: &str) -> Result<Url> {
    let scheme = match socket_url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(Error::validation(format!(
                "cannot derive a health-check address from scheme `{other}`"
            )));
        }
    };

    let mut url = socket_url.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::validation(format!("cannot switch `{socket_url}` to {scheme}")))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}
