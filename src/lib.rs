pub mod config;
mod forward;
mod headers;
pub mod http;
mod switch;
pub mod tunnel;

use std::future::Future;
use std::sync::Arc;

use ::http::{StatusCode, Uri};
use anyhow::Context as _;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::http::{full_body, OriginClient};
pub use crate::headers::HeaderPolicy;

pub(crate) struct Shared {
    pub(crate) target: String,
    pub(crate) policy: Option<HeaderPolicy>,
    pub(crate) client: OriginClient,
}

/// Builder for configuring a [`Proxy`].
pub struct ProxyBuilder {
    target: Option<String>,
    policy: Option<HeaderPolicy>,
    client: Option<OriginClient>,
}

impl ProxyBuilder {
    /// Set the origin base URI. All inbound request paths are appended to
    /// it; a trailing slash is trimmed.
    pub fn target(mut self, uri: &str) -> anyhow::Result<Self> {
        let trimmed = uri.trim_end_matches('/');
        anyhow::ensure!(!trimmed.is_empty(), "target must not be empty");
        let parsed: Uri = trimmed.parse().context("invalid target uri")?;
        let scheme = parsed
            .scheme_str()
            .context("target uri must carry a scheme")?;
        anyhow::ensure!(
            scheme == "http" || scheme == "https",
            "unsupported target scheme {scheme:?}"
        );
        anyhow::ensure!(parsed.authority().is_some(), "target uri must carry a host");
        self.target = Some(trimmed.to_string());
        Ok(self)
    }

    /// Merge fixed headers into every origin request; an entry replaces
    /// the derived header of the same name.
    pub fn override_headers<N, V>(
        mut self,
        pairs: impl IntoIterator<Item = (N, Vec<V>)>,
    ) -> anyhow::Result<Self>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        self.policy = Some(HeaderPolicy::overrides(pairs)?);
        Ok(self)
    }

    /// Replace the derived origin headers wholesale with the function's
    /// return value.
    pub fn transform_headers(
        mut self,
        f: impl Fn(::http::HeaderMap) -> ::http::HeaderMap + Send + Sync + 'static,
    ) -> Self {
        self.policy = Some(HeaderPolicy::transform(f));
        self
    }

    /// Use an externally supplied origin client instead of the default.
    pub fn origin_client(mut self, client: OriginClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> anyhow::Result<Proxy> {
        let target = self.target.context("target is required")?;
        Ok(Proxy {
            shared: Arc::new(Shared {
                target,
                policy: self.policy,
                client: self.client.unwrap_or_default(),
            }),
        })
    }
}

/// A configured reverse proxy.
///
/// Cheaply cloneable via an internal `Arc`.
#[derive(Clone)]
pub struct Proxy {
    shared: Arc<Shared>,
}

impl Proxy {
    /// Create a new builder.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder {
            target: None,
            policy: None,
            client: None,
        }
    }

    /// Bind to `addr` and run the accept loop.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.listen_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn listen_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, target = %self.shared.target, "proxy listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(stream).await {
                    tracing::debug!(peer = %peer, error = %e, "connection error");
                }
            });
        }
    }

    /// Run the accept loop until `shutdown` resolves.
    pub async fn listen_with_shutdown(
        &self,
        addr: impl ToSocketAddrs,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        tokio::select! {
            result = self.listen(addr) => result,
            _ = shutdown => {
                tracing::info!("shutting down");
                Ok(())
            }
        }
    }

    /// Serve HTTP/1.1 on an already-accepted connection, with upgrade
    /// support so switched connections can leave the server behind.
    pub async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let shared = self.shared.clone();
        let service = service_fn(move |req| {
            let shared = shared.clone();
            async move {
                match forward::handle(&shared, req).await {
                    Ok(resp) => Ok::<_, std::convert::Infallible>(resp),
                    Err(e) => {
                        tracing::warn!(error = %e, "proxy cycle failed");
                        Ok(::http::Response::builder()
                            .status(StatusCode::BAD_GATEWAY)
                            .body(full_body("bad gateway"))
                            .unwrap())
                    }
                }
            }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
            .map_err(Into::into)
    }
}
