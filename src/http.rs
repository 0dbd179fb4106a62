use std::sync::Arc;

use bytes::Bytes;
use http::uri::Scheme;
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(data.into())
        .map_err(|e| match e {})
        .boxed()
}

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(|e| match e {}).boxed()
}

/// Convert a hyper `Incoming` body into our boxed body type.
pub fn incoming_to_body(incoming: Incoming) -> Body {
    incoming.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// HTTP client for the origin side of the proxy.
///
/// Opens a fresh connection per request, so concurrent requests to the
/// same origin never queue behind one another. Each connection task is
/// spawned with upgrade support, which keeps `101 Switching Protocols`
/// responses exportable as raw sockets.
#[derive(Clone)]
pub struct OriginClient {
    tls: TlsConnector,
}

impl OriginClient {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Issue `req` to the origin named by its absolute URI.
    ///
    /// The scheme and authority pick the connect address; the request
    /// itself goes out in origin-form.
    pub async fn request(&self, mut req: Request<Body>) -> Result<Response<Incoming>, BoxError> {
        let uri = req.uri().clone();
        let host = uri.host().ok_or("origin uri has no host")?.to_string();
        let https = uri.scheme() == Some(&Scheme::HTTPS);
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        *req.uri_mut() = origin_form(&uri);

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        let mut sender = if https {
            let name = ServerName::try_from(host)?;
            spawn_connection(self.tls.connect(name, tcp).await?).await?
        } else {
            spawn_connection(tcp).await?
        };

        Ok(sender.send_request(req).await?)
    }
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn spawn_connection<T>(io: T) -> Result<http1::SendRequest<Body>, BoxError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "origin connection error");
        }
    });
    Ok(sender)
}

fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}
