#![allow(dead_code)]

use std::net::SocketAddr;

use axum::Router;
use swivel::{Proxy, ProxyBuilder};
use tokio::net::TcpListener;

/// Start an upstream returning `body` on every path.
pub async fn start_http_upstream(body: &'static str) -> SocketAddr {
    let app = Router::new().fallback(move || async move { body });
    serve(app).await
}

/// Start an upstream echoing the request line and headers back in the
/// response body, one per line.
pub async fn start_echo_upstream() -> SocketAddr {
    let app = Router::new().fallback(|req: axum::extract::Request| async move {
        let mut out = format!("{} {}\n", req.method(), req.uri());
        for (name, value) in req.headers() {
            out.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("<bin>")));
        }
        out
    });
    serve(app).await
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

pub async fn start_proxy(target: &str) -> SocketAddr {
    start_built_proxy(Proxy::builder().target(target).unwrap()).await
}

pub async fn start_built_proxy(builder: ProxyBuilder) -> SocketAddr {
    let proxy = builder.build().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { proxy.listen_on(listener).await.unwrap() });
    addr
}
