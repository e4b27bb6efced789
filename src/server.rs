//! The development proxy.
//!
//! Sits in front of the upstream site, forwards every request to it and
//! injects the live reload client into HTML responses, so that the real
//! backend renders pages while the local pipelines provide the assets.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use console::style;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::reload::{LiveReload, Signal, client_script};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Couldn't bind the proxy to port {0}.\n{1}")]
    Bind(u16, std::io::Error),

    #[error("Couldn't start live reload.\n{0}")]
    Reload(std::io::Error),

    #[error("Couldn't create HTTP client.\n{0}")]
    Client(#[from] reqwest::Error),
}

/// Request headers that only make sense between two hops.
const HOP_HEADERS: [header::HeaderName; 5] = [
    header::HOST,
    header::CONNECTION,
    header::ACCEPT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

struct Proxy {
    client: reqwest::Client,
    /// Upstream origin, e.g. `http://mintclothier.dev`.
    upstream: String,
    /// Origin of the proxy itself.
    local: String,
    script: String,
}

/// Handle to the proxy thread. Dropping it leaves the proxy running in the
/// background for as long as the process lives.
pub struct RunningServer {
    url: String,
    reload: LiveReload,
    thread: thread::JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reload_port(&self) -> u16 {
        self.reload.port()
    }

    /// Blocks for as long as the proxy serves, which is normally until the
    /// process is killed.
    pub fn wait(self) -> anyhow::Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => anyhow::bail!("proxy thread panicked"),
        }
    }
}

/// Starts live reload and the proxy. Returns once both are listening; the
/// proxy keeps serving on its own thread.
pub fn start(config: &ServerConfig, signals: Receiver<Signal>) -> Result<RunningServer, ServerError> {
    let reload = LiveReload::listen(config.reload_port, signals).map_err(ServerError::Reload)?;

    let address = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(address).map_err(|e| ServerError::Bind(config.port, e))?;
    let port = listener
        .local_addr()
        .map_err(|e| ServerError::Bind(config.port, e))?
        .port();
    listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::Bind(port, e))?;

    let url = format!("http://localhost:{port}");
    let proxy = Arc::new(Proxy {
        client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?,
        upstream: upstream_origin(&config.proxy),
        local: url.clone(),
        script: client_script(reload.port()),
    });

    tracing::info!(
        url = %style(&url).yellow(),
        upstream = %proxy.upstream,
        "proxy listening"
    );

    let thread = thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(listener, proxy))
    });

    if config.open {
        open_browser(&url, config.browser.as_deref());
    }

    Ok(RunningServer {
        url,
        reload,
        thread,
    })
}

async fn serve(listener: TcpListener, proxy: Arc<Proxy>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let router = Router::new()
        .fallback(forward)
        .with_state(proxy)
        .layer(TraceLayer::new_for_http());

    axum::serve(listener, router).await?;

    Ok(())
}

async fn forward(State(proxy): State<Arc<Proxy>>, request: Request) -> Response {
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("upstream request failed: {e:#}");
            (StatusCode::BAD_GATEWAY, format!("{e:#}")).into_response()
        }
    }
}

impl Proxy {
    async fn forward(&self, request: Request) -> anyhow::Result<Response> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
        let url = format!("{}{}", self.upstream, path);

        let mut headers = parts.headers;
        for name in &HOP_HEADERS {
            headers.remove(name);
        }

        let body = axum::body::to_bytes(body, usize::MAX).await?;
        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        let bytes = upstream.bytes().await?;

        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONNECTION);

        if let Some(location) = headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| rewrite_location(v, &self.upstream, &self.local))
        {
            headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
        }

        let body = match is_html(&headers) {
            true => inject_script(&bytes, &self.script),
            false => bytes.to_vec(),
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        Ok(response)
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

/// `mintclothier.dev` becomes `http://mintclothier.dev`.
fn upstream_origin(proxy: &str) -> String {
    let proxy = proxy.trim_end_matches('/');
    match proxy.contains("://") {
        true => proxy.to_string(),
        false => format!("http://{proxy}"),
    }
}

/// Points redirects to the upstream host back at the proxy, whatever their
/// scheme.
fn rewrite_location(location: &str, upstream: &str, local: &str) -> Option<String> {
    let host = upstream.split_once("://").map_or(upstream, |(_, host)| host);

    ["http://", "https://"].into_iter().find_map(|scheme| {
        let rest = location.strip_prefix(scheme)?.strip_prefix(host)?;
        match rest.is_empty() || rest.starts_with(['/', '?', '#']) {
            true => Some(format!("{local}{rest}")),
            false => None,
        }
    })
}

/// Places the script right before the last `</body>`, or at the very end when
/// there is none. Works on raw bytes, so pages in any ASCII compatible
/// charset pass through untouched.
fn inject_script(html: &[u8], script: &str) -> Vec<u8> {
    const BODY_END: &[u8] = b"</body>";

    let at = html
        .windows(BODY_END.len())
        .rposition(|w| w.eq_ignore_ascii_case(BODY_END))
        .unwrap_or(html.len());

    let mut out = Vec::with_capacity(html.len() + script.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(script.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}

fn open_browser(url: &str, browser: Option<&str>) {
    let result = match browser {
        Some(app) => open::with(url, app),
        None => open::that(url),
    };

    if let Err(e) = result {
        tracing::warn!("couldn't open {url} in {}: {e}", browser.unwrap_or("browser"));
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use super::*;
    use crate::reload::Reloader;

    #[test]
    fn test_upstream_origin() {
        assert_eq!(upstream_origin("mintclothier.dev"), "http://mintclothier.dev");
        assert_eq!(upstream_origin("https://example.org/"), "https://example.org");
    }

    #[test]
    fn test_inject_script() {
        let html = b"<html><BODY><p>a</p></BODY></html>";
        assert_eq!(
            inject_script(html, "<script></script>"),
            b"<html><BODY><p>a</p><script></script></BODY></html>"
        );
        assert_eq!(inject_script(b"<p>", "<s>"), b"<p><s>");
    }

    #[test]
    fn test_inject_script_keeps_legacy_charset() {
        // "café" in ISO-8859-1
        let html = b"<html><body><p>caf\xe9</p></body></html>";
        assert_eq!(
            inject_script(html, "<s>"),
            b"<html><body><p>caf\xe9</p><s></body></html>"
        );
    }

    #[test]
    fn test_rewrite_location() {
        let local = "http://localhost:3000";
        let upstream = "http://mintclothier.dev";

        assert_eq!(
            rewrite_location("https://mintclothier.dev/shop?a=1", upstream, local).as_deref(),
            Some("http://localhost:3000/shop?a=1")
        );
        assert_eq!(
            rewrite_location("http://mintclothier.dev", upstream, local).as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(rewrite_location("https://mintclothier.dev.evil/", upstream, local), None);
        assert_eq!(rewrite_location("/relative", upstream, local), None);
    }

    fn fake_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0; 4096];
            let mut request = Vec::new();
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let body = "<html><body><h1>Mint</h1></body></html>";
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
        });

        port
    }

    #[test]
    fn test_proxy_injects_live_reload() {
        let upstream = fake_upstream();
        let (_reloader, rx) = Reloader::channel();

        let config = ServerConfig {
            proxy: format!("127.0.0.1:{upstream}"),
            browser: None,
            open: false,
            port: 0,
            reload_port: 0,
        };

        let server = start(&config, rx).unwrap();
        let port = server.url().rsplit(':').next().unwrap();

        let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).unwrap();
        write!(
            stream,
            "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("<h1>Mint</h1>"));
        assert!(response.contains(&format!(":{}/", server.reload_port())));
        assert!(response.find("WebSocket").unwrap() < response.find("</body>").unwrap());
    }
}
