//! Live reload.
//!
//! Pipelines push a [`Signal`] after writing their artifacts. With the `live`
//! feature a [`LiveReload`] hub forwards every signal to the browser tabs
//! connected to its WebSocket, where the [`client_script`] either reloads the
//! page or swaps the stylesheets in place.

use std::sync::mpsc::{Receiver, Sender, channel};

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Reload the whole page.
    Reload,
    /// Only stylesheets changed.
    Css,
}

impl Signal {
    pub fn message(self) -> &'static str {
        match self {
            Signal::Reload => "reload",
            Signal::Css => "css",
        }
    }
}

/// The sending half used by the pipelines.
#[derive(Debug, Clone, Default)]
pub struct Reloader {
    tx: Option<Sender<Signal>>,
}

impl Reloader {
    /// A reloader nobody listens to.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, Receiver<Signal>) {
        let (tx, rx) = channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Pushes a signal. Nobody listening is not an error.
    pub fn signal(&self, signal: Signal) {
        if let Some(tx) = &self.tx
            && tx.send(signal).is_err()
        {
            tracing::debug!("no live reload listener for {signal:?}");
        }
    }
}

/// Script served to the browser. Connects back to the reload socket on
/// `port`.
pub fn client_script(port: u16) -> String {
    format!(
        r#"<script>
(function () {{
  var socket = new WebSocket("ws://" + location.hostname + ":{port}/");
  socket.onmessage = function (event) {{
    if (event.data === "css") {{
      var links = document.querySelectorAll('link[rel="stylesheet"]');
      for (var i = 0; i < links.length; i++) {{
        var url = links[i].href.replace(/[?&]livereload=\d+/, "");
        links[i].href = url + (url.indexOf("?") < 0 ? "?" : "&") + "livereload=" + Date.now();
      }}
    }} else {{
      location.reload();
    }}
  }};
}})();
</script>"#
    )
}

#[cfg(feature = "live")]
pub use hub::LiveReload;

#[cfg(feature = "live")]
mod hub {
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc::Receiver;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread::JoinHandle;

    use tungstenite::WebSocket;

    use super::Signal;

    type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

    /// Only the most recent tabs are kept open.
    const MAX_CLIENTS: usize = 10;

    /// The WebSocket side of live reload.
    pub struct LiveReload {
        port: u16,
        _incoming: JoinHandle<()>,
        _outgoing: JoinHandle<()>,
    }

    impl LiveReload {
        /// Binds the socket on `preferred` or, when taken, any free port, and
        /// starts broadcasting everything received on `signals`.
        pub fn listen(preferred: u16, signals: Receiver<Signal>) -> std::io::Result<Self> {
            let (tcp, port) = reserve_port(preferred)?;
            let clients = Clients::default();

            let incoming = new_thread_ws_incoming(tcp, clients.clone());
            let outgoing = new_thread_ws_reload(signals, clients);

            tracing::info!(port, "live reload listening");

            Ok(Self {
                port,
                _incoming: incoming,
                _outgoing: outgoing,
            })
        }

        pub fn port(&self) -> u16 {
            self.port
        }
    }

    fn reserve_port(preferred: u16) -> std::io::Result<(TcpListener, u16)> {
        let listener = match TcpListener::bind(("127.0.0.1", preferred)) {
            Ok(sock) => sock,
            Err(_) => TcpListener::bind("127.0.0.1:0")?,
        };

        let port = listener.local_addr()?.port();
        Ok((listener, port))
    }

    fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for stream in server.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!("live reload connection failed: {e}");
                        continue;
                    }
                };

                match tungstenite::accept(stream) {
                    Ok(socket) => clients
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(socket),
                    Err(e) => tracing::debug!("rejected live reload client: {e}"),
                }
            }
        })
    }

    fn new_thread_ws_reload(signals: Receiver<Signal>, clients: Clients) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while let Ok(signal) = signals.recv() {
                let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
                let mut broken = vec![];

                for (i, socket) in clients.iter_mut().enumerate() {
                    match socket.send(signal.message().into()) {
                        Ok(_) => {}
                        Err(tungstenite::Error::Io(e))
                            if e.kind() == std::io::ErrorKind::BrokenPipe =>
                        {
                            broken.push(i);
                        }
                        Err(
                            tungstenite::Error::ConnectionClosed
                            | tungstenite::Error::AlreadyClosed,
                        ) => broken.push(i),
                        Err(e) => tracing::error!("live reload: {e:?}"),
                    }
                }

                for i in broken.into_iter().rev() {
                    clients.remove(i);
                }

                let len = clients.len();
                if len > MAX_CLIENTS {
                    for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                        socket.close(None).ok();
                    }
                }

                tracing::debug!(clients = clients.len(), "sent {}", signal.message());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_signal_is_noop() {
        Reloader::detached().signal(Signal::Reload);
    }

    #[test]
    fn test_channel_delivers_in_order() {
        let (reloader, rx) = Reloader::channel();
        reloader.signal(Signal::Css);
        reloader.clone().signal(Signal::Reload);

        assert_eq!(rx.recv().unwrap(), Signal::Css);
        assert_eq!(rx.recv().unwrap(), Signal::Reload);
    }

    #[test]
    fn test_dropped_receiver_is_not_an_error() {
        let (reloader, rx) = Reloader::channel();
        drop(rx);
        reloader.signal(Signal::Reload);
    }

    #[test]
    fn test_client_script() {
        let script = client_script(1337);
        assert!(script.starts_with("<script>"));
        assert!(script.contains(":1337/"));
        assert!(script.contains(r#"event.data === "css""#));
        assert!(script.contains("location.reload()"));
    }

    #[cfg(feature = "live")]
    #[test]
    fn test_live_reload_broadcasts() {
        let (reloader, rx) = Reloader::channel();
        let hub = LiveReload::listen(0, rx).unwrap();

        let (mut socket, _) =
            tungstenite::connect(format!("ws://127.0.0.1:{}/", hub.port())).unwrap();

        if let tungstenite::stream::MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream
                .set_read_timeout(Some(std::time::Duration::from_millis(100)))
                .unwrap();
        }

        // The accept thread registers the client asynchronously.
        let mut received = None;
        for _ in 0..50 {
            reloader.signal(Signal::Css);
            if let Ok(msg) = socket.read() {
                received = Some(msg.to_text().unwrap().to_string());
                break;
            }
        }

        assert_eq!(received.as_deref(), Some("css"));
    }
}
