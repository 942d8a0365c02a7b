//! The client endpoint: connect, drive the handshake, own one connection.
//!
//! [`Client::open`] resolves and connects the TCP transport, spawns the
//! connection worker, sends the upgrade request synchronously, and then
//! blocks — on a condvar signalled by the worker at every state change —
//! until the connection reaches the connected state or the open deadline
//! (30 s by default) passes.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use url::Url;

use crate::{
    close::CloseCode,
    connection::{self, Connection, Handler, Options, Role, State},
    handshake, Result, WebSocketError,
};

/// A client-side WebSocket connection.
///
/// The value owns the single connection and its worker thread; dropping it
/// (or calling [`Client::close`]) closes the connection and joins the
/// worker.
pub struct Client {
    connection: Connection,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Connects to `address:port`, performs the upgrade on `endpoint`
    /// (e.g. `/chat`), and blocks until the connection is established.
    /// Uses default [`Options`].
    pub fn open<H: Handler>(address: &str, port: u16, endpoint: &str, handler: H) -> Result<Client> {
        Self::open_with(address, port, endpoint, handler, Options::default())
    }

    /// Connects with explicit [`Options`]. Blocks for at most the
    /// configured open timeout.
    pub fn open_with<H: Handler>(
        address: &str,
        port: u16,
        endpoint: &str,
        handler: H,
        options: Options,
    ) -> Result<Client> {
        let stream = TcpStream::connect((address, port))?;
        let write_half = stream.try_clone()?;
        let conn = Connection::new(Role::Client, write_half);

        let nonce = handshake::generate_nonce();
        let request = handshake::request(address, port, endpoint, &nonce);
        let open_timeout = options.open_timeout;

        let worker = {
            let conn = conn.clone();
            let handler = Arc::new(handler);
            thread::Builder::new().name("weft-client".into()).spawn(move || {
                connection::worker_loop(&conn, stream, &*handler, &options, Some(nonce));
            })?
        };

        let mut client = Client {
            connection: conn,
            worker: Some(worker),
        };

        if let Err(err) = client.connection.write_all(request.as_bytes()) {
            client.teardown();
            return Err(err);
        }

        match client.connection.wait_for_open(open_timeout) {
            State::Connected => Ok(client),
            State::Closed => {
                log::error!("connection failed during handshake");
                client.teardown();
                Err(WebSocketError::ConnectionClosed)
            }
            State::Handshake => {
                log::error!("handshake did not complete within {:?}", open_timeout);
                client.teardown();
                Err(WebSocketError::HandshakeTimeout)
            }
        }
    }

    /// Connects to a `ws://host[:port]/path` URL with default [`Options`].
    pub fn open_url<H: Handler>(url: &str, handler: H) -> Result<Client> {
        Self::open_url_with(url, handler, Options::default())
    }

    /// Connects to a `ws://` URL with explicit [`Options`].
    pub fn open_url_with<H: Handler>(url: &str, handler: H, options: Options) -> Result<Client> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" {
            return Err(WebSocketError::InvalidHttpScheme);
        }
        let host = url
            .host_str()
            .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?
            .to_string();
        let port = url.port().unwrap_or(80);
        let endpoint = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Self::open_with(&host, port, &endpoint, handler, options)
    }

    /// The connection handle, e.g. for sending from other threads.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the connection is still established.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Closes the connection (sending a close frame when still connected)
    /// and joins the worker thread.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.connection.is_connected() {
            self.connection.close(CloseCode::Normal);
        } else {
            self.connection.request_close();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DataType, Message};
    use crate::server::Server;
    use std::net::TcpListener;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    /// Server handler echoing every message back to its sender.
    struct Echo;

    impl Handler for Echo {
        type Session = ();

        fn on_open(&self, _conn: &Connection) -> Self::Session {}

        fn on_message(&self, conn: &Connection, _session: &mut Self::Session, msg: Message) {
            let _ = conn.send(msg);
        }

        fn on_close(&self, _conn: &Connection, _session: &mut Self::Session) {}
    }

    #[derive(Debug, PartialEq)]
    enum Lifecycle {
        Open,
        Msg(Message),
        Close,
    }

    /// Client handler reporting every callback through a channel.
    struct Recorder {
        tx: Mutex<Sender<Lifecycle>>,
    }

    impl Recorder {
        fn new() -> (Self, Receiver<Lifecycle>) {
            let (tx, rx) = channel();
            (Self { tx: Mutex::new(tx) }, rx)
        }

        fn report(&self, event: Lifecycle) {
            let _ = self.tx.lock().unwrap().send(event);
        }
    }

    impl Handler for Recorder {
        type Session = ();

        fn on_open(&self, _conn: &Connection) -> Self::Session {
            self.report(Lifecycle::Open);
        }

        fn on_message(&self, _conn: &Connection, _session: &mut Self::Session, msg: Message) {
            self.report(Lifecycle::Msg(msg));
        }

        fn on_close(&self, _conn: &Connection, _session: &mut Self::Session) {
            self.report(Lifecycle::Close);
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let server = Server::open("127.0.0.1", 0, Echo).unwrap();
        let port = server.local_addr().port();

        let (recorder, rx) = Recorder::new();
        let client = Client::open("127.0.0.1", port, "/", recorder).unwrap();
        assert!(client.is_connected());
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Open);

        client.connection().send(Message::text("hello")).unwrap();
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Lifecycle::Msg(Message::text("hello"))
        );

        client
            .connection()
            .send(Message::binary(vec![0x00u8, 0xFF, 0x7F]))
            .unwrap();
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Lifecycle::Msg(Message::binary(vec![0x00u8, 0xFF, 0x7F]))
        );

        client.close();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Close);
        server.close();
    }

    #[test]
    fn test_fragmented_send_is_joined_by_peer() {
        let server = Server::open("127.0.0.1", 0, Echo).unwrap();
        let port = server.local_addr().port();

        let (recorder, rx) = Recorder::new();
        let client = Client::open("127.0.0.1", port, "/", recorder).unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Open);

        let conn = client.connection();
        conn.send_fragment_start(DataType::Text, b"He").unwrap();
        conn.send_fragment_cont(false, b"l").unwrap();
        conn.send_fragment_cont(true, b"lo").unwrap();

        // The server reassembles before echoing, so one joined message
        // comes back.
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Lifecycle::Msg(Message::text("Hello"))
        );

        client.close();
        server.close();
    }

    #[test]
    fn test_ping_is_answered_transparently() {
        let server = Server::open("127.0.0.1", 0, Echo).unwrap();
        let port = server.local_addr().port();

        let (recorder, rx) = Recorder::new();
        let client = Client::open("127.0.0.1", port, "/", recorder).unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Open);

        client.connection().ping(b"abc").unwrap();
        // The pong is consumed by the engine; the connection stays healthy.
        client.connection().send(Message::text("after-ping")).unwrap();
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Lifecycle::Msg(Message::text("after-ping"))
        );

        let oversized = vec![0u8; 126];
        assert!(matches!(
            client.connection().ping(&oversized),
            Err(WebSocketError::ControlFrameTooLarge)
        ));

        client.close();
        server.close();
    }

    #[test]
    fn test_send_after_close_fails() {
        let server = Server::open("127.0.0.1", 0, Echo).unwrap();
        let port = server.local_addr().port();

        let (recorder, rx) = Recorder::new();
        let client = Client::open("127.0.0.1", port, "/", recorder).unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Open);

        let conn = client.connection().clone();
        client.close();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(Message::text("late")),
            Err(WebSocketError::ConnectionClosed)
        ));
        server.close();
    }

    #[test]
    fn test_server_close_reaches_client() {
        let server = Server::open("127.0.0.1", 0, Echo).unwrap();
        let port = server.local_addr().port();

        let (recorder, rx) = Recorder::new();
        let client = Client::open("127.0.0.1", port, "/", recorder).unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Open);

        server.close();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Close);
        assert!(!client.is_connected());
        client.close();
    }

    #[test]
    fn test_open_times_out_against_silent_server() {
        // A TCP listener that accepts and never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = thread::spawn(move || {
            let _socket = listener.accept();
            thread::sleep(Duration::from_millis(500));
        });

        let (recorder, rx) = Recorder::new();
        let options = Options::default().with_open_timeout(Duration::from_millis(200));
        let result = Client::open_with("127.0.0.1", port, "/", recorder, options);
        assert!(matches!(result, Err(WebSocketError::HandshakeTimeout)));

        // No on_open means no on_close either.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        let _ = silent.join();
    }

    #[test]
    fn test_open_fails_when_nobody_listens() {
        // Bind and drop a listener to get a port that refuses connections.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (recorder, _rx) = Recorder::new();
        let result = Client::open("127.0.0.1", port, "/", recorder);
        assert!(matches!(result, Err(WebSocketError::IoError(_))));
    }

    #[test]
    fn test_open_url() {
        let server = Server::open("127.0.0.1", 0, Echo).unwrap();
        let port = server.local_addr().port();

        let (recorder, rx) = Recorder::new();
        let url = format!("ws://127.0.0.1:{}/chat", port);
        let client = Client::open_url(&url, recorder).unwrap();
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Lifecycle::Open);

        client.close();
        server.close();
    }

    #[test]
    fn test_open_url_rejects_non_ws_schemes() {
        let (recorder, _rx) = Recorder::new();
        let result = Client::open_url("wss://example.com/", recorder);
        assert!(matches!(result, Err(WebSocketError::InvalidHttpScheme)));

        let (recorder, _rx) = Recorder::new();
        let result = Client::open_url("http://example.com/", recorder);
        assert!(matches!(result, Err(WebSocketError::InvalidHttpScheme)));
    }
}
