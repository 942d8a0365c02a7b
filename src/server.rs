//! The server endpoint: accept loop and connection-set bookkeeping.
//!
//! A [`Server`] binds a TCP listener and runs an acceptor thread. Every
//! accepted connection gets a fresh server-role protocol engine on its own
//! worker thread; the endpoint keeps a mutex-protected set of live
//! connection handles, mutated only by the acceptor (insert) and the
//! worker-exit path (remove). Closing the server stops the acceptor,
//! requests closure of every connection, and blocks on a counted wait until
//! the last worker has exited.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{
    close::CloseCode,
    connection::{self, Connection, Handler, Options, Role},
    Result,
};

/// How often the acceptor polls for shutdown between accept attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(300);

/// Counted wait for worker-thread exit. Workers decrement on the way out;
/// `Server::close` blocks until the count reaches zero.
struct Workers {
    count: Mutex<usize>,
    all_exited: Condvar,
}

struct ServerShared {
    running: AtomicBool,
    connections: Mutex<Vec<Connection>>,
    workers: Workers,
}

impl ServerShared {
    fn register(&self, conn: &Connection) {
        self.connections.lock().unwrap().push(conn.clone());
        *self.workers.count.lock().unwrap() += 1;
    }

    fn unregister(&self, conn: &Connection) {
        self.connections
            .lock()
            .unwrap()
            .retain(|c| !c.ptr_eq(conn));
        let mut count = self.workers.count.lock().unwrap();
        *count = count.saturating_sub(1);
        self.workers.all_exited.notify_all();
    }
}

/// A listening WebSocket server.
///
/// Created with [`Server::open`]; every accepted connection is driven by
/// its own worker thread and reported to the shared [`Handler`]. The server
/// keeps accepting until [`Server::close`] is called (or the value is
/// dropped), which also tears down every live connection and waits for
/// their workers to finish.
pub struct Server {
    shared: Arc<ServerShared>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl Server {
    /// Binds `address:port` and starts accepting WebSocket connections,
    /// with default [`Options`].
    pub fn open<H: Handler>(address: &str, port: u16, handler: H) -> Result<Server> {
        Self::open_with(address, port, handler, Options::default())
    }

    /// Binds `address:port` and starts accepting WebSocket connections.
    ///
    /// Port 0 asks the OS for an ephemeral port; see
    /// [`Server::local_addr`] for the bound address.
    pub fn open_with<H: Handler>(
        address: &str,
        port: u16,
        handler: H,
        options: Options,
    ) -> Result<Server> {
        let listener = TcpListener::bind((address, port))?;
        let local_addr = listener.local_addr()?;
        // Accept is polled rather than blocked on, so the acceptor can
        // observe shutdown between attempts.
        listener.set_nonblocking(true)?;

        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(true),
            connections: Mutex::new(Vec::new()),
            workers: Workers {
                count: Mutex::new(0),
                all_exited: Condvar::new(),
            },
        });

        let acceptor = {
            let shared = Arc::clone(&shared);
            let handler = Arc::new(handler);
            thread::Builder::new()
                .name("weft-acceptor".into())
                .spawn(move || acceptor_loop(listener, shared, handler, options))?
        };

        log::debug!("server listening on {}", local_addr);
        Ok(Server {
            shared,
            acceptor: Some(acceptor),
            local_addr,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// The number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Stops accepting, closes every live connection, and blocks until all
    /// connection workers have exited.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        let connections: Vec<Connection> = self.shared.connections.lock().unwrap().clone();
        for conn in connections {
            if conn.is_connected() {
                // Graceful goodbye to established sessions; handshaking
                // ones are just torn down.
                conn.close(CloseCode::Away);
            } else {
                conn.request_close();
            }
        }

        let mut count = self.shared.workers.count.lock().unwrap();
        while *count > 0 {
            let (guard, _) = self
                .shared
                .workers
                .all_exited
                .wait_timeout(count, Duration::from_secs(1))
                .unwrap();
            count = guard;
        }
        log::debug!("server on {} shut down", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn acceptor_loop<H: Handler>(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    handler: Arc<H>,
    options: Options,
) {
    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("accepted connection from {}", peer);
                if let Err(err) = start_worker(stream, &shared, &handler, &options) {
                    log::error!("failed to start connection worker: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::error!("accept failed: {}", err);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn start_worker<H: Handler>(
    stream: TcpStream,
    shared: &Arc<ServerShared>,
    handler: &Arc<H>,
    options: &Options,
) -> Result<()> {
    let write_half = stream.try_clone()?;
    let conn = Connection::new(Role::Server, write_half);
    shared.register(&conn);

    let spawned = {
        let shared = Arc::clone(shared);
        let handler = Arc::clone(handler);
        let options = options.clone();
        let conn = conn.clone();
        thread::Builder::new().name("weft-worker".into()).spawn(move || {
            connection::worker_loop(&conn, stream, &*handler, &options, None);
            shared.unregister(&conn);
        })
    };

    if let Err(err) = spawned {
        shared.unregister(&conn);
        return Err(err.into());
    }
    Ok(())
}
