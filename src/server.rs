//! RPC server
//!
//! A server binds a Unix stream socket, accepts connections on a dedicated
//! thread and hands each one to a fixed pool of workers in round-robin
//! order. Method handlers are dispatched through a mutex-guarded registry
//! and may be registered before or after start, from any thread.

use std::fmt;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;
use nix::sys::epoll::EpollTimeout;
use serde_json::Value;

use crate::io_ops;
use crate::registry::Registry;
use crate::worker;
use crate::worker::WorkerSlot;

/// Size of the request/response read buffer. A request may carry at most
/// `BUFFER_SIZE - 1` bytes; anything longer is truncated by the read and
/// dropped as a parse failure.
pub const BUFFER_SIZE: usize = 4096;

/// Default number of worker threads.
pub const DEFAULT_WORKERS: usize = 4;

/// Ceiling on the configurable pool size.
const MAX_WORKERS_LIMIT: usize = 256;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the server's worker pool.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker threads driving readiness sets.
    pub workers: usize,
    /// Upper bound on every readiness wait, so the loops observe shutdown.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.min(MAX_WORKERS_LIMIT);
        self
    }

    /// Set the readiness-wait timeout.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> io::Result<()> {
        if self.workers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "workers must be at least 1",
            ));
        }
        if self.workers > MAX_WORKERS_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("workers cannot exceed {MAX_WORKERS_LIMIT}"),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "poll interval must be non-zero",
            ));
        }
        Ok(())
    }

    pub(crate) fn wait_timeout(&self) -> EpollTimeout {
        EpollTimeout::from(u16::try_from(self.poll_interval.as_millis()).unwrap_or(u16::MAX))
    }
}

/// State shared between the server handle, the accept thread and the
/// workers.
pub(crate) struct Shared {
    path: PathBuf,
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    pub(crate) running: AtomicBool,
    pub(crate) workers: Vec<WorkerSlot>,
    cursor: Mutex<usize>,
}

impl Shared {
    /// Advance the round-robin cursor. No worker is skipped and no load
    /// feedback is consulted.
    fn next_worker(&self) -> usize {
        let mut cursor = self.cursor.lock().unwrap();
        let id = *cursor;
        *cursor = (id + 1) % self.workers.len();
        id
    }

    /// Hand a freshly accepted connection to the next worker. Failures
    /// close the connection and are not fatal to the accept loop.
    fn assign(&self, stream: UnixStream) {
        if let Err(err) = stream.set_nonblocking(true) {
            warn!("failed to set accepted connection non-blocking: {err}");
            return;
        }
        let id = self.next_worker();
        if let Err(err) = self.workers[id].watch(stream) {
            warn!("worker {id}: failed to register connection: {err}");
        }
    }
}

/// An RPC server bound to a Unix socket path.
///
/// Created with [`Server::new`], populated with [`Server::register`], put on
/// the wire with [`Server::start`] and torn down by [`Server::stop`] or
/// `Drop`. The socket file exists exactly while the server is running.
pub struct Server {
    shared: Arc<Shared>,
    listener: Option<UnixListener>,
    worker_threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl Server {
    /// Allocate a server for the given socket path with the default
    /// configuration. Does not touch the filesystem; binding happens in
    /// [`Server::start`].
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Server> {
        Server::with_config(path, ServerConfig::default())
    }

    /// Allocate a server with an explicit configuration.
    pub fn with_config<P: AsRef<Path>>(path: P, config: ServerConfig) -> io::Result<Server> {
        config.validate()?;
        let workers = (0..config.workers)
            .map(WorkerSlot::new)
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Server {
            shared: Arc::new(Shared {
                path: path.as_ref().to_owned(),
                config,
                registry: Registry::new(),
                running: AtomicBool::new(false),
                workers,
                cursor: Mutex::new(0),
            }),
            listener: None,
            worker_threads: Vec::new(),
            started: false,
        })
    }

    /// Register a method, replacing any existing handler of the same name.
    ///
    /// Safe before or after [`Server::start`], from any thread. A
    /// registration that completes before a request arrives is visible to
    /// the dispatching worker. Registrations beyond [`crate::MAX_METHODS`]
    /// distinct names are silently ignored.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.shared.registry.register(name, Arc::new(handler));
    }

    /// Bind the socket path, start listening and spawn the worker pool and
    /// the accept thread. Returns immediately. Any failure leaves the
    /// server unstarted with no socket file on disk.
    pub fn start(&mut self) -> io::Result<()> {
        if self.started {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "server already started",
            ));
        }

        // A stale file at the path (previous unclean shutdown) would make
        // bind fail with AddrInUse.
        match fs::remove_file(&self.shared.path) {
            Ok(()) => debug!("removed stale socket file {:?}", self.shared.path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(&self.shared.path)?;
        listener.set_nonblocking(true)?;

        self.shared.running.store(true, Ordering::Release);

        for id in 0..self.shared.config.workers {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("urpc-worker-{id}"))
                .spawn(move || worker::worker_main(shared, id));
            match spawned {
                Ok(thread) => self.worker_threads.push(thread),
                Err(err) => {
                    self.abort_start();
                    return Err(err);
                }
            }
        }

        let acceptor_listener = listener.try_clone()?;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("urpc-acceptor".to_owned())
            .spawn(move || accept_loop(acceptor_listener, shared));
        if let Err(err) = spawned {
            self.abort_start();
            return Err(err);
        }

        info!(
            "server listening on {:?} with {} workers",
            self.shared.path, self.shared.config.workers
        );
        self.listener = Some(listener);
        self.started = true;
        Ok(())
    }

    /// Unwind a partially completed start: stop whatever was spawned and
    /// remove the socket file.
    fn abort_start(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for thread in self.worker_threads.drain(..) {
            let _ = thread.join();
        }
        let _ = fs::remove_file(&self.shared.path);
    }

    /// Stop accepting, join the workers, drop all connections and remove
    /// the socket file. Idempotent; also run by `Drop`. In-flight handler
    /// invocations finish before the owning worker exits.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping server on {:?}", self.shared.path);

        if let Some(listener) = self.listener.take() {
            // Unblock the acceptor's readable wait; the detached thread
            // exits on its next tick at the latest.
            unsafe {
                libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
        for thread in self.worker_threads.drain(..) {
            let _ = thread.join();
        }
        for slot in &self.shared.workers {
            slot.disconnect_all();
        }
        match fs::remove_file(&self.shared.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove socket file {:?}: {err}", self.shared.path),
        }
    }

    /// Whether the server is currently accepting connections.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The socket path this server was created for.
    pub fn socket_path(&self) -> &Path {
        &self.shared.path
    }

    /// Total connections currently assigned across all workers. Tracked for
    /// observability only.
    pub fn active_connections(&self) -> usize {
        self.shared.workers.iter().map(WorkerSlot::connections).sum()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("path", &self.shared.path)
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

/// Accept loop: bounded readable wait so the running flag is observed, then
/// accept and assign. `WouldBlock` and `Interrupted` retry; other errors
/// end the loop.
fn accept_loop(listener: UnixListener, shared: Arc<Shared>) {
    debug!("acceptor started");
    while shared.running.load(Ordering::Acquire) {
        match io_ops::wait_readable(&listener, shared.config.poll_interval) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("acceptor: readiness wait failed: {err}");
                }
                break;
            }
        }
        match listener.accept() {
            Ok((stream, _addr)) => shared.assign(stream),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("acceptor: accept failed: {err}");
                }
                break;
            }
        }
    }
    debug!("acceptor exiting");
}
