//! Worker pool
//!
//! Each worker owns an independent epoll readiness set and a map of the
//! connections assigned to it. The accept thread registers new connections
//! round-robin; the worker drives read → dispatch → write for each ready
//! descriptor. The readiness wait uses a bounded timeout so the loop can
//! observe shutdown promptly.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;
use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;

use crate::io_ops;
use crate::registry::Registry;
use crate::server::BUFFER_SIZE;
use crate::server::Shared;
use crate::wire;

/// Upper bound on events harvested per readiness wait.
const MAX_EVENTS: usize = 32;

/// Whether the connection survives the request that was just serviced.
#[derive(Debug, PartialEq)]
pub(crate) enum ConnStatus {
    Open,
    Closed,
}

/// Per-worker state: readiness set plus the connections it owns. The map is
/// locked by the accept thread on insert and by the owning worker on
/// service; its length is the connection count.
pub(crate) struct WorkerSlot {
    id: usize,
    epoll: Epoll,
    conns: Mutex<HashMap<RawFd, UnixStream>>,
}

impl WorkerSlot {
    pub(crate) fn new(id: usize) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            id,
            epoll,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Register a freshly accepted connection with the readiness set.
    /// Called from the accept thread; edge-triggered, so the service path
    /// must drain the descriptor.
    pub(crate) fn watch(&self, stream: UnixStream) -> io::Result<()> {
        let fd = stream.as_raw_fd();
        let mut conns = self.conns.lock().unwrap();
        self.epoll.add(
            &stream,
            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, fd as u64),
        )?;
        conns.insert(fd, stream);
        debug!("worker {}: watching new connection on fd {fd}", self.id);
        Ok(())
    }

    pub(crate) fn connections(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub(crate) fn disconnect_all(&self) {
        self.conns.lock().unwrap().clear();
    }

    /// Service one ready descriptor. The stream is taken out of the map for
    /// the duration so the dispatch runs without any worker lock held.
    fn service(&self, fd: RawFd, registry: &Registry, tick: Duration) {
        let stream = self.conns.lock().unwrap().remove(&fd);
        let Some(mut stream) = stream else {
            return;
        };
        match handle_request(&mut stream, registry, tick) {
            ConnStatus::Open => {
                self.conns.lock().unwrap().insert(fd, stream);
            }
            ConnStatus::Closed => {
                if let Err(err) = self.epoll.delete(&stream) {
                    debug!("worker {}: epoll delete for fd {fd} failed: {err}", self.id);
                }
                debug!("worker {}: connection on fd {fd} closed", self.id);
            }
        }
    }
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("id", &self.id)
            .field("connections", &self.connections())
            .finish()
    }
}

/// Worker loop: bounded readiness wait, then service every ready
/// descriptor. Exits when the running flag clears or the wait fails hard.
pub(crate) fn worker_main(shared: Arc<Shared>, id: usize) {
    let slot = &shared.workers[id];
    let timeout = shared.config.wait_timeout();
    let tick = shared.config.poll_interval;
    let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
    debug!("worker {id} started");

    while shared.running.load(Ordering::Acquire) {
        let ready = match slot.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("worker {id}: readiness wait failed: {err}");
                break;
            }
        };
        for event in &events[..ready] {
            slot.service(event.data() as RawFd, &shared.registry, tick);
        }
    }
    debug!("worker {id} exiting");
}

/// Read one request from the descriptor, dispatch it, write the response.
///
/// A request that produces no response (parse failure, unknown method,
/// handler returned the no-result sentinel) closes the connection so the
/// peer's read observes zero bytes. A served connection stays registered
/// for further calls.
fn handle_request(stream: &mut UnixStream, registry: &Registry, tick: Duration) -> ConnStatus {
    let mut buf = [0u8; BUFFER_SIZE];
    let (len, eof) = match io_ops::read_available(stream, &mut buf) {
        Ok(read) => read,
        Err(err) => {
            debug!("request read failed: {err}");
            return ConnStatus::Closed;
        }
    };
    if len == 0 {
        return ConnStatus::Closed;
    }
    let Some(request) = wire::decode_request(&buf[..len]) else {
        debug!("dropping unparseable request ({len} bytes)");
        return ConnStatus::Closed;
    };
    let Some(handler) = registry.lookup(&request.method) else {
        debug!("no handler registered for method {:?}", request.method);
        return ConnStatus::Closed;
    };
    let Some(result) = handler(request.params) else {
        return ConnStatus::Closed;
    };
    let body = match serde_json::to_vec(&result) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to serialize result of {:?}: {err}", request.method);
            return ConnStatus::Closed;
        }
    };
    if let Err(err) = io_ops::write_all(stream, &body, tick) {
        debug!("response write failed: {err}");
        return ConnStatus::Closed;
    }
    if eof { ConnStatus::Closed } else { ConnStatus::Open }
}
