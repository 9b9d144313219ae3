//! RPC client
//!
//! A client wraps one connected stream socket behind a mutex that
//! serializes `write request → read response` round-trips, so at most one
//! call is in flight on the socket at any instant. The asynchronous variant
//! spawns a one-shot thread that performs the synchronous call and hands
//! the result to a callback.

use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use log::debug;
use log::error;
use log::warn;
use serde_json::Value;

use crate::server::BUFFER_SIZE;
use crate::wire;

/// Receiver of an asynchronous call's outcome. Runs on the calling task's
/// thread, which may be any thread; it takes ownership of the result.
pub type AsyncCallback = Box<dyn FnOnce(Option<Value>) + Send + 'static>;

/// A connection to an RPC server.
///
/// Calls return either an owned JSON value or `None`, the "no result"
/// outcome; transport failures, unknown methods and handler-signalled
/// errors are all surfaced as `None`.
#[derive(Debug)]
pub struct Client {
    stream: Mutex<UnixStream>,
}

impl Client {
    /// Connect to the server listening at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Client> {
        let stream = UnixStream::connect(path)?;
        Ok(Client {
            stream: Mutex::new(stream),
        })
    }

    /// Invoke `method` with `params` and block for the response.
    ///
    /// Consumes `params`. Returns `None` on transport failure, when no
    /// handler is registered for `method`, or when the handler produced no
    /// result; a present JSON `null` comes back as `Some(Value::Null)`.
    pub fn call(&self, method: &str, params: Value) -> Option<Value> {
        let request = match wire::encode_request(method, params) {
            Ok(request) => request,
            Err(err) => {
                warn!("failed to encode request for {method:?}: {err}");
                return None;
            }
        };

        let mut buf = [0u8; BUFFER_SIZE];
        let len = {
            let mut stream = self.stream.lock().unwrap();
            if let Err(err) = stream.write_all(&request) {
                debug!("request write for {method:?} failed: {err}");
                return None;
            }
            match read_once(&mut stream, &mut buf) {
                Ok(len) => len,
                Err(err) => {
                    debug!("response read for {method:?} failed: {err}");
                    return None;
                }
            }
        };
        if len == 0 {
            // Peer wrote nothing and hung up: no result.
            return None;
        }
        wire::decode_response(&buf[..len])
    }

    /// Invoke `method` without blocking the caller.
    ///
    /// Consumes `params` and returns immediately. The synchronous call runs
    /// on a detached one-shot thread; its outcome is handed to `callback`
    /// if one was given and dropped otherwise. Concurrent asynchronous
    /// calls against the same client serialize on the client's mutex.
    pub fn call_async(self: &Arc<Self>, method: &str, params: Value, callback: Option<AsyncCallback>) {
        let client = Arc::clone(self);
        let method = method.to_owned();
        let spawned = thread::Builder::new()
            .name("urpc-call".to_owned())
            .spawn(move || {
                let result = client.call(&method, params);
                match callback {
                    Some(callback) => callback(result),
                    None => drop(result),
                }
            });
        if let Err(err) = spawned {
            // The closure never ran; params and callback are released here.
            error!("failed to spawn async call thread: {err}");
        }
    }
}

/// One read, as the wire contract prescribes: whatever is available is the
/// whole response. `Interrupted` is transparent.
fn read_once(stream: &mut UnixStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(buf) {
            Ok(len) => return Ok(len),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}
