//! Descriptor-level I/O helpers
//!
//! Non-blocking read/write loops shared by the worker and accept threads.
//! `WouldBlock` terminates a drain, `Interrupted` is transparent, everything
//! else propagates to the caller.

use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;

fn poll_millis(timeout: Duration) -> PollTimeout {
    PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX))
}

fn wait(fd: impl AsFd, events: PollFlags, timeout: Duration) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd.as_fd(), events)];
    match poll(&mut fds, poll_millis(timeout)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(err) => Err(io::Error::from(err)),
    }
}

/// Wait up to `timeout` for the descriptor to become readable. `Ok(false)`
/// means the wait timed out (or was interrupted); the caller loops.
pub(crate) fn wait_readable(fd: impl AsFd, timeout: Duration) -> io::Result<bool> {
    wait(fd, PollFlags::POLLIN, timeout)
}

fn wait_writable(fd: impl AsFd, timeout: Duration) -> io::Result<bool> {
    wait(fd, PollFlags::POLLOUT, timeout)
}

/// Drain whatever is currently readable into `buf`, stopping at EOF, at
/// `WouldBlock`, or once the buffer is full minus one byte. Returns the
/// number of bytes read and whether the peer has closed its end.
pub(crate) fn read_available(stream: &mut UnixStream, buf: &mut [u8]) -> io::Result<(usize, bool)> {
    let cap = buf.len() - 1;
    let mut filled = 0;
    let mut eof = false;
    while filled < cap {
        match stream.read(&mut buf[filled..cap]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok((filled, eof))
}

/// Write the whole buffer to a non-blocking stream, waiting for writability
/// between partial writes.
pub(crate) fn write_all(
    stream: &mut UnixStream,
    mut bytes: &[u8],
    tick: Duration,
) -> io::Result<()> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(&*stream, tick)?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::thread;

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn read_available_drains_pending_bytes() {
        let (mut local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        remote.write_all(b"hello").unwrap();

        let mut buf = [0u8; 64];
        let (len, eof) = read_available(&mut local, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert!(!eof);
    }

    #[test]
    fn read_available_caps_at_len_minus_one() {
        let (mut local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        remote.write_all(&[7u8; 64]).unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = read_available(&mut local, &mut buf).unwrap();
        assert_eq!(len, 15);
    }

    #[test]
    fn read_available_reports_eof() {
        let (mut local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        remote.write_all(b"bye").unwrap();
        drop(remote);

        let mut buf = [0u8; 64];
        let (len, eof) = read_available(&mut local, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"bye");
        assert!(eof);

        let (len, eof) = read_available(&mut local, &mut buf).unwrap();
        assert_eq!(len, 0);
        assert!(eof);
    }

    #[test]
    fn write_all_round_trips() {
        let (mut local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        write_all(&mut local, b"response body", TICK).unwrap();
        let mut buf = [0u8; 13];
        remote.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"response body");
    }

    #[test]
    fn write_all_rides_out_a_full_send_buffer() {
        let (mut local, mut remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        // Shrink the send buffer so the payload cannot leave in one write;
        // the writer must hit WouldBlock and wait for the reader to drain.
        let size: libc::c_int = 4096;
        let rc = unsafe {
            libc::setsockopt(
                local.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let payload = vec![0x5au8; 1 << 20];
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8192];
            let mut total = 0;
            loop {
                // Drain slowly so the buffer stays full for a while.
                thread::sleep(Duration::from_millis(1));
                match remote.read(&mut buf) {
                    Ok(0) => return total,
                    Ok(n) => {
                        assert!(buf[..n].iter().all(|&b| b == 0x5a));
                        total += n;
                    }
                    Err(err) => panic!("reader failed: {err}"),
                }
            }
        });

        write_all(&mut local, &payload, TICK).unwrap();
        drop(local);
        assert_eq!(reader.join().unwrap(), payload.len());
    }
}
