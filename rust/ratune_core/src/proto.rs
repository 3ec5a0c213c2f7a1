// SPDX-License-Identifier: GPL-2.0
//
// ratune: wire protocol between the collector and the inference daemon.
//
// One request per connection over a local stream socket: exactly 20
// bytes of little-endian f32 features in, exactly 4 bytes of
// little-endian i32 class index back, then close. Anything else on the
// wire is malformed and the daemon drops the connection without a
// response.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    connect, getsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, UnixAddr,
};

use crate::model::IoClass;
use crate::NUM_FEATURES;

/// Request payload size: 5 little-endian f32.
pub const REQUEST_LEN: usize = NUM_FEATURES * 4;

/// Response payload size: one little-endian i32.
pub const RESPONSE_LEN: usize = 4;

pub fn encode_request(features: &[f32; NUM_FEATURES]) -> [u8; REQUEST_LEN] {
    let mut buf = [0u8; REQUEST_LEN];
    for (i, f) in features.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
    }
    buf
}

pub fn decode_request(buf: &[u8; REQUEST_LEN]) -> [f32; NUM_FEATURES] {
    let mut features = [0.0f32; NUM_FEATURES];
    for (i, f) in features.iter_mut().enumerate() {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[i * 4..i * 4 + 4]);
        *f = f32::from_le_bytes(word);
    }
    features
}

pub fn encode_response(class: IoClass) -> [u8; RESPONSE_LEN] {
    class.index().to_le_bytes()
}

pub fn decode_response(buf: &[u8; RESPONSE_LEN]) -> Result<IoClass> {
    let idx = i32::from_le_bytes(*buf);
    IoClass::from_index(idx).with_context(|| format!("daemon returned invalid class {idx}"))
}

/// Client side of the protocol, used once per window by the collector.
///
/// Both directions carry a timeout so an unresponsive daemon costs one
/// skipped window instead of hanging the control loop.
pub struct PredictorClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl PredictorClient {
    pub fn new(socket_path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// One full request/response exchange.
    pub fn predict(&self, features: &[f32; NUM_FEATURES]) -> Result<IoClass> {
        let mut stream = connect_with_timeout(&self.socket_path, self.timeout)
            .with_context(|| format!("connecting to {}", self.socket_path.display()))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_read_timeout(Some(self.timeout))?;

        stream
            .write_all(&encode_request(features))
            .context("sending feature vector")?;
        // One request per connection: half-close the write side so the
        // daemon sees a clean end of payload.
        stream.shutdown(std::net::Shutdown::Write)?;

        let mut buf = [0u8; RESPONSE_LEN];
        stream
            .read_exact(&mut buf)
            .context("reading prediction")?;
        decode_response(&buf)
    }
}

/// Connect with a deadline. `UnixStream::connect` alone would block
/// without bound once the daemon's listen backlog is full, so the
/// connect runs non-blocking and is polled against `timeout`.
fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<UnixStream> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("creating socket")?;
    let addr = UnixAddr::new(path)?;

    match connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) => {
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
            let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            if poll(&mut fds, PollTimeout::from(ms)).context("polling connect")? == 0 {
                bail!("connect timed out after {timeout:?}");
            }
            let err = getsockopt(&fd, sockopt::SocketError)?;
            if err != 0 {
                return Err(std::io::Error::from_raw_os_error(err)).context("completing connect");
            }
        }
        // A full backlog reports EAGAIN on a non-blocking unix socket;
        // the daemon exists but is not accepting. Fail the exchange now
        // rather than wait on it.
        Err(Errno::EAGAIN) => bail!("daemon is not accepting connections"),
        Err(e) => return Err(e).context("connecting"),
    }

    let stream = UnixStream::from(fd);
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Server-side read of one request. Returns the decoded features, or an
/// error for a short payload. A payload longer than [`REQUEST_LEN`] is
/// also malformed: the sender speaks one-request-per-connection, so any
/// trailing byte means a protocol mismatch.
pub fn read_request(stream: &mut UnixStream) -> Result<[f32; NUM_FEATURES]> {
    let mut buf = [0u8; REQUEST_LEN];
    stream
        .read_exact(&mut buf)
        .context("short feature payload")?;

    let mut extra = [0u8; 1];
    match stream.read(&mut extra) {
        Ok(0) => {}
        Ok(_) => bail!("oversized feature payload"),
        // The peer keeping the socket open without more data is fine;
        // a timeout here just means the payload ended at 20 bytes.
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
        Err(e) => return Err(e).context("checking for trailing bytes"),
    }

    Ok(decode_request(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding_is_little_endian_and_ordered() {
        let features = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let buf = encode_request(&features);
        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&buf[16..20], &5.0f32.to_le_bytes());
        assert_eq!(decode_request(&buf), features);
    }

    #[test]
    fn response_round_trip() {
        for class in [IoClass::Sequential, IoClass::Random, IoClass::Mixed] {
            let buf = encode_response(class);
            assert_eq!(decode_response(&buf).unwrap(), class);
        }
    }

    #[test]
    fn response_rejects_out_of_range_class() {
        let buf = 7i32.to_le_bytes();
        assert!(decode_response(&buf).is_err());
        let buf = (-1i32).to_le_bytes();
        assert!(decode_response(&buf).is_err());
    }

    #[test]
    fn client_fails_cleanly_when_daemon_absent() {
        let client = PredictorClient::new("/tmp/ratune-no-such-socket", Duration::from_millis(50));
        assert!(client.predict(&[0.0; NUM_FEATURES]).is_err());
    }

    #[test]
    fn predict_stays_bounded_when_daemon_stops_accepting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wedged.sock");
        // Bound but never accepted: connections pile up in the backlog.
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let mut parked = Vec::new();
        while parked.len() < 8192 {
            match connect_with_timeout(&path, Duration::from_millis(50)) {
                Ok(s) => parked.push(s),
                Err(_) => break,
            }
        }

        let client = PredictorClient::new(&path, Duration::from_millis(100));
        let start = std::time::Instant::now();
        assert!(client.predict(&[0.0; NUM_FEATURES]).is_err());
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "predict must fail within its timeout, took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn read_request_accepts_exact_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proto.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let features = [9.0f32, 8.0, 7.0, 6.0, 5.0];
        let sender = std::thread::spawn({
            let path = path.clone();
            move || {
                let mut s = UnixStream::connect(path).unwrap();
                s.write_all(&encode_request(&features)).unwrap();
                // Close the write side so the server sees EOF after 20 bytes.
            }
        });

        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let got = read_request(&mut stream).unwrap();
        assert_eq!(got, features);
        sender.join().unwrap();
    }

    #[test]
    fn read_request_rejects_short_and_long_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proto.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        for payload_len in [3usize, 25] {
            let sender = std::thread::spawn({
                let path = path.clone();
                move || {
                    let mut s = UnixStream::connect(path).unwrap();
                    s.write_all(&vec![0u8; payload_len]).unwrap();
                }
            });

            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            assert!(
                read_request(&mut stream).is_err(),
                "{payload_len}-byte payload must be rejected"
            );
            sender.join().unwrap();
        }
    }
}
