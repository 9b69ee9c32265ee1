//! Per-connection session: the framer and dispatch loop.
//!
//! A session accumulates bytes into a receive buffer bounded by the
//! negotiated message size, peels off complete frames one at a time, and
//! dispatches each synchronously — the next frame is never read before
//! the current one's reply has been written (spec §4.4). The state
//! machine only ever advances forward; any fatal condition tears the
//! session down via [`Session::teardown`].

use crate::error::{string, Error};
use crate::fcall::*;
use crate::fidtable::FidTable;
use crate::serialize::{read_msg, write_msg};
use crate::storage::StorageGateway;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Header size: 4-byte length + 1-byte type + 2-byte tag (spec §4.1).
pub const HEADER_SIZE: u32 = 7;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    VersionNegotiated,
    Attached,
    Error,
}

/// Limits this session enforces, derived from the server's configuration
/// (spec §5 "bounded work").
#[derive(Copy, Clone, Debug)]
pub struct SessionLimits {
    pub max_msize: u32,
    pub max_fids: usize,
    pub send_timeout: Duration,
}

/// Extracts exactly one complete frame from `buf` if present, shifting
/// the remainder down. Pure and synchronous so it can be unit tested
/// without a socket.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame.
/// A fatal framing error (`size < 7` or `size > max_msize`) is reported
/// as `Err` and the caller must tear the session down without a reply
/// (spec §4.4, §7.1).
pub fn extract_frame(buf: &mut Vec<u8>, max_msize: u32) -> Result<Option<Vec<u8>>, Error> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if size < HEADER_SIZE {
        return Err(Error::fatal(format!("frame size {} below minimum", size)));
    }
    if size > max_msize {
        return Err(Error::fatal(format!(
            "frame size {} exceeds negotiated max {}",
            size, max_msize
        )));
    }
    if (buf.len() as u32) < size {
        return Ok(None);
    }
    let frame = buf.drain(..size as usize).collect();
    Ok(Some(frame))
}

/// Per-connection state. Owns the fid table and holds a cloned handle to
/// the shared [`StorageGateway`] (the gateway itself enforces mutual
/// exclusion, so sharing it across sessions is the point, spec §3).
pub struct Session {
    pub id: usize,
    pub state: SessionState,
    pub msize: u32,
    pub version: String,
    pub fids: FidTable,
    pub gateway: StorageGateway,
    pub limits: SessionLimits,
    pub stats: Option<std::sync::Arc<crate::server::Stats>>,
    shutdown_rx: Option<tokio::sync::watch::Receiver<bool>>,
    recv_buf: Vec<u8>,
}

impl Session {
    pub fn new(id: usize, gateway: StorageGateway, limits: SessionLimits) -> Self {
        Session {
            id,
            state: SessionState::Connected,
            msize: limits.max_msize,
            version: String::new(),
            fids: FidTable::new(limits.max_fids),
            gateway,
            limits,
            stats: None,
            shutdown_rx: None,
            recv_buf: Vec::with_capacity(limits.max_msize as usize),
        }
    }

    /// Attach the server's shared statistics counters, incremented once
    /// per dispatched request (spec §9 Design Note: pass an updates
    /// handle into handlers rather than a back-pointer to the server).
    pub fn with_stats(mut self, stats: std::sync::Arc<crate::server::Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Attach the server's shutdown signal: `run`'s read loop selects on
    /// it alongside the socket, so a server-wide stop request tears this
    /// session down immediately instead of waiting for its next frame
    /// (spec §4.5: "stop closes all sessions first, then the listener").
    pub fn with_shutdown(mut self, rx: tokio::sync::watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(rx);
        self
    }

    /// Close every fid's open storage handle, if any, without removing
    /// the fids themselves yet — a prelude shared by `reset_for_version`
    /// and `teardown` so neither leaks a handle into the storage driver
    /// (spec §4.3: "FreeAll(): ... closes every open handle and clears
    /// the table.").
    async fn close_open_handles(&mut self) {
        let handles: Vec<u64> = self
            .fids
            .iter()
            .filter(|(_, state)| state.opened)
            .map(|(_, state)| state.handle)
            .collect();
        for handle in handles {
            let _ = self.gateway.close(handle).await;
        }
    }

    /// Reset back to version-negotiated state and invalidate every fid,
    /// per a mid-session `Tversion` (spec §6, Open Question resolved in
    /// DESIGN.md).
    pub async fn reset_for_version(&mut self) {
        self.close_open_handles().await;
        self.fids.clear();
        self.state = SessionState::VersionNegotiated;
    }

    pub fn attach(&mut self) {
        self.state = SessionState::Attached;
    }

    /// Release every fid, closing any still-open storage handle first.
    /// Safe to call more than once (spec §8 property 10, idempotent
    /// teardown) — the second call simply finds no open handles left.
    pub async fn teardown(&mut self) {
        self.close_open_handles().await;
        self.fids.clear();
        self.state = SessionState::Error;
    }

    /// Drive one connection end to end: read, frame, dispatch, reply,
    /// repeat until a terminal condition (spec §4.4).
    pub async fn run(mut self, mut stream: TcpStream) {
        info!("session {}: accepted", self.id);
        let mut read_buf = vec![0u8; self.limits.max_msize as usize];
        let mut shutdown_rx = self.shutdown_rx.clone();

        'outer: loop {
            let read_result = match shutdown_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        res = stream.read(&mut read_buf) => Some(res),
                        _ = rx.changed() => None,
                    }
                }
                None => Some(stream.read(&mut read_buf).await),
            };

            let n = match read_result {
                None => {
                    info!("session {}: shutdown requested", self.id);
                    break;
                }
                Some(Ok(0)) => {
                    info!("session {}: remote closed", self.id);
                    break;
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    warn!("session {}: read error: {}", self.id, e);
                    break;
                }
            };
            self.recv_buf.extend_from_slice(&read_buf[..n]);

            loop {
                let frame = match extract_frame(&mut self.recv_buf, self.msize) {
                    Ok(Some(f)) => f,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("session {}: {}", self.id, e);
                        break 'outer;
                    }
                };

                let reply = self.dispatch_frame(&frame).await;
                match reply {
                    Ok(bytes) => {
                        if let Err(e) = self.send(&mut stream, &bytes).await {
                            warn!("session {}: send failed: {}", self.id, e);
                            break 'outer;
                        }
                    }
                    Err(e) => {
                        warn!("session {}: fatal dispatch error: {}", self.id, e);
                        break 'outer;
                    }
                }
            }
        }

        self.teardown().await;
        let _ = stream.shutdown().await;
        info!("session {}: torn down", self.id);
    }

    /// Decode one frame, dispatch it to a handler, and encode the reply.
    /// Only a framing-level failure (fatal to the session) returns `Err`
    /// here; handler-level failures are already folded into an `Rerror`
    /// reply by [`crate::handlers::dispatch`].
    async fn dispatch_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>, Error> {
        // frame includes the 4-byte size prefix; the codec reads
        // everything after it.
        let mut cursor = std::io::Cursor::new(&frame[4..]);
        let msg = match read_msg(&mut cursor) {
            Ok(m) => m,
            Err(e) => return Err(Error::fatal(format!("malformed message: {}", e))),
        };
        debug!("session {}: \t<- {:?}", self.id, msg.body);

        let tag = msg.tag;
        let result = crate::handlers::dispatch(self, msg.body).await;
        if let Some(stats) = &self.stats {
            stats.record_request(result.is_err());
        }
        let reply_body = match result {
            Ok(body) => body,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => FCall::RError {
                ename: e.as_reply_string(),
            },
        };
        debug!("session {}: \t-> {:?}", self.id, reply_body);

        let reply = Msg {
            tag,
            body: reply_body,
        };
        let mut out = Vec::with_capacity(self.msize as usize);
        out.extend_from_slice(&[0u8; 4]);
        write_msg(&mut out, &reply).map_err(|e| Error::fatal(e.to_string()))?;

        let total = out.len() as u32;
        if total > self.msize {
            // A reply too large to fit is a programming/storage-config
            // error, not something the client caused; fall back to an
            // error reply that is guaranteed to fit (spec §8 property 9).
            return self.encode_oversize_fallback(tag);
        }
        out[..4].copy_from_slice(&total.to_le_bytes());
        Ok(out)
    }

    fn encode_oversize_fallback(&self, tag: u16) -> Result<Vec<u8>, Error> {
        let reply = Msg {
            tag,
            body: FCall::RError {
                ename: string::BAD_MESSAGE.to_owned(),
            },
        };
        let mut out = Vec::new();
        out.extend_from_slice(&[0u8; 4]);
        write_msg(&mut out, &reply).map_err(|e| Error::fatal(e.to_string()))?;
        let total = out.len() as u32;
        out[..4].copy_from_slice(&total.to_le_bytes());
        Ok(out)
    }

    /// Write a framed reply, yielding back to the reactor and retrying
    /// while the send window is saturated, bounded by `send_timeout`
    /// (spec §4.4, §5).
    async fn send(&self, stream: &mut TcpStream, bytes: &[u8]) -> Result<(), Error> {
        tokio::time::timeout(self.limits.send_timeout, stream.write_all(bytes))
            .await
            .map_err(|_| Error::fatal("send window timeout"))?
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fidtable::FidState;
    use crate::storage::{Attributes, DirEntry, StorageDriver, StorageGateway};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CloseCountingDriver {
        closed: Arc<AtomicUsize>,
    }

    impl StorageDriver for CloseCountingDriver {
        fn is_mounted(&self) -> bool {
            true
        }
        fn open(&mut self, _path: &str) -> Result<u64, crate::error::DriverErrno> {
            Ok(1)
        }
        fn create(&mut self, _path: &str) -> Result<u64, crate::error::DriverErrno> {
            Ok(1)
        }
        fn directory_create(&mut self, _path: &str) -> Result<(), crate::error::DriverErrno> {
            Ok(())
        }
        fn close(&mut self, _handle: u64) -> Result<(), crate::error::DriverErrno> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn read(&mut self, _handle: u64, _buf: &mut [u8]) -> Result<u32, crate::error::DriverErrno> {
            Ok(0)
        }
        fn write(&mut self, _handle: u64, _buf: &[u8]) -> Result<u32, crate::error::DriverErrno> {
            Ok(0)
        }
        fn seek(&mut self, _handle: u64, _offset: u64) -> Result<(), crate::error::DriverErrno> {
            Ok(())
        }
        fn directory_read(
            &mut self,
            _handle: u64,
        ) -> Result<Option<DirEntry>, crate::error::DriverErrno> {
            Ok(None)
        }
        fn delete(&mut self, _path: &str) -> Result<(), crate::error::DriverErrno> {
            Ok(())
        }
        fn rename(&mut self, _old: &str, _new: &str) -> Result<(), crate::error::DriverErrno> {
            Ok(())
        }
        fn size(&mut self, _handle: u64) -> Result<u64, crate::error::DriverErrno> {
            Ok(0)
        }
        fn attributes(&mut self, _handle: u64) -> Result<Attributes, crate::error::DriverErrno> {
            Err(crate::error::DriverErrno::NotFound)
        }
        fn free_space(&self) -> u64 {
            0
        }
        fn total_space(&self) -> u64 {
            0
        }
    }

    fn session_with_counting_driver() -> (Session, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let gateway = StorageGateway::new(
            Box::new(CloseCountingDriver {
                closed: closed.clone(),
            }),
            Duration::from_secs(1),
        );
        let limits = SessionLimits {
            max_msize: 8192,
            max_fids: 4,
            send_timeout: Duration::from_secs(1),
        };
        (Session::new(0, gateway, limits), closed)
    }

    #[tokio::test]
    async fn teardown_closes_every_open_fid_handle() {
        let (mut session, closed) = session_with_counting_driver();
        let mut opened = FidState::new(1, QId::root(), "/a".to_owned());
        opened.opened = true;
        session.fids.insert(1, opened).unwrap();
        session
            .fids
            .insert(2, FidState::new(0, QId::root(), "/".to_owned()))
            .unwrap();

        session.teardown().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(session.fids.is_empty());
        assert_eq!(session.state, SessionState::Error);
    }

    #[tokio::test]
    async fn reset_for_version_closes_open_handles_before_clearing() {
        let (mut session, closed) = session_with_counting_driver();
        let mut opened = FidState::new(1, QId::root(), "/a".to_owned());
        opened.opened = true;
        session.fids.insert(1, opened).unwrap();

        session.reset_for_version().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.state, SessionState::VersionNegotiated);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_does_not_reclose() {
        let (mut session, closed) = session_with_counting_driver();
        let mut opened = FidState::new(1, QId::root(), "/a".to_owned());
        opened.opened = true;
        session.fids.insert(1, opened).unwrap();

        session.teardown().await;
        session.teardown().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extract_frame_waits_for_full_header() {
        let mut buf = vec![1, 2, 3];
        assert_eq!(extract_frame(&mut buf, 8192).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn extract_frame_waits_for_full_payload() {
        let mut buf = 20u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 5]);
        assert_eq!(extract_frame(&mut buf, 8192).unwrap(), None);
    }

    #[test]
    fn extract_frame_returns_one_frame_and_shifts_remainder() {
        let mut first = 8u32.to_le_bytes().to_vec();
        first.extend_from_slice(&[0xAA; 4]);
        let mut buf = first.clone();
        buf.extend_from_slice(&[9, 9, 9]);

        let frame = extract_frame(&mut buf, 8192).unwrap().unwrap();
        assert_eq!(frame, first);
        assert_eq!(buf, vec![9, 9, 9]);
    }

    #[test]
    fn undersized_frame_is_fatal() {
        let buf_backing = 3u32.to_le_bytes().to_vec();
        let mut buf = buf_backing;
        buf.extend_from_slice(&[0, 0, 0]);
        assert!(extract_frame(&mut buf, 8192).is_err());
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let mut buf = 9000u32.to_le_bytes().to_vec();
        buf.resize(9000, 0);
        assert!(extract_frame(&mut buf, 8192).is_err());
    }
}
