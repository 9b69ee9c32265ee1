//! Listening socket + bounded pool of session slots.
//!
//! The protocol's "single cooperative poll loop" (spec §4.5, §5) maps
//! onto a single-threaded tokio runtime: `accept()`'s future and every
//! live session's future are all driven by the same executor, which only
//! ever interleaves at `.await` points, exactly like the reactor's poll
//! boundaries. A `tokio::sync::Semaphore` sized to `N` stands in for the
//! fixed session-slot array (spec §9, "arena for FID entries" applies
//! equally to the session pool) — past `N` concurrent sessions, `accept`
//! is simply not polled for a new connection until a slot frees up.
//!
//! Run the binary with a current-thread runtime
//! (`#[tokio::main(flavor = "current_thread")]`) to match the spec's
//! single-execution-context model as closely as tokio allows.

use crate::session::{Session, SessionLimits};
use crate::storage::StorageGateway;
use log::{error, info};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Read-only statistics exposed behind a short-held set of atomics
/// (spec §9 Design Note: "expose read-only statistics behind a
/// short-held lock" — atomics avoid needing a lock at all).
#[derive(Default)]
pub struct Stats {
    sessions_active: AtomicUsize,
    sessions_total: AtomicUsize,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_accept(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_teardown(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, was_error: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if was_error {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_active: usize,
    pub sessions_total: usize,
    pub requests_total: u64,
    pub errors_total: u64,
}

/// The server: a listener, a bounded pool of session slots, and global
/// statistics (spec §3).
pub struct Server {
    listener: TcpListener,
    gateway: StorageGateway,
    limits: SessionLimits,
    slots: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    stats: Arc<Stats>,
    next_session_id: usize,
    shutdown_tx: watch::Sender<bool>,
    sessions: JoinSet<()>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        gateway: StorageGateway,
        limits: SessionLimits,
        max_sessions: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Server {
            listener,
            gateway,
            limits,
            slots: Arc::new(Semaphore::new(max_sessions)),
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(Stats::default()),
            next_session_id: 0,
            shutdown_tx,
            sessions: JoinSet::new(),
        })
    }

    /// A handle the caller can use to stop the server from another task
    /// (spec §4.5, §9: "an atomic boolean read once per reactor
    /// iteration").
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Drive accepts until shutdown is requested. Each accepted
    /// connection becomes one bounded, independently-scheduled session
    /// task; `Semaphore` permits enforce the fixed slot count.
    ///
    /// On shutdown, stops accepting first, then signals every live
    /// session to close and waits for all of them to finish before
    /// returning, per spec §4.5 ("stop closes all sessions first, then
    /// the listener") — the listener itself closes when `self` drops.
    pub async fn serve(&mut self) -> std::io::Result<()> {
        info!("server: listening on {:?}", self.listener.local_addr()?);

        while self.running.load(Ordering::Relaxed) {
            // Wait for a free slot, re-checking the shutdown flag
            // periodically rather than blocking on it indefinitely.
            let permit = tokio::select! {
                res = self.slots.clone().acquire_owned() => match res {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => continue,
            };

            let accept = tokio::select! {
                res = self.listener.accept() => res,
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                    drop(permit);
                    continue;
                }
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    error!("server: accept failed: {}", e);
                    drop(permit);
                    continue;
                }
            };

            let id = self.next_session_id;
            self.next_session_id += 1;
            info!("server: session {} from {}", id, peer);

            let session = Session::new(id, self.gateway.clone(), self.limits)
                .with_stats(self.stats.clone())
                .with_shutdown(self.shutdown_tx.subscribe());
            let stats = self.stats.clone();
            stats.record_accept();
            self.sessions.spawn(async move {
                session.run(stream).await;
                stats.record_teardown();
                drop(permit);
            });
        }

        info!("server: shutdown requested, closing {} session(s)", self.sessions.len());
        let _ = self.shutdown_tx.send(true);
        while self.sessions.join_next().await.is_some() {}
        info!("server: all sessions closed");
        Ok(())
    }
}

/// A cloneable flag that requests server shutdown. Setting it stops the
/// reactor from accepting further connections on its next iteration and
/// signals every live session to close (spec §4.5: "stop closes all
/// sessions first, then the listener").
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_snapshot_reflects_accept_and_teardown() {
        let stats = Stats::default();
        stats.record_accept();
        stats.record_accept();
        stats.record_teardown();
        stats.record_request(false);
        stats.record_request(true);

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_active, 1);
        assert_eq!(snap.sessions_total, 2);
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.errors_total, 1);
    }

    #[test]
    fn shutdown_handle_flips_the_shared_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let handle = ShutdownHandle {
            running: running.clone(),
        };
        handle.stop();
        assert!(!running.load(Ordering::Relaxed));
    }
}
