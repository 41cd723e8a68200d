use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tracing::info;

/// Process-wide admission and lifecycle state: the live-session counter, the
/// once latch, the accept gate, the session wait-group for graceful drain,
/// and the idle timer.
///
/// The counter is the only cross-task shared mutable state outside the server
/// handle; it is an atomic, never a lock.
#[derive(Debug)]
pub struct Lifecycle {
    connections: AtomicI64,
    once_used: AtomicBool,
    exited: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    active: AtomicUsize,
    drained: Notify,
    timer_tx: OnceLock<mpsc::UnboundedSender<TimerCmd>>,
}

enum TimerCmd {
    Stop,
    Restart,
}

/// Holds one slot in the live-session counter; releases it on drop, and
/// rearms the idle timer when the last slot goes away. Every admission path
/// acquires one of these, so rejection branches release automatically.
pub struct ConnectionGuard {
    lifecycle: Arc<Lifecycle>,
    previous: i64,
}

/// Membership in the graceful-drain wait group.
pub struct SessionRegistration {
    lifecycle: Arc<Lifecycle>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            connections: AtomicI64::new(0),
            once_used: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            shutdown_tx,
            active: AtomicUsize::new(0),
            drained: Notify::new(),
            timer_tx: OnceLock::new(),
        })
    }

    /// Claim a counter slot. Returns a guard carrying the pre-increment
    /// value, which admission compares against `max_connection`.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        let previous = self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            lifecycle: Arc::clone(self),
            previous,
        }
    }

    pub fn connection_count(&self) -> i64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Single-try once latch. The first caller wins; losers never retry.
    pub fn try_once(&self) -> bool {
        self.once_used
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Request graceful shutdown: stop accepting new connections while
    /// existing sessions run to completion. Returns whether this call was the
    /// first one.
    pub fn exit(&self) -> bool {
        let first = self
            .exited
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            info!("received exit request, waiting for all clients to close sessions");
            // send_replace updates the gate even before anyone subscribes.
            self.shutdown_tx.send_replace(true);
        }
        first
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Resolves once `exit` has been called.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Join the graceful-drain wait group for the duration of a session.
    pub fn register_session(self: &Arc<Self>) -> SessionRegistration {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionRegistration {
            lifecycle: Arc::clone(self),
        }
    }

    /// Wait until every registered session has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Arm the idle timer. When it fires with no live sessions, the server
    /// begins graceful shutdown.
    pub fn arm_idle_timer(self: &Arc<Self>, timeout: Duration) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if self.timer_tx.set(tx).is_err() {
            return;
        }
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let mut armed = true;
            loop {
                if armed {
                    tokio::select! {
                        cmd = rx.recv() => match cmd {
                            Some(TimerCmd::Stop) => armed = false,
                            Some(TimerCmd::Restart) => {}
                            None => return,
                        },
                        _ = tokio::time::sleep(timeout) => {
                            if lifecycle.connection_count() == 0 {
                                info!(seconds = timeout.as_secs(), "idle timeout reached");
                                lifecycle.exit();
                                return;
                            }
                            armed = false;
                        }
                    }
                } else {
                    match rx.recv().await {
                        Some(TimerCmd::Restart) => armed = true,
                        Some(TimerCmd::Stop) => {}
                        None => return,
                    }
                }
            }
        });
    }

    pub fn stop_idle_timer(&self) {
        if let Some(tx) = self.timer_tx.get() {
            let _ = tx.send(TimerCmd::Stop);
        }
    }

    pub fn restart_idle_timer(&self) {
        if let Some(tx) = self.timer_tx.get() {
            let _ = tx.send(TimerCmd::Restart);
        }
    }
}

impl ConnectionGuard {
    /// Counter value before this connection was added.
    pub fn previous(&self) -> i64 {
        self.previous
    }

    /// Counter value including this connection.
    pub fn count(&self) -> i64 {
        self.previous + 1
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let before = self.lifecycle.connections.fetch_sub(1, Ordering::SeqCst);
        if before <= 1 && !self.lifecycle.exited() {
            self.lifecycle.restart_idle_timer();
        }
    }
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        if self.lifecycle.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.lifecycle.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_returns_to_zero_after_guards_drop() {
        let lifecycle = Lifecycle::new();
        {
            let g1 = lifecycle.acquire();
            let g2 = lifecycle.acquire();
            assert_eq!(g1.previous(), 0);
            assert_eq!(g2.previous(), 1);
            assert_eq!(g2.count(), 2);
            assert_eq!(lifecycle.connection_count(), 2);
        }
        assert_eq!(lifecycle.connection_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_go_negative() {
        let lifecycle = Lifecycle::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let lc = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let guard = lc.acquire();
                    assert!(guard.count() > 0);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(lifecycle.connection_count(), 0);
    }

    #[tokio::test]
    async fn once_latch_admits_exactly_one_winner() {
        let lifecycle = Lifecycle::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lc = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move { lc.try_once() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn exit_reports_first_call_only() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.exit());
        assert!(!lifecycle.exit());
        assert!(!lifecycle.exit());
        // and the accept gate observed it
        lifecycle.shutdown_requested().await;
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_without_sessions() {
        let lifecycle = Lifecycle::new();
        tokio::time::timeout(Duration::from_millis(100), lifecycle.wait_idle())
            .await
            .expect("wait_idle should not block");
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_registrations_drop() {
        let lifecycle = Lifecycle::new();
        let registration = lifecycle.register_session();
        let waiter = {
            let lc = Arc::clone(&lifecycle);
            tokio::spawn(async move { lc.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(registration);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should finish")
            .expect("task");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_when_no_sessions_are_live() {
        let lifecycle = Lifecycle::new();
        lifecycle.arm_idle_timer(Duration::from_secs(2));
        tokio::time::timeout(Duration::from_secs(10), lifecycle.shutdown_requested())
            .await
            .expect("idle timer should trigger exit");
        assert!(lifecycle.exited());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_idle_timer_does_not_fire() {
        let lifecycle = Lifecycle::new();
        lifecycle.arm_idle_timer(Duration::from_secs(1));
        lifecycle.stop_idle_timer();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!lifecycle.exited());

        lifecycle.restart_idle_timer();
        tokio::time::timeout(Duration::from_secs(10), lifecycle.shutdown_requested())
            .await
            .expect("restarted timer should fire");
    }
}
