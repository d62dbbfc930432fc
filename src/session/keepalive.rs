//! Per-session keep-alive pinger.
//!
//! One named thread per session pings at half the session lifetime whenever
//! the session has been idle that long. The first wait is randomized so a
//! burst of sessions opened together does not ping in lockstep. The thread
//! exits when the shutdown sender is dropped or the server reports the
//! session gone; in the latter case it also reaps expired registry entries,
//! its own included.

use super::backend::ActivityClock;
use super::registry::{SessionKey, SessionRegistry};
use crate::transport::{Transport, TransportError};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MIN_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a running pinger; dropping or stopping it ends the thread
pub(crate) struct KeepAlive {
    shutdown: Option<Sender<()>>,
}

impl KeepAlive {
    /// Spawn a pinger. Returns None when the thread cannot be spawned; the
    /// session then simply relies on caller activity.
    pub(crate) fn start(
        key: SessionKey,
        url: String,
        transport: Arc<dyn Transport>,
        clock: Arc<ActivityClock>,
        registry: Arc<SessionRegistry>,
    ) -> Option<Self> {
        let interval = ping_interval(clock.lifetime());
        let initial = initial_delay(interval);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let spawned = thread::Builder::new()
            .name(format!("keepalive-{key}"))
            .spawn(move || {
                let mut wait = initial;
                loop {
                    match shutdown_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let idle = clock.idle();
                    if idle < interval {
                        wait = (interval - idle).max(MIN_INTERVAL);
                        continue;
                    }

                    let dispatched = Instant::now();
                    match transport.ping(&url) {
                        Ok(()) => {
                            clock.touch_at(dispatched);
                            registry.record_keepalive(key);
                            tracing::trace!(session = %url, "keepalive_ping");
                        }
                        Err(TransportError::SessionGone { .. }) => {
                            tracing::debug!(session = %url, "keepalive_session_gone");
                            registry.mark_expired(key);
                            registry.reap_expired();
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(session = %url, error = %e, "keepalive_ping_failed");
                        }
                    }
                    wait = interval;
                }
                tracing::trace!(session = %url, "keepalive_stopped");
            });

        match spawned {
            Ok(_) => Some(KeepAlive {
                shutdown: Some(shutdown_tx),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "keepalive_spawn_failed");
                None
            }
        }
    }

    pub(crate) fn stop(mut self) {
        self.shutdown.take();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shutdown.take();
    }
}

/// Half the lifetime, with a floor so tiny lifetimes do not spin
pub(crate) fn ping_interval(lifetime: Duration) -> Duration {
    (lifetime / 2).max(MIN_INTERVAL)
}

fn initial_delay(interval: Duration) -> Duration {
    let millis = interval.as_millis().max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..millis);
    Duration::from_millis(jitter).max(MIN_INTERVAL)
}
