//! At-most-once session teardown
//!
//! Teardown can be triggered by an explicit disconnect, by the OS revoking
//! the interface and by the hosting process going away, possibly all at
//! once. [`ShutdownCoordinator::begin`] claims the session under the record
//! lock: it takes the interface handle and sets the in-flight flag, so every
//! other trigger sees nothing to do. The slow work then runs unlocked on the
//! session's worker pool. If the pool has to cancel it, the stops it did not
//! reach are run once more, each bounded by the forced wait.

use std::future::Future;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use whisper_tun::TunHandle;

use crate::bridge::BridgeController;
use crate::error::Result;
use crate::event::SessionState;
use crate::pool::{PoolShutdown, WorkerPool};
use crate::router::EngineAdapter;
use crate::session::SessionRecord;
use crate::tunnel::TunInterfaceManager;

pub(crate) type SharedRecord = Arc<Mutex<SessionRecord>>;

/// Lock the session record, recovering from poisoning
pub(crate) fn lock(record: &SharedRecord) -> MutexGuard<'_, SessionRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight flag when the teardown task ends or is cancelled
struct InFlightGuard {
    record: SharedRecord,
    epoch: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut record = lock(&self.record);
        if record.epoch == self.epoch {
            record.shutting_down = false;
        }
    }
}

/// A claimed teardown; the session's resources now belong to it
pub(crate) struct Teardown {
    handle: TunHandle,
    pool: Arc<WorkerPool>,
    guard: InFlightGuard,
    /// State the session was in when the teardown was claimed
    pub(crate) previous: SessionState,
}

/// Runs detach, engine stop and bridge stop exactly once per session
pub struct ShutdownCoordinator {
    tunnel: Arc<TunInterfaceManager>,
    engine: Arc<EngineAdapter>,
    bridge: Arc<BridgeController>,
    grace: Duration,
    force: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        tunnel: Arc<TunInterfaceManager>,
        engine: Arc<EngineAdapter>,
        bridge: Arc<BridgeController>,
        grace: Duration,
        force: Duration,
    ) -> Self {
        Self {
            tunnel,
            engine,
            bridge,
            grace,
            force,
        }
    }

    /// Claim the session for teardown
    ///
    /// Returns `None` when the session owns no handle or a teardown is
    /// already in flight. On success the session is in Stopping.
    pub(crate) fn begin(&self, shared: &SharedRecord) -> Option<Teardown> {
        let mut record = lock(shared);
        if record.shutting_down {
            return None;
        }
        let handle = record.handle.take()?;
        let pool = record
            .pool
            .take()
            .unwrap_or_else(|| Arc::new(WorkerPool::new(1)));

        record.shutting_down = true;
        let previous = record.set_state(SessionState::Stopping);

        Some(Teardown {
            handle,
            pool,
            guard: InFlightGuard {
                record: shared.clone(),
                epoch: record.epoch,
            },
            previous,
        })
    }

    /// Run the claimed teardown and shut down the session's pool
    ///
    /// Each step is best-effort; a failing step is logged and the next one
    /// still runs. Resolving `interrupt` cancels the pool at once. Engine and
    /// bridge are stopped even when the pool is cancelled.
    pub(crate) async fn finish<I>(&self, teardown: Teardown, interrupt: I) -> Result<PoolShutdown>
    where
        I: Future<Output = ()>,
    {
        let Teardown {
            mut handle,
            pool,
            guard,
            ..
        } = teardown;

        let tunnel = self.tunnel.clone();
        let engine = self.engine.clone();
        let bridge = self.bridge.clone();
        let bridge_claimed = Arc::new(AtomicBool::new(false));
        let claimed = bridge_claimed.clone();

        let queued = pool.spawn(async move {
            let _in_flight = guard;

            match tunnel.detach(&mut handle) {
                Ok(fd) => {
                    log::debug!(
                        "Closing descriptor {} that was never handed off",
                        fd.as_raw_fd()
                    );
                    drop(fd);
                }
                Err(e) if e.is_already_detached() => {
                    log::debug!("Interface {} already handed off", handle.name());
                }
                Err(e) => log::warn!("Failed to detach interface {}: {}", handle.name(), e),
            }

            engine.stop().await;
            if !claimed.swap(true, Ordering::SeqCst) {
                bridge.stop().await;
            }

            log::info!("Teardown of {} finished", handle.name());
        });

        if !queued {
            log::error!("Teardown could not be queued on the session pool");
        }

        let result = pool.shutdown(self.grace, self.force, interrupt).await;
        if !matches!(result, Ok(PoolShutdown::Drained)) {
            self.stop_leftovers(&bridge_claimed).await;
        }

        let outcome = result?;
        log::debug!("Session pool shut down: {:?}", outcome);
        Ok(outcome)
    }

    /// Stop the collaborators a cancelled teardown did not reach
    ///
    /// The engine adapter ignores a second stop; the bridge is only stopped
    /// if the teardown task never got to it.
    async fn stop_leftovers(&self, bridge_claimed: &AtomicBool) {
        log::warn!("Teardown was cut short; stopping what is left");

        if tokio::time::timeout(self.force, self.engine.stop())
            .await
            .is_err()
        {
            log::error!("Routing engine did not stop within {:?}", self.force);
        }

        if !bridge_claimed.swap(true, Ordering::SeqCst)
            && tokio::time::timeout(self.force, self.bridge.stop())
                .await
                .is_err()
        {
            log::error!("Bridge did not stop within {:?}", self.force);
        }
    }
}
