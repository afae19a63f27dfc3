//! Maintenance scheduler
//!
//! One process-wide timer thread watches every open scope and fires the
//! online maintenance the manager exposes as explicit operations:
//!
//! - debounced index flushes (time threshold)
//! - compaction when a scope accumulates `compact_every` journal appends or
//!   goes `compact_interval_ms` without compacting
//! - periodic checkpoint snapshots
//!
//! The scheduler holds only a `Weak` reference to the manager; it dies with
//! it and never keeps the engine alive on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use engram_core::types::Scope;

use crate::manager::MemoryManager;

/// Default scheduler tick
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Running scheduler; stopping joins the thread
pub struct SchedulerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl MemoryManager {
    /// Start the process-wide maintenance scheduler
    ///
    /// Idempotent: a second call replaces the previous scheduler.
    pub fn start_maintenance(self: &Arc<Self>, tick: Duration) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let weak: Weak<MemoryManager> = Arc::downgrade(self);
        let flag = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("engram-maintenance".into())
            .spawn(move || {
                info!("maintenance scheduler started");
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    run_tick(&manager);
                }
                info!("maintenance scheduler stopped");
            })
            .expect("failed to spawn maintenance scheduler thread");

        let previous = self.scheduler.lock().replace(SchedulerHandle {
            shutdown,
            thread: Some(thread),
        });
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Stop the scheduler if one is running
    pub fn stop_maintenance(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
    }
}

fn run_tick(manager: &Arc<MemoryManager>) {
    let maintenance = &manager.config().maintenance;
    for &scope in Scope::resolution_order() {
        let Ok(handle) = manager.handle(scope) else {
            continue;
        };

        // Time-debounced index flush
        let paths = handle.store.paths();
        match handle
            .inverted
            .maybe_flush(&paths.inverted_index(), &paths.index_meta())
        {
            Ok(true) => debug!(%scope, "scheduled index flush"),
            Ok(false) => {}
            Err(e) => warn!(%scope, error = %e, "scheduled index flush failed"),
        }

        // Compaction triggers: append count or wall-clock interval
        let appends = handle.store.appends_since_snapshot();
        let interval_due = handle
            .store
            .last_compact_at()
            .map(|at| {
                (chrono::Utc::now() - at).num_milliseconds() as u64
                    >= maintenance.compact_interval_ms
            })
            .unwrap_or(false);
        if appends >= maintenance.compact_every || (appends > 0 && interval_due) {
            info!(%scope, appends, interval_due, "scheduled compaction");
            if let Err(e) = manager.compact(scope) {
                warn!(%scope, error = %e, "scheduled compaction failed");
            }
            continue;
        }

        // Periodic snapshot between compactions
        let snapshot_due = handle
            .store
            .last_compact_at()
            .map(|at| {
                (chrono::Utc::now() - at).num_milliseconds() as u64
                    >= maintenance.snapshot_interval_ms
            })
            .unwrap_or(appends > 0);
        if appends > 0 && snapshot_due {
            if let Err(e) = manager.snapshot(scope) {
                warn!(%scope, error = %e, "scheduled snapshot failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::config::{BackendKind, EnvOverrides, StoreConfig};
    use tempfile::TempDir;

    fn file_backend_manager(dir: &TempDir) -> Arc<MemoryManager> {
        let mut config = StoreConfig::default();
        config.storage.backend = BackendKind::File;
        Arc::new(
            MemoryManager::open(dir.path().to_path_buf(), config, EnvOverrides::default())
                .unwrap(),
        )
    }

    #[test]
    fn test_scheduler_starts_and_stops() {
        let dir = TempDir::new().unwrap();
        let manager = file_backend_manager(&dir);
        manager.start_maintenance(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        manager.stop_maintenance();
    }

    #[test]
    fn test_scheduler_replaced_on_restart() {
        let dir = TempDir::new().unwrap();
        let manager = file_backend_manager(&dir);
        manager.start_maintenance(Duration::from_millis(10));
        manager.start_maintenance(Duration::from_millis(10));
        manager.stop_maintenance();
    }
}
