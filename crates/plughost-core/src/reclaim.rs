//! Confirmed unloading of module contexts.
//!
//! Tearing a context down only releases the references the context holds
//! itself. Anything else that still points into it (a retained
//! [`ModuleRef`](crate::ModuleRef), a background thread, a release parked on
//! a deferred queue) keeps it alive. The waiter therefore keeps asking the
//! host's [`MemoryManager`] for reclamation passes until the context is gone,
//! with bounded patience:
//!
//! ```text
//! Idle ──> TearingDown ──> Polling ──┬──> Reclaimed
//!                            ▲   │   └──> TimedOut (>= timeout)
//!                            └───┘ pass, still alive
//! ```

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ReclaimConfig;
use crate::context::ContextHandle;

/// The host's memory manager.
pub trait MemoryManager: Send + Sync {
    /// Run one full, blocking reclamation pass.
    fn collect(&self);
}

/// Time source for the polling loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Wait between two reclamation passes.
    fn sleep(&self, duration: Duration);
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Queue of values whose drop has been deferred to the next reclamation pass.
///
/// Code that cannot release a module reference where it stands (a callback
/// running on a host thread, a finalizer) parks it here instead. Each
/// [`collect`](MemoryManager::collect) drops everything parked so far.
#[derive(Clone, Default)]
pub struct DeferredReleaseQueue {
    pending: Arc<Mutex<Vec<Box<dyn Any + Send>>>>,
}

impl DeferredReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `value` until the next pass.
    pub fn defer<T: Send + 'static>(&self, value: T) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(value));
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemoryManager for DeferredReleaseQueue {
    fn collect(&self) {
        let drained = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if !drained.is_empty() {
            tracing::debug!("Releasing {} deferred values", drained.len());
        }
        // Dropped outside the lock: a value's drop may defer more values.
        drop(drained);
        std::thread::yield_now();
    }
}

/// How an unload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Nothing was loaded; no pass was run.
    AlreadyEmpty,
    /// The context was reclaimed. `slow_warned` is set when the slow
    /// warning fired first.
    Reclaimed {
        passes: u32,
        elapsed: Duration,
        slow_warned: bool,
    },
    /// The context was still reachable when the timeout elapsed.
    TimedOut {
        passes: u32,
        elapsed: Duration,
        outstanding: usize,
        slow_warned: bool,
    },
}

impl ReclaimOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::TimedOut { .. })
    }
}

/// Runs the unload protocol.
pub struct ReclaimWaiter {
    memory: Arc<dyn MemoryManager>,
    clock: Arc<dyn Clock>,
    config: ReclaimConfig,
}

impl ReclaimWaiter {
    pub fn new(memory: Arc<dyn MemoryManager>, clock: Arc<dyn Clock>, config: ReclaimConfig) -> Self {
        Self {
            memory,
            clock,
            config,
        }
    }

    /// Unload the context owned by `handle` and wait until it is reclaimed.
    ///
    /// `handle` is empty when this returns, whatever the outcome. An empty
    /// handle succeeds immediately without any reclamation pass. A timeout
    /// is reported, not retried; retrying is up to the caller.
    pub fn unload(&self, handle: &mut ContextHandle) -> ReclaimOutcome {
        let Some(observer) = handle.observe() else {
            tracing::debug!("No module context to unload");
            return ReclaimOutcome::AlreadyEmpty;
        };
        let generation = observer.generation();

        tracing::info!(generation, "Unloading module context...");
        handle.unload();
        debug_assert!(handle.is_empty());

        let started = self.clock.now();
        let mut warned = false;
        let mut passes = 0u32;

        loop {
            self.memory.collect();
            passes += 1;

            if !observer.is_alive() {
                let elapsed = self.clock.now().saturating_duration_since(started);
                tracing::info!(
                    generation,
                    passes,
                    "Module context unloaded successfully."
                );
                return ReclaimOutcome::Reclaimed {
                    passes,
                    elapsed,
                    slow_warned: warned,
                };
            }

            let elapsed = self.clock.now().saturating_duration_since(started);

            // The first slow pass only warns, even past the timeout, so a
            // single stalled pass is always followed by another one.
            if !warned && elapsed >= self.config.slow_warning() {
                warned = true;
                tracing::warn!(
                    generation,
                    ?elapsed,
                    "Module unloading is taking longer than expected..."
                );
            } else if elapsed >= self.config.timeout() {
                let outstanding = observer.outstanding_references();
                tracing::error!(
                    generation,
                    passes,
                    outstanding,
                    "Failed to unload module context. Possible causes: retained module references, running threads, etc."
                );
                return ReclaimOutcome::TimedOut {
                    passes,
                    elapsed,
                    outstanding,
                    slow_warned: warned,
                };
            }

            self.clock.sleep(self.config.poll_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use crate::shared::SharedDependencySet;
    use crate::testing::{FakeBackend, ManualClock, ScriptedMemoryManager};
    use std::path::Path;

    fn loader() -> Loader {
        let backend = Arc::new(FakeBackend::new().with_module("project", &[]));
        Loader::new(backend, Arc::new(SharedDependencySet::new()))
    }

    fn waiter(memory: Arc<dyn MemoryManager>, clock: Arc<ManualClock>) -> ReclaimWaiter {
        ReclaimWaiter::new(memory, clock, ReclaimConfig::default())
    }

    #[test]
    fn test_empty_handle_runs_no_pass() {
        let memory = Arc::new(ScriptedMemoryManager::new());
        let clock = Arc::new(ManualClock::new());
        let mut handle = ContextHandle::empty();

        let outcome = waiter(memory.clone(), clock).unload(&mut handle);
        assert_eq!(outcome, ReclaimOutcome::AlreadyEmpty);
        assert!(outcome.is_success());
        assert_eq!(memory.passes(), 0);
    }

    #[test]
    fn test_reclaimed_on_first_pass() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();
        drop(module);

        let memory = Arc::new(ScriptedMemoryManager::new());
        let clock = Arc::new(ManualClock::new());
        let outcome = waiter(memory.clone(), clock).unload(&mut handle);

        assert!(matches!(outcome, ReclaimOutcome::Reclaimed { passes: 1, .. }));
        assert!(handle.is_empty());
        assert_eq!(memory.passes(), 1);
    }

    #[test]
    fn test_reclaimed_on_third_pass() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let memory = Arc::new(ScriptedMemoryManager::new());
        memory.release_on_pass(3, module);
        let clock = Arc::new(ManualClock::new());
        let outcome = waiter(memory.clone(), clock).unload(&mut handle);

        assert!(matches!(outcome, ReclaimOutcome::Reclaimed { passes: 3, .. }));
        assert!(handle.is_empty());
    }

    #[test]
    fn test_times_out_when_never_reclaimed() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let memory = Arc::new(ScriptedMemoryManager::new());
        let clock = Arc::new(ManualClock::new());
        let outcome = waiter(memory.clone(), clock.clone()).unload(&mut handle);

        match outcome {
            ReclaimOutcome::TimedOut {
                elapsed,
                outstanding,
                passes,
                slow_warned,
            } => {
                assert!(slow_warned);
                assert!(elapsed >= Duration::from_millis(5000));
                assert!(elapsed < Duration::from_millis(5000) + Duration::from_millis(10) * 2);
                assert_eq!(outstanding, 1);
                assert_eq!(passes, memory.passes());
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!outcome.is_success());
        assert!(handle.is_empty());
        drop(module);
    }

    #[test]
    fn test_timeout_respects_config() {
        let loader = loader();
        let (_module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let memory = Arc::new(ScriptedMemoryManager::new());
        let clock = Arc::new(ManualClock::new());
        let config = ReclaimConfig {
            slow_warning_ms: 20,
            timeout_ms: 50,
            poll_interval_ms: 10,
        };
        let outcome = ReclaimWaiter::new(memory.clone(), clock, config).unload(&mut handle);

        assert!(!outcome.is_success());
        // Passes at t = 0, 10, 20, 30, 40, 50.
        assert_eq!(memory.passes(), 6);
    }

    /// Memory manager whose first pass blocks the clock for `stall`.
    struct StallingMemoryManager {
        clock: Arc<ManualClock>,
        stall: Duration,
        inner: ScriptedMemoryManager,
    }

    impl MemoryManager for StallingMemoryManager {
        fn collect(&self) {
            if self.inner.passes() == 0 {
                self.clock.advance(self.stall);
            }
            self.inner.collect();
        }
    }

    #[test]
    fn test_quick_reclaim_is_not_slow() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let memory = Arc::new(ScriptedMemoryManager::new());
        memory.release_on_pass(3, module);
        let outcome = waiter(memory, Arc::new(ManualClock::new())).unload(&mut handle);

        assert!(matches!(
            outcome,
            ReclaimOutcome::Reclaimed {
                slow_warned: false,
                ..
            }
        ));
    }

    #[test]
    fn test_slow_reclaim_warns_once_and_succeeds() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        // Passes run every 10 ms; pass 201 is the first at >= 2000 ms.
        let memory = Arc::new(ScriptedMemoryManager::new());
        memory.release_on_pass(202, module);
        let clock = Arc::new(ManualClock::new());
        let outcome = waiter(memory, clock).unload(&mut handle);

        match outcome {
            ReclaimOutcome::Reclaimed {
                passes,
                elapsed,
                slow_warned,
            } => {
                assert_eq!(passes, 202);
                assert!(elapsed >= Duration::from_millis(2000));
                assert!(slow_warned);
            }
            other => panic!("expected reclamation, got {:?}", other),
        }
    }

    #[test]
    fn test_stalled_first_pass_gets_another_pass() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let clock = Arc::new(ManualClock::new());
        let memory = StallingMemoryManager {
            clock: clock.clone(),
            stall: Duration::from_millis(6000),
            inner: ScriptedMemoryManager::new(),
        };
        memory.inner.release_on_pass(2, module);
        let outcome = waiter(Arc::new(memory), clock).unload(&mut handle);

        match outcome {
            ReclaimOutcome::Reclaimed {
                passes,
                elapsed,
                slow_warned,
            } => {
                assert_eq!(passes, 2);
                assert!(elapsed >= Duration::from_millis(6000));
                assert!(slow_warned);
            }
            other => panic!("expected reclamation, got {:?}", other),
        }
    }

    #[test]
    fn test_stalled_pass_times_out_on_the_next_one() {
        let loader = loader();
        let (_module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let clock = Arc::new(ManualClock::new());
        let memory = Arc::new(StallingMemoryManager {
            clock: clock.clone(),
            stall: Duration::from_millis(6000),
            inner: ScriptedMemoryManager::new(),
        });
        let outcome = waiter(memory.clone(), clock).unload(&mut handle);

        assert!(matches!(
            outcome,
            ReclaimOutcome::TimedOut {
                passes: 2,
                slow_warned: true,
                ..
            }
        ));
        assert_eq!(memory.inner.passes(), 2);
    }

    #[test]
    fn test_deferred_release_queue_drains_on_collect() {
        let loader = loader();
        let (module, mut handle) = loader.load(Path::new("/mods/project.so")).unwrap();

        let queue = DeferredReleaseQueue::new();
        queue.defer(module);
        assert_eq!(queue.len(), 1);

        let clock = Arc::new(ManualClock::new());
        let outcome = waiter(Arc::new(queue.clone()), clock).unload(&mut handle);

        assert!(matches!(outcome, ReclaimOutcome::Reclaimed { passes: 1, .. }));
        assert!(queue.is_empty());
    }
}
