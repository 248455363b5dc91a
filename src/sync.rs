use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

/// Tracks whether cross-process gradient synchronization is currently withheld.
///
/// Suspensions nest: synchronization resumes once every outstanding guard is dropped.
#[derive(Debug, Default)]
pub struct SyncController {
    depth: AtomicUsize,
}

impl SyncController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Withholds synchronization until the returned guard is dropped.
    pub fn suspend(&self) -> SyncSuspension<'_> {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(depth = depth; "distributed sync suspended");

        SyncSuspension {
            controller: Some(self),
        }
    }

    /// Whether gradients would be synchronized right now.
    pub fn is_sync_enabled(&self) -> bool {
        self.depth.load(Ordering::Acquire) == 0
    }

    fn resume(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(depth = depth; "distributed sync suspension released");
    }
}

/// Keeps distributed synchronization withheld while alive.
#[must_use = "synchronization resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SyncSuspension<'a> {
    controller: Option<&'a SyncController>,
}

impl SyncSuspension<'_> {
    /// A guard that suspends nothing, for contexts that never synchronize.
    pub fn inert() -> Self {
        Self { controller: None }
    }

    /// Whether this guard actually withholds synchronization.
    pub fn is_active(&self) -> bool {
        self.controller.is_some()
    }
}

impl Drop for SyncSuspension<'_> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspension_restores_on_drop() {
        let sync = SyncController::new();
        assert!(sync.is_sync_enabled());

        {
            let guard = sync.suspend();
            assert!(guard.is_active());
            assert!(!sync.is_sync_enabled());
        }

        assert!(sync.is_sync_enabled());
    }

    #[test]
    fn nested_suspensions() {
        let sync = SyncController::new();
        let outer = sync.suspend();
        let inner = sync.suspend();

        drop(inner);
        assert!(!sync.is_sync_enabled());

        drop(outer);
        assert!(sync.is_sync_enabled());
    }

    #[test]
    fn inert_guard() {
        let guard = SyncSuspension::inert();
        assert!(!guard.is_active());
    }
}
