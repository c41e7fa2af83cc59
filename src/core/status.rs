use std::sync::atomic::{AtomicBool, Ordering};

/// Global readiness flag indicating whether the first request snapshot has arrived.
///
/// Used by the readiness probe endpoint. Until the store subscription has delivered
/// its initial snapshot the operator dashboard would show an empty queue, so the
/// service reports itself as not ready.
static SNAPSHOT_LOADED: AtomicBool = AtomicBool::new(false);

/// Store backend that delivered the snapshot, for log output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Memory,
    Etcd,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Memory => "memory",
            SnapshotSource::Etcd => "etcd",
        }
    }
}

/// Mark the service as ready once the initial snapshot is in place.
pub fn mark_ready(source: SnapshotSource) {
    let was_ready = SNAPSHOT_LOADED.swap(true, Ordering::SeqCst);
    if !was_ready {
        log::info!(
            "Initial request snapshot loaded from {}, service is ready",
            source.as_str()
        );
    }
}

/// Check if the service is ready to handle traffic.
pub fn is_ready() -> bool {
    SNAPSHOT_LOADED.load(Ordering::SeqCst)
}

/// Reset readiness status (useful for testing)
#[allow(dead_code)]
pub fn reset() {
    SNAPSHOT_LOADED.store(false, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // These tests touch process-wide state, serialize them.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_initial_state_not_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        assert!(!is_ready());
    }

    #[test]
    fn test_mark_ready_memory() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        assert!(!is_ready());
        mark_ready(SnapshotSource::Memory);
        assert!(is_ready());
    }

    #[test]
    fn test_multiple_marks_stay_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        mark_ready(SnapshotSource::Etcd);
        assert!(is_ready());
        mark_ready(SnapshotSource::Etcd);
        assert!(is_ready());
    }
}
