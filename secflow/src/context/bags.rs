//! Run-scoped bags shared between stages.

use crate::core::{ScanArtifact, ScanType};
use parking_lot::{Mutex, RwLock};
use std::any::Any;

/// Scan artifacts produced by earlier stages of the same run.
///
/// Append-only: later stages read what earlier stages produced.
#[derive(Debug, Default)]
pub struct ArtifactBag {
    artifacts: RwLock<Vec<ScanArtifact>>,
}

impl ArtifactBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an artifact.
    pub fn push(&self, artifact: ScanArtifact) {
        self.artifacts.write().push(artifact);
    }

    /// Returns the most recent artifact of the given scan type.
    #[must_use]
    pub fn latest(&self, scan_type: ScanType) -> Option<ScanArtifact> {
        self.artifacts
            .read()
            .iter()
            .rev()
            .find(|a| a.scan_type == scan_type)
            .cloned()
    }

    /// Returns all recorded artifacts.
    #[must_use]
    pub fn all(&self) -> Vec<ScanArtifact> {
        self.artifacts.read().clone()
    }

    /// Returns the number of recorded artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.read().is_empty()
    }
}

/// Guards that must stay alive until the run's cleanup has finished.
///
/// Stages park environment leases here; the scheduler drops the bag only
/// after the cleanup coordinator returns.
#[derive(Default)]
pub struct HeldResources {
    guards: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl HeldResources {
    /// Creates an empty holder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps a guard alive for the rest of the run.
    pub fn hold<T: Any + Send>(&self, guard: T) {
        self.guards.lock().push(Box::new(guard));
    }

    /// Returns the number of held guards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.lock().len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.lock().is_empty()
    }

    /// Drops every guard, most recent first.
    pub fn release_all(&self) {
        let mut guards = std::mem::take(&mut *self.guards.lock());
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
    }
}

impl std::fmt::Debug for HeldResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldResources")
            .field("held", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_artifact_bag_latest_by_type() {
        let bag = ArtifactBag::new();
        bag.push(ScanArtifact::file(ScanType::DependencyScan, "old.json"));
        bag.push(ScanArtifact::file(ScanType::DynamicScan, "zap.xml"));
        bag.push(ScanArtifact::file(ScanType::DependencyScan, "new.json"));

        let latest = bag.latest(ScanType::DependencyScan).unwrap();
        assert_eq!(latest.file_name(), "new.json");
        assert!(bag.latest(ScanType::StaticAnalysisSummary).is_none());
        assert_eq!(bag.len(), 3);
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_held_resources_release() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let held = HeldResources::new();
        held.hold(DropCounter(dropped.clone()));
        held.hold(DropCounter(dropped.clone()));

        assert_eq!(held.len(), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        held.release_all();
        assert!(held.is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}
