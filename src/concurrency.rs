//! Concurrency Manager — tracks active [`PipelineSlot`]s in a two-level
//! `project -> (feature -> Slot)` mapping so the Feature Watcher never
//! admits more concurrent pipelines per project than its configured cap.
//!
//! Pure in-memory, per §4.D: after a process restart this state starts
//! empty and rebuilds implicitly from the store on the Watcher's next
//! cycle (features left `in_progress` are orphaned; see [`crate::watcher`]).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::ids::{FeatureId, ProjectId};

/// In-memory token representing "this feature is being worked on right
/// now". Never persisted.
#[derive(Debug, Clone)]
pub struct PipelineSlot {
    pub project: ProjectId,
    pub feature: FeatureId,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<ProjectId, HashMap<FeatureId, PipelineSlot>>,
}

/// Tracks [`PipelineSlot`]s. The only mutators are `acquire` (called from
/// the Watcher) and `release` (called from the Pipeline finalizer) — see
/// the shared-resource policy in §5.
pub struct ConcurrencyManager {
    inner: Mutex<Inner>,
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active_count(&self, project: ProjectId) -> usize {
        self.lock().slots.get(&project).map(|m| m.len()).unwrap_or(0)
    }

    pub fn can_start(&self, project: ProjectId, cap: u32) -> bool {
        (self.active_count(project) as u32) < cap
    }

    pub fn is_active(&self, project: ProjectId, feature: FeatureId) -> bool {
        self.lock()
            .slots
            .get(&project)
            .map(|m| m.contains_key(&feature))
            .unwrap_or(false)
    }

    pub fn list_active(&self, project: ProjectId) -> Vec<PipelineSlot> {
        self.lock()
            .slots
            .get(&project)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Errors if a slot already exists for `(project, feature)` — a
    /// double-acquire indicates a bug in the caller (the Watcher only
    /// admits features for which `isActive` was false).
    pub fn acquire(&self, project: ProjectId, feature: FeatureId) -> Result<(), ConcurrencyError> {
        let mut inner = self.lock();
        let project_slots = inner.slots.entry(project).or_default();
        if project_slots.contains_key(&feature) {
            return Err(ConcurrencyError::AlreadyAcquired { project, feature });
        }
        project_slots.insert(
            feature,
            PipelineSlot {
                project,
                feature,
                acquired_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Idempotent: releasing a slot that does not exist is a no-op. Cleans
    /// up empty project entries so `active_count` does not grow unbounded
    /// with stale project keys.
    pub fn release(&self, project: ProjectId, feature: FeatureId) {
        let mut inner = self.lock();
        if let Some(project_slots) = inner.slots.get_mut(&project) {
            project_slots.remove(&feature);
            if project_slots.is_empty() {
                inner.slots.remove(&project);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("pipeline slot already acquired for project {project:?} feature {feature:?}")]
    AlreadyAcquired { project: ProjectId, feature: FeatureId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_start_respects_the_cap() {
        let mgr = ConcurrencyManager::new();
        let project = ProjectId(1);
        assert!(mgr.can_start(project, 2));
        mgr.acquire(project, FeatureId(1)).unwrap();
        assert!(mgr.can_start(project, 2));
        mgr.acquire(project, FeatureId(2)).unwrap();
        assert!(!mgr.can_start(project, 2));
    }

    #[test]
    fn double_acquire_without_release_fails() {
        let mgr = ConcurrencyManager::new();
        let project = ProjectId(1);
        let feature = FeatureId(1);
        mgr.acquire(project, feature).unwrap();
        let err = mgr.acquire(project, feature).unwrap_err();
        assert!(matches!(err, ConcurrencyError::AlreadyAcquired { .. }));
    }

    #[test]
    fn release_is_idempotent_and_cleans_up_empty_projects() {
        let mgr = ConcurrencyManager::new();
        let project = ProjectId(1);
        let feature = FeatureId(1);
        mgr.acquire(project, feature).unwrap();
        mgr.release(project, feature);
        mgr.release(project, feature);
        assert_eq!(mgr.active_count(project), 0);
        // Re-acquiring after release must succeed.
        mgr.acquire(project, feature).unwrap();
    }

    #[test]
    fn is_active_reflects_acquire_and_release() {
        let mgr = ConcurrencyManager::new();
        let project = ProjectId(1);
        let feature = FeatureId(1);
        assert!(!mgr.is_active(project, feature));
        mgr.acquire(project, feature).unwrap();
        assert!(mgr.is_active(project, feature));
        mgr.release(project, feature);
        assert!(!mgr.is_active(project, feature));
    }
}
