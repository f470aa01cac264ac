use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// One node of the managed process tree, backed by exactly one OS process
/// once forked.
///
/// `children` is fixed at plan-build time; only `pid`, `state` and
/// `loaded_dependencies` mutate over a stage's lifetime. The parent link is
/// a name back-reference, never an owning handle, so the tree stays a
/// rooted forest with no cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub process_type: String,
    /// OS process id. Absent before fork and after reap.
    pub pid: Option<i32>,
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// Absolute paths whose contents this stage's warm state depends on.
    pub loaded_dependencies: BTreeSet<PathBuf>,
    pub state: StageState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(
        name: String,
        process_type: String,
        parent: Option<String>,
        children: Vec<String>,
    ) -> Self {
        Self {
            name,
            process_type,
            pid: None,
            parent,
            children,
            loaded_dependencies: BTreeSet::new(),
            state: StageState::Pending,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    /// Record that the lifecycle manager forked this stage.
    pub fn record_forked(&mut self, pid: i32) -> Result<()> {
        self.state = self.state.try_transition(StageState::Starting)?;
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Add a loaded dependency.
    ///
    /// Dependencies are monotonically non-decreasing while the stage is
    /// still live; reports arriving once the stage is being torn down are
    /// ignored. Returns `true` if the path was newly recorded.
    pub fn add_dependency(&mut self, path: &Path) -> bool {
        if self.state >= StageState::Killing {
            return false;
        }
        self.loaded_dependencies.insert(path.to_path_buf())
    }

    /// Whether the stage currently maps to a live OS process.
    pub fn is_live(&self) -> bool {
        matches!(self.state, StageState::Starting | StageState::Ready)
    }
}

/// Lifecycle state of a stage.
///
/// State machine transitions:
/// - `Pending` -> `Starting` (when the lifecycle manager forks it)
/// - `Starting` -> `Ready` | `Killing` | `Dead`
/// - `Ready` -> `Killing` | `Dead`
/// - `Killing` -> `Dead`
/// - `Dead` is a terminal state
///
/// The derived ordering follows lifecycle order, so `state < Killing`
/// means "still live enough to accumulate dependencies".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    /// Created from the plan, not yet forked.
    Pending,
    /// Forked; setup work is running in the child.
    Starting,
    /// Setup complete and registered over the control channel.
    Ready,
    /// A cascade kill was issued; waiting for the OS exit.
    Killing,
    /// The OS process has been reaped.
    Dead,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::Pending => write!(f, "pending"),
            StageState::Starting => write!(f, "starting"),
            StageState::Ready => write!(f, "ready"),
            StageState::Killing => write!(f, "killing"),
            StageState::Dead => write!(f, "dead"),
        }
    }
}

impl StageState {
    /// Check if transitioning from the current state to the new state is
    /// valid. Same-state transitions are always valid (no-op).
    pub fn can_transition_to(&self, new_state: &StageState) -> bool {
        if self == new_state {
            return true;
        }

        match self {
            StageState::Pending => matches!(new_state, StageState::Starting),
            StageState::Starting => matches!(
                new_state,
                StageState::Ready | StageState::Killing | StageState::Dead
            ),
            StageState::Ready => matches!(new_state, StageState::Killing | StageState::Dead),
            StageState::Killing => matches!(new_state, StageState::Dead),
            StageState::Dead => false, // Terminal state
        }
    }

    /// Attempt to transition to a new state, returning an error if invalid.
    pub fn try_transition(&self, new_state: StageState) -> Result<StageState> {
        if self.can_transition_to(&new_state) {
            Ok(new_state)
        } else {
            bail!("Invalid stage state transition: {self} -> {new_state}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> Stage {
        Stage::new("app".to_string(), "preload".to_string(), None, vec![])
    }

    #[test]
    fn test_new_stage_is_pending_without_pid() {
        let stage = stage();
        assert_eq!(stage.state, StageState::Pending);
        assert!(stage.pid.is_none());
        assert!(stage.loaded_dependencies.is_empty());
    }

    #[test]
    fn test_record_forked_sets_pid_and_starting() {
        let mut stage = stage();
        stage.record_forked(1234).expect("fork transition");
        assert_eq!(stage.state, StageState::Starting);
        assert_eq!(stage.pid, Some(1234));
        assert!(stage.started_at.is_some());
    }

    #[test]
    fn test_full_lifecycle_transitions() {
        let state = StageState::Pending;
        let state = state.try_transition(StageState::Starting).unwrap();
        let state = state.try_transition(StageState::Ready).unwrap();
        let state = state.try_transition(StageState::Killing).unwrap();
        let state = state.try_transition(StageState::Dead).unwrap();
        assert_eq!(state, StageState::Dead);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!StageState::Pending.can_transition_to(&StageState::Ready));
        assert!(!StageState::Pending.can_transition_to(&StageState::Dead));
        assert!(!StageState::Killing.can_transition_to(&StageState::Ready));
        assert!(StageState::Pending
            .try_transition(StageState::Killing)
            .is_err());
    }

    #[test]
    fn test_dead_is_terminal() {
        for target in [
            StageState::Pending,
            StageState::Starting,
            StageState::Ready,
            StageState::Killing,
        ] {
            assert!(!StageState::Dead.can_transition_to(&target));
        }
        // Same-state is a no-op, not an error.
        assert!(StageState::Dead.can_transition_to(&StageState::Dead));
    }

    #[test]
    fn test_crash_before_ready_goes_straight_to_dead() {
        assert!(StageState::Starting.can_transition_to(&StageState::Dead));
    }

    #[test]
    fn test_dependencies_are_monotonic_while_live() {
        let mut stage = stage();
        stage.record_forked(1).unwrap();

        assert!(stage.add_dependency(Path::new("/srv/app/a.rb")));
        assert!(!stage.add_dependency(Path::new("/srv/app/a.rb")));
        assert!(stage.add_dependency(Path::new("/srv/app/b.rb")));
        assert_eq!(stage.loaded_dependencies.len(), 2);

        stage.state = StageState::Killing;
        assert!(!stage.add_dependency(Path::new("/srv/app/c.rb")));
        assert_eq!(stage.loaded_dependencies.len(), 2);
    }

    #[test]
    fn test_state_ordering_follows_lifecycle() {
        assert!(StageState::Pending < StageState::Starting);
        assert!(StageState::Starting < StageState::Ready);
        assert!(StageState::Ready < StageState::Killing);
        assert!(StageState::Killing < StageState::Dead);
    }
}
