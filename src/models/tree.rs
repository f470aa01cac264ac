//! The canonical stage tree and its dependency index.
//!
//! All mutation happens on the reactor thread, so neither structure needs
//! locking. The cascade algorithm lives here as pure record manipulation;
//! signaling and forking are the tree monitor's job.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::stage::{Stage, StageState};
use crate::plan::Plan;

/// Mapping from a watched file to the stages whose warm state depends on
/// it. Rebuilt incrementally from `FeatureLoaded` reports; a stage's
/// entries disappear when it is torn down.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    by_path: HashMap<PathBuf, BTreeSet<String>>,
}

impl DependencyIndex {
    /// Record that `stage` depends on `path`. Returns `true` if this is a
    /// new edge.
    pub fn insert(&mut self, path: &Path, stage: &str) -> bool {
        self.by_path
            .entry(path.to_path_buf())
            .or_default()
            .insert(stage.to_string())
    }

    /// Drop every entry owned by `stage`.
    pub fn remove_stage(&mut self, stage: &str) {
        self.by_path.retain(|_, owners| {
            owners.remove(stage);
            !owners.is_empty()
        });
    }

    /// Stages that loaded `path`, in name order.
    pub fn stages_for(&self, path: &Path) -> Vec<String> {
        self.by_path
            .get(path)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owns(&self, path: &Path, stage: &str) -> bool {
        self.by_path
            .get(path)
            .map(|owners| owners.contains(stage))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// A stage scheduled for termination by a cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillTarget {
    pub name: String,
    pub pid: Option<i32>,
}

/// Result of collapsing one or more subtrees.
///
/// `killed` lists the stages that were live and are now being torn down,
/// children before parents. `respawn` lists the plan positions to fork
/// again, parents before children.
#[derive(Debug, Default)]
pub struct CascadeOutcome {
    pub killed: Vec<KillTarget>,
    pub respawn: Vec<String>,
}

impl CascadeOutcome {
    pub fn is_noop(&self) -> bool {
        self.killed.is_empty() && self.respawn.is_empty()
    }
}

/// The live stage tree, stored flat and keyed by the plan's globally
/// unique stage names.
#[derive(Debug)]
pub struct StageTree {
    stages: HashMap<String, Stage>,
    /// Plan preorder; doubles as the boot/fork order.
    order: Vec<String>,
    root: String,
    index: DependencyIndex,
}

impl StageTree {
    /// Instantiate the tree from a static plan. Every stage starts out
    /// `pending`.
    pub fn from_plan(plan: &Plan) -> Self {
        let mut stages = HashMap::new();
        let mut order = Vec::new();
        Self::add_plan_node(&mut stages, &mut order, plan.root(), None);
        Self {
            stages,
            order,
            root: plan.root().name.clone(),
            index: DependencyIndex::default(),
        }
    }

    fn add_plan_node(
        stages: &mut HashMap<String, Stage>,
        order: &mut Vec<String>,
        node: &crate::plan::PlanNode,
        parent: Option<String>,
    ) {
        let children = node.children.iter().map(|c| c.name.clone()).collect();
        stages.insert(
            node.name.clone(),
            Stage::new(
                node.name.clone(),
                node.kind.process_type().to_string(),
                parent,
                children,
            ),
        );
        order.push(node.name.clone());
        for child in &node.children {
            Self::add_plan_node(stages, order, child, Some(node.name.clone()));
        }
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// All stage names in boot order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn index(&self) -> &DependencyIndex {
        &self.index
    }

    /// Children of a stage. A leaf yields an empty slice.
    pub fn children_of(&self, name: &str) -> &[String] {
        self.stages
            .get(name)
            .map(|s| s.children.as_slice())
            .unwrap_or(&[])
    }

    /// Subtree names, parents before children.
    pub fn subtree_preorder(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        if !self.stages.contains_key(name) {
            return out;
        }
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            for child in self.children_of(&current).iter().rev() {
                pending.push(child.clone());
            }
            out.push(current);
        }
        out
    }

    /// Subtree names, children before parents.
    pub fn subtree_postorder(&self, name: &str) -> Vec<String> {
        let mut out = self.subtree_preorder(name);
        out.reverse();
        out
    }

    /// Record that the lifecycle manager forked `name` as `pid`.
    pub fn record_forked(&mut self, name: &str, pid: i32) -> Result<()> {
        let stage = self
            .stages
            .get_mut(name)
            .with_context(|| format!("Unknown stage '{name}'"))?;
        stage.record_forked(pid)
    }

    /// A child confirmed it is starting. Idempotent with the parent-side
    /// record; a report carrying a pid that no longer matches the current
    /// incarnation is rejected.
    pub fn record_starting(&mut self, name: &str, pid: i32) -> Result<()> {
        let stage = self
            .stages
            .get_mut(name)
            .with_context(|| format!("Unknown stage '{name}'"))?;
        if let Some(existing) = stage.pid {
            if existing != pid {
                bail!("Stale status report for stage '{name}' (pid {pid} != {existing})");
            }
        }
        stage.state = stage.state.try_transition(StageState::Starting)?;
        stage.pid = Some(pid);
        Ok(())
    }

    /// A child finished setup and registered; it is now warm.
    pub fn record_ready(&mut self, name: &str, pid: i32) -> Result<()> {
        let stage = self
            .stages
            .get_mut(name)
            .with_context(|| format!("Unknown stage '{name}'"))?;
        if stage.pid != Some(pid) {
            bail!("Stale ready report for stage '{name}' (pid {pid})");
        }
        stage.state = stage.state.try_transition(StageState::Ready)?;
        Ok(())
    }

    /// Add `path` to a stage's loaded dependencies and index it.
    ///
    /// Returns `true` when the path is newly indexed for this stage, which
    /// is the tree monitor's cue to arm the file watcher.
    pub fn record_feature(&mut self, name: &str, path: &Path) -> Result<bool> {
        let stage = self
            .stages
            .get_mut(name)
            .with_context(|| format!("Unknown stage '{name}'"))?;
        if !stage.add_dependency(path) {
            return Ok(false);
        }
        Ok(self.index.insert(path, name))
    }

    /// The OS process backing `name` has been reaped.
    pub fn record_dead(&mut self, name: &str) -> Result<()> {
        let stage = self
            .stages
            .get_mut(name)
            .with_context(|| format!("Unknown stage '{name}'"))?;
        stage.state = stage.state.try_transition(StageState::Dead)?;
        stage.pid = None;
        self.index.remove_stage(name);
        Ok(())
    }

    /// Whether `pid` backs the current incarnation of `name`.
    pub fn owns_pid(&self, name: &str, pid: i32) -> bool {
        self.stages
            .get(name)
            .map(|s| s.pid == Some(pid))
            .unwrap_or(false)
    }

    /// Move every live member of the subtree to `killing`, children before
    /// parents, and return them as kill targets. Already dead or not yet
    /// forked members are skipped, which is what makes a repeated kill of
    /// the same subtree a no-op.
    fn mark_subtree_killing(&mut self, name: &str) -> Vec<KillTarget> {
        let mut targets = Vec::new();
        for member in self.subtree_postorder(name) {
            let Some(stage) = self.stages.get_mut(&member) else {
                continue;
            };
            if !stage.is_live() {
                continue;
            }
            stage.state = StageState::Killing;
            targets.push(KillTarget {
                name: member,
                pid: stage.pid,
            });
        }
        targets
    }

    /// Replace every record in the subtree with a fresh `pending` stage of
    /// the same name and shape, dropping accumulated dependencies and
    /// index entries. Returns the positions in fork order.
    fn reset_subtree(&mut self, name: &str) -> Vec<String> {
        let order = self.subtree_preorder(name);
        for member in &order {
            self.index.remove_stage(member);
            let Some(old) = self.stages.get(member) else {
                continue;
            };
            let fresh = Stage::new(
                old.name.clone(),
                old.process_type.clone(),
                old.parent.clone(),
                old.children.clone(),
            );
            self.stages.insert(member.clone(), fresh);
        }
        order
    }

    /// Tear down the subtree rooted at `name` and plan its respawn.
    ///
    /// A subtree with no live members is left untouched and yields an
    /// empty outcome.
    pub fn collapse_subtree(&mut self, name: &str) -> CascadeOutcome {
        if !self.stages.contains_key(name) {
            return CascadeOutcome::default();
        }
        let killed = self.mark_subtree_killing(name);
        if killed.is_empty() {
            return CascadeOutcome::default();
        }
        let respawn = self.reset_subtree(name);
        CascadeOutcome { killed, respawn }
    }

    /// Map a changed file to the subtrees that must die, collapse each,
    /// and return the combined outcome.
    ///
    /// An unknown path, an unknown stage name in the index, and an
    /// already collapsed owner are all no-ops: the index and the tree are
    /// never assumed perfectly synchronized across the fork boundary.
    pub fn cascade_kill(&mut self, path: &Path) -> CascadeOutcome {
        let owners = self.index.stages_for(path);
        let mut outcome = CascadeOutcome::default();
        for owner in owners {
            // An earlier owner in this same cascade may have collapsed a
            // subtree containing this one, clearing its index entry.
            if !self.index.owns(path, &owner) {
                continue;
            }
            let collapsed = self.collapse_subtree(&owner);
            outcome.killed.extend(collapsed.killed);
            outcome.respawn.extend(collapsed.respawn);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Plan, PlanNode};

    fn plan() -> Plan {
        // root -> [a -> [a1], b]
        Plan::new(PlanNode::named(
            "root",
            vec![
                PlanNode::named("a", vec![PlanNode::named("a1", vec![])]),
                PlanNode::named("b", vec![]),
            ],
        ))
        .expect("valid plan")
    }

    fn booted_tree() -> StageTree {
        let mut tree = StageTree::from_plan(&plan());
        for (i, name) in ["root", "a", "a1", "b"].iter().enumerate() {
            let pid = 100 + i as i32;
            tree.record_forked(name, pid).unwrap();
            tree.record_ready(name, pid).unwrap();
        }
        tree
    }

    #[test]
    fn test_from_plan_builds_pending_tree_in_boot_order() {
        let tree = StageTree::from_plan(&plan());
        assert_eq!(tree.names(), &["root", "a", "a1", "b"]);
        assert_eq!(tree.root_name(), "root");
        assert_eq!(tree.get("a").unwrap().state, StageState::Pending);
        assert_eq!(tree.get("a").unwrap().parent.as_deref(), Some("root"));
        assert_eq!(tree.children_of("root"), &["a", "b"]);
        assert!(tree.children_of("a1").is_empty());
        assert!(tree.children_of("nope").is_empty());
    }

    #[test]
    fn test_subtree_orders() {
        let tree = booted_tree();
        assert_eq!(tree.subtree_preorder("root"), ["root", "a", "a1", "b"]);
        assert_eq!(tree.subtree_postorder("a"), ["a1", "a"]);
    }

    #[test]
    fn test_record_feature_indexes_once() {
        let mut tree = booted_tree();
        let path = Path::new("/srv/app/foo.rb");

        assert!(tree.record_feature("a1", path).unwrap());
        assert!(!tree.record_feature("a1", path).unwrap());
        assert_eq!(tree.index().stages_for(path), ["a1"]);
        assert!(tree.index().owns(path, "a1"));
    }

    #[test]
    fn test_cascade_kills_only_dependent_leaf() {
        let mut tree = booted_tree();
        let path = Path::new("/srv/app/foo.rb");
        tree.record_feature("a1", path).unwrap();
        let root_pid = tree.get("root").unwrap().pid;
        let a_pid = tree.get("a").unwrap().pid;
        let b_pid = tree.get("b").unwrap().pid;

        let outcome = tree.cascade_kill(path);

        assert_eq!(
            outcome.killed,
            vec![KillTarget {
                name: "a1".to_string(),
                pid: Some(102),
            }]
        );
        assert_eq!(outcome.respawn, ["a1"]);

        // The leaf is back to pending; everything else is warm and keeps
        // its pid.
        assert_eq!(tree.get("a1").unwrap().state, StageState::Pending);
        assert!(tree.get("a1").unwrap().pid.is_none());
        assert_eq!(tree.get("root").unwrap().state, StageState::Ready);
        assert_eq!(tree.get("root").unwrap().pid, root_pid);
        assert_eq!(tree.get("a").unwrap().pid, a_pid);
        assert_eq!(tree.get("b").unwrap().pid, b_pid);
    }

    #[test]
    fn test_cascade_on_interior_stage_takes_descendants() {
        let mut tree = booted_tree();
        let path = Path::new("/srv/app/env.rb");
        tree.record_feature("a", path).unwrap();
        tree.record_feature("a1", Path::new("/srv/app/foo.rb")).unwrap();

        let outcome = tree.cascade_kill(path);

        let killed: Vec<&str> = outcome.killed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(killed, ["a1", "a"], "children go before parents");
        assert_eq!(outcome.respawn, ["a", "a1"], "parents fork before children");

        // The descendant's own index entries are gone with it.
        assert!(tree.index().stages_for(Path::new("/srv/app/foo.rb")).is_empty());
    }

    #[test]
    fn test_cascade_unknown_path_is_noop() {
        let mut tree = booted_tree();
        let outcome = tree.cascade_kill(Path::new("/nope.rb"));
        assert!(outcome.is_noop());
        assert_eq!(tree.get("root").unwrap().state, StageState::Ready);
    }

    #[test]
    fn test_collapse_is_idempotent_for_dead_subtree() {
        let mut tree = booted_tree();
        let path = Path::new("/srv/app/foo.rb");
        tree.record_feature("a1", path).unwrap();
        let first = tree.cascade_kill(path);
        assert!(!first.is_noop());
        // The fresh pending record has no pid and no live state, so a
        // second collapse finds nothing to do.
        let second = tree.collapse_subtree("a1");
        assert!(second.is_noop());
    }

    #[test]
    fn test_overlapping_owners_collapse_once() {
        let mut tree = booted_tree();
        let path = Path::new("/srv/app/shared.rb");
        tree.record_feature("a", path).unwrap();
        tree.record_feature("a1", path).unwrap();

        let outcome = tree.cascade_kill(path);

        let killed: Vec<&str> = outcome.killed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(killed, ["a1", "a"], "the subtree collapses exactly once");
        assert_eq!(outcome.respawn, ["a", "a1"]);
    }

    #[test]
    fn test_disjoint_cascades_commute() {
        let foo = Path::new("/srv/app/foo.rb");
        let bar = Path::new("/srv/app/bar.rb");

        let run = |first: &Path, second: &Path| {
            let mut tree = booted_tree();
            tree.record_feature("a1", foo).unwrap();
            tree.record_feature("b", bar).unwrap();
            tree.cascade_kill(first);
            tree.cascade_kill(second);
            let mut states: Vec<(String, StageState, Option<i32>)> = tree
                .names()
                .iter()
                .map(|n| {
                    let s = tree.get(n).unwrap();
                    (n.clone(), s.state, s.pid)
                })
                .collect();
            states.sort();
            states
        };

        assert_eq!(run(foo, bar), run(bar, foo));
    }

    #[test]
    fn test_dead_stage_drops_index_entries() {
        let mut tree = booted_tree();
        let path = Path::new("/srv/app/foo.rb");
        tree.record_feature("b", path).unwrap();
        tree.record_dead("b").unwrap();

        assert!(tree.index().stages_for(path).is_empty());
        assert!(tree.get("b").unwrap().pid.is_none());
    }

    #[test]
    fn test_stale_reports_are_rejected() {
        let mut tree = booted_tree();
        assert!(tree.record_starting("a1", 9999).is_err());
        assert!(tree.record_ready("a1", 9999).is_err());
        assert!(tree.record_starting("ghost", 1).is_err());
    }
}
