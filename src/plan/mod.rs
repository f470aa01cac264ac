//! The static plan: the declaratively specified shape of the stage tree.
//!
//! The plan language itself lives outside the core; what arrives here is
//! the tree-shaped boundary object, optionally deserialized from a small
//! JSON file. Construction enforces the one invariant cascade-kill and
//! respawn depend on: stage names are globally unique.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Which run loop a stage executes once warm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKindSpec {
    /// Holds warm state and waits to be killed.
    #[default]
    Preload,
    /// Keeps a listening socket open and accepts client connections.
    Acceptor,
}

impl StageKindSpec {
    /// Label shown in the process title and status output.
    pub fn process_type(&self) -> &'static str {
        match self {
            StageKindSpec::Preload => "preload",
            StageKindSpec::Acceptor => "acceptor",
        }
    }
}

/// One node of the plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub name: String,
    #[serde(default)]
    pub kind: StageKindSpec,
    /// Client commands an acceptor stage serves. Ignored for other kinds.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    /// A preloading node, for building plans in code.
    pub fn named(name: &str, children: Vec<PlanNode>) -> Self {
        Self {
            name: name.to_string(),
            kind: StageKindSpec::Preload,
            commands: Vec::new(),
            children,
        }
    }

    /// An acceptor node serving the given commands.
    pub fn acceptor(name: &str, commands: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: StageKindSpec::Acceptor,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            children: Vec::new(),
        }
    }
}

/// A validated plan.
#[derive(Debug, Clone)]
pub struct Plan {
    root: PlanNode,
}

impl Plan {
    /// Validate and wrap a plan tree.
    ///
    /// Fails if two nodes share a name: the dependency index maps files to
    /// stage names, so a duplicate would make cascade-kill ambiguous.
    pub fn new(root: PlanNode) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut pending = vec![&root];
        while let Some(node) = pending.pop() {
            if node.name.is_empty() {
                bail!("Plan contains a stage with an empty name");
            }
            if !seen.insert(node.name.clone()) {
                bail!("Duplicate stage name in plan: '{}'", node.name);
            }
            pending.extend(node.children.iter());
        }
        Ok(Self { root })
    }

    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        let root: PlanNode = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?;
        Self::new(root)
    }

    pub fn root(&self) -> &PlanNode {
        &self.root
    }

    /// Find a node by stage name.
    pub fn find(&self, name: &str) -> Option<&PlanNode> {
        let mut pending = vec![&self.root];
        while let Some(node) = pending.pop() {
            if node.name == name {
                return Some(node);
            }
            pending.extend(node.children.iter());
        }
        None
    }

    /// Number of stages in the plan.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![&self.root];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.children.iter());
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rejects_duplicate_names() {
        let root = PlanNode::named(
            "root",
            vec![PlanNode::named("app", vec![]), PlanNode::named("app", vec![])],
        );
        let err = Plan::new(root).unwrap_err();
        assert!(err.to_string().contains("Duplicate stage name"));
    }

    #[test]
    fn test_plan_rejects_empty_name() {
        let root = PlanNode::named("", vec![]);
        assert!(Plan::new(root).is_err());
    }

    #[test]
    fn test_find_and_len() {
        let plan = Plan::new(PlanNode::named(
            "root",
            vec![
                PlanNode::named("a", vec![PlanNode::named("a1", vec![])]),
                PlanNode::acceptor("server", &["serve", "console"]),
            ],
        ))
        .unwrap();

        assert_eq!(plan.len(), 4);
        assert_eq!(plan.find("a1").unwrap().name, "a1");
        assert_eq!(plan.find("server").unwrap().kind, StageKindSpec::Acceptor);
        assert!(plan.find("missing").is_none());
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hearth.json");
        std::fs::write(
            &path,
            r#"{
                "name": "boot",
                "children": [
                    { "name": "app",
                      "children": [
                          { "name": "server", "kind": "acceptor",
                            "commands": ["serve"] }
                      ] }
                ]
            }"#,
        )
        .unwrap();

        let plan = Plan::load(&path).expect("plan loads");
        assert_eq!(plan.root().name, "boot");
        assert_eq!(plan.find("server").unwrap().kind, StageKindSpec::Acceptor);
        assert_eq!(plan.find("app").unwrap().kind, StageKindSpec::Preload);
    }

    #[test]
    fn test_load_rejects_missing_file() {
        assert!(Plan::load(Path::new("/nonexistent/hearth.json")).is_err());
    }
}
