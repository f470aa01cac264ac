pub mod stage;
pub mod tree;

pub use stage::{Stage, StageState};
pub use tree::{CascadeOutcome, DependencyIndex, KillTarget, StageTree};
