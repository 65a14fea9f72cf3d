//! Node relabeler core library
//!
//! This crate provides the pieces of the node relabeling controller:
//! compiling `--relabel` rules into executable matchers, applying them to a
//! node's label set, and the reconciliation loop that turns node watch
//! events into label updates.

pub mod cluster;
pub mod directory;
pub mod reconciler;
pub mod rules;

// Re-export commonly used types
pub use directory::{DirectoryError, NodeDirectory, NodeEvent, NodeSnapshot};
pub use reconciler::{FatalError, Reconciler};
pub use rules::{ParseError, RuleSet};
