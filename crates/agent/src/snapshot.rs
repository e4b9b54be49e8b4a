//! Immutable views of the tool set.

use mcpagent_core::{ToolDescriptor, ToolProvider};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The tool set as it was at one point in time.
///
/// Cloning is cheap. Snapshots are replaced wholesale, never mutated, so a
/// holder of an old snapshot is unaffected by reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ToolSnapshot {
    tools: Arc<[ToolDescriptor]>,
    names: Arc<BTreeSet<String>>,
}

impl ToolSnapshot {
    /// Snapshot the provider's current tools, minus the disallowed ones.
    pub fn take(provider: &dyn ToolProvider, disallowed: &[String]) -> Self {
        Self::from_descriptors(provider.list(), disallowed)
    }

    pub fn from_descriptors(tools: Vec<ToolDescriptor>, disallowed: &[String]) -> Self {
        let tools: Vec<ToolDescriptor> = tools
            .into_iter()
            .filter(|t| !disallowed.iter().any(|d| d == &t.name))
            .collect();
        let names = tools.iter().map(|t| t.name.clone()).collect();
        Self {
            tools: tools.into(),
            names: Arc::new(names),
        }
    }

    /// Whether both snapshots offer the same tool names.
    ///
    /// Only membership is compared; a tool whose schema changes in place
    /// does not count as a change.
    pub fn same_tools(&self, other: &ToolSnapshot) -> bool {
        self.names == other.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Tool names in listing order.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
