use std::collections::HashMap;

use petgraph::graph::NodeIndex;

use crate::core::Dynamic;

/// Values computed during a single run, keyed by plan node.
///
/// Owned by the scheduler loop alone. Values are dropped as soon as nothing
/// left to run needs them, and the largest number of values held at once is
/// tracked for diagnostics.
#[derive(Debug, Default)]
pub(crate) struct ResultStore {
    values: HashMap<NodeIndex, Dynamic>,
    peak: usize,
}

impl ResultStore {
    pub fn insert(&mut self, node: NodeIndex, value: Dynamic) {
        self.values.insert(node, value);
        self.peak = self.peak.max(self.values.len());
    }

    pub fn get(&self, node: NodeIndex) -> Option<&Dynamic> {
        self.values.get(&node)
    }

    /// Drop a value. Returns whether it was present.
    pub fn expunge(&mut self, node: NodeIndex) -> bool {
        self.values.remove(&node).is_some()
    }

    pub fn take(&mut self, node: NodeIndex) -> Option<Dynamic> {
        self.values.remove(&node)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}
