//! Compound chain: logical groupings whose status outlives their section.
//!
//! Nodes live in an arena keyed by record id and point at their parent by id.
//! A compound stays in the arena after its section is popped, so records that
//! reference it later still aggregate into it and its ancestors.

use std::collections::HashMap;

use stepwire_types::TestingStatus;

use super::aggregator::merge_into;

#[derive(Debug, Clone)]
struct CompoundNode {
    parent: Option<String>,
    status: TestingStatus,
}

#[derive(Debug, Default)]
pub struct CompoundChain {
    nodes: HashMap<String, CompoundNode>,
}

impl CompoundChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compound under `parent` and push its initial status up the chain.
    ///
    /// Re-registering an id keeps the existing node.
    pub fn register(&mut self, id: &str, parent: Option<&str>, status: TestingStatus) {
        if self.nodes.contains_key(id) {
            log::debug!("[TRACKER] Compound {} already registered", id);
            return;
        }
        self.nodes.insert(
            id.to_string(),
            CompoundNode {
                parent: parent.map(str::to_string),
                status: TestingStatus::Unknown,
            },
        );
        self.propagate(id, status);
    }

    /// Merge `status` into `origin` and its ancestors.
    ///
    /// The walk stops at the first node already ranked at least as high as
    /// `status`: every ancestor above it ranks at least as high too. A missing
    /// node ends the walk silently. Returns the number of nodes raised.
    pub fn propagate(&mut self, origin: &str, status: TestingStatus) -> usize {
        let mut raised = 0;
        let mut current = Some(origin.to_string());

        while let Some(id) = current {
            let Some(node) = self.nodes.get_mut(&id) else {
                break;
            };
            if !merge_into(&mut node.status, status) {
                break;
            }
            raised += 1;
            current = node.parent.clone();
        }

        raised
    }

    pub fn status(&self, id: &str) -> Option<TestingStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
