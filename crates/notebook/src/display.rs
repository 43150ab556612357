//! Display registry: where each display id has been rendered.
//!
//! Kernels can render one display object into several output slots (even in
//! different cells) and later update it in place. The registry remembers
//! every slot per display id so an update can fan out to all of them.

use std::collections::HashMap;

use crate::ids::CellId;

/// One output slot: a cell and an index into its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    pub cell_id: CellId,
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayRegistry {
    key_paths: HashMap<String, Vec<KeyPath>>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new slot for `display_id` and return every slot it now has.
    pub fn record(&mut self, display_id: &str, key_path: KeyPath) -> &[KeyPath] {
        let paths = self.key_paths.entry(display_id.to_string()).or_default();
        paths.push(key_path);
        paths
    }

    /// Slots for `display_id` in the order they were recorded.
    pub fn paths(&self, display_id: &str) -> &[KeyPath] {
        self.key_paths
            .get(display_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Drop every slot in `cell_id`; other cells keep theirs.
    pub fn forget_cell(&mut self, cell_id: &CellId) {
        for paths in self.key_paths.values_mut() {
            paths.retain(|p| &p.cell_id != cell_id);
        }
        self.key_paths.retain(|_, paths| !paths.is_empty());
    }

    pub fn clear(&mut self) {
        self.key_paths.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.key_paths.is_empty()
    }
}
