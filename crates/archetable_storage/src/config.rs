//! World configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::World`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorldConfig {
    /// Number of stages that keep separate conflict counters.
    pub stage_count: usize,
    /// Whether read/write conflict counters are maintained.
    pub check_access: bool,
    /// Delete a table as soon as its last entity leaves.
    pub delete_empty_tables: bool,
    /// Maximum number of hops followed when traversing relationships.
    pub max_traversal_depth: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            stage_count: 1,
            check_access: cfg!(debug_assertions),
            delete_empty_tables: false,
            max_traversal_depth: 64,
        }
    }
}

impl WorldConfig {
    /// Configuration with every diagnostic enabled.
    #[must_use]
    pub fn checked() -> Self {
        Self {
            check_access: true,
            ..Self::default()
        }
    }

    /// Configuration with diagnostics disabled.
    #[must_use]
    pub fn unchecked() -> Self {
        Self {
            check_access: false,
            ..Self::default()
        }
    }

    /// Sets the stage count (at least one).
    #[must_use]
    pub fn with_stage_count(mut self, stage_count: usize) -> Self {
        self.stage_count = stage_count.max(1);
        self
    }

    /// Enables or disables conflict counters.
    #[must_use]
    pub fn with_check_access(mut self, enabled: bool) -> Self {
        self.check_access = enabled;
        self
    }

    /// Enables or disables eager deletion of empty tables.
    #[must_use]
    pub fn with_delete_empty_tables(mut self, enabled: bool) -> Self {
        self.delete_empty_tables = enabled;
        self
    }

    /// Sets the traversal depth limit.
    #[must_use]
    pub fn with_max_traversal_depth(mut self, depth: usize) -> Self {
        self.max_traversal_depth = depth;
        self
    }
}
