//! Archetable - Archetype table store with a compiled query engine
//!
//! This crate re-exports all layers of the Archetable system for convenient access.
//! For detailed documentation, see the individual layer crates.
//!
//! # Architecture
//!
//! ```text
//! Layer 2: archetable_query      - Query compiler, VM, cache, change detection
//! Layer 1: archetable_storage    - Entity index, id registry, archetype tables
//! Layer 0: archetable_foundation - Core types (EntityId, Id, Value, Error)
//! ```

pub use archetable_foundation as foundation;
pub use archetable_query as query;
pub use archetable_storage as storage;
