//! Archetype table storage for Archetable.
//!
//! This crate provides:
//! - [`EntityIndex`] - Generational entity allocation and location records
//! - [`IdRegistry`] - Per-id table caches and wildcard pair lists
//! - [`Table`] - Columnar rows with membership and write counters
//! - [`World`] - The mutable handle tying them together

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod archetype;
pub mod config;
pub mod conflict;
pub mod entity_index;
pub mod id_record;
pub mod schema;
pub mod sparse;
pub mod table;
pub mod world;

pub use archetype::Archetype;
pub use config::WorldConfig;
pub use conflict::{AccessCounters, AccessMode};
pub use entity_index::{EntityIndex, Record, RecordFlags};
pub use id_record::{
    IdRecord, IdRecordId, IdRegistry, IdTraits, ListLink, PairList, TableCache, TableRecord,
};
pub use schema::{
    Cardinality, ComponentHooks, ComponentSchema, FieldSchema, OnDelete, OnViolation,
    RelationshipSchema, Storage,
};
pub use sparse::SparseSet;
pub use table::{Column, ColumnSpec, Table, TableEvent, TableId, move_row};
pub use world::{CompareFn, World};
