//! Query engine for Archetable.
//!
//! This crate provides:
//! - [`QueryDesc`] / [`Term`] - Query descriptions
//! - [`QueryCompiler`] - Validation and compilation into an op [`Program`]
//! - [`Program::next`] - The backtracking query VM
//! - [`QueryCache`] - Incrementally maintained table matches with groups,
//!   ordering and change-detection monitors
//! - [`Query`] / [`QueryIter`] - Query handles and batch iteration

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod compiler;
pub mod iter;
pub mod monitor;
pub mod op;
pub mod query;
pub mod term;
pub mod vm;

pub use cache::{CacheEntry, CacheMatch, CacheOrder, Grouping, MatchId, QueryCache};
pub use compiler::{
    CachePlan, CompiledQuery, FieldInfo, MAX_FIELDS, MAX_VARIABLES, QueryCompiler,
};
pub use iter::QueryIter;
pub use monitor::{FixedField, FixedMonitor, UNTRACKED};
pub use op::{Op, OpKind, OpSrc, Program, THIS};
pub use query::{Query, QueryCount};
pub use term::{
    CacheKind, GroupBy, GroupByFn, InOut, Oper, OrderBy, QueryDesc, Source, THIS_VAR, Term,
    Traversal,
};
pub use vm::{Env, FieldState, OpCtx, RunState, VarValue};
