//! Operation set for the query VM.
//!
//! A compiled query is a linear [`Program`] of [`Op`]s over a small variable
//! table. Variable 0 is always `$this`. Each op either produces candidates
//! for an unbound source (select) or tests a bound one (with); which of the
//! two happens is decided when the op is entered.

use std::fmt;
use std::sync::Arc;

use archetable_foundation::{EntityId, Id};

/// Index of `$this` in the variable table.
pub const THIS: usize = 0;

/// Source an op is evaluated on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpSrc {
    /// A variable slot.
    Var(usize),
    /// A fixed entity.
    Entity(EntityId),
}

/// What an op does.
#[derive(Clone, Debug)]
pub enum OpKind {
    // === Table matching ===
    /// Match a concrete, wildcard or `Any` id against table types.
    And,
    /// Match the first id of an Or chain that a table has.
    Or(Vec<Id>),
    /// Match an id on the source or on the targets of a traversable
    /// relationship.
    Up {
        /// Test the source itself before traversing.
        self_first: bool,
        /// Order selected tables by depth.
        cascade: bool,
    },

    // === Sparse sets ===
    /// Match a non-fragmenting id through its sparse set. With `negate`,
    /// keep rows that lack the id.
    Sparse {
        /// Keep rows without the id.
        negate: bool,
    },

    // === Negation ===
    /// Succeed if the nested program finds nothing. Never binds.
    Not(Box<Program>),

    // === Cache ===
    /// Yield the entries of the query cache.
    Cache,
}

impl OpKind {
    fn name(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or(_) => "or",
            Self::Up {
                cascade: true, ..
            } => "cascade",
            Self::Up {
                self_first: true, ..
            } => "selfup",
            Self::Up { .. } => "up",
            Self::Sparse { negate: false } => "sparse",
            Self::Sparse { negate: true } => "notsparse",
            Self::Not(_) => "not",
            Self::Cache => "cache",
        }
    }
}

/// One operation of a compiled query.
#[derive(Clone, Debug)]
pub struct Op {
    /// Operation.
    pub kind: OpKind,
    /// Field written by the op.
    pub field: Option<usize>,
    /// Source the op is evaluated on.
    pub src: OpSrc,
    /// Id to match. Pair elements may be wildcards.
    pub id: Id,
    /// Variable bound to (or constraining) the pair target.
    pub second_var: Option<usize>,
    /// Relationship followed by `Up`.
    pub trav_rel: EntityId,
    /// Succeed once without a match instead of failing.
    pub optional: bool,
    /// Variables bound before the op runs, as a bitmask.
    pub written: u64,
}

impl Op {
    /// An op of `kind` matching `id` on `src`.
    #[must_use]
    pub fn new(kind: OpKind, src: OpSrc, id: Id) -> Self {
        Self {
            kind,
            field: None,
            src,
            id,
            second_var: None,
            trav_rel: archetable_foundation::builtin::CHILD_OF,
            optional: false,
            written: 0,
        }
    }

    /// Returns true if the source variable was bound before the op.
    #[must_use]
    pub fn src_written(&self) -> bool {
        match self.src {
            OpSrc::Var(v) => self.written & (1 << v) != 0,
            OpSrc::Entity(_) => true,
        }
    }
}

/// A linear program of ops.
#[derive(Clone, Debug, Default)]
pub struct Program {
    /// Operations, executed front to back.
    pub ops: Vec<Op>,
    /// Variable names; index 0 is `this`.
    pub vars: Vec<Arc<str>>,
    /// Id of each field before it is matched.
    pub fields: Vec<Id>,
}

impl Program {
    /// Index of a named variable.
    #[must_use]
    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.as_ref() == name)
    }

    fn fmt_src(&self, src: OpSrc) -> String {
        match src {
            OpSrc::Var(v) => format!("${}", self.vars.get(v).map_or("?", |n| n.as_ref())),
            OpSrc::Entity(e) => e.to_string(),
        }
    }

    fn fmt_ops(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            let mode = if op.src_written() { "with" } else { "sel" };
            let field = op.field.map_or_else(|| "-".to_string(), |f| f.to_string());
            write!(
                f,
                "{:indent$}{i:>2}. [{field:>2}] {:<10} {mode:<4} {:<8}",
                "",
                op.kind.name(),
                self.fmt_src(op.src),
            )?;
            match &op.kind {
                OpKind::Or(ids) => {
                    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                    write!(f, " {}", ids.join(" || "))?;
                }
                OpKind::Cache | OpKind::Not(_) => {}
                _ => write!(f, " {}", op.id)?,
            }
            if let Some(v) = op.second_var {
                write!(f, " -> {}", self.fmt_src(OpSrc::Var(v)))?;
            }
            if matches!(op.kind, OpKind::Up { .. }) {
                write!(f, " via {}", op.trav_rel)?;
            }
            if op.optional {
                write!(f, " ?")?;
            }
            writeln!(f)?;
            if let OpKind::Not(sub) = &op.kind {
                sub.fmt_ops(f, indent + 4)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_ops(f, 0)
    }
}
