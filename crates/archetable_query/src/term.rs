//! Query terms and query descriptions.
//!
//! A [`Term`] is one clause of a query: an id or pair, the source it is
//! matched on, how its data is accessed, and how it combines with the other
//! terms. A [`QueryDesc`] is the ordered term list plus cache options.

use std::fmt;
use std::sync::Arc;

use archetable_foundation::{EntityId, Id, builtin};
use archetable_storage::{CompareFn, TableId, World};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Name of the implicit source variable.
pub const THIS_VAR: &str = "this";

/// Where a term is matched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Source {
    /// The implicit `$this` variable, bound to table ranges.
    #[default]
    This,
    /// A fixed entity.
    Entity(EntityId),
    /// A named entity variable.
    Var(Arc<str>),
}

/// How a term's data is accessed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InOut {
    /// Resolved at compile time: `InOut` on `$this`, `In` elsewhere, `None`
    /// for tags.
    #[default]
    Default,
    /// Data is not accessed.
    None,
    /// Read only.
    In,
    /// Written, not read.
    Out,
    /// Read and written.
    InOut,
}

impl InOut {
    /// Returns true if the field is read.
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(self, Self::In | Self::InOut | Self::Default)
    }

    /// Returns true if the field is written.
    #[must_use]
    pub const fn writes(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// How a term combines with its neighbours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Oper {
    /// Must match.
    #[default]
    And,
    /// Consecutive `Or` terms form a chain; one of them must match.
    Or,
    /// Must not match.
    Not,
    /// Matches if possible; the field reports whether it is set.
    Optional,
}

/// Relationship traversal for a term.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Traversal {
    /// Match on the source itself.
    #[default]
    SelfOnly,
    /// Match on the target of the traversal relationship, transitively.
    Up,
    /// Match on the source, else upwards.
    SelfUp,
    /// Like `SelfUp`, iterated in breadth-first (depth) order.
    Cascade,
}

impl Traversal {
    /// Returns true if the term may match on a related entity.
    #[must_use]
    pub const fn is_up(self) -> bool {
        !matches!(self, Self::SelfOnly)
    }
}

/// One clause of a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Term {
    /// Id or pair to match. Pair elements may be `*` or `_`.
    pub id: Id,
    /// Variable bound to the first pair element. Not supported; rejected by
    /// the compiler.
    pub first_var: Option<Arc<str>>,
    /// Variable bound to the second pair element.
    pub second_var: Option<Arc<str>>,
    /// Source.
    pub src: Source,
    /// Access mode.
    pub inout: InOut,
    /// Operator.
    pub oper: Oper,
    /// Traversal direction.
    pub trav: Traversal,
    /// Relationship followed by up traversal.
    pub trav_rel: EntityId,
}

impl Term {
    /// A term matching `id` on `$this`.
    #[must_use]
    pub fn new(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            first_var: None,
            second_var: None,
            src: Source::This,
            inout: InOut::Default,
            oper: Oper::And,
            trav: Traversal::SelfOnly,
            trav_rel: builtin::CHILD_OF,
        }
    }

    /// A term matching the pair `(first, second)`.
    #[must_use]
    pub fn pair(first: EntityId, second: EntityId) -> Self {
        Self::new(Id::pair(first, second))
    }

    /// A term matching `(first, $var)`, binding the target to `var`.
    #[must_use]
    pub fn pair_var(first: EntityId, var: &str) -> Self {
        Self {
            second_var: Some(Arc::from(var)),
            ..Self::pair(first, builtin::WILDCARD)
        }
    }

    /// A term matching `($var, second)`.
    #[must_use]
    pub fn var_pair(var: &str, second: EntityId) -> Self {
        Self {
            first_var: Some(Arc::from(var)),
            ..Self::pair(builtin::WILDCARD, second)
        }
    }

    /// Matches on a fixed entity.
    #[must_use]
    pub fn src(mut self, entity: EntityId) -> Self {
        self.src = Source::Entity(entity);
        self
    }

    /// Matches on a named variable.
    #[must_use]
    pub fn src_var(mut self, var: &str) -> Self {
        self.src = if var == THIS_VAR {
            Source::This
        } else {
            Source::Var(Arc::from(var))
        };
        self
    }

    /// Sets the access mode.
    #[must_use]
    pub fn inout(mut self, inout: InOut) -> Self {
        self.inout = inout;
        self
    }

    /// Read-only access.
    #[must_use]
    pub fn read(self) -> Self {
        self.inout(InOut::In)
    }

    /// Write-only access.
    #[must_use]
    pub fn write(self) -> Self {
        self.inout(InOut::Out)
    }

    /// Sets the operator.
    #[must_use]
    pub fn oper(mut self, oper: Oper) -> Self {
        self.oper = oper;
        self
    }

    /// Chains with the following `Or` terms.
    #[must_use]
    pub fn or(self) -> Self {
        self.oper(Oper::Or)
    }

    /// Negates the term.
    #[must_use]
    pub fn not(self) -> Self {
        self.oper(Oper::Not)
    }

    /// Makes the term optional.
    #[must_use]
    pub fn optional(self) -> Self {
        self.oper(Oper::Optional)
    }

    /// Matches on the targets of `rel`, transitively.
    #[must_use]
    pub fn up(mut self, rel: EntityId) -> Self {
        self.trav = Traversal::Up;
        self.trav_rel = rel;
        self
    }

    /// Matches on the source, else on the targets of `rel`.
    #[must_use]
    pub fn self_up(mut self, rel: EntityId) -> Self {
        self.trav = Traversal::SelfUp;
        self.trav_rel = rel;
        self
    }

    /// Like [`Self::self_up`], iterated in depth order.
    #[must_use]
    pub fn cascade(mut self, rel: EntityId) -> Self {
        self.trav = Traversal::Cascade;
        self.trav_rel = rel;
        self
    }
}

impl From<Id> for Term {
    fn from(id: Id) -> Self {
        Self::new(id)
    }
}

impl From<EntityId> for Term {
    fn from(entity: EntityId) -> Self {
        Self::new(entity)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.oper {
            Oper::Not => write!(f, "!")?,
            Oper::Optional => write!(f, "?")?,
            Oper::And | Oper::Or => {}
        }
        match (&self.first_var, &self.second_var, self.id.first()) {
            (Some(first), _, _) => write!(f, "(${first}, {})", fmt_second(self.id))?,
            (None, Some(second), Some(first)) => write!(f, "({first}, ${second})")?,
            _ => write!(f, "{}", self.id)?,
        }
        match &self.src {
            Source::This => {}
            Source::Entity(e) => write!(f, "({e})")?,
            Source::Var(v) => write!(f, "(${v})")?,
        }
        match self.trav {
            Traversal::SelfOnly => {}
            Traversal::Up => write!(f, " up")?,
            Traversal::SelfUp => write!(f, " self|up")?,
            Traversal::Cascade => write!(f, " cascade")?,
        }
        if self.oper == Oper::Or {
            write!(f, " ||")?;
        }
        Ok(())
    }
}

fn fmt_second(id: Id) -> String {
    id.second().map_or_else(String::new, |s| s.to_string())
}

/// Whether and how a query caches its matched tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CacheKind {
    /// Evaluate every term on each iteration.
    None,
    /// Cache the cacheable terms, evaluate the rest on each iteration.
    #[default]
    Auto,
    /// Cache every term; creation fails if a term cannot be cached.
    All,
}

/// Computes the group of a table.
pub type GroupByFn = fn(&World, TableId, EntityId) -> u64;

/// Groups cached tables. Groups are iterated in ascending id order.
#[derive(Clone, Copy)]
pub struct GroupBy {
    /// Relationship passed to the callback.
    pub rel: EntityId,
    /// Group function. When absent, the group is the index of the table's
    /// first `rel` target, or 0.
    pub callback: Option<GroupByFn>,
}

impl GroupBy {
    /// Groups tables by their `rel` target.
    #[must_use]
    pub fn target(rel: EntityId) -> Self {
        Self {
            rel,
            callback: None,
        }
    }

    /// Computes the group of `table`.
    #[must_use]
    pub fn group_of(&self, world: &World, table: TableId) -> u64 {
        match self.callback {
            Some(callback) => callback(world, table, self.rel),
            None => world
                .table_target(table, self.rel, 0)
                .map_or(0, |t| u64::from(t.index())),
        }
    }
}

impl fmt::Debug for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupBy")
            .field("rel", &self.rel)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Orders cached results by the value of a component.
#[derive(Clone, Copy)]
pub struct OrderBy {
    /// Component whose values are compared.
    pub id: Id,
    /// Comparison.
    pub compare: CompareFn,
}

impl fmt::Debug for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBy").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Description of a query.
#[derive(Clone, Debug, Default)]
pub struct QueryDesc {
    /// Terms, in order.
    pub terms: Vec<Term>,
    /// Cache policy.
    pub cache_kind: CacheKind,
    /// Result ordering. Requires a cache.
    pub order_by: Option<OrderBy>,
    /// Result grouping. Requires a cache.
    pub group_by: Option<GroupBy>,
    /// Also yield tables without rows.
    pub match_empty_tables: bool,
    /// Keep change-detection monitors. Requires a cache.
    pub detect_changes: bool,
}

impl QueryDesc {
    /// Creates an empty description.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a term.
    #[must_use]
    pub fn term(mut self, term: impl Into<Term>) -> Self {
        self.terms.push(term.into());
        self
    }

    /// Sets the cache policy.
    #[must_use]
    pub fn cache(mut self, kind: CacheKind) -> Self {
        self.cache_kind = kind;
        self
    }

    /// Orders results by `id`.
    #[must_use]
    pub fn order_by(mut self, id: impl Into<Id>, compare: CompareFn) -> Self {
        self.order_by = Some(OrderBy {
            id: id.into(),
            compare,
        });
        self
    }

    /// Groups tables by their `rel` target.
    #[must_use]
    pub fn group_by(mut self, rel: EntityId) -> Self {
        self.group_by = Some(GroupBy::target(rel));
        self
    }

    /// Groups tables with a callback.
    #[must_use]
    pub fn group_by_fn(mut self, rel: EntityId, callback: GroupByFn) -> Self {
        self.group_by = Some(GroupBy {
            rel,
            callback: Some(callback),
        });
        self
    }

    /// Yields empty tables too.
    #[must_use]
    pub fn match_empty_tables(mut self) -> Self {
        self.match_empty_tables = true;
        self
    }

    /// Enables change detection.
    #[must_use]
    pub fn detect_changes(mut self) -> Self {
        self.detect_changes = true;
        self
    }
}

impl fmt::Display for QueryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}
