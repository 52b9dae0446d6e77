//! Query compilation.
//!
//! [`QueryCompiler::compile`] validates a [`QueryDesc`] against the world's
//! metadata, assigns fields and variables, decides which terms go into the
//! cache, and orders the remaining terms into a [`Program`]:
//!
//! 1. fixed-source terms,
//! 2. the `Cache` op, if the query is cached,
//! 3. the remaining positive terms in declaration order, with
//!    non-fragmenting `$this` terms moved behind the table terms,
//! 4. optional terms,
//! 5. negated terms.
//!
//! Ops on a bound source test it; ops on an unbound source produce it.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use archetable_foundation::{
    EntityId, Error, ErrorKind, Id, Result, SemanticLimit, builtin,
};
use archetable_storage::{Storage, World};
use log::{debug, trace};

use crate::cache::{CacheOrder, Grouping};
use crate::monitor::FixedField;
use crate::op::{Op, OpKind, OpSrc, Program, THIS};
use crate::term::{CacheKind, InOut, Oper, QueryDesc, Source, THIS_VAR, Term, Traversal};

/// Maximum number of fields in a query.
pub const MAX_FIELDS: usize = 32;

/// Maximum number of named variables in a query, `$this` excluded.
pub const MAX_VARIABLES: usize = 63;

// =============================================================================
// Compiled Query Types
// =============================================================================

/// A field after compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    /// Id of the field (first id of an Or chain).
    pub id: Id,
    /// Source.
    pub src: Source,
    /// Access mode, never `Default`.
    pub inout: InOut,
    /// Operator. Or chains report `Or`.
    pub oper: Oper,
    /// Traversal.
    pub trav: Traversal,
    /// Terms folded into the field.
    pub terms: Range<usize>,
    /// The field's data lives in the cache.
    pub cached: bool,
}

impl FieldInfo {
    /// Returns true if the field is written through.
    #[must_use]
    pub fn writes(&self) -> bool {
        self.inout.writes() && self.oper != Oper::Not
    }

    /// Returns true if the field is read.
    #[must_use]
    pub fn reads(&self) -> bool {
        matches!(self.inout, InOut::In | InOut::InOut) && self.oper != Oper::Not
    }
}

/// Layout of the cache part of a query.
#[derive(Clone, Debug)]
pub struct CachePlan {
    /// Program matching one table against the cacheable terms.
    pub program: Program,
    /// Cache field → query field.
    pub field_map: Vec<usize>,
    /// Cache fields watched by monitors.
    pub tracked: Vec<bool>,
    /// Grouping.
    pub grouping: Grouping,
    /// Ordering.
    pub ordering: Option<CacheOrder>,
}

/// A compiled query ready for execution.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    /// Program run by iterators.
    pub program: Program,
    /// Field metadata, indexed by field.
    pub fields: Vec<FieldInfo>,
    /// Cache layout, if the query is cached.
    pub cache: Option<CachePlan>,
    /// Read fields on fixed sources, watched by the fixed monitor.
    pub fixed: Vec<FixedField>,
    /// Every id the query refers to.
    pub ids: Vec<Id>,
    /// Yield tables without rows.
    pub match_empty_tables: bool,
}

// =============================================================================
// Query Compiler
// =============================================================================

/// Compiles query descriptions.
pub struct QueryCompiler;

struct Ctx<'a> {
    world: &'a World,
    vars: Vec<Arc<str>>,
}

impl Ctx<'_> {
    fn var(&mut self, name: &Arc<str>) -> usize {
        if name.as_ref() == THIS_VAR {
            return THIS;
        }
        if let Some(i) = self.vars.iter().position(|v| v == name) {
            return i;
        }
        self.vars.push(name.clone());
        self.vars.len() - 1
    }

    fn storage(&self, id: Id) -> Storage {
        if id.is_wildcard() {
            return id
                .first()
                .filter(|f| *f != builtin::WILDCARD && *f != builtin::ANY)
                .and_then(|f| self.world.component_schema(f))
                .map_or(Storage::Table, |s| s.storage);
        }
        self.world.id_traits(id).storage
    }

    fn is_tag(&self, id: Id) -> bool {
        self.world.data_schema(id).is_none()
    }

    fn traversable(&self, rel: EntityId) -> bool {
        self.world
            .relationship_schema(rel)
            .is_some_and(|s| s.traversable)
    }
}

/// A field with its resolved terms, before op ordering.
struct Draft {
    info: FieldInfo,
    ids: Vec<Id>,
    second_var: Option<usize>,
    src: OpSrc,
    trav_rel: EntityId,
    storage: Storage,
}

impl Draft {
    fn positive(&self) -> bool {
        matches!(self.info.oper, Oper::And | Oper::Or)
    }

    fn cacheable(&self) -> bool {
        self.src == OpSrc::Var(THIS)
            && self.info.trav == Traversal::SelfOnly
            && self.second_var.is_none()
            && self.storage.fragments()
    }
}

impl QueryCompiler {
    /// Compiles `desc` against the metadata of `world`.
    ///
    /// # Errors
    ///
    /// Returns an error if a term is malformed, variables are used
    /// inconsistently, limits are exceeded, or the cache options cannot be
    /// honored.
    pub fn compile(world: &World, desc: &QueryDesc) -> Result<CompiledQuery> {
        if desc.terms.is_empty() {
            return Err(Error::invalid_query("query has no terms"));
        }
        let mut ctx = Ctx {
            world,
            vars: vec![Arc::from(THIS_VAR)],
        };
        let drafts = Self::fold_fields(&mut ctx, &desc.terms)?;
        if drafts.len() > MAX_FIELDS {
            return Err(Error::limit_exceeded(SemanticLimit::MaxFields {
                limit: MAX_FIELDS,
                actual: drafts.len(),
            }));
        }
        if ctx.vars.len() > MAX_VARIABLES + 1 {
            return Err(Error::limit_exceeded(SemanticLimit::MaxVariables {
                limit: MAX_VARIABLES,
            }));
        }

        let cached = Self::cache_policy(desc, &drafts)?;
        let order = Self::order(&drafts, cached);
        Self::check_vars(&ctx, &drafts, &order)?;

        let mut fields: Vec<FieldInfo> = drafts.iter().map(|d| d.info.clone()).collect();
        let field_ids: Vec<Id> = drafts.iter().map(|d| d.ids[0]).collect();

        let cache = if cached {
            for (f, draft) in drafts.iter().enumerate() {
                fields[f].cached = draft.cacheable();
            }
            Some(Self::cache_plan(desc, &ctx, &drafts)?)
        } else {
            None
        };

        let mut ops = Vec::new();
        let mut written = 0u64;
        for step in &order {
            match *step {
                Step::Cache => {
                    let mut op = Op::new(OpKind::Cache, OpSrc::Var(THIS), Id::WILDCARD);
                    op.written = written;
                    ops.push(op);
                    written |= 1;
                }
                Step::Field(f) => {
                    let op = Self::field_op(&ctx, &drafts[f], f, written);
                    written |= Self::writes_vars(&drafts[f]);
                    ops.push(op);
                }
            }
        }

        let program = Program {
            ops,
            vars: ctx.vars.clone(),
            fields: field_ids,
        };

        let fixed = drafts
            .iter()
            .enumerate()
            .filter_map(|(f, d)| match (d.src, d.info.reads(), d.storage) {
                (OpSrc::Entity(entity), true, Storage::Table) if !d.info.trav.is_up() => {
                    Some(FixedField {
                        field: f,
                        entity,
                        id: d.ids[0],
                    })
                }
                _ => None,
            })
            .collect();

        let mut ids: Vec<Id> = drafts.iter().flat_map(|d| d.ids.iter().copied()).collect();
        ids.sort_unstable();
        ids.dedup();

        debug!(
            "compiled query [{desc}] into {} ops{}",
            program.ops.len(),
            if cache.is_some() { " (cached)" } else { "" }
        );
        trace!("query plan:\n{program}");

        Ok(CompiledQuery {
            program,
            fields,
            cache,
            fixed,
            ids,
            match_empty_tables: desc.match_empty_tables,
        })
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Validates terms and folds Or chains into single fields.
    fn fold_fields(ctx: &mut Ctx<'_>, terms: &[Term]) -> Result<Vec<Draft>> {
        let mut drafts = Vec::new();
        let mut i = 0;
        while i < terms.len() {
            let start = i;
            while terms[i].oper == Oper::Or {
                i += 1;
                if i == terms.len() {
                    return Err(Error::invalid_term(i - 1, "or chain has no final term"));
                }
            }
            let chain = &terms[start..=i];
            for (k, term) in chain.iter().enumerate() {
                Self::validate_term(ctx, start + k, term)?;
            }
            drafts.push(if chain.len() == 1 {
                Self::draft(ctx, start, &chain[0])
            } else {
                Self::draft_or(ctx, start, chain)?
            });
            i += 1;
        }
        Ok(drafts)
    }

    fn validate_term(ctx: &Ctx<'_>, index: usize, term: &Term) -> Result<()> {
        let id = term.id;
        if term.first_var.is_some() {
            return Err(Error::invalid_term(
                index,
                "variable as pair first element is not supported",
            ));
        }
        if !id.is_pair() && id.is_wildcard() {
            return Err(Error::invalid_term(index, "wildcard must be a pair element"));
        }
        if term.second_var.is_some() && !id.is_pair() {
            return Err(Error::invalid_term(index, "target variable on a non-pair id"));
        }
        if id.is_wildcard() && ctx.storage(id) == Storage::DontFragment {
            return Err(Error::invalid_term(
                index,
                "wildcard over a non-fragmenting relationship",
            ));
        }
        if term.trav.is_up() {
            if !ctx.traversable(term.trav_rel) {
                return Err(Error::invalid_term(
                    index,
                    format!("relationship {} is not traversable", term.trav_rel),
                ));
            }
            if id.is_wildcard() || term.second_var.is_some() {
                return Err(Error::invalid_term(index, "up traversal needs a concrete id"));
            }
            if term.trav != Traversal::Up && ctx.storage(id) == Storage::DontFragment {
                return Err(Error::invalid_term(
                    index,
                    "self traversal of a non-fragmenting id",
                ));
            }
        }
        if let Source::Entity(e) = term.src {
            if !ctx.world.exists(e) {
                return Err(Error::invalid_term(index, format!("source {e} is not alive")));
            }
        }
        Ok(())
    }

    fn resolve_inout(ctx: &Ctx<'_>, term: &Term) -> InOut {
        if term.oper == Oper::Not {
            return InOut::None;
        }
        match term.inout {
            InOut::Default if ctx.is_tag(term.id) => InOut::None,
            InOut::Default if term.src == Source::This => InOut::InOut,
            InOut::Default => InOut::In,
            other => other,
        }
    }

    fn draft(ctx: &mut Ctx<'_>, index: usize, term: &Term) -> Draft {
        let src = match &term.src {
            Source::This => OpSrc::Var(THIS),
            Source::Entity(e) => OpSrc::Entity(*e),
            Source::Var(name) => OpSrc::Var(ctx.var(name)),
        };
        let second_var = term.second_var.as_ref().map(|name| ctx.var(name));
        Draft {
            info: FieldInfo {
                id: term.id,
                src: term.src.clone(),
                inout: Self::resolve_inout(ctx, term),
                oper: term.oper,
                trav: term.trav,
                terms: index..index + 1,
                cached: false,
            },
            ids: vec![term.id],
            second_var,
            src,
            trav_rel: term.trav_rel,
            storage: ctx.storage(term.id),
        }
    }

    fn draft_or(ctx: &mut Ctx<'_>, start: usize, chain: &[Term]) -> Result<Draft> {
        let head = &chain[0];
        for (k, term) in chain.iter().enumerate() {
            let index = start + k;
            if term.id.is_wildcard() || term.second_var.is_some() {
                return Err(Error::invalid_term(index, "or chain terms must be concrete"));
            }
            if term.trav != Traversal::SelfOnly {
                return Err(Error::invalid_term(index, "or chain terms cannot traverse"));
            }
            if term.src != head.src {
                return Err(Error::invalid_term(index, "or chain terms must share a source"));
            }
            if ctx.storage(term.id) == Storage::DontFragment {
                return Err(Error::invalid_term(
                    index,
                    "or chain over a non-fragmenting id",
                ));
            }
        }
        let last = start + chain.len() - 1;
        if !matches!(chain[chain.len() - 1].oper, Oper::And) {
            return Err(Error::invalid_term(last, "or chain must end with a plain term"));
        }
        let mut draft = Self::draft(ctx, start, head);
        draft.info.oper = Oper::Or;
        draft.info.terms = start..last + 1;
        draft.ids = chain.iter().map(|t| t.id).collect();
        Ok(draft)
    }

    // =========================================================================
    // Caching
    // =========================================================================

    /// Decides whether the query gets a cache.
    fn cache_policy(desc: &QueryDesc, drafts: &[Draft]) -> Result<bool> {
        let needs_cache =
            desc.order_by.is_some() || desc.group_by.is_some() || desc.detect_changes;
        let incompatible = |reason: &str| Error::new(ErrorKind::IncompatibleCachePolicy(reason.into()));
        match desc.cache_kind {
            CacheKind::None if needs_cache => Err(incompatible(
                "ordering, grouping and change detection need a cache",
            )),
            CacheKind::None => Ok(false),
            CacheKind::All if drafts.iter().any(|d| !d.cacheable()) => Err(incompatible(
                "query has terms that cannot be cached",
            )),
            CacheKind::All | CacheKind::Auto => {
                let any = drafts.iter().any(|d| d.cacheable() && d.positive());
                if !any && needs_cache {
                    return Err(incompatible("query has no cacheable terms"));
                }
                if let Some(order) = &desc.order_by {
                    let ok = drafts.iter().any(|d| {
                        d.cacheable() && d.positive() && d.ids.len() == 1 && d.ids[0] == order.id
                    });
                    if !ok {
                        return Err(Error::invalid_query(format!(
                            "order_by id {} is not a cached term",
                            order.id
                        )));
                    }
                }
                Ok(any)
            }
        }
    }

    fn cache_plan(desc: &QueryDesc, ctx: &Ctx<'_>, drafts: &[Draft]) -> Result<CachePlan> {
        let mut ops = Vec::new();
        let mut field_map = Vec::new();
        let mut tracked = Vec::new();
        let mut fields = Vec::new();
        let cacheable: Vec<usize> = (0..drafts.len()).filter(|&f| drafts[f].cacheable()).collect();
        // Positive terms first so negation and optionals see a bound table.
        let ordered = cacheable
            .iter()
            .filter(|&&f| drafts[f].positive())
            .chain(cacheable.iter().filter(|&&f| drafts[f].info.oper == Oper::Optional))
            .chain(cacheable.iter().filter(|&&f| drafts[f].info.oper == Oper::Not));
        let mut local_of = vec![usize::MAX; drafts.len()];
        for &f in &cacheable {
            local_of[f] = field_map.len();
            field_map.push(f);
            tracked.push(drafts[f].info.reads());
            fields.push(drafts[f].ids[0]);
        }
        for &f in ordered {
            ops.push(Self::field_op(ctx, &drafts[f], local_of[f], 1));
        }

        let cascade_rel = drafts
            .iter()
            .find(|d| d.info.trav == Traversal::Cascade)
            .map(|d| d.trav_rel);
        let grouping = match (desc.group_by, cascade_rel) {
            (Some(group_by), _) => Grouping::By(group_by),
            (None, Some(rel)) => Grouping::Depth(rel),
            (None, None) => Grouping::None,
        };
        let ordering = desc.order_by.map(|o| CacheOrder {
            id: o.id,
            compare: o.compare,
        });
        if ordering.is_some_and(|o| ctx.world.data_schema(o.id).is_none()) {
            return Err(Error::invalid_query("order_by id carries no data"));
        }
        Ok(CachePlan {
            program: Program {
                ops,
                vars: vec![Arc::from(THIS_VAR)],
                fields,
            },
            field_map,
            tracked,
            grouping,
            ordering,
        })
    }

    // =========================================================================
    // Ordering and Variables
    // =========================================================================

    fn order(drafts: &[Draft], cached: bool) -> Vec<Step> {
        let live = |d: &Draft| !(cached && d.cacheable());
        let mut steps = Vec::new();
        steps.extend(
            (0..drafts.len())
                .filter(|&f| {
                    live(&drafts[f])
                        && drafts[f].positive()
                        && matches!(drafts[f].src, OpSrc::Entity(_))
                })
                .map(Step::Field),
        );
        if cached {
            steps.push(Step::Cache);
        }
        let rest: Vec<usize> = (0..drafts.len())
            .filter(|&f| {
                live(&drafts[f]) && drafts[f].positive() && matches!(drafts[f].src, OpSrc::Var(_))
            })
            .collect();
        let sparse_this =
            |f: usize| drafts[f].src == OpSrc::Var(THIS) && !drafts[f].storage.fragments();
        steps.extend(rest.iter().copied().filter(|&f| !sparse_this(f)).map(Step::Field));
        steps.extend(rest.iter().copied().filter(|&f| sparse_this(f)).map(Step::Field));
        for oper in [Oper::Optional, Oper::Not] {
            steps.extend(
                (0..drafts.len())
                    .filter(|&f| live(&drafts[f]) && drafts[f].info.oper == oper)
                    .map(Step::Field),
            );
        }
        steps
    }

    fn writes_vars(draft: &Draft) -> u64 {
        if !draft.positive() {
            return 0;
        }
        let mut mask = 0;
        if let OpSrc::Var(v) = draft.src {
            mask |= 1 << v;
        }
        if let Some(v) = draft.second_var {
            mask |= 1 << v;
        }
        mask
    }

    /// Checks that optional and negated terms only read bound variables and
    /// that a variable first introduced by an optional term is not used by a
    /// later term.
    fn check_vars(ctx: &Ctx<'_>, drafts: &[Draft], order: &[Step]) -> Result<()> {
        let name = |v: usize| ctx.vars.get(v).map_or("?", |n| n.as_ref()).to_string();
        let used = |d: &Draft| {
            let src = match d.src {
                OpSrc::Var(v) if v != THIS => Some(v),
                _ => None,
            };
            [src, d.second_var].into_iter().flatten()
        };

        let mut seen = HashSet::new();
        let mut optional_only = HashSet::new();
        for draft in drafts {
            for v in used(draft) {
                if optional_only.contains(&v) {
                    return Err(Error::invalid_term(
                        draft.info.terms.start,
                        format!("variable ${} is only bound by an optional term", name(v)),
                    ));
                }
                if seen.insert(v) && draft.info.oper == Oper::Optional {
                    optional_only.insert(v);
                }
            }
        }

        let mut written = 0u64;
        for step in order {
            let Step::Field(f) = *step else {
                written |= 1;
                continue;
            };
            let draft = &drafts[f];
            let index = draft.info.terms.start;
            match draft.info.oper {
                Oper::And | Oper::Or => written |= Self::writes_vars(draft),
                Oper::Optional | Oper::Not => {
                    if let OpSrc::Var(v) = draft.src {
                        if written & (1 << v) == 0 {
                            let reason = if v == THIS {
                                "$this is only constrained by optional or negated terms"
                                    .to_string()
                            } else {
                                format!("variable ${} is not bound by a positive term", name(v))
                            };
                            return Err(Error::invalid_term(index, reason));
                        }
                    }
                    if let Some(v) = draft.second_var {
                        if draft.info.oper == Oper::Not && written & (1 << v) == 0 {
                            return Err(Error::invalid_term(
                                index,
                                format!("variable ${} is only used in a negated term", name(v)),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn field_op(ctx: &Ctx<'_>, draft: &Draft, field: usize, written: u64) -> Op {
        let id = draft.ids[0];
        let kind = if draft.ids.len() > 1 {
            OpKind::Or(draft.ids.clone())
        } else if draft.storage == Storage::DontFragment && !draft.info.trav.is_up() {
            OpKind::Sparse {
                negate: draft.info.oper == Oper::Not,
            }
        } else if draft.info.trav.is_up() {
            OpKind::Up {
                self_first: draft.info.trav != Traversal::Up,
                cascade: draft.info.trav == Traversal::Cascade,
            }
        } else {
            OpKind::And
        };
        let mut op = Op::new(kind, draft.src, id);
        op.second_var = draft.second_var;
        op.trav_rel = draft.trav_rel;
        op.written = written;
        op.optional = draft.info.oper == Oper::Optional;
        if draft.info.oper == Oper::Not && !matches!(op.kind, OpKind::Sparse { .. }) {
            let sub = Program {
                ops: vec![op],
                vars: ctx.vars.clone(),
                fields: Vec::new(),
            };
            let mut not = Op::new(OpKind::Not(Box::new(sub)), draft.src, id);
            not.written = written;
            return not;
        }
        if draft.info.oper != Oper::Not {
            op.field = Some(field);
        }
        op
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Field(usize),
    Cache,
}
