//! Rule index interface.
//!
//! Given a reference (and, for functions, call arguments) the index
//! returns the applicable rule set, the ordered `else` chain per rule,
//! the default rule, an early-exit hint, and the single/multi-value
//! classification. The baseline implementation returns every rule at the
//! reference in source order; trie-based narrowing is a compiler concern
//! and plugs in behind the same trait.

use std::sync::Arc;

use crate::policy::{Rule, RuleHeadKind};
use crate::value::{Ref, Value};

/// Single- versus multi-value classification of an indexed rule set.
pub type RuleKind = RuleHeadKind;

/// Resolves references to plugged values on behalf of the index. An
/// index that narrows by ground operands calls back through this; the
/// baseline index does not.
pub trait IndexResolver {
    /// Resolve a reference to its current value, or `None` when the
    /// value is undefined or unknown.
    fn resolve(&mut self, reference: &Ref) -> Option<Value>;
}

/// The result of an index lookup.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub kind: RuleKind,
    /// Primary rules in source order.
    pub rules: Vec<Arc<Rule>>,
    /// Ordered `else` chain per primary rule, parallel to `rules`.
    pub else_chains: Vec<Vec<Arc<Rule>>>,
    pub default_rule: Option<Arc<Rule>>,
    /// True when one successful proof determines the result: the caller
    /// may stop enumerating solutions.
    pub early_exit: bool,
    /// True when no rule reference carries variable positions.
    pub only_ground_refs: bool,
}

impl IndexResult {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default_rule.is_none()
    }

    /// Arity of the indexed function rules (primary, else, or default).
    pub fn arg_count(&self) -> usize {
        self.rules
            .first()
            .map(|r| r.head.args.len())
            .or_else(|| self.default_rule.as_ref().map(|r| r.head.args.len()))
            .unwrap_or(0)
    }

    pub fn else_chain(&self, i: usize) -> &[Arc<Rule>] {
        self.else_chains.get(i).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// The per-reference index interface the evaluator dispatches through.
pub trait RuleIndex {
    /// Rules applicable given the resolver's view of ground operands.
    fn lookup(&self, resolver: &mut dyn IndexResolver) -> IndexResult;

    /// Every rule at the reference, ignoring operand values. Used when
    /// indexing is disabled or during partial evaluation.
    fn all_rules(&self, resolver: &mut dyn IndexResolver) -> IndexResult;
}

/// Baseline index: classification without narrowing.
#[derive(Debug, Clone)]
pub struct BaseRuleIndex {
    result: IndexResult,
}

impl BaseRuleIndex {
    pub fn from_rules(rules: &[Arc<Rule>]) -> Self {
        let mut primaries = Vec::new();
        let mut else_chains = Vec::new();
        let mut default_rule = None;

        for rule in rules {
            if rule.default {
                if default_rule.is_none() {
                    default_rule = Some(rule.clone());
                }
                continue;
            }
            else_chains.push(
                rule.else_chain()
                    .into_iter()
                    .map(|r| Arc::new(r.clone()))
                    .collect::<Vec<_>>(),
            );
            primaries.push(rule.clone());
        }

        let kind = primaries
            .first()
            .or(default_rule.as_ref())
            .map(|r| r.kind())
            .unwrap_or(RuleKind::SingleValue);

        let only_ground_refs = primaries.iter().all(|r| r.path.is_ground());

        let is_function = primaries
            .first()
            .or(default_rule.as_ref())
            .map(|r| r.is_function())
            .unwrap_or(false);

        // Early exit is sound only when every applicable rule grounds to
        // one observable value: single-value rules with ground refs and
        // ground head values (different body solutions cannot diverge).
        let all_heads_ground = primaries
            .iter()
            .chain(else_chains.iter().flatten())
            .chain(default_rule.iter())
            .all(|r| {
                r.head
                    .value
                    .as_ref()
                    .map(|v| v.value.is_ground())
                    .unwrap_or(false)
            });
        let early_exit =
            kind == RuleKind::SingleValue && (is_function || only_ground_refs) && all_heads_ground;

        BaseRuleIndex {
            result: IndexResult {
                kind,
                rules: primaries,
                else_chains,
                default_rule,
                early_exit,
                only_ground_refs,
            },
        }
    }
}

impl RuleIndex for BaseRuleIndex {
    fn lookup(&self, _resolver: &mut dyn IndexResolver) -> IndexResult {
        self.result.clone()
    }

    fn all_rules(&self, _resolver: &mut dyn IndexResolver) -> IndexResult {
        self.result.clone()
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Body, Expr, Head};
    use crate::value::Term;

    fn arc(rule: Rule) -> Arc<Rule> {
        Arc::new(rule)
    }

    fn ground_rule(value: Term) -> Rule {
        let mut r = Rule::new(
            Head::single(Ref::operator("p"), value),
            Body::from_expr(Expr::term(Term::bool(true))),
        );
        r.path = Ref::data(&["t", "p"]);
        r
    }

    #[test]
    fn default_rules_are_separated() {
        let mut d = ground_rule(Term::bool(false)).as_default();
        d.path = Ref::data(&["t", "p"]);
        let idx = BaseRuleIndex::from_rules(&[arc(ground_rule(Term::bool(true))), arc(d)]);
        let res = &idx.result;
        assert_eq!(res.rules.len(), 1);
        assert!(res.default_rule.is_some());
        assert!(res.early_exit);
    }

    #[test]
    fn non_ground_head_value_disables_early_exit() {
        let mut r = Rule::new(
            Head::single(Ref::operator("p"), Term::var("x")),
            Body::from_expr(Expr::equality(Term::var("x"), Term::int(1))),
        );
        r.path = Ref::data(&["t", "p"]);
        let idx = BaseRuleIndex::from_rules(&[arc(r)]);
        assert!(!idx.result.early_exit);
        assert!(idx.result.only_ground_refs);
    }

    #[test]
    fn multi_value_rules_never_early_exit() {
        let mut r = Rule::new(
            Head::multi(Ref::operator("p"), Term::int(1)),
            Body::from_expr(Expr::term(Term::bool(true))),
        );
        r.path = Ref::data(&["t", "p"]);
        let idx = BaseRuleIndex::from_rules(&[arc(r)]);
        assert_eq!(idx.result.kind, RuleKind::MultiValue);
        assert!(!idx.result.early_exit);
    }
}
