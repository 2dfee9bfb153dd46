//! Save/support machinery for partial evaluation, plus the small stacks
//! used by `with` substitution.
//!
//! The save set names the terms that are known-unknown; the save stack
//! accumulates the expressions of the residual query; the support set
//! collects synthesised rules that could not be inlined.

use std::collections::{BTreeMap, BTreeSet};

use arbiter_ast::{
    walk_expr_terms, walk_terms, Expr, Head, Module, Package, Ref, Rule, Term, Value, Var,
};

use crate::bindings::{Bid, Bindings};

// ──────────────────────────────────────────────
// Save set
// ──────────────────────────────────────────────

#[derive(Debug)]
struct SaveSetElem {
    terms: Vec<Term>,
    bid: Bid,
}

/// Stack of known-unknown terms, each anchored to a bindings frame.
#[derive(Debug, Default)]
pub(crate) struct SaveSet {
    stack: Vec<SaveSetElem>,
}

impl SaveSet {
    pub fn new() -> Self {
        SaveSet::default()
    }

    pub fn push(&mut self, terms: Vec<Term>, bid: Bid) {
        self.stack.push(SaveSetElem { terms, bid });
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    /// Does `term` itself resolve to a saved term? Vars match saved vars
    /// of the same frame; refs match when a saved ref is a prefix of the
    /// plugged ref (the ref depends on an unknown subtree).
    pub fn contains(&self, binds: &Bindings, term: &Term, bid: Bid) -> bool {
        if self.stack.is_empty() {
            return false;
        }
        let (t, tb) = binds.apply(term, bid);
        match &t.value {
            Value::Var(v) => self.contains_var(v, tb),
            Value::Ref(_) => {
                let plugged = binds.plug(&t, tb);
                match &plugged.value {
                    Value::Ref(r) => self.contains_ref(binds, r),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Does `term` or any of its subterms depend on a saved term?
    pub fn contains_recursive(&self, binds: &Bindings, term: &Term, bid: Bid) -> bool {
        if self.stack.is_empty() {
            return false;
        }
        let mut found = false;
        walk_terms(term, &mut |t| {
            if found {
                return;
            }
            if matches!(t.value, Value::Var(_) | Value::Ref(_)) && self.contains(binds, t, bid) {
                found = true;
            }
        });
        found
    }

    /// Does any term of `expr` depend on a saved term?
    pub fn expr_unknown(&self, binds: &Bindings, expr: &Expr, bid: Bid) -> bool {
        if self.stack.is_empty() {
            return false;
        }
        let mut found = false;
        walk_expr_terms(expr, &mut |t| {
            if found {
                return;
            }
            if matches!(t.value, Value::Var(_) | Value::Ref(_)) && self.contains(binds, t, bid) {
                found = true;
            }
        });
        found
    }

    fn contains_var(&self, v: &Var, bid: Bid) -> bool {
        self.stack.iter().any(|elem| {
            elem.bid == bid
                && elem
                    .terms
                    .iter()
                    .any(|t| matches!(&t.value, Value::Var(e) if e == v))
        })
    }

    fn contains_ref(&self, binds: &Bindings, r: &Ref) -> bool {
        self.stack.iter().any(|elem| {
            elem.terms.iter().any(|t| {
                let plugged = binds.plug(t, elem.bid);
                match &plugged.value {
                    Value::Ref(saved) => r.has_prefix(saved),
                    Value::Var(v) => {
                        matches!(r.first().map(|h| &h.value), Some(Value::Var(h)) if h == v)
                    }
                    _ => false,
                }
            })
        })
    }

    /// The saved variables, namespaced against `caller`.
    pub fn vars(&self, caller: Bid) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        for elem in &self.stack {
            for t in &elem.terms {
                if let Value::Var(v) = &t.value {
                    if elem.bid == caller {
                        out.insert(v.clone());
                    } else {
                        out.insert(format!("{}{}", v, elem.bid));
                    }
                }
            }
        }
        out
    }
}

// ──────────────────────────────────────────────
// Save stack
// ──────────────────────────────────────────────

/// One residual expression with the frames its sides were saved under.
/// `None` frames mean the expression was fully materialised at save time.
#[derive(Debug, Clone)]
pub(crate) struct SavedExpr {
    pub expr: Expr,
    pub b1: Option<Bid>,
    pub b2: Option<Bid>,
}

/// The ordered residual of the current query, bracketed per
/// sub-evaluation by `push_query`/`pop_query`.
#[derive(Debug)]
pub(crate) struct SaveStack {
    queries: Vec<Vec<SavedExpr>>,
}

impl SaveStack {
    pub fn new() -> Self {
        SaveStack {
            queries: vec![Vec::new()],
        }
    }

    pub fn push(&mut self, expr: Expr, b1: Option<Bid>, b2: Option<Bid>) {
        self.queries
            .last_mut()
            .expect("save stack underflow")
            .push(SavedExpr { expr, b1, b2 });
    }

    pub fn pop(&mut self) {
        self.queries
            .last_mut()
            .expect("save stack underflow")
            .pop();
    }

    pub fn peek(&self) -> &[SavedExpr] {
        self.queries.last().map(|q| q.as_slice()).unwrap_or(&[])
    }

    pub fn push_query(&mut self) {
        self.queries.push(Vec::new());
    }

    pub fn push_query_frame(&mut self, frame: Vec<SavedExpr>) {
        self.queries.push(frame);
    }

    pub fn pop_query(&mut self) -> Vec<SavedExpr> {
        self.queries.pop().unwrap_or_default()
    }
}

// ──────────────────────────────────────────────
// Support set
// ──────────────────────────────────────────────

/// Synthesised rules emitted when a residual cannot be inlined, grouped
/// by package path.
#[derive(Debug, Default)]
pub(crate) struct SaveSupport {
    paths: BTreeSet<Ref>,
    by_pkg: BTreeMap<Ref, Vec<Rule>>,
}

impl SaveSupport {
    pub fn new() -> Self {
        SaveSupport::default()
    }

    pub fn exists(&self, path: &Ref) -> bool {
        self.paths.contains(path)
    }

    /// Insert a rule registered at `path`, grouped under package `pkg`.
    pub fn insert(&mut self, path: &Ref, pkg: Ref, rule: Rule) {
        self.paths.insert(path.clone());
        self.by_pkg.entry(pkg).or_default().push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.by_pkg.is_empty()
    }

    pub fn into_modules(self) -> Vec<Module> {
        self.by_pkg
            .into_iter()
            .map(|(pkg, rules)| Module::new(Package::new(pkg), rules))
            .collect()
    }
}

/// Build a rule head from the tail of a support path: the first segment
/// becomes the rule name, remaining segments stay reference positions.
pub(crate) fn ref_head(rule_ref: &[Term], value: Option<Term>) -> Head {
    let mut reference = Vec::with_capacity(rule_ref.len());
    for (i, t) in rule_ref.iter().enumerate() {
        if i == 0 {
            match &t.value {
                Value::String(s) => reference.push(Term::var(s.clone())),
                _ => reference.push(t.clone()),
            }
        } else {
            reference.push(t.clone());
        }
    }
    Head {
        reference: Ref::new(reference),
        key: None,
        value,
        args: Vec::new(),
        location: Default::default(),
    }
}

// ──────────────────────────────────────────────
// Inlining control
// ──────────────────────────────────────────────

/// Disables inlining for reference subtrees, either globally (shallow
/// partial evaluation) or per `with` scope.
#[derive(Debug, Default)]
pub(crate) struct InliningControl {
    pub shallow: bool,
    stack: Vec<Vec<Ref>>,
}

impl InliningControl {
    pub fn new(shallow: bool) -> Self {
        InliningControl {
            shallow,
            stack: Vec::new(),
        }
    }

    pub fn push_disable(&mut self, refs: Vec<Ref>) {
        self.stack.push(refs);
    }

    pub fn pop_disable(&mut self) {
        self.stack.pop();
    }

    /// Is `reference` covered by a disabled subtree? With `prefix_only`
    /// the disabled entry must be a prefix of the reference; otherwise
    /// overlap in either direction counts.
    pub fn disabled(&self, reference: &Ref, prefix_only: bool) -> bool {
        self.stack.iter().flatten().any(|d| {
            if d.is_empty() {
                return false;
            }
            reference.has_prefix(d) || (!prefix_only && d.has_prefix(reference))
        })
    }
}

// ──────────────────────────────────────────────
// Function mocks and with-targets
// ──────────────────────────────────────────────

/// Per-`with` frames of function/built-in replacements. Lookups see only
/// the innermost frame: a nested replacement call must not observe the
/// mocks it is replacing.
#[derive(Debug)]
pub(crate) struct FunctionMocksStack {
    stack: Vec<Vec<(Ref, Term)>>,
}

impl FunctionMocksStack {
    pub fn new() -> Self {
        FunctionMocksStack {
            stack: vec![Vec::new()],
        }
    }

    pub fn put_pairs(&mut self, pairs: Vec<(Ref, Term)>) {
        self.stack.push(pairs);
    }

    pub fn pop_pairs(&mut self) {
        self.stack.pop();
    }

    /// Push an empty frame to isolate a nested call from current mocks.
    pub fn push_isolated(&mut self) {
        self.stack.push(Vec::new());
    }

    pub fn pop_isolated(&mut self) {
        self.stack.pop();
    }

    pub fn get(&self, reference: &Ref) -> Option<&Term> {
        self.stack
            .last()
            .and_then(|frame| frame.iter().find(|(r, _)| r == reference))
            .map(|(_, t)| t)
    }
}

/// References replaced by `with`; rule-tree lookups and base reads
/// bypass subtrees under any active target.
#[derive(Debug, Default)]
pub(crate) struct RefStack {
    stack: Vec<Vec<Ref>>,
}

impl RefStack {
    pub fn new() -> Self {
        RefStack::default()
    }

    pub fn push(&mut self, targets: Vec<Ref>) {
        self.stack.push(targets);
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    pub fn prefixed(&self, reference: &Ref) -> bool {
        self.stack
            .iter()
            .flatten()
            .any(|t| reference.has_prefix(t))
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_ast::Body;

    #[test]
    fn save_set_matches_ref_prefixes() {
        let mut binds = Bindings::new();
        let f0 = binds.new_frame();
        let mut ss = SaveSet::new();
        ss.push(vec![Term::reference(Ref::input(&[]))], f0);

        let t = Term::reference(Ref::input(&["x"]));
        assert!(ss.contains(&binds, &t, f0));
        assert!(!ss.contains(&binds, &Term::reference(Ref::data(&["x"])), f0));

        // nested inside a composite: only the recursive check sees it
        let composite = Term::array(vec![t]);
        assert!(!ss.contains(&binds, &composite, f0));
        assert!(ss.contains_recursive(&binds, &composite, f0));
    }

    #[test]
    fn save_set_vars_are_namespaced_against_caller() {
        let mut binds = Bindings::new();
        let caller = binds.new_frame();
        let other = binds.new_frame();
        let mut ss = SaveSet::new();
        ss.push(vec![Term::var("a")], caller);
        ss.push(vec![Term::var("b")], other);

        let vars = ss.vars(caller);
        assert!(vars.contains("a"));
        assert!(vars.contains(&format!("b{}", other)));
    }

    #[test]
    fn save_stack_brackets_queries() {
        let mut st = SaveStack::new();
        st.push(Expr::term(Term::bool(true)), None, None);
        st.push_query();
        st.push(Expr::term(Term::bool(false)), None, None);
        assert_eq!(st.peek().len(), 1);
        let inner = st.pop_query();
        assert_eq!(inner.len(), 1);
        assert_eq!(st.peek().len(), 1);
    }

    #[test]
    fn mocks_see_only_innermost_frame() {
        let mut mocks = FunctionMocksStack::new();
        let f = Ref::data(&["f"]);
        mocks.put_pairs(vec![(f.clone(), Term::int(1))]);
        assert_eq!(mocks.get(&f), Some(&Term::int(1)));
        mocks.push_isolated();
        assert_eq!(mocks.get(&f), None);
        mocks.pop_isolated();
        assert_eq!(mocks.get(&f), Some(&Term::int(1)));
        mocks.pop_pairs();
        assert_eq!(mocks.get(&f), None);
    }

    #[test]
    fn support_groups_by_package() {
        let mut sup = SaveSupport::new();
        let path = Ref::data(&["partial", "r"]);
        assert!(!sup.exists(&path));
        sup.insert(
            &path,
            path.prefix(path.len() - 1),
            Rule::new(ref_head(&path[2..], Some(Term::bool(true))), Body::default()),
        );
        assert!(sup.exists(&path));
        let modules = sup.into_modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].package.path, Ref::data(&["partial"]));
        assert_eq!(modules[0].rules.len(), 1);
    }
}
