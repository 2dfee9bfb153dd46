//! Per-query caches and instrumentation counters.
//!
//! The virtual cache memoises rule results keyed by fully-plugged
//! reference, optionally qualified by a *scope* tail for partial-object
//! rules. An entry may be a negative entry, meaning "rule evaluated and
//! was undefined" -- readers must distinguish that from "no entry". The
//! base cache memoises converted storage reads. Both the virtual and
//! comprehension caches are scoped so `with` substitution cannot
//! contaminate cached results.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use arbiter_ast::{Location, Ref, Term, Value};

// ──────────────────────────────────────────────
// Virtual cache keys
// ──────────────────────────────────────────────

/// One element of a virtual cache key. Scope elements compare
/// var-insensitively: any variable matches any variable at the same
/// position.
#[derive(Debug, Clone)]
pub(crate) enum VcElem {
    Term(Term),
    Scope(Vec<Term>),
}

impl PartialEq for VcElem {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (VcElem::Term(a), VcElem::Term(b)) => a == b,
            (VcElem::Scope(a), VcElem::Scope(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| {
                        matches!(
                            (&x.value, &y.value),
                            (Value::Var(_), Value::Var(_))
                        ) || x == y
                    })
            }
            _ => false,
        }
    }
}

impl Eq for VcElem {}

impl Hash for VcElem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            VcElem::Term(t) => {
                0u8.hash(state);
                t.hash(state);
            }
            VcElem::Scope(terms) => {
                1u8.hash(state);
                terms.len().hash(state);
                for t in terms {
                    // all vars hash alike so var-insensitive equality holds
                    if matches!(t.value, Value::Var(_)) {
                        2u8.hash(state);
                    } else {
                        t.hash(state);
                    }
                }
            }
        }
    }
}

/// A virtual cache key: reference terms, possibly ending in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct VcKey(pub Vec<VcElem>);

impl VcKey {
    pub fn from_terms(terms: &[Term]) -> Self {
        VcKey(terms.iter().cloned().map(VcElem::Term).collect())
    }

    pub fn push_term(&mut self, t: Term) {
        self.0.push(VcElem::Term(t));
    }

    /// Append a term to the trailing scope, creating it if absent.
    pub fn push_scope_term(&mut self, t: Term) {
        match self.0.last_mut() {
            Some(VcElem::Scope(terms)) => terms.push(t),
            _ => self.0.push(VcElem::Scope(vec![t])),
        }
    }

    pub fn has_scope(&self) -> bool {
        matches!(self.0.last(), Some(VcElem::Scope(_)))
    }

    /// The key without its trailing scope element.
    pub fn without_scope(&self) -> VcKey {
        match self.0.last() {
            Some(VcElem::Scope(_)) => VcKey(self.0[..self.0.len() - 1].to_vec()),
            _ => self.clone(),
        }
    }

    /// Drop trailing variables from the scope; an emptied scope is
    /// removed entirely.
    pub fn reduce_scope(&mut self) {
        if let Some(VcElem::Scope(terms)) = self.0.last_mut() {
            while matches!(terms.last().map(|t| &t.value), Some(Value::Var(_))) {
                terms.pop();
            }
            if terms.is_empty() {
                self.0.pop();
            }
        }
    }

}

// ──────────────────────────────────────────────
// Caches
// ──────────────────────────────────────────────

/// Rule results keyed by plugged reference. `Some(None)` entries record
/// "evaluated and undefined".
#[derive(Debug, Default)]
pub(crate) struct VirtualCache {
    scopes: Vec<HashMap<VcKey, Option<Term>>>,
}

impl VirtualCache {
    pub fn new() -> Self {
        VirtualCache {
            scopes: vec![HashMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn get(&self, key: &VcKey) -> Option<Option<Term>> {
        self.scopes.last().and_then(|s| s.get(key)).cloned()
    }

    pub fn put(&mut self, key: VcKey, term: Option<Term>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(key, term);
        }
    }
}

/// Converted base-document reads keyed by reference.
#[derive(Debug, Default)]
pub(crate) struct BaseCache {
    entries: HashMap<Ref, Term>,
}

impl BaseCache {
    pub fn new() -> Self {
        BaseCache::default()
    }

    pub fn get(&self, reference: &Ref) -> Option<&Term> {
        self.entries.get(reference)
    }

    pub fn put(&mut self, reference: Ref, term: Term) {
        self.entries.insert(reference, term);
    }
}

/// Materialised comprehension tables keyed by the comprehension's source
/// location, then by plugged index-key values.
#[derive(Debug, Default)]
pub(crate) struct ComprehensionCache {
    scopes: Vec<HashMap<Location, CompTable>>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct CompTable {
    entries: HashMap<Vec<Term>, Term>,
}

impl CompTable {
    pub fn get(&self, keys: &[Term]) -> Option<&Term> {
        self.entries.get(keys)
    }

    pub fn put(&mut self, keys: Vec<Term>, value: Term) {
        self.entries.insert(keys, value);
    }

    pub fn get_mut(&mut self, keys: &[Term]) -> Option<&mut Term> {
        self.entries.get_mut(keys)
    }
}

impl ComprehensionCache {
    pub fn new() -> Self {
        ComprehensionCache {
            scopes: vec![HashMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn get(&self, loc: &Location) -> Option<&CompTable> {
        self.scopes.last().and_then(|s| s.get(loc))
    }

    pub fn set(&mut self, loc: Location, table: CompTable) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(loc, table);
        }
    }
}

/// Cache for non-deterministic built-ins: `(name, operands) -> output`.
/// Shared across queries behind external synchronisation.
#[derive(Debug, Default)]
pub struct NdbCache {
    entries: HashMap<(String, Vec<Term>), Term>,
}

impl NdbCache {
    pub fn new() -> Self {
        NdbCache::default()
    }

    pub fn get(&self, name: &str, operands: &[Term]) -> Option<&Term> {
        self.entries.get(&(name.to_string(), operands.to_vec()))
    }

    pub fn put(&mut self, name: &str, operands: Vec<Term>, output: Term) {
        self.entries.insert((name.to_string(), operands), output);
    }
}

// ──────────────────────────────────────────────
// Instrumentation
// ──────────────────────────────────────────────

pub const COUNTER_VIRTUAL_CACHE_HIT: &str = "eval_op_virtual_cache_hit";
pub const COUNTER_VIRTUAL_CACHE_MISS: &str = "eval_op_virtual_cache_miss";
pub const COUNTER_BASE_CACHE_HIT: &str = "eval_op_base_cache_hit";
pub const COUNTER_BASE_CACHE_MISS: &str = "eval_op_base_cache_miss";
pub const COUNTER_COMPREHENSION_CACHE_HIT: &str = "eval_op_comprehension_cache_hit";
pub const COUNTER_COMPREHENSION_CACHE_MISS: &str = "eval_op_comprehension_cache_miss";
pub const COUNTER_COMPREHENSION_CACHE_BUILD: &str = "eval_op_comprehension_cache_build";
pub const COUNTER_COMPREHENSION_CACHE_SKIP: &str = "eval_op_comprehension_cache_skip";

/// Counters collected during one query, readable after the run.
#[derive(Debug, Default, Clone)]
pub struct Instrument {
    counters: BTreeMap<&'static str, u64>,
}

impl Instrument {
    pub fn new() -> Self {
        Instrument::default()
    }

    pub fn incr(&mut self, name: &'static str) {
        *self.counters.entry(name).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<&'static str, u64> {
        &self.counters
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_entries_differ_from_absent_entries() {
        let mut vc = VirtualCache::new();
        let key = VcKey::from_terms(&[Term::var("data"), Term::string("p")]);
        assert_eq!(vc.get(&key), None);
        vc.put(key.clone(), None);
        assert_eq!(vc.get(&key), Some(None));
        vc.put(key.clone(), Some(Term::int(1)));
        assert_eq!(vc.get(&key), Some(Some(Term::int(1))));
    }

    #[test]
    fn scopes_isolate_entries() {
        let mut vc = VirtualCache::new();
        let key = VcKey::from_terms(&[Term::string("p")]);
        vc.put(key.clone(), Some(Term::int(1)));
        vc.push_scope();
        assert_eq!(vc.get(&key), None);
        vc.put(key.clone(), Some(Term::int(2)));
        assert_eq!(vc.get(&key), Some(Some(Term::int(2))));
        vc.pop_scope();
        assert_eq!(vc.get(&key), Some(Some(Term::int(1))));
    }

    #[test]
    fn scope_elements_compare_var_insensitively() {
        let mut a = VcKey::from_terms(&[Term::string("p"), Term::int(1)]);
        a.push_scope_term(Term::var("x"));
        a.push_scope_term(Term::int(5));

        let mut b = VcKey::from_terms(&[Term::string("p"), Term::int(1)]);
        b.push_scope_term(Term::var("y"));
        b.push_scope_term(Term::int(5));

        let mut c = VcKey::from_terms(&[Term::string("p"), Term::int(1)]);
        c.push_scope_term(Term::var("x"));
        c.push_scope_term(Term::int(6));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut vc = VirtualCache::new();
        vc.put(a, Some(Term::int(42)));
        assert_eq!(vc.get(&b), Some(Some(Term::int(42))));
        assert_eq!(vc.get(&c), None);
    }

    #[test]
    fn scope_reduction_drops_trailing_vars() {
        let mut k = VcKey::from_terms(&[Term::string("p")]);
        k.push_scope_term(Term::int(1));
        k.push_scope_term(Term::var("x"));
        k.reduce_scope();
        assert!(k.has_scope());

        let mut all_vars = VcKey::from_terms(&[Term::string("p")]);
        all_vars.push_scope_term(Term::var("x"));
        all_vars.reduce_scope();
        assert!(!all_vars.has_scope());
    }
}
