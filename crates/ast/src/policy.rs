//! Policy AST: modules, rules, bodies, and expressions.
//!
//! These types are the compiled form consumed by the evaluator. Parsing
//! and compilation from source text happen upstream; constructors here
//! are used by compilers, by the partial evaluator when synthesizing
//! support rules, and by tests.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::value::{Location, Ref, Term, Value, Var};

/// Name of the built-in equality operator.
pub const EQUALITY_OP: &str = "eq";

// ──────────────────────────────────────────────
// Modules and rules
// ──────────────────────────────────────────────

/// A namespace declaration. The path is rooted at `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub path: Ref,
}

impl Package {
    pub fn new(path: Ref) -> Self {
        Package { path }
    }
}

/// A set of rules grouped under one package.
#[derive(Debug, Clone)]
pub struct Module {
    pub package: Package,
    pub rules: Vec<Rule>,
}

impl Module {
    pub fn new(package: Package, rules: Vec<Rule>) -> Self {
        Module { package, rules }
    }
}

/// Rule kinds as classified from the head shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleHeadKind {
    /// Head produces one value per fully-ground reference.
    SingleValue,
    /// Head contributes members to a set at its reference.
    MultiValue,
}

/// A rule head: `(reference, key?, value?, args?)`.
///
/// The reference is package-relative; its first element is a `Var`
/// carrying the rule name. The compiler computes the absolute
/// data-rooted path when modules are loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub reference: Ref,
    pub key: Option<Term>,
    pub value: Option<Term>,
    pub args: Vec<Term>,
    pub location: Location,
}

impl Head {
    /// Single-value head: `reference := value`.
    pub fn single(reference: Ref, value: Term) -> Self {
        Head {
            reference,
            key: None,
            value: Some(value),
            args: Vec::new(),
            location: Location::default(),
        }
    }

    /// Multi-value head: `reference contains key`.
    pub fn multi(reference: Ref, key: Term) -> Self {
        Head {
            reference,
            key: Some(key),
            value: None,
            args: Vec::new(),
            location: Location::default(),
        }
    }

    /// Function head: `name(args...) := value`.
    pub fn func(name: &str, args: Vec<Term>, value: Term) -> Self {
        Head {
            reference: Ref::new(vec![Term::var(name)]),
            key: None,
            value: Some(value),
            args,
            location: Location::default(),
        }
    }

    pub fn kind(&self) -> RuleHeadKind {
        if self.key.is_some() && self.value.is_none() {
            RuleHeadKind::MultiValue
        } else {
            RuleHeadKind::SingleValue
        }
    }

    /// The key term unified against set members: the declared key, or the
    /// last reference position for heads written `p[k]`.
    pub fn key_term(&self) -> Option<&Term> {
        self.key.as_ref().or_else(|| self.reference.last())
    }
}

/// A rule: head, conjunctive body, optional ordered `else` chain, and
/// the absolute path assigned at compile time.
#[derive(Debug, Clone)]
pub struct Rule {
    pub head: Head,
    pub body: Body,
    pub els: Option<Box<Rule>>,
    pub default: bool,
    pub location: Location,
    /// Absolute data-rooted reference; filled in by the compiler.
    pub path: Ref,
}

impl Rule {
    pub fn new(head: Head, body: Body) -> Self {
        Rule {
            head,
            body,
            els: None,
            default: false,
            location: Location::default(),
            path: Ref::default(),
        }
    }

    pub fn with_else(mut self, els: Rule) -> Self {
        self.els = Some(Box::new(els));
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn kind(&self) -> RuleHeadKind {
        self.head.kind()
    }

    pub fn is_function(&self) -> bool {
        !self.head.args.is_empty()
    }

    /// The ordered `else` chain, outermost first.
    pub fn else_chain(&self) -> Vec<&Rule> {
        let mut out = Vec::new();
        let mut cur = self.els.as_deref();
        while let Some(r) = cur {
            out.push(r);
            cur = r.els.as_deref();
        }
        out
    }
}

// ──────────────────────────────────────────────
// Bodies and expressions
// ──────────────────────────────────────────────

/// A conjunctive ordered sequence of expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Body(pub Vec<Expr>);

impl Body {
    pub fn new(exprs: Vec<Expr>) -> Self {
        Body(exprs)
    }

    pub fn from_expr(expr: Expr) -> Self {
        Body(vec![expr])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, expr: Expr) {
        self.0.push(expr);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Expr> {
        self.0.iter()
    }
}

impl std::ops::Index<usize> for Body {
    type Output = Expr;

    fn index(&self, i: usize) -> &Expr {
        &self.0[i]
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

/// The payload of an expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExprTerms {
    /// A bare term, true unless it plugs to literal `false`.
    Term(Term),
    /// An operator application; `terms[0]` is the operator reference.
    /// Equality `a = b` is the call `eq(a, b)`.
    Call(Vec<Term>),
    /// A universal quantification over an iterable domain.
    Every(Box<Every>),
}

/// `every key, value in domain { body }`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Every {
    pub key: Option<Term>,
    pub value: Term,
    pub domain: Term,
    pub body: Body,
}

/// An expression-scoped substitution target: `with target as value`.
#[derive(Debug, Clone)]
pub struct With {
    pub target: Term,
    pub value: Term,
    pub location: Location,
}

impl With {
    pub fn new(target: Term, value: Term) -> Self {
        With {
            target,
            value,
            location: Location::default(),
        }
    }
}

impl PartialEq for With {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.value == other.value
    }
}

impl Eq for With {}

impl PartialOrd for With {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for With {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.target, &self.value).cmp(&(&other.target, &other.value))
    }
}

impl Hash for With {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for With {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "with {} as {}", self.target, self.value)
    }
}

/// One step of a rule or query body. Location is excluded from equality
/// so that structurally identical expressions compare equal.
#[derive(Debug, Clone)]
pub struct Expr {
    pub terms: ExprTerms,
    pub negated: bool,
    pub with: Vec<With>,
    pub location: Location,
}

impl Expr {
    pub fn term(t: Term) -> Self {
        Expr {
            terms: ExprTerms::Term(t),
            negated: false,
            with: Vec::new(),
            location: Location::default(),
        }
    }

    pub fn call(terms: Vec<Term>) -> Self {
        Expr {
            terms: ExprTerms::Call(terms),
            negated: false,
            with: Vec::new(),
            location: Location::default(),
        }
    }

    /// The equality expression `a = b`.
    pub fn equality(a: Term, b: Term) -> Self {
        Expr::call(vec![
            Term::reference(Ref::operator(EQUALITY_OP)),
            a,
            b,
        ])
    }

    pub fn every(every: Every) -> Self {
        Expr {
            terms: ExprTerms::Every(Box::new(every)),
            negated: false,
            with: Vec::new(),
            location: Location::default(),
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn with_clause(mut self, w: With) -> Self {
        self.with.push(w);
        self
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn is_call(&self) -> bool {
        matches!(self.terms, ExprTerms::Call(_))
    }

    pub fn is_equality(&self) -> bool {
        match &self.terms {
            ExprTerms::Call(terms) => match terms.first().map(|t| &t.value) {
                Some(Value::Ref(r)) => {
                    r.len() == 1 && matches!(&r[0].value, Value::Var(v) if v == EQUALITY_OP)
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// The operator reference of a call expression.
    pub fn operator(&self) -> Option<&Ref> {
        match &self.terms {
            ExprTerms::Call(terms) => match terms.first().map(|t| &t.value) {
                Some(Value::Ref(r)) => Some(r),
                _ => None,
            },
            _ => None,
        }
    }

    /// The argument terms of a call expression.
    pub fn operands(&self) -> &[Term] {
        match &self.terms {
            ExprTerms::Call(terms) if !terms.is_empty() => &terms[1..],
            _ => &[],
        }
    }

    /// Logical complement: negation toggled, everything else preserved.
    pub fn complement(&self) -> Expr {
        let mut cpy = self.clone();
        cpy.negated = !self.negated;
        cpy
    }

    /// A copy with the `with` clauses removed.
    pub fn no_with(&self) -> Expr {
        let mut cpy = self.clone();
        cpy.with.clear();
        cpy
    }

    /// Complement with `with` clauses removed, used to evaluate the
    /// positive form of a negated expression.
    pub fn complement_no_with(&self) -> Expr {
        let mut cpy = self.complement();
        cpy.with.clear();
        cpy
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.negated == other.negated && self.terms == other.terms && self.with == other.with
    }
}

impl Eq for Expr {}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.negated, &self.terms, &self.with).cmp(&(other.negated, &other.terms, &other.with))
    }
}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.negated.hash(state);
        self.terms.hash(state);
        self.with.hash(state);
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        match &self.terms {
            ExprTerms::Term(t) => write!(f, "{}", t)?,
            ExprTerms::Call(terms) => {
                if self.is_equality() && terms.len() == 3 {
                    write!(f, "{} = {}", terms[1], terms[2])?;
                } else if let Some(op) = terms.first() {
                    write!(f, "{}(", op)?;
                    for (i, a) in terms[1..].iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", a)?;
                    }
                    write!(f, ")")?;
                }
            }
            ExprTerms::Every(e) => {
                write!(f, "every ")?;
                if let Some(k) = &e.key {
                    write!(f, "{}, ", k)?;
                }
                write!(f, "{} in {} {{ {} }}", e.value, e.domain, e.body)?;
            }
        }
        for w in &self.with {
            write!(f, " {}", w)?;
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Term and variable walking
// ──────────────────────────────────────────────

/// Options controlling which variable occurrences a walk collects.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarVisitorParams {
    /// Do not descend into comprehension and `every` closures.
    pub skip_closures: bool,
    /// Skip the head (first) position of references.
    pub skip_ref_head: bool,
    /// Skip the operator reference of calls entirely.
    pub skip_ref_call_head: bool,
    /// Skip `with` targets (values are still walked).
    pub skip_with_target: bool,
}

/// Collect the variables of a term.
pub fn term_vars(term: &Term, params: VarVisitorParams) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    collect_term(term, params, false, &mut out);
    out
}

/// Collect the variables of an expression.
pub fn expr_vars(expr: &Expr, params: VarVisitorParams) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    collect_expr(expr, params, &mut out);
    out
}

/// Collect the variables of a body.
pub fn body_vars(body: &Body, params: VarVisitorParams) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    for expr in body.iter() {
        collect_expr(expr, params, &mut out);
    }
    out
}

fn collect_expr(expr: &Expr, params: VarVisitorParams, out: &mut BTreeSet<Var>) {
    match &expr.terms {
        ExprTerms::Term(t) => collect_term(t, params, false, out),
        ExprTerms::Call(terms) => {
            for (i, t) in terms.iter().enumerate() {
                if i == 0 && params.skip_ref_call_head {
                    continue;
                }
                collect_term(t, params, false, out);
            }
        }
        ExprTerms::Every(e) => {
            if !params.skip_closures {
                if let Some(k) = &e.key {
                    collect_term(k, params, false, out);
                }
                collect_term(&e.value, params, false, out);
                collect_term(&e.domain, params, false, out);
                for inner in e.body.iter() {
                    collect_expr(inner, params, out);
                }
            } else {
                collect_term(&e.domain, params, false, out);
            }
        }
    }
    for w in &expr.with {
        if !params.skip_with_target {
            collect_term(&w.target, params, false, out);
        }
        collect_term(&w.value, params, false, out);
    }
}

fn collect_term(term: &Term, params: VarVisitorParams, in_ref_head: bool, out: &mut BTreeSet<Var>) {
    match &term.value {
        Value::Var(v) => {
            if !(in_ref_head && params.skip_ref_head) {
                out.insert(v.clone());
            }
        }
        Value::Ref(r) => {
            for (i, t) in r.iter().enumerate() {
                collect_term(t, params, i == 0, out);
            }
        }
        Value::Array(elems) => {
            for t in elems {
                collect_term(t, params, false, out);
            }
        }
        Value::Object(obj) => {
            for (k, v) in obj {
                collect_term(k, params, false, out);
                collect_term(v, params, false, out);
            }
        }
        Value::Set(set) => {
            for t in set {
                collect_term(t, params, false, out);
            }
        }
        Value::Call(terms) => {
            for (i, t) in terms.iter().enumerate() {
                if i == 0 && params.skip_ref_call_head {
                    continue;
                }
                collect_term(t, params, false, out);
            }
        }
        Value::ArrayCompr(c) => {
            if !params.skip_closures {
                collect_term(&c.term, params, false, out);
                for e in c.body.iter() {
                    collect_expr(e, params, out);
                }
            }
        }
        Value::SetCompr(c) => {
            if !params.skip_closures {
                collect_term(&c.term, params, false, out);
                for e in c.body.iter() {
                    collect_expr(e, params, out);
                }
            }
        }
        Value::ObjectCompr(c) => {
            if !params.skip_closures {
                collect_term(&c.key, params, false, out);
                collect_term(&c.value, params, false, out);
                for e in c.body.iter() {
                    collect_expr(e, params, out);
                }
            }
        }
        _ => {}
    }
}

/// Visit every term of an expression, including nested composites and
/// closure bodies.
pub fn walk_expr_terms(expr: &Expr, f: &mut dyn FnMut(&Term)) {
    match &expr.terms {
        ExprTerms::Term(t) => walk_terms(t, f),
        ExprTerms::Call(terms) => {
            for t in terms {
                walk_terms(t, f);
            }
        }
        ExprTerms::Every(e) => {
            if let Some(k) = &e.key {
                walk_terms(k, f);
            }
            walk_terms(&e.value, f);
            walk_terms(&e.domain, f);
            for inner in e.body.iter() {
                walk_expr_terms(inner, f);
            }
        }
    }
    for w in &expr.with {
        walk_terms(&w.target, f);
        walk_terms(&w.value, f);
    }
}

/// Visit a term and all terms nested inside it.
pub fn walk_terms(term: &Term, f: &mut dyn FnMut(&Term)) {
    f(term);
    match &term.value {
        Value::Ref(r) => {
            for t in r.iter() {
                walk_terms(t, f);
            }
        }
        Value::Array(elems) => {
            for t in elems {
                walk_terms(t, f);
            }
        }
        Value::Object(obj) => {
            for (k, v) in obj {
                walk_terms(k, f);
                walk_terms(v, f);
            }
        }
        Value::Set(set) => {
            for t in set {
                walk_terms(t, f);
            }
        }
        Value::Call(terms) => {
            for t in terms {
                walk_terms(t, f);
            }
        }
        Value::ArrayCompr(c) => {
            walk_terms(&c.term, f);
            for e in c.body.iter() {
                walk_expr_terms(e, f);
            }
        }
        Value::SetCompr(c) => {
            walk_terms(&c.term, f);
            for e in c.body.iter() {
                walk_expr_terms(e, f);
            }
        }
        Value::ObjectCompr(c) => {
            walk_terms(&c.key, f);
            walk_terms(&c.value, f);
            for e in c.body.iter() {
                walk_expr_terms(e, f);
            }
        }
        _ => {}
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_shape_is_detected() {
        let e = Expr::equality(Term::var("x"), Term::int(1));
        assert!(e.is_equality());
        assert!(e.is_call());
        assert_eq!(e.operands().len(), 2);
        assert_eq!(e.to_string(), "x = 1");
    }

    #[test]
    fn complement_no_with_strips_clauses() {
        let e = Expr::term(Term::var("x"))
            .with_clause(With::new(
                Term::reference(Ref::input(&[])),
                Term::int(1),
            ))
            .negate();
        let c = e.complement_no_with();
        assert!(!c.negated);
        assert!(c.with.is_empty());
    }

    #[test]
    fn expr_equality_ignores_location() {
        let a = Expr::term(Term::var("x")).at(Location::new(1, 1));
        let b = Expr::term(Term::var("x")).at(Location::new(2, 2));
        assert_eq!(a, b);
    }

    #[test]
    fn var_collection_respects_skip_params() {
        // f(x) with ref head data.f
        let e = Expr::call(vec![
            Term::reference(Ref::data(&["f"])),
            Term::var("x"),
        ]);
        let all = expr_vars(&e, VarVisitorParams::default());
        assert!(all.contains("data"));
        assert!(all.contains("x"));

        let skipped = expr_vars(
            &e,
            VarVisitorParams {
                skip_ref_call_head: true,
                ..Default::default()
            },
        );
        assert!(!skipped.contains("data"));
        assert!(skipped.contains("x"));
    }

    #[test]
    fn else_chain_flattens_in_order() {
        let r3 = Rule::new(Head::single(Ref::operator("p"), Term::int(3)), Body::default());
        let r2 = Rule::new(Head::single(Ref::operator("p"), Term::int(2)), Body::default())
            .with_else(r3);
        let r1 = Rule::new(Head::single(Ref::operator("p"), Term::int(1)), Body::default())
            .with_else(r2);
        let chain = r1.else_chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].head.value.as_ref().unwrap(), &Term::int(2));
        assert_eq!(chain[1].head.value.as_ref().unwrap(), &Term::int(3));
    }

    #[test]
    fn head_kind_classification() {
        let multi = Head::multi(Ref::operator("p"), Term::var("x"));
        assert_eq!(multi.kind(), RuleHeadKind::MultiValue);

        let single = Head::single(Ref::operator("p"), Term::int(1));
        assert_eq!(single.kind(), RuleHeadKind::SingleValue);

        let func = Head::func("f", vec![Term::var("a")], Term::var("a"));
        assert_eq!(func.kind(), RuleHeadKind::SingleValue);
    }
}
