//! Copy propagation over residual bodies.
//!
//! Partial evaluation leaves behind chains of trivial equalities binding
//! generated variables. This pass substitutes those bindings away and
//! drops the equalities, keeping the body semantically identical:
//!
//! - only positive equalities binding a non-safe variable are folded;
//! - a binding is kept whenever its variable already occurs in an
//!   emitted expression (folding it there would change nothing, dropping
//!   it would leave the variable unbound);
//! - an occurs check rejects self-referential bindings;
//! - an emptied body is restored to its last dropped equality so heads
//!   keep a defining body.

use std::collections::{BTreeSet, HashMap};

use arbiter_ast::{
    expr_vars, Body, Every, Expr, ExprTerms, Ref, Term, Value, Var, VarVisitorParams, With,
};

pub(crate) struct CopyPropagator {
    safe: BTreeSet<Var>,
    ensure_non_empty: bool,
}

impl CopyPropagator {
    pub fn new(safe: BTreeSet<Var>) -> Self {
        CopyPropagator {
            safe,
            ensure_non_empty: false,
        }
    }

    pub fn with_ensure_non_empty_body(mut self, ensure: bool) -> Self {
        self.ensure_non_empty = ensure;
        self
    }

    pub fn apply(&self, body: Body) -> Body {
        let mut sub: HashMap<Var, Term> = HashMap::new();
        let mut out: Vec<Expr> = Vec::new();
        let mut last_dropped: Option<Expr> = None;

        for expr in body.0 {
            let expr = substitute_expr(&expr, &sub);

            if !expr.negated && expr.with.is_empty() && expr.is_equality() {
                let lhs = expr.operands()[0].clone();
                let rhs = expr.operands()[1].clone();

                if lhs == rhs {
                    last_dropped = Some(expr);
                    continue;
                }

                if let Some((v, t)) = self.binding_of(&lhs, &rhs, &out) {
                    // fold the binding into later expressions and into
                    // already-recorded substitutions
                    for existing in sub.values_mut() {
                        let mut single = HashMap::new();
                        single.insert(v.clone(), t.clone());
                        *existing = substitute_term(existing, &single);
                    }
                    sub.insert(v, t);
                    last_dropped = Some(expr);
                    continue;
                }
            }

            out.push(expr);
        }

        if out.is_empty() && self.ensure_non_empty {
            match last_dropped {
                Some(e) => out.push(substitute_expr(&e, &sub)),
                None => out.push(Expr::term(Term::bool(true))),
            }
        }

        Body::new(out)
    }

    /// Pick the foldable side of an equality, if any.
    fn binding_of(&self, lhs: &Term, rhs: &Term, emitted: &[Expr]) -> Option<(Var, Term)> {
        for (var_side, other) in [(lhs, rhs), (rhs, lhs)] {
            let v = match &var_side.value {
                Value::Var(v) => v,
                _ => continue,
            };
            if self.safe.contains(v) {
                continue;
            }
            if occurs_in(v, other) {
                continue;
            }
            if emitted.iter().any(|e| {
                expr_vars(e, VarVisitorParams::default()).contains(v)
            }) {
                continue;
            }
            return Some((v.clone(), other.clone()));
        }
        None
    }
}

fn occurs_in(v: &Var, term: &Term) -> bool {
    let mut found = false;
    arbiter_ast::walk_terms(term, &mut |t| {
        if matches!(&t.value, Value::Var(x) if x == v) {
            found = true;
        }
    });
    found
}

fn substitute_expr(expr: &Expr, sub: &HashMap<Var, Term>) -> Expr {
    if sub.is_empty() {
        return expr.clone();
    }
    let mut cpy = expr.clone();
    cpy.terms = match &expr.terms {
        ExprTerms::Term(t) => ExprTerms::Term(substitute_term(t, sub)),
        ExprTerms::Call(terms) => {
            let mut new_terms = Vec::with_capacity(terms.len());
            for (i, t) in terms.iter().enumerate() {
                if i == 0 {
                    new_terms.push(t.clone());
                } else {
                    new_terms.push(substitute_term(t, sub));
                }
            }
            ExprTerms::Call(new_terms)
        }
        ExprTerms::Every(e) => ExprTerms::Every(Box::new(Every {
            key: e.key.as_ref().map(|k| substitute_term(k, sub)),
            value: substitute_term(&e.value, sub),
            domain: substitute_term(&e.domain, sub),
            body: Body::new(e.body.iter().map(|x| substitute_expr(x, sub)).collect()),
        })),
    };
    cpy.with = expr
        .with
        .iter()
        .map(|w| With {
            target: w.target.clone(),
            value: substitute_term(&w.value, sub),
            location: w.location,
        })
        .collect();
    cpy
}

fn substitute_term(term: &Term, sub: &HashMap<Var, Term>) -> Term {
    let value = match &term.value {
        Value::Var(v) => match sub.get(v) {
            Some(t) => return t.clone(),
            None => Value::Var(v.clone()),
        },
        Value::Ref(r) => Value::Ref(Ref::new(
            r.iter()
                .enumerate()
                .map(|(i, t)| {
                    if i == 0 {
                        t.clone()
                    } else {
                        substitute_term(t, sub)
                    }
                })
                .collect(),
        )),
        Value::Array(elems) => {
            Value::Array(elems.iter().map(|t| substitute_term(t, sub)).collect())
        }
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (substitute_term(k, sub), substitute_term(v, sub)))
                .collect(),
        ),
        Value::Set(set) => Value::Set(set.iter().map(|t| substitute_term(t, sub)).collect()),
        Value::Call(terms) => Value::Call(
            terms
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    if i == 0 {
                        t.clone()
                    } else {
                        substitute_term(t, sub)
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    };
    Term {
        value,
        location: term.location,
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn input_x() -> Term {
        Term::reference(Ref::input(&["x"]))
    }

    #[test]
    fn folds_generated_bindings_into_uses() {
        // __local0__ = input.x; __local0__ > 7
        let body = Body::new(vec![
            Expr::equality(Term::var("__local0__"), input_x()),
            Expr::call(vec![
                Term::reference(Ref::operator("gt")),
                Term::var("__local0__"),
                Term::int(7),
            ]),
        ]);
        let cp = CopyPropagator::new(BTreeSet::new());
        let out = cp.apply(body);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_string(), "gt(input.x, 7)");
    }

    #[test]
    fn safe_vars_are_not_folded() {
        let mut safe = BTreeSet::new();
        safe.insert("x".to_string());
        let body = Body::new(vec![Expr::equality(Term::var("x"), input_x())]);
        let out = CopyPropagator::new(safe).apply(body);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn emptied_bodies_are_restored() {
        let body = Body::new(vec![Expr::equality(Term::var("y"), input_x())]);
        let out = CopyPropagator::new(BTreeSet::new())
            .with_ensure_non_empty_body(true)
            .apply(body);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_string(), "y = input.x");
    }

    #[test]
    fn bindings_used_by_emitted_expressions_are_kept() {
        // not p(z); z = 1  -- z occurs in an emitted (negated) expr, so
        // the binding must stay
        let body = Body::new(vec![
            Expr::call(vec![
                Term::reference(Ref::data(&["p"])),
                Term::var("z"),
            ])
            .negate(),
            Expr::equality(Term::var("z"), Term::int(1)),
        ]);
        let out = CopyPropagator::new(BTreeSet::new()).apply(body);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn trivial_equalities_vanish() {
        let body = Body::new(vec![
            Expr::equality(Term::int(1), Term::int(1)),
            Expr::term(Term::bool(true)),
        ]);
        let out = CopyPropagator::new(BTreeSet::new()).apply(body);
        assert_eq!(out.len(), 1);
    }
}
