//! Binding frames and the undo log.
//!
//! A frame maps variables to `(term, frame)` pairs: the bound term lives
//! in the frame it was produced under, so dereferencing hops frames.
//! Frames live in a per-query arena and are addressed by typed index
//! (`Bid`); the parent/caller back-references of the evaluator are plain
//! indices with no lifetime entanglement.
//!
//! Every `bind` returns exactly one `Undo`. Branching code records its
//! binds and must undo them before exposing the frame to any other
//! branch.

use std::collections::HashMap;

use arbiter_ast::{
    ArrayComprehension, Body, Expr, ExprTerms, Every, ObjectComprehension, Ref, SetComprehension,
    Term, Value, Var, With, DATA_ROOT, FUNC_ARGS_ROOT, INPUT_ROOT,
};

/// Index of a binding frame in the per-query arena.
pub(crate) type Bid = usize;

#[derive(Debug, Clone)]
struct BoundTo {
    term: Term,
    bid: Bid,
}

#[derive(Debug, Default)]
struct Frame {
    values: HashMap<Var, BoundTo>,
}

/// One recorded binding, sufficient to restore the prior state.
#[derive(Debug)]
pub(crate) struct Undo {
    bid: Bid,
    var: Var,
    prior: Option<BoundTo>,
}

/// The per-query arena of binding frames.
#[derive(Debug, Default)]
pub(crate) struct Bindings {
    frames: Vec<Frame>,
}

fn is_root_name(v: &str) -> bool {
    v == DATA_ROOT || v == INPUT_ROOT || v == FUNC_ARGS_ROOT
}

impl Bindings {
    pub fn new() -> Self {
        Bindings { frames: Vec::new() }
    }

    pub fn new_frame(&mut self) -> Bid {
        self.frames.push(Frame::default());
        self.frames.len() - 1
    }

    /// Bind `var` (in frame `at`) to `to` (living in frame `to_bid`).
    pub fn bind(&mut self, var: &Var, to: Term, to_bid: Bid, at: Bid) -> Undo {
        let prior = self.frames[at]
            .values
            .insert(var.clone(), BoundTo { term: to, bid: to_bid });
        Undo {
            bid: at,
            var: var.clone(),
            prior,
        }
    }

    /// Restore the state recorded by `bind`.
    pub fn undo(&mut self, undo: Undo) {
        match undo.prior {
            Some(prior) => {
                self.frames[undo.bid].values.insert(undo.var, prior);
            }
            None => {
                self.frames[undo.bid].values.remove(&undo.var);
            }
        }
    }

    /// Dereference through variable bindings until a non-variable term or
    /// an unbound variable is reached.
    pub fn apply(&self, term: &Term, bid: Bid) -> (Term, Bid) {
        if let Value::Var(v) = &term.value {
            if let Some(b) = self.frames[bid].values.get(v) {
                let (t, nb) = (b.term.clone(), b.bid);
                return self.apply(&t, nb);
            }
        }
        (term.clone(), bid)
    }

    /// Full recursive substitution. Unbound variables are left in place.
    pub fn plug(&self, term: &Term, bid: Bid) -> Term {
        self.plug_impl(term, bid, None)
    }

    /// Full recursive substitution with unbound variables renamed unless
    /// they belong to `caller`'s frame (or name a document root).
    pub fn plug_namespaced(&self, term: &Term, bid: Bid, caller: Bid) -> Term {
        self.plug_impl(term, bid, Some(caller))
    }

    fn plug_impl(&self, term: &Term, bid: Bid, caller: Option<Bid>) -> Term {
        let value = match &term.value {
            Value::Var(v) => {
                if let Some(b) = self.frames[bid].values.get(v) {
                    let (t, nb) = (b.term.clone(), b.bid);
                    return self.plug_impl(&t, nb, caller);
                }
                match caller {
                    Some(c) if bid != c && !is_root_name(v) => {
                        Value::Var(format!("{}{}", v, bid))
                    }
                    _ => Value::Var(v.clone()),
                }
            }
            Value::Ref(r) => Value::Ref(Ref::new(
                r.iter().map(|t| self.plug_impl(t, bid, caller)).collect(),
            )),
            Value::Array(elems) => Value::Array(
                elems.iter().map(|t| self.plug_impl(t, bid, caller)).collect(),
            ),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| {
                        (
                            self.plug_impl(k, bid, caller),
                            self.plug_impl(v, bid, caller),
                        )
                    })
                    .collect(),
            ),
            Value::Set(set) => Value::Set(
                set.iter().map(|t| self.plug_impl(t, bid, caller)).collect(),
            ),
            Value::Call(terms) => Value::Call(
                terms.iter().map(|t| self.plug_impl(t, bid, caller)).collect(),
            ),
            // Comprehension bodies close over this frame; they are
            // namespaced wholesale when captured, never plugged piecemeal.
            Value::ArrayCompr(_) | Value::ObjectCompr(_) | Value::SetCompr(_) => {
                return term.clone()
            }
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                return term.clone()
            }
        };
        Term {
            value,
            location: term.location,
        }
    }

    /// Syntactically rename every variable of `term` that does not name a
    /// document root and does not belong to `caller`'s frame. No
    /// substitution is performed; closure bodies are descended into.
    pub fn namespace_term(&self, term: &Term, bid: Bid, caller: Bid) -> Term {
        if bid == caller {
            return term.clone();
        }
        let value = match &term.value {
            Value::Var(v) if !is_root_name(v) => Value::Var(format!("{}{}", v, bid)),
            Value::Var(v) => Value::Var(v.clone()),
            Value::Ref(r) => Value::Ref(Ref::new(
                r.iter().map(|t| self.namespace_term(t, bid, caller)).collect(),
            )),
            Value::Array(elems) => Value::Array(
                elems.iter().map(|t| self.namespace_term(t, bid, caller)).collect(),
            ),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| {
                        (
                            self.namespace_term(k, bid, caller),
                            self.namespace_term(v, bid, caller),
                        )
                    })
                    .collect(),
            ),
            Value::Set(set) => Value::Set(
                set.iter().map(|t| self.namespace_term(t, bid, caller)).collect(),
            ),
            Value::Call(terms) => Value::Call(
                terms.iter().map(|t| self.namespace_term(t, bid, caller)).collect(),
            ),
            Value::ArrayCompr(c) => Value::ArrayCompr(Box::new(ArrayComprehension {
                term: self.namespace_term(&c.term, bid, caller),
                body: self.namespace_body(&c.body, bid, caller),
            })),
            Value::SetCompr(c) => Value::SetCompr(Box::new(SetComprehension {
                term: self.namespace_term(&c.term, bid, caller),
                body: self.namespace_body(&c.body, bid, caller),
            })),
            Value::ObjectCompr(c) => Value::ObjectCompr(Box::new(ObjectComprehension {
                key: self.namespace_term(&c.key, bid, caller),
                value: self.namespace_term(&c.value, bid, caller),
                body: self.namespace_body(&c.body, bid, caller),
            })),
            other => other.clone(),
        };
        Term {
            value,
            location: term.location,
        }
    }

    pub fn namespace_body(&self, body: &Body, bid: Bid, caller: Bid) -> Body {
        Body::new(
            body.iter()
                .map(|e| self.namespace_expr(e, bid, caller))
                .collect(),
        )
    }

    pub fn namespace_expr(&self, expr: &Expr, bid: Bid, caller: Bid) -> Expr {
        let mut cpy = expr.clone();
        cpy.terms = match &expr.terms {
            ExprTerms::Term(t) => ExprTerms::Term(self.namespace_term(t, bid, caller)),
            ExprTerms::Call(terms) => ExprTerms::Call(
                terms.iter().map(|t| self.namespace_term(t, bid, caller)).collect(),
            ),
            ExprTerms::Every(e) => ExprTerms::Every(Box::new(Every {
                key: e.key.as_ref().map(|k| self.namespace_term(k, bid, caller)),
                value: self.namespace_term(&e.value, bid, caller),
                domain: self.namespace_term(&e.domain, bid, caller),
                body: self.namespace_body(&e.body, bid, caller),
            })),
        };
        cpy.with = expr
            .with
            .iter()
            .map(|w| With {
                target: w.target.clone(),
                value: self.namespace_term(&w.value, bid, caller),
                location: w.location,
            })
            .collect();
        cpy
    }

    /// Enumerate the local entries of a frame: the variable term and its
    /// value plugged and namespaced against `caller`.
    pub fn iter_frame(&self, bid: Bid, caller: Bid) -> Vec<(Term, Term)> {
        let mut entries: Vec<(Var, BoundTo)> = self.frames[bid]
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
            .into_iter()
            .map(|(k, v)| {
                let plugged = self.plug_impl(&v.term, v.bid, Some(caller));
                (Term::var(k), plugged)
            })
            .collect()
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_apply_plug_and_undo_round_trip() {
        let mut b = Bindings::new();
        let f0 = b.new_frame();
        let f1 = b.new_frame();

        // x (f0) -> y (f1), y (f1) -> 1
        let u1 = b.bind(&"x".to_string(), Term::var("y"), f1, f0);
        let u2 = b.bind(&"y".to_string(), Term::int(1), f1, f1);

        let (t, bid) = b.apply(&Term::var("x"), f0);
        assert_eq!(t, Term::int(1));
        assert_eq!(bid, f1);

        let plugged = b.plug(&Term::array(vec![Term::var("x"), Term::var("z")]), f0);
        assert_eq!(
            plugged,
            Term::array(vec![Term::int(1), Term::var("z")])
        );

        b.undo(u2);
        let (t, _) = b.apply(&Term::var("x"), f0);
        assert_eq!(t, Term::var("y"));
        b.undo(u1);
        let (t, _) = b.apply(&Term::var("x"), f0);
        assert_eq!(t, Term::var("x"));
    }

    #[test]
    fn undo_restores_shadowed_binding() {
        let mut b = Bindings::new();
        let f0 = b.new_frame();
        let u1 = b.bind(&"x".to_string(), Term::int(1), f0, f0);
        let u2 = b.bind(&"x".to_string(), Term::int(2), f0, f0);
        let (t, _) = b.apply(&Term::var("x"), f0);
        assert_eq!(t, Term::int(2));
        b.undo(u2);
        let (t, _) = b.apply(&Term::var("x"), f0);
        assert_eq!(t, Term::int(1));
        b.undo(u1);
    }

    #[test]
    fn namespaced_plug_renames_foreign_unbound_vars() {
        let mut b = Bindings::new();
        let caller = b.new_frame();
        let local = b.new_frame();

        let t = Term::array(vec![
            Term::var("x"),
            Term::reference(Ref::data(&["a"])),
        ]);
        let out = b.plug_namespaced(&t, local, caller);
        assert_eq!(
            out,
            Term::array(vec![
                Term::var(format!("x{}", local)),
                Term::reference(Ref::data(&["a"])),
            ])
        );

        // vars in the caller frame keep their names
        let out = b.plug_namespaced(&Term::var("x"), caller, caller);
        assert_eq!(out, Term::var("x"));
    }

    #[test]
    fn sets_are_reordered_after_plugging() {
        let mut b = Bindings::new();
        let f0 = b.new_frame();
        let _u = b.bind(&"x".to_string(), Term::int(0), f0, f0);
        let set = Term::set(vec![Term::var("x"), Term::int(5)]);
        let plugged = b.plug(&set, f0);
        match &plugged.value {
            Value::Set(s) => {
                let elems: Vec<_> = s.iter().cloned().collect();
                assert_eq!(elems, vec![Term::int(0), Term::int(5)]);
            }
            other => panic!("expected set, got {:?}", other),
        }
    }
}
