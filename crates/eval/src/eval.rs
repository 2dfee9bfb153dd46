//! The recursive evaluation driver.
//!
//! Evaluation is continuation-passing: each step succeeds by invoking a
//! continuation for every solution, and backtracks by returning. The
//! machine threads itself through every continuation as an argument, so
//! closures capture only terms and small cloned frames.
//!
//! Frames are cheap copies: a body, an index into it, a bindings frame
//! id, and trace lineage. `closure` shares the bindings frame, `child`
//! allocates a fresh one. The parent link is a plain query id used only
//! for trace events.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Arc;

use arbiter_ast::{
    body_vars, expr_vars, walk_terms, ArrayComprehension, Body, Compiler, Every, Expr, ExprTerms,
    Head, IndexResolver, IndexResult, Location, Object, ObjectComprehension, Ref, Rule,
    RuleHeadKind, Set, SetComprehension, Term, TreeNode, Value, Var, VarVisitorParams, With,
    DATA_ROOT, INPUT_ROOT,
};
use arbiter_storage::{Store, Transaction};

use crate::bindings::{Bid, Bindings};
use crate::builtins::{BuiltinContext, BuiltinRegistry};
use crate::cache::{
    BaseCache, CompTable, ComprehensionCache, Instrument, NdbCache, VcKey, VirtualCache,
    COUNTER_COMPREHENSION_CACHE_BUILD, COUNTER_COMPREHENSION_CACHE_HIT,
    COUNTER_COMPREHENSION_CACHE_MISS, COUNTER_COMPREHENSION_CACHE_SKIP,
    COUNTER_VIRTUAL_CACHE_HIT, COUNTER_VIRTUAL_CACHE_MISS,
};
use crate::cancel::Cancel;
use crate::copyprop::CopyPropagator;
use crate::errors::{suppress_early_exit, Error, EvalResult, Stop};
use crate::save::{
    ref_head, FunctionMocksStack, InliningControl, RefStack, SaveSet, SaveStack, SaveSupport,
    SavedExpr,
};
use crate::trace::{Event, Node, Op, QueryTracer};

pub(crate) type EvalIter<'a, 'q> = &'a mut dyn FnMut(&mut Machine<'q>, &Frame) -> EvalResult;
pub(crate) type UnifyIter<'a, 'q> = &'a mut dyn FnMut(&mut Machine<'q>) -> EvalResult;
type RefIter<'a, 'q> = &'a mut dyn FnMut(&mut Machine<'q>, usize) -> EvalResult;

/// Per-invocation evaluation state: one body, a position in it, a
/// bindings frame, and trace lineage.
#[derive(Clone)]
pub(crate) struct Frame {
    pub query: Rc<Body>,
    pub index: usize,
    pub query_id: u64,
    pub parent_id: u64,
    pub bid: Bid,
    pub find_one: bool,
}

/// All per-query mutable state plus the shared read-only collaborators.
pub(crate) struct Machine<'q> {
    pub compiler: &'q Compiler,
    pub store: &'q dyn Store,
    pub txn: Transaction,
    pub builtins: &'q BuiltinRegistry,

    pub binds: Bindings,
    pub virtual_cache: VirtualCache,
    pub base_cache: BaseCache,
    pub comp_cache: ComprehensionCache,
    pub ndb_cache: Option<&'q std::sync::Mutex<NdbCache>>,
    pub instr: Instrument,

    pub partial: bool,
    pub save_set: SaveSet,
    pub save_stack: SaveStack,
    pub save_support: SaveSupport,
    pub save_namespace: String,
    pub skip_save_namespace: bool,
    pub inlining: InliningControl,

    pub mocks: FunctionMocksStack,
    pub targets: RefStack,

    pub input: Option<Term>,
    pub data: Option<Term>,

    pub cancel: Option<Arc<dyn Cancel>>,
    pub tracers: Vec<Box<dyn QueryTracer>>,
    pub trace_enabled: bool,
    pub plug_trace_vars: bool,

    pub builtin_errors: Vec<Error>,
    pub query_id_seq: u64,
    pub genvar_seq: u64,
    pub genvar_prefix: String,
    pub indexing: bool,
    pub early_exit_enabled: bool,
    pub time: Term,
    pub caller_bid: Bid,
    pub index_args: Option<(Vec<Term>, Bid)>,
}

impl<'q> Machine<'q> {
    fn next_query_id(&mut self) -> u64 {
        let id = self.query_id_seq;
        self.query_id_seq += 1;
        id
    }

    /// New frame over `body` sharing the current bindings frame.
    pub fn closure_frame(&mut self, f: &Frame, body: Body) -> Frame {
        Frame {
            query: Rc::new(body),
            index: 0,
            query_id: self.next_query_id(),
            parent_id: f.query_id,
            bid: f.bid,
            find_one: false,
        }
    }

    /// New frame over `body` with a fresh bindings frame.
    pub fn child_frame(&mut self, f: &Frame, body: Body, find_one: bool) -> Frame {
        let bid = self.binds.new_frame();
        Frame {
            query: Rc::new(body),
            index: 0,
            query_id: self.next_query_id(),
            parent_id: f.query_id,
            bid,
            find_one,
        }
    }

    pub fn generate_var(&mut self, suffix: &str) -> Term {
        self.genvar_seq += 1;
        Term::var(format!("{}_{}_{}", self.genvar_prefix, suffix, self.genvar_seq))
    }

    fn generate_term_var(&self, f: &Frame) -> Term {
        Term::var(format!(
            "{}_term_{}_{}",
            self.genvar_prefix, f.query_id, f.index
        ))
    }

    // ──────────────────────────────────────────────
    // Unknown checks
    // ──────────────────────────────────────────────
    //
    // A term is unknown when it depends on a save-set entry, touches a
    // reference with inlining disabled, or names a virtual document --
    // rules may depend transitively on unknowns, so virtual references
    // are conservatively unknown during partial evaluation. Direct
    // save-set membership (`save_set.contains`) stays narrower: it only
    // gates evaluation of the term itself.

    fn is_virtual_ref(&self, r: &Ref) -> bool {
        r.root_is(DATA_ROOT) && self.compiler.is_virtual(&r.ground_prefix())
    }

    fn term_touches_virtual(&self, t: &Term) -> bool {
        let mut found = false;
        walk_terms(t, &mut |x| {
            if found {
                return;
            }
            if let Value::Ref(r) = &x.value {
                if self.is_virtual_ref(r) || self.inlining.disabled(r, true) {
                    found = true;
                }
            }
        });
        found
    }

    pub fn unknown_term(&self, t: &Term, bid: Bid) -> bool {
        self.partial
            && (self.save_set.contains_recursive(&self.binds, t, bid)
                || self.term_touches_virtual(t))
    }

    pub fn unknown_ref(&self, r: &Ref, bid: Bid) -> bool {
        if !self.partial {
            return false;
        }
        self.is_virtual_ref(r)
            || self.inlining.disabled(r, true)
            || self
                .save_set
                .contains(&self.binds, &Term::reference(r.clone()), bid)
    }

    pub fn unknown_expr(&self, expr: &Expr, bid: Bid) -> bool {
        if !self.partial {
            return false;
        }
        if self.save_set.expr_unknown(&self.binds, expr, bid) {
            return true;
        }
        let mut found = false;
        arbiter_ast::walk_expr_terms(expr, &mut |t| {
            if !found && self.term_touches_virtual(t) {
                found = true;
            }
        });
        found
    }

    pub fn unknown_terms(&self, terms: &[Term], bid: Bid) -> bool {
        self.partial && terms.iter().any(|t| self.unknown_term(t, bid))
    }

    // ──────────────────────────────────────────────
    // Tracing
    // ──────────────────────────────────────────────

    fn trace_event(&mut self, op: Op, f: &Frame, node: Node, message: String, target: Option<Ref>) {
        if !self.trace_enabled {
            return;
        }
        let location = match &node {
            Node::Body(b) => b.iter().next().map(|e| e.location).unwrap_or_default(),
            Node::Expr(e) => e.location,
            Node::Rule(r) => r.location,
            Node::Term(t) => t.location,
        };
        let locals = if self.plug_trace_vars {
            Some(self.binds.iter_frame(f.bid, f.bid))
        } else {
            None
        };
        let event = Event {
            op,
            query_id: f.query_id,
            parent_id: f.parent_id,
            node,
            location,
            message,
            target,
            locals,
        };
        for t in &mut self.tracers {
            if t.enabled() {
                t.trace_event(&event);
            }
        }
    }

    fn trace_enter(&mut self, f: &Frame, node: Node) {
        self.trace_event(Op::Enter, f, node, String::new(), None);
    }

    fn trace_exit(&mut self, f: &Frame, node: Node) {
        let msg = if f.find_one { "early".to_string() } else { String::new() };
        self.trace_event(Op::Exit, f, node, msg, None);
    }

    fn trace_eval(&mut self, f: &Frame, expr: &Expr) {
        self.trace_event(Op::Eval, f, Node::Expr(expr.clone()), String::new(), None);
    }

    fn trace_redo(&mut self, f: &Frame, node: Node) {
        self.trace_event(Op::Redo, f, node, String::new(), None);
    }

    fn trace_fail(&mut self, f: &Frame, node: Node) {
        self.trace_event(Op::Fail, f, node, String::new(), None);
    }

    fn trace_duplicate(&mut self, f: &Frame, node: Node) {
        self.trace_event(Op::Duplicate, f, node, String::new(), None);
    }

    fn trace_save(&mut self, f: &Frame, expr: &Expr) {
        self.trace_event(Op::Save, f, Node::Expr(expr.clone()), String::new(), None);
    }

    fn trace_unify(&mut self, f: &Frame, a: &Term, b: &Term) {
        if !self.trace_enabled {
            return;
        }
        let expr = Expr::equality(a.clone(), b.clone());
        self.trace_event(Op::Unify, f, Node::Expr(expr), String::new(), None);
    }

    // ──────────────────────────────────────────────
    // Driver
    // ──────────────────────────────────────────────

    /// Evaluate a frame with enter/exit/redo tracing around it.
    pub fn run_frame(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        if !self.trace_enabled {
            return self.eval(f, iter);
        }
        self.trace_enter(f, Node::Body((*f.query).clone()));
        self.eval(f, &mut |m, fr| {
            m.trace_exit(fr, Node::Body((*fr.query).clone()));
            let r = iter(m, fr);
            m.trace_redo(fr, Node::Body((*fr.query).clone()));
            r
        })
    }

    pub fn eval(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        self.eval_expr(f, iter)
    }

    fn eval_expr(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        if let Some(cancel) = &self.cancel {
            if cancel.cancelled() {
                return Err(Stop::Fatal(Error::cancel()));
            }
        }

        if f.index >= f.query.len() {
            match iter(self, f) {
                Err(Stop::EarlyExit) | Err(Stop::DeferredEarlyExit) => {
                    // the signal continues unwinding toward the frame
                    // that requested find-one
                    return if f.find_one {
                        Err(Stop::EarlyExit)
                    } else {
                        Err(Stop::DeferredEarlyExit)
                    };
                }
                Err(other) => return Err(other),
                Ok(()) => {}
            }
            if f.find_one && !self.partial {
                return Err(Stop::EarlyExit);
            }
            return Ok(());
        }

        let expr = f.query[f.index].clone();
        self.trace_eval(f, &expr);

        if !expr.with.is_empty() {
            return self.eval_with(f, iter);
        }

        self.eval_step(f, &mut |m, fr| m.next(fr, iter))
    }

    fn next(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        let mut nf = f.clone();
        nf.index += 1;
        self.eval_expr(&nf, iter)
    }

    fn eval_step(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        let expr = f.query[f.index].clone();

        if expr.negated {
            return self.eval_not(f, iter);
        }

        let mut defined = false;
        let res = match &expr.terms {
            ExprTerms::Call(terms) => {
                if expr.is_equality() {
                    self.biunify(&terms[1], &terms[2], f.bid, f.bid, f, &mut |m| {
                        defined = true;
                        let r = iter(m, f);
                        m.trace_redo(f, Node::Expr(expr.clone()));
                        r
                    })
                } else {
                    let terms = terms.clone();
                    self.eval_call(f, &terms, &mut |m| {
                        defined = true;
                        let r = iter(m, f);
                        m.trace_redo(f, Node::Expr(expr.clone()));
                        r
                    })
                }
            }
            ExprTerms::Term(t) => {
                let rterm = self.generate_term_var(f);
                if self.partial {
                    self.inlining
                        .push_disable(vec![Ref::new(vec![rterm.clone()])]);
                }
                let t = t.clone();
                let res = self.biunify(&t, &rterm, f.bid, f.bid, f, &mut |m| {
                    if m.partial && m.save_set.contains(&m.binds, &rterm, f.bid) {
                        let e = Expr::term(rterm.clone());
                        return m.save_expr(f, &e, f.bid, &mut |m| iter(m, f));
                    }
                    if m.binds.plug(&rterm, f.bid) != Term::bool(false) {
                        defined = true;
                        let r = iter(m, f);
                        m.trace_redo(f, Node::Expr(expr.clone()));
                        return r;
                    }
                    Ok(())
                });
                if self.partial {
                    self.inlining.pop_disable();
                }
                res
            }
            ExprTerms::Every(e) => {
                let ev = EveryEval {
                    frame: f.clone(),
                    expr: expr.clone(),
                    every: (**e).clone(),
                };
                ev.eval(self, &mut |m| {
                    defined = true;
                    let r = iter(m, f);
                    m.trace_redo(f, Node::Expr(expr.clone()));
                    r
                })
            }
        };

        res?;
        if !defined {
            self.trace_fail(f, Node::Expr(expr));
        }
        Ok(())
    }

    // ──────────────────────────────────────────────
    // Negation
    // ──────────────────────────────────────────────

    fn eval_not(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        let expr = f.query[f.index].clone();

        if self.unknown_expr(&expr, f.bid) {
            return self.eval_not_partial(f, iter);
        }

        let negation = Body::from_expr(expr.complement_no_with());
        let cf = self.closure_frame(f, negation.clone());

        if self.trace_enabled {
            self.trace_enter(&cf, Node::Body(negation.clone()));
        }

        let mut defined = false;
        let res = self.eval(&cf, &mut |m, cfr| {
            if m.trace_enabled {
                m.trace_exit(cfr, Node::Body(negation.clone()));
                m.trace_redo(cfr, Node::Body(negation.clone()));
            }
            defined = true;
            Ok(())
        });
        res?;

        if !defined {
            return iter(self, f);
        }
        self.trace_fail(f, Node::Expr(expr));
        Ok(())
    }

    fn eval_not_partial(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        let expr = f.query[f.index].clone();
        let negation = expr.complement_no_with();
        let cf = self.closure_frame(f, Body::from_expr(negation));
        let negation_id = cf.query_id;

        // Unknowns are namespaced with the frame they originate in so
        // variables across queries stay distinct.
        let unknowns = self.save_set.vars(self.caller_bid);

        let cp = if !self.inlining.shallow {
            Some(CopyPropagator::new(unknowns.clone()).with_ensure_non_empty_body(true))
        } else {
            None
        };

        let mut saved_queries: Vec<Body> = Vec::new();
        self.save_stack.push_query();

        let res = self.eval(&cf, &mut |m, _| {
            let current = m.save_stack.peek().to_vec();
            let plugged = m.plug_saved(&current, m.caller_bid);
            // A body that fails to type-check can never succeed.
            if !m.compiler.passes_type_check(&plugged) {
                return Ok(());
            }
            let plugged = match &cp {
                Some(c) => c.apply(plugged),
                None => plugged,
            };
            saved_queries.push(plugged);
            Ok(())
        });
        self.save_stack.pop_query();
        res?;

        // No residuals: the positive form is always undefined, so the
        // negation holds trivially.
        if saved_queries.is_empty() {
            return iter(self, f);
        }

        if !can_inline_negation(&unknowns, &saved_queries) {
            return self.eval_not_partial_support(
                f,
                negation_id,
                &expr,
                &unknowns,
                &saved_queries,
                iter,
            );
        }

        // Inline the complemented cartesian product:
        // (A && B) || (C && D) becomes
        // (!A && !C) || (!A && !D) || (!B && !C) || (!B && !D)
        let mut curr: Vec<Expr> = Vec::new();
        self.complemented_cartesian_product(f, &saved_queries, 0, &mut curr, iter)
    }

    fn complemented_cartesian_product(
        &mut self,
        f: &Frame,
        queries: &[Body],
        idx: usize,
        curr: &mut Vec<Expr>,
        iter: EvalIter<'_, 'q>,
    ) -> EvalResult {
        if idx == queries.len() {
            let exprs = curr.clone();
            return self.save_inlined_negated_exprs(f, &exprs, &mut |m| iter(m, f));
        }
        for expr in queries[idx].iter() {
            curr.push(expr.complement());
            self.complemented_cartesian_product(f, queries, idx + 1, curr, iter)?;
            curr.pop();
        }
        Ok(())
    }

    fn eval_not_partial_support(
        &mut self,
        f: &Frame,
        negation_id: u64,
        expr: &Expr,
        unknowns: &BTreeSet<Var>,
        queries: &[Body],
        iter: EvalIter<'_, 'q>,
    ) -> EvalResult {
        let support_name = format!("__not{}_{}_{}__", f.query_id, f.index, negation_id);
        let path = Ref::new(vec![
            Term::var(DATA_ROOT),
            Term::string(self.save_namespace.clone()),
            Term::string(support_name.clone()),
        ]);

        let mut bvars: BTreeSet<Var> = BTreeSet::new();
        for q in queries {
            bvars.extend(body_vars(q, VarVisitorParams::default()));
        }

        // Rule args: unknowns the bodies actually use, in deterministic
        // order.
        let args: Vec<Term> = unknowns
            .intersection(&bvars)
            .map(|v| Term::var(v.clone()))
            .collect();

        let head = Head {
            reference: Ref::new(vec![Term::var(support_name)]),
            key: None,
            value: Some(Term::bool(true)),
            args: args.clone(),
            location: expr.location,
        };

        for q in queries {
            let mut rule = Rule::new(head.clone(), q.clone());
            rule.path = path.clone();
            self.save_support
                .insert(&path, path.prefix(path.len() - 1), rule);
        }

        let mut cpy = expr.clone();
        cpy.terms = if args.is_empty() {
            ExprTerms::Term(Term::reference(path))
        } else {
            let mut terms = Vec::with_capacity(args.len() + 1);
            terms.push(Term::reference(path));
            terms.extend(args);
            ExprTerms::Call(terms)
        };

        self.save_inlined_negated_exprs(f, &[cpy], &mut |m| m.next(f, iter))
    }

    // ──────────────────────────────────────────────
    // `with` substitution
    // ──────────────────────────────────────────────

    fn eval_with(&mut self, f: &Frame, iter: EvalIter<'_, 'q>) -> EvalResult {
        let expr = f.query[f.index].clone();

        let mut disable: Vec<Ref> = Vec::new();

        if self.partial {
            // Disable inlining on every reference the expression touches
            // so the residual keeps its `with` semantics.
            let mut collect = |t: &Term| {
                if let Value::Ref(r) = &t.value {
                    disable.push(r.ground_prefix());
                }
            };

            for w in &expr.with {
                if self.is_function_target(&w.target) || is_other_ref(&w.target) {
                    walk_terms(&w.value, &mut collect);
                    continue;
                }
                // Unknown replacement value: the whole expression must be
                // saved with its `with` clauses intact.
                if self
                    .save_set
                    .contains_recursive(&self.binds, &w.value, f.bid)
                {
                    return self.save_expr_mark_unknowns(f, &expr, f.bid, &mut |m, fr| {
                        m.next(fr, iter)
                    });
                }
                walk_terms(&w.target, &mut collect);
                walk_terms(&w.value, &mut collect);
            }

            let stripped = expr.no_with();
            arbiter_ast::walk_expr_terms(&stripped, &mut collect);
        }

        let mut pairs_input: Vec<(Ref, Term)> = Vec::new();
        let mut pairs_data: Vec<(Ref, Term)> = Vec::new();
        let mut targets: Vec<Ref> = Vec::new();
        let mut mocks: Vec<(Ref, Term)> = Vec::new();

        for w in &expr.with {
            let target_ref = match &w.target.value {
                Value::Ref(r) => r.clone(),
                other => {
                    return Err(Stop::Fatal(Error::internal(
                        format!("with target must be a ref, got {}", other.type_name()),
                        w.location,
                    )))
                }
            };
            let plugged = self.binds.plug(&w.value, f.bid);

            if self.is_function_target(&w.target) {
                mocks.push((target_ref, plugged));
                continue;
            }
            if is_input_ref(&w.target) {
                pairs_input.push((target_ref.clone(), plugged));
            } else if is_data_ref(&w.target) {
                pairs_data.push((target_ref.clone(), plugged));
            } else if self
                .builtins
                .get(&ref_operator_name(&target_ref))
                .is_some()
            {
                mocks.push((target_ref, plugged));
                continue;
            }
            targets.push(target_ref);
        }

        let input = merge_term_with_values(self.input.as_ref(), &pairs_input)
            .map_err(|msg| Stop::Fatal(Error::with_merge_conflict(msg, expr.location)))?;
        let data = merge_term_with_values(self.data.as_ref(), &pairs_data)
            .map_err(|msg| Stop::Fatal(Error::with_merge_conflict(msg, expr.location)))?;

        let mut old = Some(self.with_push(&input, &data, &mocks, &targets, &disable));

        let res = self.eval_step(f, &mut |m, fr| {
            m.with_pop(old.take().expect("with scope missing"));
            let r = m.next(fr, iter);
            old = Some(m.with_push(&input, &data, &mocks, &targets, &disable));
            r
        });

        if let Some(o) = old {
            self.with_pop(o);
        }
        res
    }

    #[allow(clippy::type_complexity)]
    fn with_push(
        &mut self,
        input: &Option<Term>,
        data: &Option<Term>,
        mocks: &[(Ref, Term)],
        targets: &[Ref],
        disable: &[Ref],
    ) -> (Option<Option<Term>>, Option<Option<Term>>) {
        let old_input = input
            .as_ref()
            .map(|t| std::mem::replace(&mut self.input, Some(t.clone())));
        let old_data = data
            .as_ref()
            .map(|t| std::mem::replace(&mut self.data, Some(t.clone())));

        self.comp_cache.push_scope();
        self.virtual_cache.push_scope();
        self.targets.push(targets.to_vec());
        self.inlining.push_disable(disable.to_vec());
        self.mocks.put_pairs(mocks.to_vec());

        (old_input, old_data)
    }

    fn with_pop(&mut self, old: (Option<Option<Term>>, Option<Option<Term>>)) {
        self.mocks.pop_pairs();
        self.inlining.pop_disable();
        self.targets.pop();
        self.virtual_cache.pop_scope();
        self.comp_cache.pop_scope();
        if let Some(data) = old.1 {
            self.data = data;
        }
        if let Some(input) = old.0 {
            self.input = input;
        }
    }

    fn is_function_target(&self, target: &Term) -> bool {
        match &target.value {
            Value::Ref(r) => self.compiler.is_function(r),
            _ => false,
        }
    }

    // ──────────────────────────────────────────────
    // Calls
    // ──────────────────────────────────────────────

    fn eval_call(&mut self, f: &Frame, terms: &[Term], iter: UnifyIter<'_, 'q>) -> EvalResult {
        let expr = f.query[f.index].clone();
        let op_ref = match terms.first().map(|t| &t.value) {
            Some(Value::Ref(r)) => r.clone(),
            _ => {
                return Err(Stop::Fatal(Error::internal(
                    "call operator must be a ref",
                    expr.location,
                )))
            }
        };

        let mock = self.mocks.get(&op_ref).cloned();
        if let Some(mock) = &mock {
            if let Value::Ref(mref) = &mock.value {
                if self.compiler.is_function(mref)
                    || self.builtins.get(&ref_operator_name(mref)).is_some()
                {
                    // replaced by another function: rebuild the call and
                    // evaluate it outside the current mock frame
                    let mut mock_call = Vec::with_capacity(terms.len());
                    mock_call.push(Term::reference(mref.clone()));
                    mock_call.extend_from_slice(&terms[1..]);

                    self.mocks.push_isolated();
                    let res = self.eval_call(f, &mock_call, &mut |m| {
                        m.mocks.pop_isolated();
                        let r = iter(m);
                        m.mocks.push_isolated();
                        r
                    });
                    self.mocks.pop_isolated();
                    return res;
                }
            }
        }
        // a remaining mock is a value replacement

        if op_ref.root_is(DATA_ROOT) {
            if let Some(mock) = mock {
                let arity = self.compiler.function_arity(&op_ref).ok_or_else(|| {
                    Stop::Fatal(Error::internal("mocked non-function", expr.location))
                })?;
                return self.eval_call_value(f, arity, terms, &mock, iter);
            }

            let ir = if self.partial {
                self.get_rules(f, &op_ref, None)?
            } else {
                self.get_rules(f, &op_ref, Some(&terms[1..]))?
            };
            let ir = match ir {
                Some(ir) => ir,
                None => return Ok(()),
            };
            let fe = FuncEval {
                frame: f.clone(),
                ir,
                terms: terms.to_vec(),
            };
            return fe.eval(self, iter);
        }

        let name = ref_operator_name(&op_ref);
        let (decl, func) = match self.builtins.get(&name) {
            Some(b) => (b.decl.clone(), b.func),
            None => {
                return Err(Stop::Fatal(Error::unsupported_builtin(
                    &name,
                    expr.location,
                )))
            }
        };

        if let Some(mock) = mock {
            return self.eval_call_value(f, decl.arity, terms, &mock, iter);
        }

        if self.unknown_expr(&expr, f.bid) {
            return self.save_call(f, decl.arity, terms, iter);
        }

        // plug operands; a trailing captured-output term is not an
        // operand of the built-in itself
        let operands: Vec<Term> = terms[1..]
            .iter()
            .map(|t| self.binds.plug(t, f.bid))
            .collect();
        if operands.len() < decl.arity {
            return Err(Stop::Fatal(Error::type_err(
                format!(
                    "{}: expected {} operands, got {}",
                    name,
                    decl.arity,
                    operands.len()
                ),
                expr.location,
            )));
        }
        let end = if operands.len() > decl.arity {
            operands.len() - 1
        } else {
            operands.len()
        };

        let use_ndb = decl.nondeterministic && self.ndb_cache.is_some();
        if use_ndb {
            let cached = self
                .ndb_cache
                .unwrap()
                .lock()
                .expect("ndb cache lock poisoned")
                .get(&name, &operands[..end])
                .cloned();
            if let Some(v) = cached {
                if !decl.has_result {
                    return iter(self);
                }
                if operands.len() == decl.arity {
                    if v == Term::bool(false) {
                        return Ok(());
                    }
                    return iter(self);
                }
                let out = terms[terms.len() - 1].clone();
                return self.biunify(&out, &v, f.bid, f.bid, f, iter);
            }
        }

        let output = {
            let bctx = BuiltinContext {
                location: expr.location,
                query_id: f.query_id,
                parent_id: f.parent_id,
                time: &self.time,
                cancel: self.cancel.as_deref(),
            };
            func(&bctx, &operands[..end])
        };

        match output {
            Err(e) if e.code == crate::errors::ErrorCode::Builtin => {
                // recorded, evaluation continues on other branches
                self.builtin_errors.push(e);
                Ok(())
            }
            Err(e) => Err(Stop::Fatal(e)),
            Ok(None) => Ok(()),
            Ok(Some(output)) => {
                if use_ndb {
                    self.ndb_cache
                        .unwrap()
                        .lock()
                        .expect("ndb cache lock poisoned")
                        .put(&name, operands[..end].to_vec(), output.clone());
                }
                if !decl.has_result {
                    return iter(self);
                }
                if operands.len() == decl.arity {
                    if output == Term::bool(false) {
                        return Ok(());
                    }
                    return iter(self);
                }
                let out = terms[terms.len() - 1].clone();
                self.biunify(&out, &output, f.bid, f.bid, f, iter)
            }
        }
    }

    fn eval_call_value(
        &mut self,
        f: &Frame,
        arity: usize,
        terms: &[Term],
        mock: &Term,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        if terms.len() == arity + 2 {
            let out = terms[terms.len() - 1].clone();
            return self.biunify(&out, mock, f.bid, f.bid, f, iter);
        }
        if terms.len() == arity + 1 {
            if *mock != Term::bool(false) {
                return iter(self);
            }
            return Ok(());
        }
        Err(Stop::Fatal(Error::internal(
            "mocked call arity mismatch",
            f.query[f.index].location,
        )))
    }

    // ──────────────────────────────────────────────
    // Unification
    // ──────────────────────────────────────────────

    pub fn unify(&mut self, a: &Term, b: &Term, f: &Frame, iter: UnifyIter<'_, 'q>) -> EvalResult {
        self.biunify(a, b, f.bid, f.bid, f, iter)
    }

    pub fn biunify(
        &mut self,
        a: &Term,
        b: &Term,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let (a, b1) = self.binds.apply(a, b1);
        let (b, b2) = self.binds.apply(b, b2);
        if self.trace_enabled {
            self.trace_unify(f, &a, &b);
        }
        match &a.value {
            Value::Var(_)
            | Value::Ref(_)
            | Value::ArrayCompr(_)
            | Value::SetCompr(_)
            | Value::ObjectCompr(_) => self.biunify_values(&a, &b, b1, b2, f, iter),
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                match (&a.value, &b.value) {
                    (_, Value::Var(_)) | (_, Value::Ref(_)) => {
                        self.biunify_values(&a, &b, b1, b2, f, iter)
                    }
                    (x, y) if std::mem::discriminant(x) == std::mem::discriminant(y) => {
                        self.biunify_values(&a, &b, b1, b2, f, iter)
                    }
                    _ => Ok(()),
                }
            }
            Value::Array(ea) => match &b.value {
                Value::Var(_) | Value::Ref(_) | Value::ArrayCompr(_) => {
                    self.biunify_values(&a, &b, b1, b2, f, iter)
                }
                Value::Array(eb) => {
                    if ea.len() != eb.len() {
                        return Ok(());
                    }
                    let ea = ea.clone();
                    let eb = eb.clone();
                    self.biunify_terms_rec(&ea, &eb, b1, b2, f, 0, iter)
                }
                _ => Ok(()),
            },
            Value::Object(oa) => match &b.value {
                Value::Var(_) | Value::Ref(_) | Value::ObjectCompr(_) => {
                    self.biunify_values(&a, &b, b1, b2, f, iter)
                }
                Value::Object(ob) => {
                    let oa = oa.clone();
                    let ob = ob.clone();
                    self.biunify_objects(&oa, &ob, b1, b2, f, iter)
                }
                _ => Ok(()),
            },
            Value::Set(_) => self.biunify_values(&a, &b, b1, b2, f, iter),
            Value::Call(_) => Ok(()),
        }
    }

    pub(crate) fn biunify_terms(
        &mut self,
        a: &[Term],
        b: &[Term],
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        if a.len() != b.len() {
            return Ok(());
        }
        self.biunify_terms_rec(a, b, b1, b2, f, 0, iter)
    }

    fn biunify_terms_rec(
        &mut self,
        a: &[Term],
        b: &[Term],
        b1: Bid,
        b2: Bid,
        f: &Frame,
        idx: usize,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        if idx == a.len() {
            return iter(self);
        }
        self.biunify(&a[idx], &b[idx], b1, b2, f, &mut |m| {
            m.biunify_terms_rec(a, b, b1, b2, f, idx + 1, iter)
        })
    }

    fn biunify_objects(
        &mut self,
        a: &Object,
        b: &Object,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        if a.len() != b.len() {
            return Ok(());
        }

        // Unbound variables cannot be unified as keys: plug both sides
        // before pairing values up.
        let a = if non_ground_keys(a) {
            plug_keys(&self.binds, a, b1)
        } else {
            a.clone()
        };
        let b = if non_ground_keys(b) {
            plug_keys(&self.binds, b, b2)
        } else {
            b.clone()
        };

        let keys: Vec<Term> = a.keys().cloned().collect();
        self.biunify_objects_rec(&a, &b, b1, b2, f, &keys, 0, iter)
    }

    #[allow(clippy::too_many_arguments)]
    fn biunify_objects_rec(
        &mut self,
        a: &Object,
        b: &Object,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        keys: &[Term],
        idx: usize,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        if idx == keys.len() {
            return iter(self);
        }
        let key = &keys[idx];
        let v2 = match b.get(key) {
            Some(v) => v.clone(),
            None => return Ok(()),
        };
        let v1 = a.get(key).cloned().expect("key from same object");
        self.biunify(&v1, &v2, b1, b2, f, &mut |m| {
            m.biunify_objects_rec(a, b, b1, b2, f, keys, idx + 1, iter)
        })
    }

    fn biunify_values(
        &mut self,
        a: &Term,
        b: &Term,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        // Refs and comprehensions evaluate here; in partial mode, terms
        // in the save set skip evaluation and the equality is saved.
        let save_a = if self.partial {
            if matches!(a.value, Value::Set(_)) {
                self.save_set.contains_recursive(&self.binds, a, b1)
            } else {
                self.save_set.contains(&self.binds, a, b1)
            }
        } else {
            false
        };
        if !save_a {
            if matches!(a.value, Value::Ref(_)) {
                return self.biunify_ref(a, b, b1, b2, f, iter);
            }
        }

        let save_b = if self.partial {
            if matches!(b.value, Value::Set(_)) {
                self.save_set.contains_recursive(&self.binds, b, b2)
            } else {
                self.save_set.contains(&self.binds, b, b2)
            }
        } else {
            false
        };
        if !save_b {
            if matches!(b.value, Value::Ref(_)) {
                return self.biunify_ref(b, a, b2, b1, f, iter);
            }
        }

        if save_a || save_b {
            return self.save_unify(f, a, b, b1, b2, iter);
        }

        if a.value.is_comprehension() {
            return self.biunify_comprehension(a, b, b1, b2, false, f, iter);
        } else if b.value.is_comprehension() {
            return self.biunify_comprehension(b, a, b2, b1, true, f, iter);
        }

        let var_a = matches!(a.value, Value::Var(_));
        let var_b = matches!(b.value, Value::Var(_));

        if var_a && var_b {
            if b1 == b2 && a == b {
                return iter(self);
            }
            let v = match &a.value {
                Value::Var(v) => v.clone(),
                _ => unreachable!(),
            };
            let undo = self.binds.bind(&v, b.clone(), b2, b1);
            let res = iter(self);
            self.binds.undo(undo);
            return res;
        } else if var_a {
            let v = match &a.value {
                Value::Var(v) => v.clone(),
                _ => unreachable!(),
            };
            let undo = self.binds.bind(&v, b.clone(), b2, b1);
            let res = iter(self);
            self.binds.undo(undo);
            return res;
        } else if var_b {
            let v = match &b.value {
                Value::Var(v) => v.clone(),
                _ => unreachable!(),
            };
            let undo = self.binds.bind(&v, a.clone(), b1, b2);
            let res = iter(self);
            self.binds.undo(undo);
            return res;
        }

        // Sets may contain bound variables: plug both sides and compare
        // as wholes.
        let (a, b) = if matches!(a.value, Value::Set(_)) {
            (self.binds.plug(a, b1), self.binds.plug(b, b2))
        } else {
            (a.clone(), b.clone())
        };

        if a == b {
            return iter(self);
        }
        Ok(())
    }

    fn biunify_ref(
        &mut self,
        a: &Term,
        b: &Term,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let r = match &a.value {
            Value::Ref(r) => r.clone(),
            _ => unreachable!("biunify_ref on non-ref"),
        };

        if r.root_is(DATA_ROOT) {
            let node = self
                .compiler
                .rule_tree()
                .child(&r[0].value)
                .cloned();
            let tw = TreeWalk {
                frame: f.clone(),
                ref_: r.clone(),
                pos: 1,
                plugged: r.clone(),
                bid: b1,
                rterm: b.clone(),
                rbid: b2,
                node,
            };
            return tw.eval(self, iter);
        }

        let (term, term_bid) = if r.root_is(INPUT_ROOT) {
            match &self.input {
                Some(t) => (t.clone(), b1),
                None => return Ok(()),
            }
        } else {
            // synthesized generator refs root at an arbitrary term (an
            // `every` domain); an unbound var head is undefined
            let (t, tb) = self.binds.apply(&r[0], b1);
            if matches!(t.value, Value::Var(_)) {
                return Ok(());
            }
            (t, tb)
        };

        let tw = TermWalk {
            frame: f.clone(),
            ref_: r,
            pos: 1,
            bid: b1,
            term,
            term_bid,
            rterm: b.clone(),
            rbid: b2,
        };
        tw.eval(self, iter)
    }

    // ──────────────────────────────────────────────
    // Comprehensions
    // ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn biunify_comprehension(
        &mut self,
        a: &Term,
        b: &Term,
        b1: Bid,
        b2: Bid,
        swap: bool,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        if self.unknown_term(a, b1) {
            return self.biunify_comprehension_partial(a, b, b1, b2, swap, f, iter);
        }

        if let Some(value) = self.build_comprehension_cache(f, a)? {
            return self.biunify(&value, b, b1, b2, f, iter);
        }
        self.instr.incr(COUNTER_COMPREHENSION_CACHE_MISS);

        match &a.value {
            Value::ArrayCompr(c) => {
                let c = (**c).clone();
                self.biunify_comprehension_array(&c, b, b1, b2, f, iter)
            }
            Value::SetCompr(c) => {
                let c = (**c).clone();
                self.biunify_comprehension_set(&c, b, b1, b2, f, iter)
            }
            Value::ObjectCompr(c) => {
                let c = (**c).clone();
                self.biunify_comprehension_object(&c, b, b1, b2, f, iter)
            }
            _ => Err(Stop::Fatal(Error::internal(
                "illegal comprehension type",
                a.location,
            ))),
        }
    }

    /// Materialise the comprehension's full table once, keyed by its
    /// index keys, and return the entry for the current key values.
    fn build_comprehension_cache(
        &mut self,
        f: &Frame,
        a: &Term,
    ) -> Result<Option<Term>, Stop> {
        let index = match self.compiler.comprehension_index(&a.location) {
            Some(idx) => idx.clone(),
            None => {
                self.instr.incr(COUNTER_COMPREHENSION_CACHE_SKIP);
                return Ok(None);
            }
        };

        if self.comp_cache.get(&a.location).is_none() {
            let table = match &a.value {
                Value::ArrayCompr(c) => {
                    let c = (**c).clone();
                    self.build_comprehension_cache_array(f, &c, &index.keys)?
                }
                Value::SetCompr(c) => {
                    let c = (**c).clone();
                    self.build_comprehension_cache_set(f, &c, &index.keys)?
                }
                Value::ObjectCompr(c) => {
                    let c = (**c).clone();
                    self.build_comprehension_cache_object(f, &c, &index.keys)?
                }
                _ => {
                    return Err(Stop::Fatal(Error::internal(
                        "illegal comprehension type",
                        a.location,
                    )))
                }
            };
            self.comp_cache.set(a.location, table);
            self.instr.incr(COUNTER_COMPREHENSION_CACHE_BUILD);
        } else {
            self.instr.incr(COUNTER_COMPREHENSION_CACHE_HIT);
        }

        let values: Vec<Term> = index
            .keys
            .iter()
            .map(|k| self.binds.plug(k, f.bid))
            .collect();
        Ok(self
            .comp_cache
            .get(&a.location)
            .and_then(|t| t.get(&values))
            .cloned())
    }

    fn build_comprehension_cache_array(
        &mut self,
        f: &Frame,
        c: &ArrayComprehension,
        keys: &[Term],
    ) -> Result<CompTable, Stop> {
        let cf = self.child_frame(f, c.body.clone(), false);
        let mut table = CompTable::default();
        let term = c.term.clone();
        self.run_frame(&cf, &mut |m, cfr| {
            let values: Vec<Term> = keys.iter().map(|k| m.binds.plug(k, cfr.bid)).collect();
            let head = m.binds.plug(&term, cfr.bid);
            match table.get_mut(&values) {
                Some(entry) => {
                    if let Value::Array(elems) = &mut entry.value {
                        elems.push(head);
                    }
                }
                None => table.put(values, Term::array(vec![head])),
            }
            Ok(())
        })?;
        Ok(table)
    }

    fn build_comprehension_cache_set(
        &mut self,
        f: &Frame,
        c: &SetComprehension,
        keys: &[Term],
    ) -> Result<CompTable, Stop> {
        let cf = self.child_frame(f, c.body.clone(), false);
        let mut table = CompTable::default();
        let term = c.term.clone();
        self.run_frame(&cf, &mut |m, cfr| {
            let values: Vec<Term> = keys.iter().map(|k| m.binds.plug(k, cfr.bid)).collect();
            let head = m.binds.plug(&term, cfr.bid);
            match table.get_mut(&values) {
                Some(entry) => {
                    if let Value::Set(set) = &mut entry.value {
                        set.insert(head);
                    }
                }
                None => table.put(values, Term::set(vec![head])),
            }
            Ok(())
        })?;
        Ok(table)
    }

    fn build_comprehension_cache_object(
        &mut self,
        f: &Frame,
        c: &ObjectComprehension,
        keys: &[Term],
    ) -> Result<CompTable, Stop> {
        let cf = self.child_frame(f, c.body.clone(), false);
        let mut table = CompTable::default();
        let key = c.key.clone();
        let value = c.value.clone();
        let key_loc = c.key.location;
        self.run_frame(&cf, &mut |m, cfr| {
            let values: Vec<Term> = keys.iter().map(|k| m.binds.plug(k, cfr.bid)).collect();
            let head_key = m.binds.plug(&key, cfr.bid);
            let head_value = m.binds.plug(&value, cfr.bid);
            match table.get_mut(&values) {
                Some(entry) => {
                    if let Value::Object(obj) = &mut entry.value {
                        if let Some(existing) = obj.get(&head_key) {
                            if *existing != head_value {
                                return Err(Stop::Fatal(Error::object_key_conflict(key_loc)));
                            }
                        }
                        obj.insert(head_key, head_value);
                    }
                }
                None => table.put(values, Term::object(vec![(head_key, head_value)])),
            }
            Ok(())
        })?;
        Ok(table)
    }

    fn biunify_comprehension_array(
        &mut self,
        c: &ArrayComprehension,
        b: &Term,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let cf = self.closure_frame(f, c.body.clone());
        let mut result: Vec<Term> = Vec::new();
        let term = c.term.clone();
        self.run_frame(&cf, &mut |m, cfr| {
            result.push(m.binds.plug(&term, cfr.bid));
            Ok(())
        })?;
        self.biunify(&Term::array(result), b, b1, b2, f, iter)
    }

    fn biunify_comprehension_set(
        &mut self,
        c: &SetComprehension,
        b: &Term,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let cf = self.closure_frame(f, c.body.clone());
        let mut result = Set::new();
        let term = c.term.clone();
        self.run_frame(&cf, &mut |m, cfr| {
            result.insert(m.binds.plug(&term, cfr.bid));
            Ok(())
        })?;
        self.biunify(&Term::new(Value::Set(result)), b, b1, b2, f, iter)
    }

    fn biunify_comprehension_object(
        &mut self,
        c: &ObjectComprehension,
        b: &Term,
        b1: Bid,
        b2: Bid,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let cf = self.closure_frame(f, c.body.clone());
        let mut result = Object::new();
        let key = c.key.clone();
        let value = c.value.clone();
        let key_loc = c.key.location;
        self.run_frame(&cf, &mut |m, cfr| {
            let k = m.binds.plug(&key, cfr.bid);
            let v = m.binds.plug(&value, cfr.bid);
            if let Some(existing) = result.get(&k) {
                if *existing != v {
                    return Err(Stop::Fatal(Error::object_key_conflict(key_loc)));
                }
            }
            result.insert(k, v);
            Ok(())
        })?;
        self.biunify(&Term::new(Value::Object(result)), b, b1, b2, f, iter)
    }

    /// Under partial evaluation comprehensions are not materialised: the
    /// term is copied, current bindings are injected as equalities on its
    /// body, and the equality is saved.
    #[allow(clippy::too_many_arguments)]
    fn biunify_comprehension_partial(
        &mut self,
        a: &Term,
        b: &Term,
        b1: Bid,
        b2: Bid,
        swap: bool,
        f: &Frame,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let cpy_a = self.amend_comprehension(a, b1)?;

        let b = if b.value.is_comprehension() {
            self.amend_comprehension(b, b2)?
        } else {
            b.clone()
        };

        if !swap {
            self.save_unify(f, &cpy_a, &b, b1, b2, iter)
        } else {
            self.save_unify(f, &b, &cpy_a, b2, b1, iter)
        }
    }

    /// Capture bindings used by the comprehension as equalities appended
    /// to its body, then namespace the whole term.
    fn amend_comprehension(&mut self, a: &Term, b1: Bid) -> Result<Term, Stop> {
        let mut cpy = a.clone();
        let vars = arbiter_ast::term_vars(a, VarVisitorParams::default());

        let entries = self.binds.iter_frame(b1, self.caller_bid);
        let extra: Vec<Expr> = entries
            .into_iter()
            .filter(|(k, _)| match &k.value {
                Value::Var(v) => vars.contains(v),
                _ => false,
            })
            .map(|(k, v)| Expr::equality(k, v))
            .collect();

        match &mut cpy.value {
            Value::ArrayCompr(c) => c.body.0.extend(extra),
            Value::SetCompr(c) => c.body.0.extend(extra),
            Value::ObjectCompr(c) => c.body.0.extend(extra),
            other => {
                return Err(Stop::Fatal(Error::internal(
                    format!("illegal comprehension {}", other.type_name()),
                    a.location,
                )))
            }
        }

        Ok(self.binds.namespace_term(&cpy, b1, self.caller_bid))
    }

    // ──────────────────────────────────────────────
    // Saving
    // ──────────────────────────────────────────────

    /// Carry the current expression's `with` clauses (minus function and
    /// built-in mocks) and location onto a saved expression.
    fn update_from_query(&self, f: &Frame, expr: &mut Expr) {
        let current = &f.query[f.index];
        expr.with = current
            .with
            .iter()
            .filter(|w| !(is_other_ref(&w.target) || self.is_function_target(&w.target)))
            .cloned()
            .collect();
        expr.location = current.location;
    }

    pub(crate) fn save_expr(
        &mut self,
        f: &Frame,
        expr: &Expr,
        bid: Bid,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let mut expr = expr.clone();
        self.update_from_query(f, &mut expr);
        self.save_stack.push(expr.clone(), Some(bid), Some(bid));
        self.trace_save(f, &expr);
        let res = iter(self);
        self.save_stack.pop();
        res
    }

    /// Save a pre-plugged expression; materialisation leaves it alone.
    fn save_expr_plugged(
        &mut self,
        f: &Frame,
        expr: Expr,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let mut expr = expr;
        self.update_from_query(f, &mut expr);
        self.save_stack.push(expr.clone(), None, None);
        self.trace_save(f, &expr);
        let res = iter(self);
        self.save_stack.pop();
        res
    }

    fn save_expr_mark_unknowns(
        &mut self,
        f: &Frame,
        expr: &Expr,
        bid: Bid,
        iter: EvalIter<'_, 'q>,
    ) -> EvalResult {
        let mut expr = expr.clone();
        self.update_from_query(f, &mut expr);

        let decl_args_len = self.get_decl_args_len(f, &expr)?;
        let mut pairs: Vec<(Term, Bid)> = Vec::new();
        get_save_pairs_from_expr(&self.binds, decl_args_len, &expr, bid, &mut pairs);
        let pops = pairs.len();
        for (t, b) in pairs {
            self.save_set.push(vec![t], b);
        }

        self.save_stack.push(expr.clone(), Some(bid), Some(bid));
        self.trace_save(f, &expr);
        let res = iter(self, f);
        self.save_stack.pop();
        for _ in 0..pops {
            self.save_set.pop();
        }
        res
    }

    pub(crate) fn save_unify(
        &mut self,
        f: &Frame,
        a: &Term,
        b: &Term,
        b1: Bid,
        b2: Bid,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let mut expr = Expr::equality(a.clone(), b.clone());
        self.update_from_query(f, &mut expr);

        let mut pairs: Vec<(Term, Bid)> = Vec::new();
        get_save_pairs_from_term(&self.binds, a, b1, &mut pairs);
        get_save_pairs_from_term(&self.binds, b, b2, &mut pairs);
        let pops = pairs.len();
        for (t, bb) in pairs {
            self.save_set.push(vec![t], bb);
        }

        self.save_stack.push(expr.clone(), Some(b1), Some(b2));
        self.trace_save(f, &expr);
        let res = iter(self);

        self.save_stack.pop();
        for _ in 0..pops {
            self.save_set.pop();
        }
        res
    }

    pub(crate) fn save_call(
        &mut self,
        f: &Frame,
        decl_args_len: usize,
        terms: &[Term],
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let mut expr = Expr::call(terms.to_vec());
        self.update_from_query(f, &mut expr);

        // a captured output term is an unknown for the rest of the query
        let mut pairs: Vec<(Term, Bid)> = Vec::new();
        if decl_args_len == terms.len().saturating_sub(2) {
            get_save_pairs_from_term(&self.binds, &terms[terms.len() - 1], f.bid, &mut pairs);
        }
        let pops = pairs.len();
        for (t, b) in pairs {
            self.save_set.push(vec![t], b);
        }

        self.save_stack.push(expr.clone(), Some(f.bid), None);
        self.trace_save(f, &expr);
        let res = iter(self);

        self.save_stack.pop();
        for _ in 0..pops {
            self.save_set.pop();
        }
        res
    }

    fn save_inlined_negated_exprs(
        &mut self,
        f: &Frame,
        exprs: &[Expr],
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let current = &f.query[f.index];
        let withs: Vec<With> = current
            .with
            .iter()
            .filter(|w| !(is_other_ref(&w.target) || self.is_function_target(&w.target)))
            .map(|w| With {
                target: w.target.clone(),
                value: self
                    .binds
                    .plug_namespaced(&w.value, f.bid, self.caller_bid),
                location: w.location,
            })
            .collect();

        for e in exprs {
            let mut e2 = e.clone();
            e2.with = withs.clone();
            self.save_stack.push(e2.clone(), None, None);
            self.trace_save(f, &e2);
        }
        let res = iter(self);
        for _ in exprs {
            self.save_stack.pop();
        }
        res
    }

    /// Materialise a saved query by plugging each side through its
    /// recorded frame, namespaced against the caller frame.
    pub(crate) fn plug_saved(&self, saved: &[SavedExpr], caller: Bid) -> Body {
        let mut out = Vec::with_capacity(saved.len());
        for se in saved {
            let b1 = match se.b1 {
                Some(b) => b,
                None => {
                    out.push(se.expr.clone());
                    continue;
                }
            };
            let mut cpy = se.expr.clone();
            cpy.terms = match &se.expr.terms {
                ExprTerms::Term(t) => {
                    ExprTerms::Term(self.binds.plug_namespaced(t, b1, caller))
                }
                ExprTerms::Call(terms) => {
                    let mut new_terms = Vec::with_capacity(terms.len());
                    for (i, t) in terms.iter().enumerate() {
                        if i == 0 {
                            new_terms.push(t.clone());
                        } else if i == 2 && se.expr.is_equality() {
                            let b2 = se.b2.unwrap_or(b1);
                            new_terms.push(self.binds.plug_namespaced(t, b2, caller));
                        } else {
                            new_terms.push(self.binds.plug_namespaced(t, b1, caller));
                        }
                    }
                    ExprTerms::Call(new_terms)
                }
                ExprTerms::Every(e) => ExprTerms::Every(e.clone()),
            };
            cpy.with = se
                .expr
                .with
                .iter()
                .map(|w| With {
                    target: w.target.clone(),
                    value: self.binds.plug_namespaced(&w.value, b1, caller),
                    location: w.location,
                })
                .collect();
            out.push(cpy);
        }
        Body::new(out)
    }

    // ──────────────────────────────────────────────
    // Rule index access
    // ──────────────────────────────────────────────

    pub(crate) fn get_rules(
        &mut self,
        f: &Frame,
        reference: &Ref,
        args: Option<&[Term]>,
    ) -> Result<Option<IndexResult>, Stop> {
        use arbiter_ast::RuleIndex as _;

        let index = match self.compiler.rule_index(reference) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        self.index_args = args.map(|a| (a.to_vec(), f.bid));
        let mut result = if self.indexing && args.is_some() {
            index.lookup(self)
        } else {
            index.all_rules(self)
        };
        self.index_args = None;

        result.early_exit = result.early_exit && self.early_exit_enabled;

        if self.trace_enabled {
            let mut msg = format!("(matched {} rule", result.rules.len());
            if result.rules.len() != 1 {
                msg.push('s');
            }
            if result.early_exit {
                msg.push_str(", early exit");
            }
            msg.push(')');
            let expr = f.query[f.index].clone();
            self.trace_event(
                Op::Index,
                f,
                Node::Expr(expr),
                msg,
                Some(reference.clone()),
            );
        }

        Ok(Some(result))
    }

    fn get_decl_args_len(&mut self, f: &Frame, expr: &Expr) -> Result<Option<usize>, Stop> {
        if !expr.is_call() || expr.is_equality() {
            return Ok(None);
        }
        let operator = match expr.operator() {
            Some(r) => r.clone(),
            None => return Ok(None),
        };
        if let Some(b) = self.builtins.get(&ref_operator_name(&operator)) {
            return Ok(Some(b.decl.arity));
        }
        match self.get_rules(f, &operator, None)? {
            Some(ir) if !ir.is_empty() => Ok(Some(ir.arg_count())),
            _ => Ok(None),
        }
    }

    pub(crate) fn namespace_ref(&self, reference: &Ref) -> Ref {
        if self.skip_save_namespace {
            reference.clone()
        } else {
            reference.insert(1, Term::string(self.save_namespace.clone()))
        }
    }
}

impl IndexResolver for Machine<'_> {
    fn resolve(&mut self, reference: &Ref) -> Option<Value> {
        Machine::resolve(self, reference).ok().flatten()
    }
}

// ──────────────────────────────────────────────
// Helper predicates and merging
// ──────────────────────────────────────────────

pub(crate) fn is_input_ref(term: &Term) -> bool {
    matches!(&term.value, Value::Ref(r) if r.root_is(INPUT_ROOT))
}

pub(crate) fn is_data_ref(term: &Term) -> bool {
    matches!(&term.value, Value::Ref(r) if r.root_is(DATA_ROOT))
}

pub(crate) fn is_other_ref(term: &Term) -> bool {
    matches!(&term.value, Value::Ref(r) if !r.root_is(DATA_ROOT) && !r.root_is(INPUT_ROOT))
}

/// The registry name of an operator reference: leading var, then
/// dot-joined string segments (e.g. `time.now_ns`).
pub(crate) fn ref_operator_name(r: &Ref) -> String {
    let mut out = String::new();
    for (i, t) in r.iter().enumerate() {
        match &t.value {
            Value::Var(v) if i == 0 => out.push_str(v),
            Value::String(s) => {
                out.push('.');
                out.push_str(s);
            }
            other => {
                out.push('.');
                out.push_str(&other.to_string());
            }
        }
    }
    out
}

fn non_ground_keys(obj: &Object) -> bool {
    obj.keys().any(|k| !k.value.is_ground())
}

fn plug_keys(binds: &Bindings, obj: &Object, bid: Bid) -> Object {
    obj.iter()
        .map(|(k, v)| (binds.plug(k, bid), v.clone()))
        .collect()
}

/// Merge two values; objects merge recursively with `a` winning on
/// non-object overlap.
pub(crate) fn merge(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Object(oa), Value::Object(ob)) => merge_objects(oa, ob).map(Value::Object),
        _ => Some(a.clone()),
    }
}

/// New object of the non-overlapping keys of both sides; overlapping
/// object values merge recursively, anything else resolves to `a`.
pub(crate) fn merge_objects(a: &Object, b: &Object) -> Option<Object> {
    let mut result = Object::new();
    for (k, v) in a {
        match b.get(k) {
            None => {
                result.insert(k.clone(), v.clone());
            }
            Some(v2) => match (&v.value, &v2.value) {
                (Value::Object(o1), Value::Object(o2)) => {
                    let merged = merge_objects(o1, o2)?;
                    result.insert(k.clone(), Term::new(Value::Object(merged)));
                }
                _ => {
                    result.insert(k.clone(), v.clone());
                }
            },
        }
    }
    for (k, v) in b {
        if !a.contains_key(k) {
            result.insert(k.clone(), v.clone());
        }
    }
    Some(result)
}

/// Combine `with` replacement pairs into one replacement document.
/// Patches conflict when overlapping paths disagree; merging over the
/// current document never conflicts (the replacement side wins).
pub(crate) fn merge_term_with_values(
    current: Option<&Term>,
    pairs: &[(Ref, Term)],
) -> Result<Option<Term>, String> {
    if pairs.is_empty() {
        return Ok(None);
    }

    let mut patch: Option<Value> = None;
    for (target, value) in pairs {
        let wrapped = wrap_in_objects_ref(value.clone(), &target[1..]);
        patch = Some(match patch {
            None => wrapped.value,
            Some(existing) => merge_patches(&existing, &wrapped.value)?,
        });
    }
    let patch = patch.expect("pairs is non-empty");

    let merged = match current {
        Some(cur) => merge(&patch, &cur.value).expect("replacement-side merge cannot fail"),
        None => patch,
    };
    Ok(Some(Term::new(merged)))
}

fn merge_patches(a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Object(oa), Value::Object(ob)) => {
            let mut result = oa.clone();
            for (k, v) in ob {
                match result.get(k) {
                    None => {
                        result.insert(k.clone(), v.clone());
                    }
                    Some(existing) => {
                        let merged = merge_patches(&existing.value, &v.value)?;
                        result.insert(k.clone(), Term::new(merged));
                    }
                }
            }
            Ok(Value::Object(result))
        }
        _ => {
            if a == b {
                Ok(a.clone())
            } else {
                Err("conflicting replacement values".to_string())
            }
        }
    }
}

/// Nest a leaf under the keys of `path`, leaf-to-root so ground-ness is
/// preserved.
pub(crate) fn wrap_in_objects_ref(leaf: Term, path: &[Term]) -> Term {
    if path.is_empty() {
        return leaf;
    }
    let key = path[0].clone();
    let val = wrap_in_objects_ref(leaf, &path[1..]);
    Term::object(vec![(key, val)])
}

fn get_save_pairs_from_expr(
    binds: &Bindings,
    decl_args_len: Option<usize>,
    expr: &Expr,
    bid: Bid,
    out: &mut Vec<(Term, Bid)>,
) {
    match &expr.terms {
        ExprTerms::Term(t) => get_save_pairs_from_term(binds, t, bid, out),
        ExprTerms::Call(terms) => {
            if expr.is_equality() {
                get_save_pairs_from_term(binds, &terms[1], bid, out);
                get_save_pairs_from_term(binds, &terms[2], bid, out);
            } else if let Some(n) = decl_args_len {
                if n == terms.len().saturating_sub(2) {
                    get_save_pairs_from_term(binds, &terms[terms.len() - 1], bid, out);
                }
            }
        }
        ExprTerms::Every(_) => {}
    }
}

fn get_save_pairs_from_term(binds: &Bindings, t: &Term, bid: Bid, out: &mut Vec<(Term, Bid)>) {
    if matches!(t.value, Value::Var(_)) {
        out.push((t.clone(), bid));
        return;
    }
    let vars = arbiter_ast::term_vars(
        t,
        VarVisitorParams {
            skip_closures: true,
            skip_ref_head: true,
            ..Default::default()
        },
    );
    for v in vars {
        let (y, next) = binds.apply(&Term::var(v), bid);
        get_save_pairs_from_term(binds, &y, next, out);
    }
}

/// Is the value free of variables, references, and closures?
pub(crate) fn is_constant(v: &Value) -> bool {
    let mut constant = true;
    walk_terms(&Term::new(v.clone()), &mut |t| match &t.value {
        Value::Var(_)
        | Value::Ref(_)
        | Value::Call(_)
        | Value::ArrayCompr(_)
        | Value::SetCompr(_)
        | Value::ObjectCompr(_) => constant = false,
        _ => {}
    });
    constant
}

fn is_reserved_var(v: &str) -> bool {
    v == DATA_ROOT || v == INPUT_ROOT
}

/// Decide whether the residual queries of a negation can be inlined as
/// a complemented cartesian product.
pub(crate) fn can_inline_negation(safe: &BTreeSet<Var>, queries: &[Body]) -> bool {
    let mut size: usize = 1;

    for q in queries {
        size = size.saturating_mul(q.len());
        for expr in q.iter() {
            // Nested refs or calls change meaning under complement: the
            // complement of `not f(input.x)` is not `f(input.x)`.
            if contains_nested_ref_or_call(expr) {
                return false;
            }
            if !expr.negated {
                // positive expressions with unsafe vars become unsafe
                // when negated
                let vars = expr_vars(
                    expr,
                    VarVisitorParams {
                        skip_ref_call_head: true,
                        skip_closures: true,
                        ..Default::default()
                    },
                );
                if vars
                    .iter()
                    .any(|v| !safe.contains(v) && !is_reserved_var(v))
                {
                    return false;
                }
            }
        }
    }

    // bounded product size; keeps the result from blowing up
    size <= 16
}

fn contains_nested_ref_or_call(expr: &Expr) -> bool {
    match &expr.terms {
        ExprTerms::Call(terms) => {
            if expr.is_equality() {
                terms[1..].iter().any(contains_nested_in_term)
            } else {
                terms[1..].iter().any(|t| has_ref_or_call(t, true))
            }
        }
        ExprTerms::Term(t) => contains_nested_in_term(t),
        ExprTerms::Every(_) => true,
    }
}

fn contains_nested_in_term(term: &Term) -> bool {
    match &term.value {
        Value::Ref(r) => r[1..].iter().any(|t| has_ref_or_call(t, true)),
        _ => has_ref_or_call(term, false),
    }
}

fn has_ref_or_call(term: &Term, include_self: bool) -> bool {
    let mut found = false;
    let mut first = true;
    walk_terms(term, &mut |t| {
        if first {
            first = false;
            if !include_self {
                return;
            }
        }
        if matches!(t.value, Value::Ref(_) | Value::Call(_)) {
            found = true;
        }
    });
    if include_self && matches!(term.value, Value::Ref(_) | Value::Call(_)) {
        return true;
    }
    found
}

// ──────────────────────────────────────────────
// Tree walk (data-rooted references)
// ──────────────────────────────────────────────

#[derive(Clone)]
struct TreeWalk {
    frame: Frame,
    ref_: Ref,
    pos: usize,
    plugged: Ref,
    bid: Bid,
    rterm: Term,
    rbid: Bid,
    node: Option<Arc<TreeNode>>,
}

impl TreeWalk {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        if self.pos == self.ref_.len() {
            return self.finish(m, iter);
        }
        let plugged = m.binds.plug(&self.ref_[self.pos], self.bid);
        if plugged.is_ground() {
            return self.next(m, iter, plugged);
        }
        self.enumerate(m, iter)
    }

    fn finish<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        // Refs into virtual docs partial evaluation cannot handle, or
        // base docs with inlining disabled, must be saved.
        if m.partial && m.unknown_ref(&self.plugged, self.bid) {
            return m.save_unify(
                &self.frame,
                &Term::reference(self.plugged.clone()),
                &self.rterm,
                self.bid,
                self.rbid,
                iter,
            );
        }

        let v = match self.extent(m)? {
            Some(v) => v,
            None => return Ok(()),
        };
        m.biunify(&self.rterm, &v, self.rbid, self.bid, &self.frame, iter)
    }

    fn next<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>, plugged: Term) -> EvalResult {
        let mut cpy = self.clone();
        cpy.plugged.0[self.pos] = plugged.clone();
        cpy.pos += 1;

        if !m.targets.prefixed(&cpy.plugged.prefix(cpy.pos)) {
            if let Some(node) = &self.node {
                if let Some(child) = node.child(&plugged.value) {
                    if !child.values.is_empty() {
                        let mut ve_plugged = self.plugged.clone();
                        ve_plugged.0[self.pos] = plugged;
                        let ve = VirtualEval {
                            frame: self.frame.clone(),
                            ref_: self.ref_.clone(),
                            plugged: ve_plugged,
                            pos: self.pos,
                            bid: self.bid,
                            rterm: self.rterm.clone(),
                            rbid: self.rbid,
                        };
                        return ve.eval(m, iter);
                    }
                    cpy.node = Some(child.clone());
                    return cpy.eval(m, iter);
                }
            }
        }
        cpy.node = None;
        cpy.eval(m, iter)
    }

    fn enumerate<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        if m.inlining.disabled(&self.plugged.prefix(self.pos), true) {
            return m.save_unify(
                &self.frame,
                &Term::reference(self.plugged.clone()),
                &self.rterm,
                self.bid,
                self.rbid,
                iter,
            );
        }

        let doc = m
            .resolve(&self.plugged.prefix(self.pos))
            .map_err(Stop::Fatal)?;

        let mut deferred = false;
        let mut handle = |r: EvalResult| -> EvalResult {
            match r {
                Err(Stop::DeferredEarlyExit) => {
                    deferred = true;
                    Ok(())
                }
                other => other,
            }
        };

        if let Some(doc) = doc {
            match doc {
                Value::Array(elems) => {
                    for i in 0..elems.len() {
                        let k = Term::int(i as i64);
                        let r = m.biunify(
                            &k,
                            &self.ref_[self.pos],
                            self.bid,
                            self.bid,
                            &self.frame,
                            &mut |m| self.next(m, iter, k.clone()),
                        );
                        handle(r)?;
                    }
                }
                Value::Object(obj) => {
                    for k in obj.keys() {
                        let r = m.biunify(
                            k,
                            &self.ref_[self.pos],
                            self.bid,
                            self.bid,
                            &self.frame,
                            &mut |m| self.next(m, iter, k.clone()),
                        );
                        handle(r)?;
                    }
                }
                Value::Set(set) => {
                    for elem in &set {
                        let r = m.biunify(
                            elem,
                            &self.ref_[self.pos],
                            self.bid,
                            self.bid,
                            &self.frame,
                            &mut |m| self.next(m, iter, elem.clone()),
                        );
                        handle(r)?;
                    }
                }
                _ => {}
            }
        }

        if deferred {
            return Err(Stop::DeferredEarlyExit);
        }

        let node = match &self.node {
            Some(n) => n.clone(),
            None => return Ok(()),
        };
        for key in node.sorted_keys() {
            let key_term = Term::new(key.clone());
            m.biunify(
                &key_term,
                &self.ref_[self.pos],
                self.bid,
                self.bid,
                &self.frame,
                &mut |m| self.next(m, iter, key_term.clone()),
            )?;
        }
        Ok(())
    }

    /// The merged extent of the base document and all virtual leaves at
    /// the (fully plugged) reference.
    fn extent<'q>(&self, m: &mut Machine<'q>) -> Result<Option<Term>, Stop> {
        let base = m.resolve(&self.plugged).map_err(Stop::Fatal)?;
        let mut path = self.plugged.clone();
        let virtual_ = match &self.node {
            Some(node) => self.leaves(m, &mut path, node)?,
            None => None,
        };

        match (base, virtual_) {
            (None, None) => Ok(None),
            (Some(b), None) => Ok(Some(Term::new(b))),
            (None, Some(v)) => Ok(Some(Term::new(Value::Object(v)))),
            (Some(b), Some(v)) => {
                let merged = merge(&b, &Value::Object(v)).ok_or_else(|| {
                    Stop::Fatal(Error::merge_conflict(self.plugged[0].location))
                })?;
                Ok(Some(Term::new(merged)))
            }
        }
    }

    /// Build the virtual extent by recursing into all branches of the
    /// rule tree, skipping hidden subtrees.
    fn leaves<'q>(
        &self,
        m: &mut Machine<'q>,
        path: &mut Ref,
        node: &Arc<TreeNode>,
    ) -> Result<Option<Object>, Stop> {
        let mut result = Object::new();

        for (key, child) in &node.children {
            if child.hide {
                continue;
            }
            path.0.push(Term::new(key.clone()));

            let save: Option<Value> = if !child.values.is_empty() {
                let rterm = m.generate_var("leaf");
                let path_term = Term::reference(path.clone());
                let mut captured: Option<Value> = None;
                let rt = rterm.clone();
                m.biunify(
                    &path_term,
                    &rterm,
                    self.frame.bid,
                    self.frame.bid,
                    &self.frame,
                    &mut |m| {
                        captured = Some(m.binds.plug(&rt, self.frame.bid).value);
                        Ok(())
                    },
                )?;
                captured
            } else {
                self.leaves(m, path, child)?.map(Value::Object)
            };

            if let Some(v) = save {
                let key_term = path.last().expect("path non-empty").clone();
                let mut single = Object::new();
                single.insert(key_term, Term::new(v));
                if let Some(merged) = merge_objects(&result, &single) {
                    result = merged;
                }
            }

            path.0.pop();
        }

        Ok(Some(result))
    }
}

// ──────────────────────────────────────────────
// Virtual document dispatch
// ──────────────────────────────────────────────

#[derive(Clone)]
struct VirtualEval {
    frame: Frame,
    ref_: Ref,
    plugged: Ref,
    pos: usize,
    bid: Bid,
    rterm: Term,
    rbid: Bid,
}

impl VirtualEval {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let ir = match m.get_rules(&self.frame, &self.plugged.prefix(self.pos + 1), None)? {
            Some(ir) => ir,
            None => return Ok(()),
        };

        // Ordered rules are not inlined under partial evaluation.
        let has_else = ir.else_chains.iter().any(|c| !c.is_empty());
        if has_else && m.unknown_ref(&self.ref_, self.bid) {
            return m.save_unify(
                &self.frame,
                &Term::reference(self.ref_.clone()),
                &self.rterm,
                self.bid,
                self.rbid,
                iter,
            );
        }

        match ir.kind {
            RuleHeadKind::MultiValue => {
                let empty = if ir.only_ground_refs {
                    Term::set(vec![])
                } else {
                    Term::object(vec![])
                };
                let pe = PartialDocEval {
                    frame: self.frame.clone(),
                    ir,
                    ref_: self.ref_.clone(),
                    plugged: self.plugged.clone(),
                    pos: self.pos,
                    bid: self.bid,
                    rterm: self.rterm.clone(),
                    rbid: self.rbid,
                    empty,
                };
                pe.eval(m, iter)
            }
            RuleHeadKind::SingleValue => {
                if ir.only_ground_refs {
                    let ce = CompleteDocEval {
                        frame: self.frame.clone(),
                        ir,
                        ref_: self.ref_.clone(),
                        plugged: self.plugged.clone(),
                        pos: self.pos,
                        bid: self.bid,
                        rterm: self.rterm.clone(),
                        rbid: self.rbid,
                    };
                    ce.eval(m, iter)
                } else {
                    let pe = PartialDocEval {
                        frame: self.frame.clone(),
                        ir,
                        ref_: self.ref_.clone(),
                        plugged: self.plugged.clone(),
                        pos: self.pos,
                        bid: self.bid,
                        rterm: self.rterm.clone(),
                        rbid: self.rbid,
                        empty: Term::object(vec![]),
                    };
                    pe.eval(m, iter)
                }
            }
        }
    }
}

// ──────────────────────────────────────────────
// Complete (single-value, ground-ref) rules
// ──────────────────────────────────────────────

#[derive(Clone)]
struct CompleteDocEval {
    frame: Frame,
    ir: IndexResult,
    ref_: Ref,
    plugged: Ref,
    pos: usize,
    bid: Bid,
    rterm: Term,
    rbid: Bid,
}

impl CompleteDocEval {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        if self.ir.is_empty() {
            return Ok(());
        }

        // full-extent walks skip functions
        let is_func = self
            .ir
            .rules
            .first()
            .or(self.ir.default_rule.as_ref())
            .map(|r| r.is_function())
            .unwrap_or(false);
        if is_func {
            return Ok(());
        }

        if !m.unknown_ref(&self.ref_, self.bid) {
            return self.eval_value(m, iter, self.ir.early_exit);
        }

        let mut generate_support = false;
        if let Some(def) = &self.ir.default_rule {
            let default_is_false = def.head.value.as_ref() == Some(&Term::bool(false));
            let rterm_disabled = match &self.rterm.value {
                Value::Ref(r) => m.inlining.disabled(r, false),
                _ => false,
            };
            if !(default_is_false && rterm_disabled) {
                // the default value may be required unless the other
                // term is a constant that differs from it
                let plugged_rterm = m.binds.plug(&self.rterm, self.rbid);
                generate_support = !is_constant(&plugged_rterm.value)
                    || def.head.value.as_ref() == Some(&plugged_rterm);
            }
        }

        if generate_support
            || m.inlining.shallow
            || m.inlining.disabled(&self.plugged.prefix(self.pos + 1), false)
        {
            return self.partial_eval_support(m, iter);
        }
        self.partial_eval(m, iter)
    }

    fn eval_value<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        find_one: bool,
    ) -> EvalResult {
        let key = VcKey::from_terms(&self.plugged[..self.pos + 1]);
        match m.virtual_cache.get(&key) {
            Some(None) => {
                m.instr.incr(COUNTER_VIRTUAL_CACHE_HIT);
                return Ok(());
            }
            Some(Some(cached)) => {
                m.instr.incr(COUNTER_VIRTUAL_CACHE_HIT);
                return self.eval_term(m, iter, &cached, self.bid);
            }
            None => {}
        }

        m.instr.incr(COUNTER_VIRTUAL_CACHE_MISS);

        let res = (|| -> EvalResult {
            let mut prev: Option<Term> = None;
            let mut deferred = false;

            let rules = self.ir.rules.clone();
            for (i, rule) in rules.iter().enumerate() {
                let (mut next, r) = self.eval_value_rule(m, iter, rule, prev.clone(), find_one);
                match r {
                    Err(Stop::DeferredEarlyExit) => deferred = true,
                    Err(other) => return Err(other),
                    Ok(()) => {}
                }
                if next.is_none() {
                    for erule in self.ir.else_chain(i) {
                        let (n, r) = self.eval_value_rule(m, iter, erule, prev.clone(), find_one);
                        match r {
                            Err(Stop::DeferredEarlyExit) => deferred = true,
                            Err(other) => return Err(other),
                            Ok(()) => {}
                        }
                        next = n;
                        if next.is_some() {
                            break;
                        }
                    }
                }
                if let Some(n) = next {
                    prev = Some(n);
                }
            }

            if prev.is_none() {
                if let Some(def) = self.ir.default_rule.clone() {
                    let (_, r) = self.eval_value_rule(m, iter, &def, None, find_one);
                    return r;
                }
                m.virtual_cache.put(key.clone(), None);
            }

            if deferred {
                return Err(Stop::DeferredEarlyExit);
            }
            Ok(())
        })();

        suppress_early_exit(res)
    }

    fn eval_value_rule<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        rule: &Arc<Rule>,
        prev: Option<Term>,
        find_one: bool,
    ) -> (Option<Term>, EvalResult) {
        let cf = m.child_frame(&self.frame, rule.body.clone(), find_one);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        let mut result: Option<Term> = None;
        let mut prev_l = prev;
        let this = self.clone();
        let rule_c = rule.clone();

        let res = m.eval(&cf, &mut |m, cfr| {
            m.trace_exit(cfr, Node::Rule(rule_c.clone()));

            let head_value = rule_c
                .head
                .value
                .as_ref()
                .expect("complete rule head value");
            let plugged = m.binds.plug(head_value, cfr.bid);

            if let Some(p) = &prev_l {
                if p.value.cmp(&plugged.value) != Ordering::Equal {
                    return Err(Stop::Fatal(Error::complete_doc_conflict(rule_c.location)));
                }
                result = Some(plugged);
                m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                return Ok(());
            }

            prev_l = Some(plugged.clone());
            m.virtual_cache.put(
                VcKey::from_terms(&this.plugged[..this.pos + 1]),
                Some(plugged.clone()),
            );
            result = Some(plugged);

            let (term, term_bid) = m.binds.apply(head_value, cfr.bid);
            this.eval_term(m, iter, &term, term_bid)?;

            m.trace_redo(cfr, Node::Rule(rule_c.clone()));
            Ok(())
        });

        (result, res)
    }

    fn partial_eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let rules = self.ir.rules.clone();
        for rule in &rules {
            let cf = m.child_frame(&self.frame, rule.body.clone(), false);
            m.trace_enter(&cf, Node::Rule(rule.clone()));

            let this = self.clone();
            let rule_c = rule.clone();
            m.eval(&cf, &mut |m, cfr| {
                m.trace_exit(cfr, Node::Rule(rule_c.clone()));
                let head_value = rule_c.head.value.as_ref().expect("rule head value");
                let (term, term_bid) = m.binds.apply(head_value, cfr.bid);
                this.eval_term(m, iter, &term, term_bid)?;
                m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                Ok(())
            })?;
        }
        Ok(())
    }

    fn partial_eval_support<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let path = m.namespace_ref(&self.plugged.prefix(self.pos + 1));
        let term = Term::reference(m.namespace_ref(&self.ref_));

        let mut defined = m.save_support.exists(&path);
        if !defined {
            let rules: Vec<Arc<Rule>> = self
                .ir
                .rules
                .iter()
                .chain(self.ir.default_rule.iter())
                .cloned()
                .collect();
            for rule in &rules {
                if self.partial_eval_support_rule(m, rule, &path)? {
                    defined = true;
                }
            }
        }

        if !defined {
            return Ok(());
        }
        m.save_unify(&self.frame, &term, &self.rterm, self.bid, self.rbid, iter)
    }

    fn partial_eval_support_rule<'q>(
        &self,
        m: &mut Machine<'q>,
        rule: &Arc<Rule>,
        path: &Ref,
    ) -> Result<bool, Stop> {
        let cf = m.child_frame(&self.frame, rule.body.clone(), false);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        m.save_stack.push_query();
        let mut defined = false;
        let rule_c = rule.clone();
        let path_c = path.clone();

        let res = m.eval(&cf, &mut |m, cfr| {
            m.trace_exit(cfr, Node::Rule(rule_c.clone()));
            defined = true;

            let current = m.save_stack.pop_query();
            let plugged = m.plug_saved(&current, m.caller_bid);
            if m.compiler.passes_type_check(&plugged) {
                let value = rule_c.head.value.as_ref().map(|v| {
                    m.binds.plug_namespaced(v, cfr.bid, m.caller_bid)
                });
                let head = ref_head(&path_c[path_c.len() - 1..], value);

                let body = if !m.inlining.shallow {
                    let mut safe = arbiter_ast::term_vars(
                        &Term::reference(head.reference.clone()),
                        VarVisitorParams::default(),
                    );
                    if let Some(v) = &head.value {
                        safe.extend(arbiter_ast::term_vars(v, VarVisitorParams::default()));
                    }
                    CopyPropagator::new(safe)
                        .with_ensure_non_empty_body(true)
                        .apply(plugged)
                } else {
                    plugged
                };

                let mut out = Rule::new(head, body);
                out.default = rule_c.default;
                out.path = path_c.clone();
                m.save_support
                    .insert(&path_c, path_c.prefix(path_c.len() - 1), out);
            }
            m.trace_redo(cfr, Node::Rule(rule_c.clone()));
            m.save_stack.push_query_frame(current);
            Ok(())
        });
        m.save_stack.pop_query();
        res?;
        Ok(defined)
    }

    fn eval_term<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        term: &Term,
        term_bid: Bid,
    ) -> EvalResult {
        let tw = TermWalk {
            frame: self.frame.clone(),
            ref_: self.ref_.clone(),
            pos: self.pos + 1,
            bid: self.bid,
            term: term.clone(),
            term_bid,
            rterm: self.rterm.clone(),
            rbid: self.rbid,
        };
        tw.eval(m, iter)
    }
}

// ──────────────────────────────────────────────
// Partial-object and partial-set rules
// ──────────────────────────────────────────────

/// Longest rule ref length among `rules`, capped at `ceil`. Multi-value
/// rules count one extra position for the set key.
fn max_ref_length(rules: &[Arc<Rule>], ceil: usize) -> usize {
    let mut longest = 0;
    for r in rules {
        let mut rl = r.path.len();
        if r.kind() == RuleHeadKind::MultiValue {
            rl += 1;
        }
        if rl >= ceil {
            return ceil;
        }
        if rl > longest {
            longest = rl;
        }
    }
    longest
}

#[derive(Default)]
struct CacheHint {
    key: Option<VcKey>,
    /// Plain reference terms of the key (scope excluded), for extracting
    /// the cacheable sub-value out of an accumulated result.
    path: Ref,
    hit: bool,
    full: bool,
}

#[derive(Clone)]
struct PartialDocEval {
    frame: Frame,
    ir: IndexResult,
    ref_: Ref,
    plugged: Ref,
    pos: usize,
    bid: Bid,
    rterm: Term,
    rbid: Bid,
    empty: Term,
}

impl PartialDocEval {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let unknown = m.unknown_ref(&self.ref_.prefix(self.pos + 1), self.bid);

        if self.ref_.len() == self.pos + 1 {
            if unknown {
                return self.partial_eval_support(m, iter);
            }
            return self.eval_all_rules(m, iter);
        }

        if (unknown && m.inlining.shallow)
            || m.inlining.disabled(&self.ref_.prefix(self.pos + 1), false)
        {
            return self.partial_eval_support(m, iter);
        }

        self.eval_each_rule(m, iter, unknown)
    }

    fn eval_each_rule<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        unknown: bool,
    ) -> EvalResult {
        if self.ir.rules.is_empty() {
            return Ok(());
        }

        if m.partial {
            let mx = max_ref_length(&self.ir.rules, self.ref_.len());
            if self.pos + 1 < mx && m.unknown_terms(&self.ref_[self.pos + 1..mx], self.bid) {
                for rule in &self.ir.rules.clone() {
                    self.eval_one_rule_post_unify(m, iter, rule)?;
                }
                return Ok(());
            }
        }

        let hint = self.eval_cache(m, iter)?;
        if hint.hit {
            return Ok(());
        }

        if hint.full {
            let result = self.eval_all_rules_no_cache(m)?;
            if let Some(key) = hint.key {
                m.virtual_cache.put(key, Some(result.clone()));
            }
            return self.eval_term_at(m, iter, self.pos + 1, &result, self.bid);
        }

        let mut result = self.empty.clone();
        let mut visited: Vec<Ref> = Vec::new();

        for rule in &self.ir.rules.clone() {
            result = self.eval_one_rule_pre_unify(m, iter, rule, result, unknown, &mut visited)?;
        }

        if let Some(key) = hint.key {
            let tail = &hint.path[self.pos + 1..];
            if let Some(v) = result.value.find(tail) {
                m.virtual_cache.put(key, Some(Term::new(v)));
            }
        }

        if !unknown {
            return self.eval_term_at(m, iter, self.pos + 1, &result, self.bid);
        }
        Ok(())
    }

    /// The whole collection is requested (e.g. `data.a.q`, not
    /// `data.a.q[x]`): evaluate every rule and unify the accumulated
    /// result.
    fn eval_all_rules<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let key = VcKey::from_terms(&self.plugged[..self.pos + 1]);
        if let Some(Some(result)) = m.virtual_cache.get(&key) {
            m.instr.incr(COUNTER_VIRTUAL_CACHE_HIT);
            return m.biunify(&result, &self.rterm, self.bid, self.rbid, &self.frame, iter);
        }
        m.instr.incr(COUNTER_VIRTUAL_CACHE_MISS);

        let result = self.eval_all_rules_no_cache(m)?;
        m.virtual_cache.put(key, Some(result.clone()));
        m.biunify(&result, &self.rterm, self.bid, self.rbid, &self.frame, iter)
    }

    fn eval_all_rules_no_cache<'q>(&self, m: &mut Machine<'q>) -> Result<Term, Stop> {
        let mut result = self.empty.clone();
        let mut visited: Vec<Ref> = Vec::new();

        for rule in &self.ir.rules.clone() {
            let cf = m.child_frame(&self.frame, rule.body.clone(), false);
            m.trace_enter(&cf, Node::Rule(rule.clone()));

            let rule_c = rule.clone();
            let pos = self.pos;
            m.eval(&cf, &mut |m, cfr| {
                m.trace_exit(cfr, Node::Rule(rule_c.clone()));
                reduce(m, &rule_c, cfr.bid, pos, &mut result, &mut visited)
                    .map_err(Stop::Fatal)?;
                m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                Ok(())
            })?;
        }
        Ok(result)
    }

    fn eval_one_rule_pre_unify<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        rule: &Arc<Rule>,
        result: Term,
        unknown: bool,
        visited: &mut Vec<Ref>,
    ) -> Result<Term, Stop> {
        let cf = m.child_frame(&self.frame, rule.body.clone(), false);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        let mut defined = false;
        let mut result = result;
        let this = self.clone();
        let rule_c = rule.clone();
        let bid = self.bid;
        let pos = self.pos;
        let ref_ = self.ref_.clone();

        // walk the dynamic portion of the rule ref (and the set key) to
        // unify vars before evaluating the body
        let res = m.biunify_rule_head(
            &cf.clone(),
            pos + 1,
            &ref_,
            &rule_c,
            bid,
            cf.bid,
            &mut |m, _pos| {
                defined = true;
                m.eval(&cf, &mut |m, cfr| {
                    m.trace_exit(cfr, Node::Rule(rule_c.clone()));

                    if unknown {
                        let head_term = rule_c
                            .head
                            .value
                            .clone()
                            .or_else(|| rule_c.head.key_term().cloned())
                            .expect("rule head term");
                        let (term, term_bid) = m.binds.apply(&head_term, cfr.bid);
                        let term = if rule_c.kind() == RuleHeadKind::MultiValue {
                            Term::set(vec![term])
                        } else {
                            term
                        };
                        let obj_ref = &rule_c.path[pos + 1..];
                        let term = wrap_in_objects_ref(term, obj_ref);
                        this.eval_term_at(m, iter, pos + 1, &term, term_bid)?;
                    } else {
                        let dup = reduce(m, &rule_c, cfr.bid, pos, &mut result, visited)
                            .map_err(Stop::Fatal)?;
                        if dup {
                            m.trace_duplicate(cfr, Node::Rule(rule_c.clone()));
                            return Ok(());
                        }
                    }

                    m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                    Ok(())
                })
            },
        );
        res?;

        if !defined {
            m.trace_fail(&cf, Node::Rule(rule.clone()));
        }
        Ok(result)
    }

    fn eval_one_rule_post_unify<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        rule: &Arc<Rule>,
    ) -> EvalResult {
        let cf = m.child_frame(&self.frame, rule.body.clone(), false);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        let mut defined = false;
        let this = self.clone();
        let rule_c = rule.clone();
        let bid = self.bid;
        let pos = self.pos;
        let ref_ = self.ref_.clone();

        let res = m.eval(&cf, &mut |m, cfr| {
            defined = true;
            let cfr_c = cfr.clone();
            m.biunify_rule_head(&cfr_c, pos + 1, &ref_, &rule_c, bid, cfr_c.bid, &mut |m, _| {
                m.trace_exit(&cfr_c, Node::Rule(rule_c.clone()));

                let head_term = rule_c
                    .head
                    .value
                    .clone()
                    .or_else(|| rule_c.head.key.clone())
                    .expect("rule head term");
                let (term, term_bid) = m.binds.apply(&head_term, cfr_c.bid);
                let term = if rule_c.kind() == RuleHeadKind::MultiValue {
                    Term::set(vec![term])
                } else {
                    term
                };
                let obj_ref = &rule_c.path[pos + 1..];
                let term = wrap_in_objects_ref(term, obj_ref);
                this.eval_term_at(m, iter, pos + 1, &term, term_bid)?;

                m.trace_redo(&cfr_c, Node::Rule(rule_c.clone()));
                Ok(())
            })
        });
        res?;

        if !defined {
            m.trace_fail(&cf, Node::Rule(rule.clone()));
        }
        Ok(())
    }

    /// Look for cached results, building a hint key by plugging ref
    /// positions until one is non-ground. Ground positions right of a
    /// variable position scope the cache entry: they constrain the
    /// evaluation through ref unification, so otherwise identical keys
    /// with different scopes occupy different slots.
    fn eval_cache<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> Result<CacheHint, Stop> {
        let mut hint = CacheHint::default();

        // no virtual caching during partial evaluation
        if m.unknown_ref(&self.ref_.prefix(self.pos + 1), self.bid) {
            return Ok(hint);
        }

        let full_key = VcKey::from_terms(&self.plugged[..self.pos + 1]);
        if let Some(Some(cached)) = m.virtual_cache.get(&full_key) {
            m.instr.incr(COUNTER_VIRTUAL_CACHE_HIT);
            hint.hit = true;
            self.eval_term_at(m, iter, self.pos + 1, &cached, self.bid)?;
            return Ok(hint);
        }

        let plugged = m.binds.plug(&self.ref_[self.pos + 1], self.bid);
        if matches!(plugged.value, Value::Var(_)) {
            hint.full = true;
            hint.key = Some(full_key);
            hint.path = self.plugged.prefix(self.pos + 1);
            m.instr.incr(COUNTER_VIRTUAL_CACHE_MISS);
            return Ok(hint);
        }

        let mx = max_ref_length(&self.ir.rules, self.ref_.len());
        let mut scoping = false;
        let mut hint_key_end = 0;
        let mut key: Option<VcKey> = None;
        let mut path = Ref::default();

        for i in self.pos + 1..mx {
            let p = m.binds.plug(&self.ref_[i], self.bid);

            if p.is_ground() && !scoping {
                hint_key_end = i;
                let mut k = VcKey::from_terms(&self.plugged[..i]);
                k.push_term(p.clone());
                let mut pth = self.plugged.prefix(i);
                pth.0.push(p);
                key = Some(k);
                path = pth;
            } else {
                scoping = true;
                match &mut key {
                    None => break,
                    Some(k) => k.push_scope_term(p),
                }
            }

            if let Some(k) = &key {
                if let Some(Some(cached)) = m.virtual_cache.get(k) {
                    m.instr.incr(COUNTER_VIRTUAL_CACHE_HIT);
                    hint.hit = true;
                    self.eval_term_at(m, iter, hint_key_end + 1, &cached, self.bid)?;
                    return Ok(hint);
                }
            }
        }

        if let Some(k) = &mut key {
            k.reduce_scope();
        }

        m.instr.incr(COUNTER_VIRTUAL_CACHE_MISS);
        hint.key = key;
        hint.path = path;
        Ok(hint)
    }

    fn partial_eval_support<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let path = m.namespace_ref(&self.plugged.prefix(self.pos + 1));
        let mut term = Term::reference(m.namespace_ref(&self.ref_));

        let mut defined = m.save_support.exists(&path);
        if !defined {
            for rule in &self.ir.rules.clone() {
                if self.partial_eval_support_rule(m, rule, &path)? {
                    defined = true;
                }
            }
        }

        if !defined {
            if self.ref_.len() != self.pos + 1 {
                return Ok(());
            }
            // the entire collection was queried: it is defined and empty
            term = self.empty.clone();
        }

        m.save_unify(&self.frame, &term, &self.rterm, self.bid, self.rbid, iter)
    }

    fn partial_eval_support_rule<'q>(
        &self,
        m: &mut Machine<'q>,
        rule: &Arc<Rule>,
        exists_path: &Ref,
    ) -> Result<bool, Stop> {
        let cf = m.child_frame(&self.frame, rule.body.clone(), false);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        m.save_stack.push_query();
        let mut defined = false;
        let rule_c = rule.clone();
        let exists_c = exists_path.clone();
        let pkg_len = rule.path.len() - rule.head.reference.len() + 1;

        let res = m.eval(&cf, &mut |m, cfr| {
            m.trace_exit(cfr, Node::Rule(rule_c.clone()));
            defined = true;

            let current = m.save_stack.pop_query();
            let plugged = m.plug_saved(&current, m.caller_bid);
            if m.compiler.passes_type_check(&plugged) {
                let value = rule_c
                    .head
                    .value
                    .as_ref()
                    .map(|v| m.binds.plug_namespaced(v, cfr.bid, m.caller_bid));

                let namespaced = m.namespace_ref(&rule_c.path);
                let mut full_ref = Vec::with_capacity(namespaced.len());
                for (i, t) in namespaced.iter().enumerate() {
                    if i == 0 {
                        full_ref.push(t.clone());
                    } else {
                        full_ref.push(m.binds.plug_namespaced(t, cfr.bid, m.caller_bid));
                    }
                }
                let full_ref = Ref::new(full_ref);
                let rule_ref = &full_ref[pkg_len..];

                let mut head = ref_head(rule_ref, value);
                if rule_c.kind() == RuleHeadKind::MultiValue {
                    head.key = rule_c
                        .head
                        .key
                        .as_ref()
                        .map(|k| m.binds.plug_namespaced(k, cfr.bid, m.caller_bid));
                } else if rule_ref.len() == 2 {
                    head.key = Some(rule_ref[1].clone());
                }

                let body = if !m.inlining.shallow {
                    let mut safe = arbiter_ast::term_vars(
                        &Term::reference(head.reference.clone()),
                        VarVisitorParams::default(),
                    );
                    if let Some(v) = &head.value {
                        safe.extend(arbiter_ast::term_vars(v, VarVisitorParams::default()));
                    }
                    if let Some(k) = &head.key {
                        safe.extend(arbiter_ast::term_vars(k, VarVisitorParams::default()));
                    }
                    CopyPropagator::new(safe)
                        .with_ensure_non_empty_body(true)
                        .apply(plugged)
                } else {
                    plugged
                };

                let mut out = Rule::new(head, body);
                out.default = rule_c.default;
                out.path = full_ref.clone();
                m.save_support
                    .insert(&exists_c, full_ref.prefix(pkg_len), out);
            }
            m.trace_redo(cfr, Node::Rule(rule_c.clone()));
            m.save_stack.push_query_frame(current);
            Ok(())
        });
        m.save_stack.pop_query();
        res?;
        Ok(defined)
    }

    fn eval_term_at<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        pos: usize,
        term: &Term,
        term_bid: Bid,
    ) -> EvalResult {
        let tw = TermWalk {
            frame: self.frame.clone(),
            ref_: self.ref_.clone(),
            pos,
            bid: self.bid,
            term: term.clone(),
            term_bid,
            rterm: self.rterm.clone(),
            rbid: self.rbid,
        };
        tw.eval(m, iter)
    }
}

impl<'q> Machine<'q> {
    /// Unify the dynamic portion of a query ref against a rule's head
    /// ref, position by position; multi-value rules additionally unify
    /// the set key when the query ref extends past the rule ref.
    #[allow(clippy::too_many_arguments)]
    fn biunify_rule_head(
        &mut self,
        f: &Frame,
        pos: usize,
        ref_: &Ref,
        rule: &Arc<Rule>,
        b1: Bid,
        b2: Bid,
        iter: RefIter<'_, 'q>,
    ) -> EvalResult {
        let rule_ref = rule.path.clone();
        let ref_c = ref_.clone();
        let rule_c = rule.clone();
        self.biunify_dynamic_ref(f, pos, &ref_c.clone(), &rule_ref, b1, b2, &mut |m, p| {
            if rule_c.kind() == RuleHeadKind::MultiValue
                && p < ref_c.len()
                && rule_c.path.len() <= ref_c.len()
            {
                let head_key = rule_c.head.key_term().expect("multi-value key").clone();
                return m.biunify(&ref_c[p], &head_key, b1, b2, f, &mut |m| iter(m, p + 1));
            }
            iter(m, p)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn biunify_dynamic_ref(
        &mut self,
        f: &Frame,
        pos: usize,
        a: &Ref,
        b: &Ref,
        b1: Bid,
        b2: Bid,
        iter: RefIter<'_, 'q>,
    ) -> EvalResult {
        if pos >= a.len() || pos >= b.len() {
            return iter(self, pos);
        }
        let ac = a.clone();
        let bc = b.clone();
        self.biunify(&a[pos], &b[pos], b1, b2, f, &mut |m| {
            m.biunify_dynamic_ref(f, pos + 1, &ac, &bc, b1, b2, iter)
        })
    }
}

/// Fold one rule solution into the accumulated collection. Returns true
/// when the contribution already existed (an idempotent add).
fn reduce(
    m: &Machine<'_>,
    rule: &Arc<Rule>,
    bid: Bid,
    pos: usize,
    result: &mut Term,
    visited: &mut Vec<Ref>,
) -> Result<bool, Error> {
    let head = &rule.head;
    let mut exists = false;

    match &mut result.value {
        Value::Set(set) => {
            let key = m
                .binds
                .plug(head.key_term().expect("multi-value key"), bid);
            exists = set.contains(&key);
            set.insert(key);
        }
        Value::Object(obj) => {
            let full_path = &rule.path;

            // data.p.q[r].s.t := 42
            //         |----|-|
            //          ^    ^
            //          |    leaf key
            //          object path
            let collision_tail = &full_path[pos + 1..];
            let collision: Ref = Ref::new(
                collision_tail
                    .iter()
                    .map(|t| m.binds.plug(t, bid))
                    .collect(),
            );
            for c in visited.iter() {
                if collision.has_prefix(c) && collision != *c {
                    return Err(Error::object_key_conflict(head.location));
                }
            }
            visited.push(collision);

            let obj_path = &full_path[pos + 1..full_path.len() - 1];
            let leaf_key = m.binds.plug(&full_path[full_path.len() - 1], bid);

            let leaf_obj = get_nested_object(obj, obj_path, m, bid, head.location)?;

            if head.kind() == RuleHeadKind::SingleValue {
                let val = m.binds.plug(head.value.as_ref().expect("head value"), bid);
                match leaf_obj.get(&leaf_key) {
                    Some(curr) => {
                        if *curr != val {
                            return Err(Error::object_key_conflict(head.location));
                        }
                        exists = true;
                    }
                    None => {
                        leaf_obj.insert(leaf_key, val);
                    }
                }
            } else {
                let key = m
                    .binds
                    .plug(head.key.as_ref().expect("multi-value key"), bid);
                match leaf_obj.get_mut(&leaf_key) {
                    Some(leaf) => match &mut leaf.value {
                        Value::Set(set) => {
                            exists = set.contains(&key);
                            set.insert(key);
                        }
                        _ => return Err(Error::object_key_conflict(head.location)),
                    },
                    None => {
                        leaf_obj.insert(leaf_key, Term::set(vec![key]));
                    }
                }
            }
        }
        _ => {}
    }

    Ok(exists)
}

/// Walk (or create) nested objects along `path`, failing on non-object
/// collisions.
fn get_nested_object<'a>(
    obj: &'a mut Object,
    path: &[Term],
    m: &Machine<'_>,
    bid: Bid,
    loc: Location,
) -> Result<&'a mut Object, Error> {
    let mut current = obj;
    for term in path {
        let key = m.binds.plug(term, bid);
        let entry = current
            .entry(key)
            .or_insert_with(|| Term::new(Value::Object(Object::new())));
        match &mut entry.value {
            Value::Object(o) => current = o,
            _ => return Err(Error::object_key_conflict(loc)),
        }
    }
    Ok(current)
}

// ──────────────────────────────────────────────
// Function rules
// ──────────────────────────────────────────────

struct FuncEval {
    frame: Frame,
    ir: IndexResult,
    terms: Vec<Term>,
}

impl FuncEval {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        if self.ir.is_empty() {
            return Ok(());
        }

        let arg_count = self.ir.arg_count();
        let expr = self.frame.query[self.frame.index].clone();

        // Ordered rules are not inlined under partial evaluation.
        let has_else = self.ir.else_chains.iter().any(|c| !c.is_empty());
        if has_else && m.unknown_expr(&expr, self.frame.bid) {
            return m.save_call(&self.frame, arg_count, &self.terms, iter);
        }

        if m.partial {
            let mut must_generate_support = false;

            if let Some(def) = &self.ir.default_rule {
                if def.head.args.len() == self.terms.len() - 1 {
                    // called without an output term: every successful
                    // evaluation is of interest unless the default is false
                    if def.head.value.as_ref() != Some(&Term::bool(false)) {
                        must_generate_support = true;
                    }
                } else {
                    // called with an output term: the default may always
                    // be required
                    must_generate_support = true;
                }
            }

            let fref = match &self.terms[0].value {
                Value::Ref(r) => r.clone(),
                _ => {
                    return Err(Stop::Fatal(Error::internal(
                        "function operator must be a ref",
                        expr.location,
                    )))
                }
            };

            if must_generate_support || m.inlining.shallow || m.inlining.disabled(&fref, false) {
                let mut unknown = m.unknown_ref(&fref, self.frame.bid);
                for i in 1..=arg_count.min(self.terms.len() - 1) {
                    if unknown {
                        break;
                    }
                    unknown = m.unknown_term(&self.terms[i], self.frame.bid);
                }
                if unknown {
                    return self.partial_eval_support(m, arg_count, iter);
                }
            }
        }

        self.eval_value(m, iter, arg_count, self.ir.early_exit)
    }

    fn eval_value<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        arg_count: usize,
        find_one: bool,
    ) -> EvalResult {
        let mut cache_key: Option<VcKey> = None;
        if !m.partial {
            let (key, hit) = self.eval_cache(m, arg_count, iter)?;
            if hit {
                return Ok(());
            }
            cache_key = key;
        }

        let res = (|| -> EvalResult {
            let mut prev: Option<Term> = None;
            let mut deferred = false;

            let rules = self.ir.rules.clone();
            for (i, rule) in rules.iter().enumerate() {
                let args = self.rule_args(rule);
                let (mut next, r) =
                    self.eval_one_rule(m, iter, rule, &args, &cache_key, prev.clone(), find_one);
                match r {
                    Err(Stop::DeferredEarlyExit) => deferred = true,
                    Err(other) => return Err(other),
                    Ok(()) => {}
                }
                if next.is_none() {
                    for erule in self.ir.else_chain(i) {
                        let eargs = self.rule_args(erule);
                        let (n, r) = self.eval_one_rule(
                            m,
                            iter,
                            erule,
                            &eargs,
                            &cache_key,
                            prev.clone(),
                            find_one,
                        );
                        match r {
                            Err(Stop::DeferredEarlyExit) => deferred = true,
                            Err(other) => return Err(other),
                            Ok(()) => {}
                        }
                        next = n;
                        if next.is_some() {
                            break;
                        }
                    }
                }
                if let Some(n) = next {
                    prev = Some(n);
                }
            }

            if prev.is_none() {
                if let Some(def) = self.ir.default_rule.clone() {
                    let dargs = self.rule_args(&def);
                    let (_, r) =
                        self.eval_one_rule(m, iter, &def, &dargs, &cache_key, None, find_one);
                    return r;
                }
            }

            if deferred {
                return Err(Stop::DeferredEarlyExit);
            }
            Ok(())
        })();

        suppress_early_exit(res)
    }

    /// The rule-side unification targets: declared parameters, plus the
    /// head value when the call site captures the output.
    fn rule_args(&self, rule: &Arc<Rule>) -> Vec<Term> {
        let mut args = rule.head.args.clone();
        if self.terms.len() - 1 == rule.head.args.len() + 1 {
            args.push(
                rule.head
                    .value
                    .clone()
                    .expect("function rule head value"),
            );
        }
        args
    }

    fn eval_cache<'q>(
        &self,
        m: &mut Machine<'q>,
        arg_count: usize,
        iter: UnifyIter<'_, 'q>,
    ) -> Result<(Option<VcKey>, bool), Stop> {
        // the output term is not part of the key when captured
        let mut plen = self.terms.len();
        if plen == arg_count + 2 {
            plen -= 1;
        }

        let mut key_terms = Vec::with_capacity(plen);
        for t in &self.terms[..plen] {
            if t.is_ground() {
                key_terms.push(t.clone());
            } else {
                key_terms.push(m.binds.plug(t, self.frame.bid));
            }
        }
        let key = VcKey::from_terms(&key_terms);

        if let Some(Some(cached)) = m.virtual_cache.get(&key) {
            m.instr.incr(COUNTER_VIRTUAL_CACHE_HIT);
            if arg_count == self.terms.len() - 1 {
                if cached == Term::bool(false) {
                    return Ok((None, true));
                }
                iter(m)?;
                return Ok((None, true));
            }
            let out = self.terms[self.terms.len() - 1].clone();
            m.biunify(&out, &cached, self.frame.bid, self.frame.bid, &self.frame, iter)?;
            return Ok((None, true));
        }

        m.instr.incr(COUNTER_VIRTUAL_CACHE_MISS);
        Ok((Some(key), false))
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_one_rule<'q>(
        &self,
        m: &mut Machine<'q>,
        iter: UnifyIter<'_, 'q>,
        rule: &Arc<Rule>,
        args: &[Term],
        cache_key: &Option<VcKey>,
        prev: Option<Term>,
        find_one: bool,
    ) -> (Option<Term>, EvalResult) {
        let cf = m.child_frame(&self.frame, rule.body.clone(), find_one);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        let mut result: Option<Term> = None;
        let mut prev_l = prev;
        let rule_c = rule.clone();
        let call_args = self.terms[1..].to_vec();
        let args_c = args.to_vec();
        let caller_bid = self.frame.bid;
        let cf_c = cf.clone();
        let terms_len = self.terms.len();
        let cache_key = cache_key.clone();
        let frame = self.frame.clone();

        let res = m.biunify_terms(&call_args, &args_c, caller_bid, cf_c.bid, &cf_c, &mut |m| {
            m.eval(&cf_c, &mut |m, cfr| {
                m.trace_exit(cfr, Node::Rule(rule_c.clone()));

                let head_value = rule_c
                    .head
                    .value
                    .as_ref()
                    .expect("function rule head value");

                // without a captured output, a saved output value must be
                // tested in the residual (it may be false)
                if rule_c.head.args.len() == terms_len - 1
                    && m.partial
                    && m.save_set.contains(&m.binds, head_value, cfr.bid)
                {
                    let e = Expr::term(head_value.clone());
                    let r = m.save_expr(&frame, &e, cfr.bid, iter);
                    m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                    return r;
                }

                let plugged = m.binds.plug(head_value, cfr.bid);
                if let Some(k) = &cache_key {
                    m.virtual_cache.put(k.clone(), Some(plugged.clone()));
                }
                result = Some(plugged.clone());

                if rule_c.head.args.len() == terms_len - 1 && plugged == Term::bool(false) {
                    if let Some(p) = &prev_l {
                        if *p != plugged {
                            return Err(Stop::Fatal(Error::function_conflict(rule_c.location)));
                        }
                    }
                    prev_l = Some(plugged);
                    return Ok(());
                }

                // partial evaluation explores all rules and may not
                // produce ground results: no conflict detection there
                if !m.partial {
                    if let Some(p) = &prev_l {
                        if *p != plugged {
                            return Err(Stop::Fatal(Error::function_conflict(rule_c.location)));
                        }
                        m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                        return Ok(());
                    }
                }

                prev_l = Some(plugged);
                iter(m)?;
                m.trace_redo(cfr, Node::Rule(rule_c.clone()));
                Ok(())
            })
        });

        (result, res)
    }

    fn partial_eval_support<'q>(
        &self,
        m: &mut Machine<'q>,
        decl_args_len: usize,
        iter: UnifyIter<'_, 'q>,
    ) -> EvalResult {
        let fref = match &self.terms[0].value {
            Value::Ref(r) => r.clone(),
            _ => unreachable!("checked by caller"),
        };
        let path = m.namespace_ref(&fref);

        if !m.save_support.exists(&path) {
            let rules: Vec<Arc<Rule>> = self
                .ir
                .rules
                .iter()
                .chain(self.ir.default_rule.iter())
                .cloned()
                .collect();
            for rule in &rules {
                self.partial_eval_support_rule(m, rule, &path)?;
            }
        }

        if !m.save_support.exists(&path) {
            // nothing was saved, nothing to call
            return Ok(());
        }

        let mut call_terms = Vec::with_capacity(self.terms.len());
        call_terms.push(Term::reference(path));
        call_terms.extend_from_slice(&self.terms[1..]);
        m.save_call(&self.frame, decl_args_len, &call_terms, iter)
    }

    fn partial_eval_support_rule<'q>(
        &self,
        m: &mut Machine<'q>,
        rule: &Arc<Rule>,
        path: &Ref,
    ) -> EvalResult {
        let cf = m.child_frame(&self.frame, rule.body.clone(), false);
        m.trace_enter(&cf, Node::Rule(rule.clone()));

        m.save_stack.push_query();

        // function arguments are unknown during rule body evaluation
        let mut arg_vars: Vec<Term> = Vec::new();
        for a in &rule.head.args {
            for v in arbiter_ast::term_vars(a, VarVisitorParams::default()) {
                arg_vars.push(Term::var(v));
            }
        }
        m.save_set.push(arg_vars, cf.bid);

        let rule_c = rule.clone();
        let path_c = path.clone();

        let res = m.eval(&cf, &mut |m, cfr| {
            m.trace_exit(cfr, Node::Rule(rule_c.clone()));

            let current = m.save_stack.pop_query();
            let plugged = m.plug_saved(&current, m.caller_bid);
            if m.compiler.passes_type_check(&plugged) {
                let name = match path_c.last().map(|t| &t.value) {
                    Some(Value::String(s)) => s.clone(),
                    _ => "func".to_string(),
                };
                let head = Head {
                    reference: Ref::new(vec![Term::var(name)]),
                    key: None,
                    value: rule_c
                        .head
                        .value
                        .as_ref()
                        .map(|v| m.binds.plug_namespaced(v, cfr.bid, m.caller_bid)),
                    args: rule_c
                        .head
                        .args
                        .iter()
                        .map(|a| m.binds.plug_namespaced(a, cfr.bid, m.caller_bid))
                        .collect(),
                    location: rule_c.head.location,
                };
                let mut out = Rule::new(head, plugged);
                out.default = rule_c.default;
                out.path = path_c.clone();
                m.save_support
                    .insert(&path_c, path_c.prefix(path_c.len() - 1), out);
            }
            m.trace_redo(cfr, Node::Rule(rule_c.clone()));
            m.save_stack.push_query_frame(current);
            Ok(())
        });

        m.save_set.pop();
        m.save_stack.pop_query();
        res
    }
}

// ──────────────────────────────────────────────
// Term walk (input, bound composites, rule outputs)
// ──────────────────────────────────────────────

#[derive(Clone)]
struct TermWalk {
    frame: Frame,
    ref_: Ref,
    pos: usize,
    bid: Bid,
    term: Term,
    term_bid: Bid,
    rterm: Term,
    rbid: Bid,
}

impl TermWalk {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        if self.pos == self.ref_.len() {
            return m.biunify(
                &self.term,
                &self.rterm,
                self.term_bid,
                self.rbid,
                &self.frame,
                iter,
            );
        }

        if m.partial && m.save_set.contains(&m.binds, &self.term, self.term_bid) {
            return self.save(m, iter);
        }

        let plugged = m.binds.plug(&self.ref_[self.pos], self.bid);
        if plugged.is_ground() {
            return self.next(m, iter, &plugged);
        }
        self.enumerate(m, iter)
    }

    fn next<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>, plugged: &Term) -> EvalResult {
        let (term, term_bid) = match self.get(m, plugged) {
            Some(tb) => tb,
            None => return Ok(()),
        };
        let mut cpy = self.clone();
        cpy.term = term;
        cpy.term_bid = term_bid;
        cpy.pos += 1;
        cpy.eval(m, iter)
    }

    fn enumerate<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let mut deferred = false;
        let mut handle = |r: EvalResult| -> EvalResult {
            match r {
                Err(Stop::DeferredEarlyExit) => {
                    deferred = true;
                    Ok(())
                }
                other => other,
            }
        };

        match &self.term.value {
            Value::Array(elems) => {
                for i in 0..elems.len() {
                    let k = Term::int(i as i64);
                    let r = m.biunify(
                        &k,
                        &self.ref_[self.pos],
                        self.term_bid,
                        self.bid,
                        &self.frame,
                        &mut |m| self.next(m, iter, &k),
                    );
                    handle(r)?;
                }
            }
            Value::Object(obj) => {
                for key in obj.keys() {
                    let r = m.biunify(
                        key,
                        &self.ref_[self.pos],
                        self.term_bid,
                        self.bid,
                        &self.frame,
                        &mut |m| {
                            let plugged = m.binds.plug(key, self.term_bid);
                            self.next(m, iter, &plugged)
                        },
                    );
                    handle(r)?;
                }
            }
            Value::Set(set) => {
                for elem in set {
                    let r = m.biunify(
                        elem,
                        &self.ref_[self.pos],
                        self.term_bid,
                        self.bid,
                        &self.frame,
                        &mut |m| {
                            let plugged = m.binds.plug(elem, self.term_bid);
                            self.next(m, iter, &plugged)
                        },
                    );
                    handle(r)?;
                }
            }
            _ => {}
        }

        if deferred {
            return Err(Stop::DeferredEarlyExit);
        }
        Ok(())
    }

    /// Look up `plugged` in the current term: set membership, object
    /// key, or array index. Non-ground collections are plugged through
    /// the term's own frame before comparing.
    fn get(&self, m: &Machine<'_>, plugged: &Term) -> Option<(Term, Bid)> {
        match &self.term.value {
            Value::Set(set) => {
                if set.iter().all(|e| e.value.is_ground()) {
                    if set.contains(plugged) {
                        return Some(m.binds.apply(plugged, self.term_bid));
                    }
                } else {
                    for elem in set {
                        if m.binds.plug(elem, self.term_bid) == *plugged {
                            return Some(m.binds.apply(plugged, self.term_bid));
                        }
                    }
                }
                None
            }
            Value::Object(obj) => {
                if obj.keys().all(|k| k.value.is_ground()) {
                    obj.get(plugged)
                        .map(|t| m.binds.apply(t, self.term_bid))
                } else {
                    for (k, v) in obj {
                        if m.binds.plug(k, self.term_bid) == *plugged {
                            return Some(m.binds.apply(v, self.term_bid));
                        }
                    }
                    None
                }
            }
            Value::Array(elems) => plugged
                .value
                .as_index()
                .and_then(|i| elems.get(i))
                .map(|t| m.binds.apply(t, self.term_bid)),
            _ => None,
        }
    }

    /// The term is unknown: bind it to a generated variable and save the
    /// rest of the walk as a reference rooted at that variable.
    fn save<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let v = m.generate_var("ref");
        let term = self.term.clone();
        let this = self.clone();
        let vc = v.clone();
        m.biunify(
            &term,
            &v,
            self.term_bid,
            self.bid,
            &self.frame,
            &mut |m| {
                let suffix = &this.ref_[this.pos..];
                let mut ref_terms = Vec::with_capacity(suffix.len() + 1);
                ref_terms.push(vc.clone());
                ref_terms.extend_from_slice(suffix);
                m.biunify(
                    &Term::reference(Ref::new(ref_terms)),
                    &this.rterm,
                    this.bid,
                    this.rbid,
                    &this.frame,
                    iter,
                )
            },
        )
    }
}

// ──────────────────────────────────────────────
// `every` quantification
// ──────────────────────────────────────────────

struct EveryEval {
    frame: Frame,
    expr: Expr,
    every: Every,
}

impl EveryEval {
    fn eval<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        // unknowns in the domain or body: save the whole expression
        if m.unknown_term(&self.every.domain, self.frame.bid)
            || self
                .every
                .body
                .iter()
                .any(|e| m.unknown_expr(e, self.frame.bid))
        {
            return self.save(m, iter);
        }

        let pd = m.binds.plug(&self.every.domain, self.frame.bid);
        if !is_iterable_value(&pd.value) {
            m.trace_fail(&self.frame, Node::Expr(self.expr.clone()));
            return Ok(());
        }

        let key = match &self.every.key {
            Some(k) => k.clone(),
            None => m.generate_var("every_key"),
        };
        let generator = Body::from_expr(Expr::equality(
            Term::reference(Ref::new(vec![self.every.domain.clone(), key])),
            self.every.value.clone(),
        ));

        let df = m.closure_frame(&self.frame, generator);
        let mut all = true;
        m.trace_enter(&df, Node::Expr(self.expr.clone()));

        let body = self.every.body.clone();
        let expr = self.expr.clone();

        let res = m.eval(&df, &mut |m, dfr| {
            if !all {
                // a failed iteration already decided the result
                return Ok(());
            }

            let mut bf = m.closure_frame(dfr, body.clone());
            bf.find_one = true;
            m.trace_enter(&bf, Node::Body(body.clone()));

            let mut done = false;
            let r = m.eval(&bf, &mut |m, bfr| {
                m.trace_exit(bfr, Node::Body(body.clone()));
                done = true;
                m.trace_redo(bfr, Node::Body(body.clone()));
                Ok(())
            });
            if !done {
                all = false;
            }
            m.trace_redo(dfr, Node::Expr(expr.clone()));

            // early exit must not abort the domain enumeration
            suppress_early_exit(r)
        });
        res?;

        if all {
            let r = iter(m);
            m.trace_exit(&df, Node::Expr(self.expr.clone()));
            return r;
        }
        m.trace_fail(&df, Node::Expr(self.expr.clone()));
        Ok(())
    }

    fn save<'q>(&self, m: &mut Machine<'q>, iter: UnifyIter<'_, 'q>) -> EvalResult {
        let plugged = self.plug_expr(m, &self.expr);
        m.save_expr_plugged(&self.frame, plugged, iter)
    }

    /// Plug every body term namespaced against the caller, recursing
    /// into nested `every` expressions. Operators are left alone.
    fn plug_expr(&self, m: &Machine<'_>, expr: &Expr) -> Expr {
        let bid = self.frame.bid;
        let caller = m.caller_bid;
        let mut cpy = expr.clone();
        if let ExprTerms::Every(e) = &expr.terms {
            let mut every = (**e).clone();
            let mut new_body = Vec::with_capacity(every.body.len());
            for inner in every.body.iter() {
                match &inner.terms {
                    ExprTerms::Term(t) => {
                        let mut ic = inner.clone();
                        ic.terms = ExprTerms::Term(m.binds.plug_namespaced(t, bid, caller));
                        new_body.push(ic);
                    }
                    ExprTerms::Call(terms) => {
                        let mut ic = inner.clone();
                        let mut new_terms = Vec::with_capacity(terms.len());
                        for (j, t) in terms.iter().enumerate() {
                            if j == 0 {
                                new_terms.push(t.clone());
                            } else {
                                new_terms.push(m.binds.plug_namespaced(t, bid, caller));
                            }
                        }
                        ic.terms = ExprTerms::Call(new_terms);
                        new_body.push(ic);
                    }
                    ExprTerms::Every(_) => new_body.push(self.plug_expr(m, inner)),
                }
            }
            every.body = Body::new(new_body);
            every.key = every
                .key
                .as_ref()
                .map(|k| m.binds.plug_namespaced(k, bid, caller));
            every.value = m.binds.plug_namespaced(&every.value, bid, caller);
            every.domain = m.binds.plug_namespaced(&every.domain, bid, caller);
            cpy.terms = ExprTerms::Every(Box::new(every));
        }
        cpy
    }
}

fn is_iterable_value(v: &Value) -> bool {
    matches!(v, Value::Array(_) | Value::Object(_) | Value::Set(_))
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: serde_json::Value) -> Object {
        match Value::from_json(&json).unwrap() {
            Value::Object(o) => o,
            other => panic!("expected object, got {}", other.type_name()),
        }
    }

    #[test]
    fn merge_prefers_replacement_on_non_objects() {
        let real = obj(serde_json::json!({"foo": "bar"}));
        let mock = obj(serde_json::json!({"foo": "blah"}));
        let merged = merge_objects(&mock, &real).unwrap();
        assert_eq!(merged, obj(serde_json::json!({"foo": "blah"})));
    }

    #[test]
    fn merge_recurses_into_objects() {
        let real = obj(serde_json::json!({
            "foo": {"foo1": {"foo11": [1, 2, 3], "foo12": "hello"}},
            "bar": "baz",
        }));
        let mock = obj(serde_json::json!({
            "foo": {"foo1": [1, 2, 3], "foo12": "world", "foo13": 123},
            "baz": "bar",
        }));
        let merged = merge_objects(&mock, &real).unwrap();
        assert_eq!(
            merged,
            obj(serde_json::json!({
                "foo": {"foo1": [1, 2, 3], "foo12": "world", "foo13": 123},
                "bar": "baz",
                "baz": "bar",
            }))
        );
    }

    #[test]
    fn with_patches_conflict_on_overlap() {
        // with input.a as 1 with input.a.b as 2
        let pairs = vec![
            (Ref::input(&["a"]), Term::int(1)),
            (Ref::input(&["a", "b"]), Term::int(2)),
        ];
        assert!(merge_term_with_values(None, &pairs).is_err());

        // disjoint paths merge
        let pairs = vec![
            (Ref::input(&["a"]), Term::int(1)),
            (Ref::input(&["b"]), Term::int(2)),
        ];
        let merged = merge_term_with_values(None, &pairs).unwrap().unwrap();
        assert_eq!(
            merged,
            Term::object(vec![
                (Term::string("a"), Term::int(1)),
                (Term::string("b"), Term::int(2)),
            ])
        );
    }

    #[test]
    fn with_replacement_overwrites_base_scalars() {
        let base = Term::object(vec![(Term::string("a"), Term::string("old"))]);
        let pairs = vec![(Ref::input(&["a"]), Term::int(1))];
        let merged = merge_term_with_values(Some(&base), &pairs).unwrap().unwrap();
        assert_eq!(
            merged,
            Term::object(vec![(Term::string("a"), Term::int(1))])
        );
    }

    #[test]
    fn operator_names_join_ref_segments() {
        assert_eq!(ref_operator_name(&Ref::operator("gt")), "gt");
        let r = Ref::new(vec![Term::var("time"), Term::string("now_ns")]);
        assert_eq!(ref_operator_name(&r), "time.now_ns");
    }

    #[test]
    fn negations_with_nested_refs_are_not_inlinable() {
        let safe = BTreeSet::new();
        // gt(input.x, 7) -- operand contains a ref
        let q = Body::new(vec![Expr::call(vec![
            Term::reference(Ref::operator("gt")),
            Term::reference(Ref::input(&["x"])),
            Term::int(7),
        ])]);
        assert!(!can_inline_negation(&safe, &[q]));
    }

    #[test]
    fn ground_single_expr_negations_are_inlinable() {
        let mut safe = BTreeSet::new();
        safe.insert("x".to_string());
        let q = Body::new(vec![Expr::call(vec![
            Term::reference(Ref::operator("gt")),
            Term::var("x"),
            Term::int(7),
        ])]);
        assert!(can_inline_negation(&safe, &[q]));
    }

    #[test]
    fn wrapping_builds_nested_objects() {
        let wrapped = wrap_in_objects_ref(
            Term::int(42),
            &[Term::string("a"), Term::string("b")],
        );
        assert_eq!(
            wrapped,
            Term::object(vec![(
                Term::string("a"),
                Term::object(vec![(Term::string("b"), Term::int(42))]),
            )])
        );
        assert_eq!(wrap_in_objects_ref(Term::int(1), &[]), Term::int(1));
    }

    #[test]
    fn constants_exclude_vars_refs_and_closures() {
        assert!(is_constant(&Value::Bool(true)));
        assert!(is_constant(
            &Term::array(vec![Term::int(1), Term::string("x")]).value
        ));
        assert!(!is_constant(&Value::Var("x".to_string())));
        assert!(!is_constant(
            &Term::array(vec![Term::reference(Ref::input(&[]))]).value
        ));
    }
}
