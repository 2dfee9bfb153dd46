//! The public query API.
//!
//! A `Query` bundles a compiled policy, a store, an input document, and
//! per-query options, and evaluates a conjunctive body. `run` returns
//! the satisfying variable bindings; `partial_run` returns the residual
//! queries and synthesised support modules instead.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use tracing::debug;

use arbiter_ast::{
    body_vars, Body, Compiler, Module, Ref, Term, Value, Var, VarVisitorParams, DATA_ROOT,
    FUNC_ARGS_ROOT, INPUT_ROOT,
};
use arbiter_storage::Store;

use crate::bindings::Bindings;
use crate::builtins::BuiltinRegistry;
use crate::cache::{
    BaseCache, ComprehensionCache, Instrument, NdbCache, VirtualCache,
};
use crate::cancel::Cancel;
use crate::errors::{Error, ErrorCode, Stop};
use crate::eval::{Frame, Machine};
use crate::save::{FunctionMocksStack, InliningControl, RefStack, SaveSet, SaveStack, SaveSupport};
use crate::trace::QueryTracer;

/// One solution: variable to plugged term.
pub type QueryResult = BTreeMap<Var, Term>;

/// The outcome of a full evaluation.
#[derive(Debug)]
pub struct QueryOutcome {
    pub results: Vec<QueryResult>,
    /// Built-in errors accumulated during the run.
    pub builtin_errors: Vec<Error>,
    pub instrument: Instrument,
}

/// The outcome of a partial evaluation: residual queries plus support
/// modules for residuals that could not be inlined.
#[derive(Debug)]
pub struct PartialOutcome {
    pub partials: Vec<Body>,
    pub support: Vec<Module>,
    pub instrument: Instrument,
}

/// Builder-style query configuration.
pub struct Query<'a> {
    compiler: &'a Compiler,
    store: &'a dyn Store,
    builtins: &'a BuiltinRegistry,
    query: Body,
    input: Option<Term>,
    data_overlay: Option<Term>,
    tracers: Vec<Box<dyn QueryTracer>>,
    plug_trace_vars: bool,
    cancel: Option<Arc<dyn Cancel>>,
    ndb_cache: Option<&'a Mutex<NdbCache>>,
    unknowns: Option<Vec<Term>>,
    partial_namespace: String,
    shallow_inlining: bool,
    skip_partial_namespace: bool,
    indexing: bool,
    early_exit: bool,
    seed_time_ns: Option<i64>,
}

impl<'a> Query<'a> {
    pub fn new(
        compiler: &'a Compiler,
        store: &'a dyn Store,
        builtins: &'a BuiltinRegistry,
        query: Body,
    ) -> Self {
        Query {
            compiler,
            store,
            builtins,
            query,
            input: None,
            data_overlay: None,
            tracers: Vec::new(),
            plug_trace_vars: false,
            cancel: None,
            ndb_cache: None,
            unknowns: None,
            partial_namespace: "partial".to_string(),
            shallow_inlining: false,
            skip_partial_namespace: false,
            indexing: true,
            early_exit: true,
            seed_time_ns: None,
        }
    }

    pub fn with_input(mut self, input: Term) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_data_overlay(mut self, data: Term) -> Self {
        self.data_overlay = Some(data);
        self
    }

    pub fn with_tracer(mut self, tracer: Box<dyn QueryTracer>) -> Self {
        self.plug_trace_vars = self.plug_trace_vars || tracer.config().plug_locals;
        self.tracers.push(tracer);
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<dyn Cancel>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_ndb_cache(mut self, cache: &'a Mutex<NdbCache>) -> Self {
        self.ndb_cache = Some(cache);
        self
    }

    /// Declare the unknowns for partial evaluation. Defaults to `input`.
    pub fn with_unknowns(mut self, unknowns: Vec<Term>) -> Self {
        self.unknowns = Some(unknowns);
        self
    }

    pub fn with_partial_namespace(mut self, ns: impl Into<String>) -> Self {
        self.partial_namespace = ns.into();
        self
    }

    pub fn with_shallow_inlining(mut self, shallow: bool) -> Self {
        self.shallow_inlining = shallow;
        self
    }

    pub fn without_indexing(mut self) -> Self {
        self.indexing = false;
        self
    }

    pub fn without_early_exit(mut self) -> Self {
        self.early_exit = false;
        self
    }

    pub fn with_seed_time_ns(mut self, ns: i64) -> Self {
        self.seed_time_ns = Some(ns);
        self
    }

    fn machine(&mut self, partial: bool) -> Result<Machine<'a>, Error> {
        let txn = self
            .store
            .begin_read()
            .map_err(|e| Error::internal(format!("storage: {}", e), Default::default()))?;

        let time_ns = self.seed_time_ns.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0)
        });

        Ok(Machine {
            compiler: self.compiler,
            store: self.store,
            txn,
            builtins: self.builtins,
            binds: Bindings::new(),
            virtual_cache: VirtualCache::new(),
            base_cache: BaseCache::new(),
            comp_cache: ComprehensionCache::new(),
            ndb_cache: self.ndb_cache,
            instr: Instrument::new(),
            partial,
            save_set: SaveSet::new(),
            save_stack: SaveStack::new(),
            save_support: SaveSupport::new(),
            save_namespace: self.partial_namespace.clone(),
            skip_save_namespace: self.skip_partial_namespace,
            inlining: InliningControl::new(self.shallow_inlining),
            mocks: FunctionMocksStack::new(),
            targets: RefStack::new(),
            input: self.input.clone(),
            data: self.data_overlay.clone(),
            cancel: self.cancel.clone(),
            tracers: std::mem::take(&mut self.tracers),
            trace_enabled: false,
            plug_trace_vars: self.plug_trace_vars,
            builtin_errors: Vec::new(),
            query_id_seq: 0,
            genvar_seq: 0,
            genvar_prefix: "__local".to_string(),
            indexing: self.indexing,
            early_exit_enabled: self.early_exit,
            time: Term::number(Decimal::from(time_ns)),
            caller_bid: 0,
            index_args: None,
        })
    }

    /// The variables of the query body that belong in results: not
    /// document roots, not wildcards, not generated, not local to a
    /// closure.
    fn result_vars(&self) -> Vec<Var> {
        body_vars(
            &self.query,
            VarVisitorParams {
                skip_closures: true,
                ..Default::default()
            },
        )
            .into_iter()
            .filter(|v| {
                v != DATA_ROOT
                    && v != INPUT_ROOT
                    && v != FUNC_ARGS_ROOT
                    && !v.starts_with('$')
                    && !v.starts_with("__")
            })
            .collect()
    }

    /// Evaluate the query and return the set of satisfying bindings.
    pub fn run(mut self) -> Result<QueryOutcome, Error> {
        debug!(exprs = self.query.len(), "query run");

        let mut m = self.machine(false)?;
        m.trace_enabled = !m.tracers.is_empty();

        let root_bid = m.binds.new_frame();
        m.caller_bid = root_bid;
        let root = Frame {
            query: Rc::new(self.query.clone()),
            index: 0,
            query_id: m.query_id_seq,
            parent_id: 0,
            bid: root_bid,
            find_one: false,
        };
        m.query_id_seq += 1;

        let vars = self.result_vars();
        let mut results: Vec<QueryResult> = Vec::new();

        let res = m.run_frame(&root, &mut |m, fr| {
            let mut row = QueryResult::new();
            for v in &vars {
                let plugged = m.binds.plug(&Term::var(v.clone()), fr.bid);
                let name = m
                    .compiler
                    .rewritten_var(v)
                    .cloned()
                    .unwrap_or_else(|| v.clone());
                row.insert(name, plugged);
            }
            results.push(row);
            Ok(())
        });

        let txn = m.txn;
        self.store.abort(txn);

        match res {
            Ok(()) | Err(Stop::EarlyExit) | Err(Stop::DeferredEarlyExit) => {}
            Err(Stop::Fatal(e)) => return Err(e),
        }

        debug!(solutions = results.len(), "query complete");
        Ok(QueryOutcome {
            results,
            builtin_errors: m.builtin_errors,
            instrument: m.instr,
        })
    }

    /// Partially evaluate the query: return the residual query set and
    /// the synthesised support modules.
    pub fn partial_run(mut self) -> Result<PartialOutcome, Error> {
        debug!(exprs = self.query.len(), "partial query run");

        let unknowns = self
            .unknowns
            .clone()
            .unwrap_or_else(|| vec![Term::reference(Ref::new(vec![Term::var(INPUT_ROOT)]))]);

        let mut m = self.machine(true)?;
        m.trace_enabled = !m.tracers.is_empty();

        let root_bid = m.binds.new_frame();
        m.caller_bid = root_bid;
        m.save_set.push(unknowns, root_bid);

        let root = Frame {
            query: Rc::new(self.query.clone()),
            index: 0,
            query_id: m.query_id_seq,
            parent_id: 0,
            bid: root_bid,
            find_one: false,
        };
        m.query_id_seq += 1;

        let mut partials: Vec<Body> = Vec::new();

        let res = m.run_frame(&root, &mut |m, _| {
            let saved = m.save_stack.peek().to_vec();
            partials.push(m.plug_saved(&saved, m.caller_bid));
            Ok(())
        });

        let txn = m.txn;
        self.store.abort(txn);

        match res {
            Ok(()) | Err(Stop::EarlyExit) | Err(Stop::DeferredEarlyExit) => {}
            Err(Stop::Fatal(e)) => return Err(e),
        }

        debug!(partials = partials.len(), "partial query complete");
        Ok(PartialOutcome {
            partials,
            support: m.save_support.into_modules(),
            instrument: m.instr,
        })
    }

    /// Resolve one reference the way built-ins and the rule index see
    /// values: input, overlay, base cache, then storage.
    pub fn resolve(mut self, reference: &Ref) -> Result<Option<Value>, Error> {
        let mut m = self.machine(false)?;
        let root_bid = m.binds.new_frame();
        m.caller_bid = root_bid;
        let out = m.resolve(reference);
        let txn = m.txn;
        self.store.abort(txn);
        match out {
            Err(e) if e.code == ErrorCode::UnknownValue => Ok(None),
            other => other,
        }
    }
}
