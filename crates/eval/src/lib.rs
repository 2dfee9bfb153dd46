//! arbiter-eval: the top-down policy evaluator.
//!
//! The evaluator accepts a compiled policy and a query (a conjunctive
//! body of expressions), resolves references against the base data tree
//! and the caller-supplied input, dispatches rules and built-ins, and
//! produces the variable bindings for which the query succeeds. A
//! second mode, partial evaluation, produces a residual program when
//! parts of the input are declared unknown.
//!
//! # Public API
//!
//! - [`Query`] -- builder-style configuration, [`Query::run`] and
//!   [`Query::partial_run`]
//! - [`BuiltinRegistry`] -- built-in function registry
//! - [`CancelHandle`] -- cooperative cancellation and deadlines
//! - [`BufferTracer`] -- event capture for tests and debugging
//! - [`NdbCache`] -- cache for non-deterministic built-ins

mod bindings;
mod builtins;
mod cache;
mod cancel;
mod copyprop;
mod errors;
mod eval;
mod query;
mod resolver;
mod save;
mod trace;

pub use builtins::{Builtin, BuiltinContext, BuiltinDecl, BuiltinFn, BuiltinRegistry};
pub use cache::{
    Instrument, NdbCache, COUNTER_BASE_CACHE_HIT, COUNTER_BASE_CACHE_MISS,
    COUNTER_COMPREHENSION_CACHE_BUILD, COUNTER_COMPREHENSION_CACHE_HIT,
    COUNTER_COMPREHENSION_CACHE_MISS, COUNTER_COMPREHENSION_CACHE_SKIP,
    COUNTER_VIRTUAL_CACHE_HIT, COUNTER_VIRTUAL_CACHE_MISS,
};
pub use cancel::{Cancel, CancelHandle};
pub use errors::{Error, ErrorCode};
pub use query::{PartialOutcome, Query, QueryOutcome, QueryResult};
pub use trace::{BufferTracer, Event, Node, Op, QueryTracer, TraceConfig};
