//! Query tracing.
//!
//! Tracers observe evaluation as a stream of events. Tracing is a pure
//! side effect: it must not change semantics, and event payloads are
//! snapshots with no lifetime ties into the evaluator.

use std::fmt;
use std::sync::{Arc, Mutex};

use arbiter_ast::{Body, Expr, Location, Ref, Rule, Term};

/// Operation tags for trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Enter,
    Exit,
    Eval,
    Redo,
    Fail,
    Duplicate,
    Save,
    Index,
    Unify,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Enter => "enter",
            Op::Exit => "exit",
            Op::Eval => "eval",
            Op::Redo => "redo",
            Op::Fail => "fail",
            Op::Duplicate => "duplicate",
            Op::Save => "save",
            Op::Index => "index",
            Op::Unify => "unify",
        };
        write!(f, "{}", s)
    }
}

/// The node an event refers to.
#[derive(Debug, Clone)]
pub enum Node {
    Body(Body),
    Expr(Expr),
    Rule(Arc<Rule>),
    Term(Term),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Body(b) => write!(f, "{}", b),
            Node::Expr(e) => write!(f, "{}", e),
            Node::Rule(r) => write!(f, "{}", r.path),
            Node::Term(t) => write!(f, "{}", t),
        }
    }
}

/// One trace event.
#[derive(Debug, Clone)]
pub struct Event {
    pub op: Op,
    pub query_id: u64,
    pub parent_id: u64,
    pub node: Node,
    pub location: Location,
    pub message: String,
    /// Target reference for index events.
    pub target: Option<Ref>,
    /// Plugged local variables, populated only when a tracer asks for
    /// them via its configuration.
    pub locals: Option<Vec<(Term, Term)>>,
}

/// Tracer configuration merged across all registered tracers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceConfig {
    /// Plug and attach local variable bindings to each event.
    pub plug_locals: bool,
}

/// Receives trace events for one query.
pub trait QueryTracer: Send {
    fn enabled(&self) -> bool {
        true
    }

    fn config(&self) -> TraceConfig {
        TraceConfig::default()
    }

    fn trace_event(&mut self, event: &Event);
}

/// A tracer that buffers events behind a shared handle.
pub struct BufferTracer {
    events: Arc<Mutex<Vec<Event>>>,
    plug_locals: bool,
}

impl BufferTracer {
    pub fn new() -> (Self, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            BufferTracer {
                events: events.clone(),
                plug_locals: false,
            },
            events,
        )
    }

    pub fn with_locals() -> (Self, Arc<Mutex<Vec<Event>>>) {
        let (mut t, h) = BufferTracer::new();
        t.plug_locals = true;
        (t, h)
    }
}

impl QueryTracer for BufferTracer {
    fn config(&self) -> TraceConfig {
        TraceConfig {
            plug_locals: self.plug_locals,
        }
    }

    fn trace_event(&mut self, event: &Event) {
        self.events.lock().expect("tracer lock poisoned").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_tracer_captures_events() {
        let (mut tracer, handle) = BufferTracer::new();
        tracer.trace_event(&Event {
            op: Op::Enter,
            query_id: 1,
            parent_id: 0,
            node: Node::Term(Term::bool(true)),
            location: Location::default(),
            message: String::new(),
            target: None,
            locals: None,
        });
        let events = handle.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, Op::Enter);
    }
}
