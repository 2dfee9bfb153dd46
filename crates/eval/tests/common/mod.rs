//! Shared fixtures for evaluator integration tests.

#![allow(dead_code)]

use arbiter_ast::{
    Body, Compiler, Expr, Head, Module, Package, Ref, Rule, Term, Value,
};
use arbiter_eval::{BuiltinRegistry, Query, QueryOutcome, QueryResult};
use arbiter_storage::MemoryStore;

pub fn eq(a: Term, b: Term) -> Expr {
    Expr::equality(a, b)
}

pub fn op_call(name: &str, args: Vec<Term>) -> Expr {
    Expr::call(
        std::iter::once(Term::reference(Ref::operator(name)))
            .chain(args)
            .collect(),
    )
}

pub fn gt(a: Term, b: Term) -> Expr {
    op_call("gt", vec![a, b])
}

pub fn input_term(path: &[&str]) -> Term {
    Term::reference(Ref::input(path))
}

pub fn data_term(path: &[&str]) -> Term {
    Term::reference(Ref::data(path))
}

pub fn truthy() -> Body {
    Body::from_expr(Expr::term(Term::bool(true)))
}

/// One module under `data.test` with the given rules.
pub fn test_module(rules: Vec<Rule>) -> Module {
    Module::new(Package::new(Ref::data(&["test"])), rules)
}

pub fn compile(modules: Vec<Module>) -> Compiler {
    Compiler::new()
        .with_modules(modules)
        .expect("modules compile")
}

pub fn single_rule(name: &str, value: Term, body: Body) -> Rule {
    Rule::new(Head::single(Ref::operator(name), value), body)
}

/// Run a query against a compiled policy and store, panicking on fatal
/// errors.
pub fn run(
    compiler: &Compiler,
    store: &MemoryStore,
    query: Body,
    input: Option<serde_json::Value>,
) -> QueryOutcome {
    let builtins = BuiltinRegistry::defaults();
    let mut q = Query::new(compiler, store, &builtins, query);
    if let Some(input) = input {
        q = q.with_input(Term::new(Value::from_json(&input).expect("valid input")));
    }
    q.run().expect("query run")
}

/// The plugged binding for `name` in a result row.
pub fn binding<'a>(row: &'a QueryResult, name: &str) -> &'a Term {
    row.get(name)
        .unwrap_or_else(|| panic!("binding {} missing: {:?}", name, row))
}

pub fn json_term(v: serde_json::Value) -> Term {
    Term::new(Value::from_json(&v).expect("valid json"))
}
