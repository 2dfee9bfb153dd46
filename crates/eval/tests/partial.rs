//! Partial evaluation: residual queries and support modules.

mod common;

use arbiter_ast::{Body, Every, Expr, ExprTerms, Ref, Term};
use arbiter_eval::{BuiltinRegistry, Query};
use arbiter_storage::MemoryStore;

use common::*;

fn partial(
    compiler: &arbiter_ast::Compiler,
    store: &MemoryStore,
    query: Body,
) -> arbiter_eval::PartialOutcome {
    let builtins = BuiltinRegistry::defaults();
    Query::new(compiler, store, &builtins, query)
        .partial_run()
        .expect("partial run")
}

#[test]
fn unknown_input_residualises_builtin_calls() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // input.x > 0 with input unknown
    let query = Body::from_expr(gt(input_term(&["x"]), Term::int(0)));
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert_eq!(out.partials[0].to_string(), "gt(input.x, 0)");
    assert!(out.support.is_empty());
}

#[test]
fn ground_queries_produce_empty_residuals() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(eq(Term::int(1), Term::int(1)));
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert!(out.partials[0].is_empty());
}

#[test]
fn equality_negations_inline_the_complement() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // not input.x = 1
    let query = Body::from_expr(eq(input_term(&["x"]), Term::int(1)).negate());
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert_eq!(out.partials[0].to_string(), "not input.x = 1");
    assert!(out.support.is_empty());
}

#[test]
fn negations_over_calls_emit_support_rules() {
    // p if { input.x > 0 }; querying `not data.test.p` cannot inline the
    // complement of a call, so a support rule is synthesised.
    let rule = single_rule(
        "p",
        Term::bool(true),
        Body::from_expr(gt(input_term(&["x"]), Term::int(0))),
    );
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(Expr::term(data_term(&["test", "p"])).negate());
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert!(out.partials[0][0].negated);

    assert_eq!(out.support.len(), 1);
    let module = &out.support[0];
    assert_eq!(module.package.path, Ref::data(&["partial"]));
    assert_eq!(module.rules.len(), 1);
    assert_eq!(module.rules[0].body.to_string(), "gt(input.x, 0)");

    // the residual refers to the synthesised rule
    let residual = out.partials[0][0].to_string();
    assert!(
        residual.starts_with("not data.partial.__not"),
        "unexpected residual: {}",
        residual
    );
}

#[test]
fn complete_rules_inline_their_bodies() {
    let rule = single_rule(
        "allow",
        Term::bool(true),
        Body::from_expr(eq(input_term(&["m"]), Term::string("GET"))),
    );
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::empty();

    // data.test.allow = true
    let query = Body::from_expr(eq(data_term(&["test", "allow"]), Term::bool(true)));
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert_eq!(out.partials[0].to_string(), "input.m = \"GET\"");
    assert!(out.support.is_empty());
}

#[test]
fn unknown_domains_save_every_expressions() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // every x in input.xs { x > 0 }
    let every = Every {
        key: None,
        value: Term::var("x"),
        domain: input_term(&["xs"]),
        body: Body::from_expr(gt(Term::var("x"), Term::int(0))),
    };
    let query = Body::from_expr(Expr::every(every));
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert_eq!(out.partials[0].len(), 1);
    assert!(matches!(
        out.partials[0][0].terms,
        ExprTerms::Every(_)
    ));
}

#[test]
fn residuals_keep_with_clauses_on_unknown_replacements() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // input.y = 1 with input.y as input.x  -- the replacement value is
    // itself unknown, so the whole expression is saved as-is
    let query = Body::from_expr(
        eq(input_term(&["y"]), Term::int(1)).with_clause(arbiter_ast::With::new(
            input_term(&["y"]),
            input_term(&["x"]),
        )),
    );
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert_eq!(out.partials[0].len(), 1);
    assert_eq!(out.partials[0][0].with.len(), 1);
}

#[test]
fn function_calls_with_unknown_args_call_support_rules() {
    // f(a) := true if { a > 0 } with a default, forcing support
    let def = arbiter_ast::Rule::new(
        arbiter_ast::Head::func("f", vec![Term::var("a")], Term::bool(true)),
        Body::default(),
    )
    .as_default();
    let rule = arbiter_ast::Rule::new(
        arbiter_ast::Head::func("f", vec![Term::var("a")], Term::bool(true)),
        Body::from_expr(gt(Term::var("a"), Term::int(0))),
    );
    let compiler = compile(vec![test_module(vec![rule, def])]);
    let store = MemoryStore::empty();

    // data.test.f(input.x, y)
    let query = Body::from_expr(Expr::call(vec![
        data_term(&["test", "f"]),
        input_term(&["x"]),
        Term::var("y"),
    ]));
    let out = partial(&compiler, &store, query);

    assert_eq!(out.partials.len(), 1);
    assert!(!out.support.is_empty());
    let residual = out.partials[0].to_string();
    assert!(
        residual.contains("data.partial.test.f"),
        "unexpected residual: {}",
        residual
    );
}
