//! End-to-end evaluation through the public query API.

mod common;

use arbiter_ast::{
    ArrayComprehension, Body, Every, Expr, Head, Module, Package, Ref, Rule, Term, Value,
};
use arbiter_eval::{
    BuiltinRegistry, CancelHandle, ErrorCode, Query, COUNTER_VIRTUAL_CACHE_HIT,
    COUNTER_VIRTUAL_CACHE_MISS,
};
use arbiter_storage::MemoryStore;
use std::sync::Arc;

use common::*;

#[test]
fn array_indexing_enumerates_all_indices() {
    // [1, 2][x] = y
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    let arr = Term::array(vec![Term::int(1), Term::int(2)]);
    let query = Body::from_expr(eq(
        Term::reference(Ref::new(vec![arr, Term::var("x")])),
        Term::var("y"),
    ));

    let out = run(&compiler, &store, query, None);
    assert_eq!(out.results.len(), 2);
    assert_eq!(binding(&out.results[0], "x"), &Term::int(0));
    assert_eq!(binding(&out.results[0], "y"), &Term::int(1));
    assert_eq!(binding(&out.results[1], "x"), &Term::int(1));
    assert_eq!(binding(&out.results[1], "y"), &Term::int(2));
}

#[test]
fn partial_object_rule_builds_indexed_object() {
    // q[k] := v if { v := ["do", "re", "mi"][k] }  queried as data.test.q = x
    let notes = Term::array(vec![
        Term::string("do"),
        Term::string("re"),
        Term::string("mi"),
    ]);
    let rule = Rule::new(
        Head::single(
            Ref::new(vec![Term::var("q"), Term::var("k")]),
            Term::var("v"),
        ),
        Body::from_expr(eq(
            Term::reference(Ref::new(vec![notes, Term::var("k")])),
            Term::var("v"),
        )),
    );
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(eq(data_term(&["test", "q"]), Term::var("x")));
    let out = run(&compiler, &store, query, None);

    assert_eq!(out.results.len(), 1);
    assert_eq!(
        binding(&out.results[0], "x"),
        &Term::object(vec![
            (Term::int(0), Term::string("do")),
            (Term::int(1), Term::string("re")),
            (Term::int(2), Term::string("mi")),
        ])
    );
}

#[test]
fn complete_rules_memoise_with_a_single_miss() {
    // allow if input.m == "GET"; allow if input.m == "POST"
    let r1 = single_rule(
        "allow",
        Term::bool(true),
        Body::from_expr(eq(input_term(&["m"]), Term::string("GET"))),
    );
    let r2 = single_rule(
        "allow",
        Term::bool(true),
        Body::from_expr(eq(input_term(&["m"]), Term::string("POST"))),
    );
    let compiler = compile(vec![test_module(vec![r1, r2])]);
    let store = MemoryStore::empty();

    // read the rule twice in one query
    let query = Body::new(vec![
        eq(data_term(&["test", "allow"]), Term::var("x")),
        eq(data_term(&["test", "allow"]), Term::var("y")),
    ]);
    let out = run(
        &compiler,
        &store,
        query,
        Some(serde_json::json!({"m": "GET"})),
    );

    assert_eq!(out.results.len(), 1);
    assert_eq!(binding(&out.results[0], "x"), &Term::bool(true));
    assert_eq!(binding(&out.results[0], "y"), &Term::bool(true));
    assert_eq!(out.instrument.counter(COUNTER_VIRTUAL_CACHE_MISS), 1);
    assert_eq!(out.instrument.counter(COUNTER_VIRTUAL_CACHE_HIT), 1);
}

#[test]
fn dynamic_key_conflicts_with_nested_path() {
    // p[k] := 1 if k == "q"  and  p.q.r.s.t := 42  conflict on the q prefix
    let dynamic = Rule::new(
        Head::single(
            Ref::new(vec![Term::var("p"), Term::var("k")]),
            Term::int(1),
        ),
        Body::from_expr(eq(Term::var("k"), Term::string("q"))),
    );
    let nested = Rule::new(
        Head::single(
            Ref::new(vec![
                Term::var("p"),
                Term::string("q"),
                Term::string("r"),
                Term::string("s"),
                Term::string("t"),
            ]),
            Term::int(42),
        ),
        truthy(),
    );
    let compiler = compile(vec![test_module(vec![dynamic, nested])]);
    let store = MemoryStore::empty();
    let builtins = BuiltinRegistry::defaults();

    let query = Body::from_expr(eq(data_term(&["test", "p"]), Term::var("x")));
    let err = Query::new(&compiler, &store, &builtins, query)
        .run()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[test]
fn disjoint_dynamic_and_nested_keys_merge() {
    // p[k] := v if k == "k"  and  p.k2.sub := w  merge into one object
    let dynamic = Rule::new(
        Head::single(
            Ref::new(vec![Term::var("p"), Term::var("k")]),
            Term::int(1),
        ),
        Body::from_expr(eq(Term::var("k"), Term::string("k"))),
    );
    let nested = Rule::new(
        Head::single(
            Ref::new(vec![
                Term::var("p"),
                Term::string("k2"),
                Term::string("sub"),
            ]),
            Term::int(2),
        ),
        truthy(),
    );
    let compiler = compile(vec![test_module(vec![dynamic, nested])]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(eq(data_term(&["test", "p"]), Term::var("x")));
    let out = run(&compiler, &store, query, None);
    assert_eq!(out.results.len(), 1);
    assert_eq!(
        binding(&out.results[0], "x"),
        &json_term(serde_json::json!({"k": 1, "k2": {"sub": 2}}))
    );
}

#[test]
fn every_quantifier_over_iterable_domains() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // every x in [1, 2, 3] { x > 0 }
    let every = Every {
        key: None,
        value: Term::var("x"),
        domain: Term::array(vec![Term::int(1), Term::int(2), Term::int(3)]),
        body: Body::from_expr(gt(Term::var("x"), Term::int(0))),
    };
    let out = run(&compiler, &store, Body::from_expr(Expr::every(every)), None);
    assert_eq!(out.results.len(), 1);
    assert!(out.results[0].is_empty());

    // one element fails
    let every = Every {
        key: None,
        value: Term::var("x"),
        domain: Term::array(vec![Term::int(1), Term::int(-1)]),
        body: Body::from_expr(gt(Term::var("x"), Term::int(0))),
    };
    let out = run(&compiler, &store, Body::from_expr(Expr::every(every)), None);
    assert!(out.results.is_empty());

    // a non-iterable domain fails silently
    let every = Every {
        key: None,
        value: Term::var("x"),
        domain: Term::string("not iterable"),
        body: Body::from_expr(gt(Term::var("x"), Term::int(0))),
    };
    let out = run(&compiler, &store, Body::from_expr(Expr::every(every)), None);
    assert!(out.results.is_empty());
}

#[test]
fn negation_holds_iff_positive_has_no_solution() {
    let rule = single_rule(
        "deny",
        Term::bool(true),
        Body::from_expr(eq(input_term(&["role"]), Term::string("guest"))),
    );
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(Expr::term(data_term(&["test", "deny"])).negate());

    let out = run(
        &compiler,
        &store,
        query.clone(),
        Some(serde_json::json!({"role": "admin"})),
    );
    assert_eq!(out.results.len(), 1);

    let out = run(
        &compiler,
        &store,
        query,
        Some(serde_json::json!({"role": "guest"})),
    );
    assert!(out.results.is_empty());
}

#[test]
fn else_chains_fire_in_order() {
    // p := 1 if false  else := 2 if false  else := 3
    let e2 = single_rule("p", Term::int(3), truthy());
    let e1 = single_rule(
        "p",
        Term::int(2),
        Body::from_expr(Expr::term(Term::bool(false))),
    )
    .with_else(e2);
    let primary = single_rule(
        "p",
        Term::int(1),
        Body::from_expr(Expr::term(Term::bool(false))),
    )
    .with_else(e1);

    let compiler = compile(vec![test_module(vec![primary])]);
    let store = MemoryStore::empty();
    let query = Body::from_expr(eq(data_term(&["test", "p"]), Term::var("x")));
    let out = run(&compiler, &store, query, None);
    assert_eq!(out.results.len(), 1);
    assert_eq!(binding(&out.results[0], "x"), &Term::int(3));
}

#[test]
fn default_rules_apply_when_undefined() {
    let def = single_rule("allow", Term::bool(false), Body::default()).as_default();
    let rule = single_rule(
        "allow",
        Term::bool(true),
        Body::from_expr(eq(input_term(&["admin"]), Term::bool(true))),
    );
    let compiler = compile(vec![test_module(vec![def, rule])]);
    let store = MemoryStore::empty();
    let query = Body::from_expr(eq(data_term(&["test", "allow"]), Term::var("x")));

    let out = run(
        &compiler,
        &store,
        query.clone(),
        Some(serde_json::json!({"admin": true})),
    );
    assert_eq!(binding(&out.results[0], "x"), &Term::bool(true));

    let out = run(&compiler, &store, query, Some(serde_json::json!({})));
    assert_eq!(binding(&out.results[0], "x"), &Term::bool(false));
}

#[test]
fn complete_rules_conflict_on_distinct_values() {
    let r1 = single_rule("v", Term::int(1), truthy());
    let r2 = single_rule("v", Term::int(2), truthy());
    let compiler = compile(vec![test_module(vec![r1, r2])]);
    let store = MemoryStore::empty();
    let builtins = BuiltinRegistry::defaults();

    let query = Body::from_expr(eq(data_term(&["test", "v"]), Term::var("x")));
    let err = Query::new(&compiler, &store, &builtins, query)
        .run()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[test]
fn functions_apply_by_positional_unification() {
    // incr(a) := b if { plus(a, 1, b) }
    let rule = Rule::new(
        Head::func("incr", vec![Term::var("a")], Term::var("b")),
        Body::from_expr(op_call(
            "plus",
            vec![Term::var("a"), Term::int(1), Term::var("b")],
        )),
    );
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::empty();

    // incr(5, y); incr(5, z) -- second call served from the cache
    let call = |out: &str| {
        Expr::call(vec![
            data_term(&["test", "incr"]),
            Term::int(5),
            Term::var(out),
        ])
    };
    let query = Body::new(vec![call("y"), call("z")]);
    let out = run(&compiler, &store, query, None);

    assert_eq!(out.results.len(), 1);
    assert_eq!(binding(&out.results[0], "y"), &Term::int(6));
    assert_eq!(binding(&out.results[0], "z"), &Term::int(6));
    assert_eq!(out.instrument.counter(COUNTER_VIRTUAL_CACHE_HIT), 1);
}

#[test]
fn functions_conflict_on_distinct_outputs() {
    let r1 = Rule::new(
        Head::func("f", vec![Term::var("a")], Term::int(1)),
        truthy(),
    );
    let r2 = Rule::new(
        Head::func("f", vec![Term::var("a")], Term::int(2)),
        truthy(),
    );
    let compiler = compile(vec![test_module(vec![r1, r2])]);
    let store = MemoryStore::empty();
    let builtins = BuiltinRegistry::defaults();

    let query = Body::from_expr(Expr::call(vec![
        data_term(&["test", "f"]),
        Term::int(0),
        Term::var("y"),
    ]));
    let err = Query::new(&compiler, &store, &builtins, query)
        .run()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[test]
fn multi_value_rules_accumulate_set_members() {
    // s contains x for x in 1, 2 plus membership lookup
    let r1 = Rule::new(Head::multi(Ref::operator("s"), Term::int(1)), truthy());
    let r2 = Rule::new(Head::multi(Ref::operator("s"), Term::int(2)), truthy());
    let compiler = compile(vec![test_module(vec![r1, r2])]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(eq(data_term(&["test", "s"]), Term::var("x")));
    let out = run(&compiler, &store, query, None);
    assert_eq!(
        binding(&out.results[0], "x"),
        &Term::set(vec![Term::int(1), Term::int(2)])
    );

    // enumerate members through the reference
    let query = Body::from_expr(eq(
        Term::reference(Ref::new(vec![
            Term::var("data"),
            Term::string("test"),
            Term::string("s"),
            Term::var("m"),
        ])),
        Term::var("v"),
    ));
    let out = run(&compiler, &store, query, None);
    assert_eq!(out.results.len(), 2);
    assert_eq!(binding(&out.results[0], "m"), &Term::int(1));
    assert_eq!(binding(&out.results[1], "m"), &Term::int(2));
}

#[test]
fn with_replaces_input_for_one_expression_only() {
    let rule = single_rule(
        "allow",
        Term::bool(true),
        Body::from_expr(eq(input_term(&["m"]), Term::string("GET"))),
    );
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::empty();

    // data.test.allow = x with input.m as "GET";
    // not data.test.allow        (under the outer input, m == "POST")
    let query = Body::new(vec![
        eq(data_term(&["test", "allow"]), Term::var("x")).with_clause(arbiter_ast::With::new(
            input_term(&["m"]),
            Term::string("GET"),
        )),
        Expr::term(data_term(&["test", "allow"])).negate(),
    ]);
    let out = run(
        &compiler,
        &store,
        query,
        Some(serde_json::json!({"m": "POST"})),
    );

    // the with-scoped read sees GET; the later read sees POST and is
    // undefined, so the negation holds
    assert_eq!(out.results.len(), 1);
    assert_eq!(binding(&out.results[0], "x"), &Term::bool(true));
}

#[test]
fn base_and_virtual_documents_merge_in_extents() {
    let rule = single_rule("computed", Term::int(2), truthy());
    let compiler = compile(vec![test_module(vec![rule])]);
    let store = MemoryStore::new(serde_json::json!({
        "test": {"stored": 1},
    }));

    let query = Body::from_expr(eq(data_term(&["test"]), Term::var("x")));
    let out = run(&compiler, &store, query, None);
    assert_eq!(out.results.len(), 1);
    assert_eq!(
        binding(&out.results[0], "x"),
        &Term::object(vec![
            (Term::string("computed"), Term::int(2)),
            (Term::string("stored"), Term::int(1)),
        ])
    );
}

#[test]
fn comprehensions_materialise_on_unification() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // [v | v := [3, 1, 2][_]] = x  -- preserves enumeration order
    let arr = Term::array(vec![Term::int(3), Term::int(1), Term::int(2)]);
    let compr = ArrayComprehension {
        term: Term::var("v"),
        body: Body::from_expr(eq(
            Term::reference(Ref::new(vec![arr, Term::var("$i")])),
            Term::var("v"),
        )),
    };
    let query = Body::from_expr(eq(
        Term::new(Value::ArrayCompr(Box::new(compr))),
        Term::var("x"),
    ));
    let out = run(&compiler, &store, query, None);
    assert_eq!(
        binding(&out.results[0], "x"),
        &Term::array(vec![Term::int(3), Term::int(1), Term::int(2)])
    );
}

#[test]
fn builtin_errors_accumulate_without_aborting() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    // div(1, 0, x) records an error and yields no solutions
    let query = Body::from_expr(op_call(
        "div",
        vec![Term::int(1), Term::int(0), Term::var("x")],
    ));
    let out = run(&compiler, &store, query, None);
    assert!(out.results.is_empty());
    assert_eq!(out.builtin_errors.len(), 1);
    assert!(out.builtin_errors[0].message.contains("divide by zero"));
}

#[test]
fn cancelled_queries_fail_with_cancel() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();
    let builtins = BuiltinRegistry::defaults();

    let cancel = Arc::new(CancelHandle::new());
    cancel.cancel();

    let query = Body::from_expr(eq(Term::int(1), Term::int(1)));
    let err = Query::new(&compiler, &store, &builtins, query)
        .with_cancel(cancel)
        .run()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancel);
}

#[test]
fn undefined_input_paths_are_not_errors() {
    let compiler = compile(vec![]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(eq(input_term(&["missing", "path"]), Term::var("x")));
    let out = run(&compiler, &store, query, Some(serde_json::json!({"a": 1})));
    assert!(out.results.is_empty());
    assert!(out.builtin_errors.is_empty());
}

#[test]
fn hidden_system_document_is_stripped_from_root_reads() {
    let compiler = compile(vec![]);
    let store = MemoryStore::new(serde_json::json!({
        "visible": 1,
        "system": {"internal": true},
    }));

    let query = Body::from_expr(eq(
        Term::reference(Ref::new(vec![Term::var("data")])),
        Term::var("x"),
    ));
    let out = run(&compiler, &store, query, None);
    assert_eq!(
        binding(&out.results[0], "x"),
        &Term::object(vec![(Term::string("visible"), Term::int(1))])
    );
}

#[test]
fn rules_nested_under_packages_appear_in_parent_extents() {
    let module = Module::new(
        Package::new(Ref::data(&["test", "inner"])),
        vec![single_rule("flag", Term::bool(true), truthy())],
    );
    let compiler = compile(vec![module]);
    let store = MemoryStore::empty();

    let query = Body::from_expr(eq(data_term(&["test"]), Term::var("x")));
    let out = run(&compiler, &store, query, None);
    assert_eq!(
        binding(&out.results[0], "x"),
        &json_term(serde_json::json!({"inner": {"flag": true}}))
    );
}
