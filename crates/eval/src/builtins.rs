//! Built-in function registry and the shipped implementations.
//!
//! A built-in receives plugged operands and yields at most one output
//! term; `None` means the call is undefined. Arithmetic is all
//! `rust_decimal` with checked operations -- overflow is an evaluation
//! error, never a panic, and `f64` never appears.

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;

use arbiter_ast::{Location, Term, Value};

use crate::cancel::Cancel;
use crate::errors::Error;

/// Declaration of a built-in: arity and evaluation properties.
#[derive(Debug, Clone)]
pub struct BuiltinDecl {
    pub name: &'static str,
    pub arity: usize,
    /// Non-deterministic built-ins are eligible for the ND cache.
    pub nondeterministic: bool,
    /// Whether the built-in declares a result. Result-less built-ins are
    /// pure effects; their continuation runs unconditionally.
    pub has_result: bool,
}

/// Context passed to each built-in invocation.
pub struct BuiltinContext<'a> {
    pub location: Location,
    pub query_id: u64,
    pub parent_id: u64,
    /// Query-start wall clock, nanoseconds. Fixed per query so repeated
    /// reads agree.
    pub time: &'a Term,
    pub cancel: Option<&'a dyn Cancel>,
}

impl fmt::Debug for BuiltinContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinContext")
            .field("location", &self.location)
            .field("query_id", &self.query_id)
            .finish()
    }
}

pub type BuiltinFn = fn(&BuiltinContext<'_>, &[Term]) -> Result<Option<Term>, Error>;

pub struct Builtin {
    pub decl: BuiltinDecl,
    pub func: BuiltinFn,
}

/// Name-to-implementation map consulted by call dispatch.
pub struct BuiltinRegistry {
    map: HashMap<&'static str, Builtin>,
}

impl BuiltinRegistry {
    pub fn empty() -> Self {
        BuiltinRegistry {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.map.get(name)
    }

    pub fn register(
        &mut self,
        name: &'static str,
        arity: usize,
        nondeterministic: bool,
        func: BuiltinFn,
    ) {
        self.map.insert(
            name,
            Builtin {
                decl: BuiltinDecl {
                    name,
                    arity,
                    nondeterministic,
                    has_result: true,
                },
                func,
            },
        );
    }

    /// The standard registry: comparison, arithmetic, aggregates, string
    /// helpers, and the clock.
    pub fn defaults() -> Self {
        let mut r = BuiltinRegistry::empty();
        r.register("equal", 2, false, bi_equal);
        r.register("neq", 2, false, bi_neq);
        r.register("lt", 2, false, bi_lt);
        r.register("lte", 2, false, bi_lte);
        r.register("gt", 2, false, bi_gt);
        r.register("gte", 2, false, bi_gte);
        r.register("plus", 2, false, bi_plus);
        r.register("minus", 2, false, bi_minus);
        r.register("mul", 2, false, bi_mul);
        r.register("div", 2, false, bi_div);
        r.register("rem", 2, false, bi_rem);
        r.register("abs", 1, false, bi_abs);
        r.register("count", 1, false, bi_count);
        r.register("sum", 1, false, bi_sum);
        r.register("max", 1, false, bi_max);
        r.register("min", 1, false, bi_min);
        r.register("concat", 2, false, bi_concat);
        r.register("startswith", 2, false, bi_startswith);
        r.register("endswith", 2, false, bi_endswith);
        r.register("time.now_ns", 0, true, bi_time_now_ns);
        r
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        BuiltinRegistry::defaults()
    }
}

// ──────────────────────────────────────────────
// Operand helpers
// ──────────────────────────────────────────────

fn as_number(name: &str, t: &Term, loc: Location) -> Result<Decimal, Error> {
    match &t.value {
        Value::Number(d) => Ok(*d),
        other => Err(Error::builtin(
            name,
            format!("operand must be number, got {}", other.type_name()),
            loc,
        )),
    }
}

fn as_string<'a>(name: &str, t: &'a Term, loc: Location) -> Result<&'a str, Error> {
    match &t.value {
        Value::String(s) => Ok(s),
        other => Err(Error::builtin(
            name,
            format!("operand must be string, got {}", other.type_name()),
            loc,
        )),
    }
}

fn number_elems<'a>(
    name: &str,
    t: &'a Term,
    loc: Location,
) -> Result<Vec<&'a Term>, Error> {
    let elems: Vec<&Term> = match &t.value {
        Value::Array(a) => a.iter().collect(),
        Value::Set(s) => s.iter().collect(),
        other => {
            return Err(Error::builtin(
                name,
                format!("operand must be array or set, got {}", other.type_name()),
                loc,
            ))
        }
    };
    for e in &elems {
        if !matches!(e.value, Value::Number(_)) {
            return Err(Error::builtin(
                name,
                format!("operand must contain numbers, got {}", e.value.type_name()),
                loc,
            ));
        }
    }
    Ok(elems)
}

fn bool_term(b: bool) -> Option<Term> {
    Some(Term::bool(b))
}

// ──────────────────────────────────────────────
// Comparison
// ──────────────────────────────────────────────

fn bi_equal(_: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(bool_term(ops[0] == ops[1]))
}

fn bi_neq(_: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(bool_term(ops[0] != ops[1]))
}

fn bi_lt(_: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(bool_term(ops[0] < ops[1]))
}

fn bi_lte(_: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(bool_term(ops[0] <= ops[1]))
}

fn bi_gt(_: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(bool_term(ops[0] > ops[1]))
}

fn bi_gte(_: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(bool_term(ops[0] >= ops[1]))
}

// ──────────────────────────────────────────────
// Arithmetic
// ──────────────────────────────────────────────

fn bi_plus(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let a = as_number("plus", &ops[0], ctx.location)?;
    let b = as_number("plus", &ops[1], ctx.location)?;
    let sum = a
        .checked_add(b)
        .ok_or_else(|| Error::builtin("plus", "addition overflow", ctx.location))?;
    Ok(Some(Term::number(sum)))
}

fn bi_minus(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let a = as_number("minus", &ops[0], ctx.location)?;
    let b = as_number("minus", &ops[1], ctx.location)?;
    let diff = a
        .checked_sub(b)
        .ok_or_else(|| Error::builtin("minus", "subtraction overflow", ctx.location))?;
    Ok(Some(Term::number(diff)))
}

fn bi_mul(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let a = as_number("mul", &ops[0], ctx.location)?;
    let b = as_number("mul", &ops[1], ctx.location)?;
    let product = a
        .checked_mul(b)
        .ok_or_else(|| Error::builtin("mul", "multiplication overflow", ctx.location))?;
    Ok(Some(Term::number(product)))
}

fn bi_div(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let a = as_number("div", &ops[0], ctx.location)?;
    let b = as_number("div", &ops[1], ctx.location)?;
    if b.is_zero() {
        return Err(Error::builtin("div", "divide by zero", ctx.location));
    }
    let quot = a
        .checked_div(b)
        .ok_or_else(|| Error::builtin("div", "division overflow", ctx.location))?;
    Ok(Some(Term::number(quot)))
}

fn bi_rem(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let a = as_number("rem", &ops[0], ctx.location)?;
    let b = as_number("rem", &ops[1], ctx.location)?;
    if !a.is_integer() || !b.is_integer() {
        return Err(Error::builtin(
            "rem",
            "modulo on non-integer value",
            ctx.location,
        ));
    }
    if b.is_zero() {
        return Err(Error::builtin("rem", "modulo by zero", ctx.location));
    }
    let rem = a
        .checked_rem(b)
        .ok_or_else(|| Error::builtin("rem", "modulo overflow", ctx.location))?;
    Ok(Some(Term::number(rem)))
}

fn bi_abs(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let a = as_number("abs", &ops[0], ctx.location)?;
    Ok(Some(Term::number(a.abs())))
}

// ──────────────────────────────────────────────
// Aggregates
// ──────────────────────────────────────────────

fn bi_count(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let n = match &ops[0].value {
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::Set(s) => s.len(),
        Value::String(s) => s.chars().count(),
        other => {
            return Err(Error::builtin(
                "count",
                format!(
                    "operand must be array, object, set, or string, got {}",
                    other.type_name()
                ),
                ctx.location,
            ))
        }
    };
    Ok(Some(Term::int(n as i64)))
}

fn bi_sum(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let elems = number_elems("sum", &ops[0], ctx.location)?;
    let mut total = Decimal::ZERO;
    for e in elems {
        if let Value::Number(d) = &e.value {
            total = total
                .checked_add(*d)
                .ok_or_else(|| Error::builtin("sum", "addition overflow", ctx.location))?;
        }
    }
    Ok(Some(Term::number(total)))
}

fn bi_max(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let elems = number_elems("max", &ops[0], ctx.location)?;
    Ok(elems.into_iter().max().cloned())
}

fn bi_min(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let elems = number_elems("min", &ops[0], ctx.location)?;
    Ok(elems.into_iter().min().cloned())
}

// ──────────────────────────────────────────────
// Strings
// ──────────────────────────────────────────────

fn bi_concat(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let delim = as_string("concat", &ops[0], ctx.location)?;
    let parts: Vec<&Term> = match &ops[1].value {
        Value::Array(a) => a.iter().collect(),
        Value::Set(s) => s.iter().collect(),
        other => {
            return Err(Error::builtin(
                "concat",
                format!("operand must be array or set, got {}", other.type_name()),
                ctx.location,
            ))
        }
    };
    let mut strs = Vec::with_capacity(parts.len());
    for p in parts {
        strs.push(as_string("concat", p, ctx.location)?.to_string());
    }
    Ok(Some(Term::string(strs.join(delim))))
}

fn bi_startswith(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let s = as_string("startswith", &ops[0], ctx.location)?;
    let prefix = as_string("startswith", &ops[1], ctx.location)?;
    Ok(bool_term(s.starts_with(prefix)))
}

fn bi_endswith(ctx: &BuiltinContext, ops: &[Term]) -> Result<Option<Term>, Error> {
    let s = as_string("endswith", &ops[0], ctx.location)?;
    let suffix = as_string("endswith", &ops[1], ctx.location)?;
    Ok(bool_term(s.ends_with(suffix)))
}

// ──────────────────────────────────────────────
// Clock
// ──────────────────────────────────────────────

fn bi_time_now_ns(ctx: &BuiltinContext, _ops: &[Term]) -> Result<Option<Term>, Error> {
    Ok(Some(ctx.time.clone()))
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(time: &Term) -> BuiltinContext<'_> {
        BuiltinContext {
            location: Location::default(),
            query_id: 0,
            parent_id: 0,
            time,
            cancel: None,
        }
    }

    #[test]
    fn comparison_uses_the_cross_kind_total_order() {
        let time = Term::int(0);
        let c = ctx(&time);
        // numbers sort before strings in the canonical order
        let out = bi_lt(&c, &[Term::int(99), Term::string("a")]).unwrap();
        assert_eq!(out, Some(Term::bool(true)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let time = Term::int(0);
        let c = ctx(&time);
        let err = bi_div(&c, &[Term::int(1), Term::int(0)]).unwrap_err();
        assert!(err.message.contains("divide by zero"));
    }

    #[test]
    fn aggregates_over_arrays_and_sets() {
        let time = Term::int(0);
        let c = ctx(&time);
        let arr = Term::array(vec![Term::int(1), Term::int(2), Term::int(3)]);
        assert_eq!(bi_sum(&c, &[arr.clone()]).unwrap(), Some(Term::int(6)));
        assert_eq!(bi_max(&c, &[arr.clone()]).unwrap(), Some(Term::int(3)));
        assert_eq!(bi_min(&c, &[arr.clone()]).unwrap(), Some(Term::int(1)));
        assert_eq!(bi_count(&c, &[arr]).unwrap(), Some(Term::int(3)));

        // max of the empty collection is undefined, not an error
        assert_eq!(bi_max(&c, &[Term::array(vec![])]).unwrap(), None);
    }

    #[test]
    fn concat_joins_strings() {
        let time = Term::int(0);
        let c = ctx(&time);
        let arr = Term::array(vec![Term::string("a"), Term::string("b")]);
        assert_eq!(
            bi_concat(&c, &[Term::string("/"), arr]).unwrap(),
            Some(Term::string("a/b"))
        );
    }

    #[test]
    fn clock_reads_the_query_timestamp() {
        let time = Term::int(12345);
        let c = ctx(&time);
        assert_eq!(bi_time_now_ns(&c, &[]).unwrap(), Some(Term::int(12345)));
    }
}
