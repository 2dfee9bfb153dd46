//! Runtime value model.
//!
//! Values are immutable, structurally compared, and totally ordered across
//! kinds so that sets and object keys have a canonical layout. All numerics
//! use `rust_decimal::Decimal` -- never `f64`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rust_decimal::Decimal;

use crate::policy::Body;

/// Root of references into the base/virtual document tree.
pub const DATA_ROOT: &str = "data";
/// Root of references into the caller-supplied input document.
pub const INPUT_ROOT: &str = "input";
/// Internal root used to address positional function arguments.
pub const FUNC_ARGS_ROOT: &str = "args";
/// Reserved top-level key hidden from whole-root reads and extents.
pub const SYSTEM_DOCUMENT_KEY: &str = "system";

/// Variable identifiers. Names beginning with `$` are wildcards; names
/// beginning with `__` are generated by the compiler or the evaluator.
pub type Var = String;

/// Ordered mapping from term to term. Duplicate keys are forbidden by
/// construction (the map collapses them; builders must reject them).
pub type Object = BTreeMap<Term, Term>;

/// Unordered collection of terms with canonical iteration order.
pub type Set = BTreeSet<Term>;

// ──────────────────────────────────────────────
// Location
// ──────────────────────────────────────────────

/// Source position attached to terms and expressions. Used for error
/// reporting and trace events only; never part of equality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub row: u32,
    pub col: u32,
}

impl Location {
    pub fn new(row: u32, col: u32) -> Self {
        Location { row, col }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

// ──────────────────────────────────────────────
// Values and terms
// ──────────────────────────────────────────────

/// An array comprehension: `[head | body]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayComprehension {
    pub term: Term,
    pub body: Body,
}

/// A set comprehension: `{head | body}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetComprehension {
    pub term: Term,
    pub body: Body,
}

/// An object comprehension: `{key: value | body}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectComprehension {
    pub key: Term,
    pub value: Term,
    pub body: Body,
}

/// The tagged value sum type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Decimal),
    String(String),
    Var(Var),
    Ref(Ref),
    Array(Vec<Term>),
    Object(Object),
    Set(Set),
    ArrayCompr(Box<ArrayComprehension>),
    ObjectCompr(Box<ObjectComprehension>),
    SetCompr(Box<SetComprehension>),
    Call(Vec<Term>),
}

impl Value {
    /// Fixed cross-kind sort order giving values a total order.
    fn sort_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Var(_) => 4,
            Value::Ref(_) => 5,
            Value::Array(_) => 6,
            Value::Object(_) => 7,
            Value::Set(_) => 8,
            Value::ArrayCompr(_) => 9,
            Value::ObjectCompr(_) => 10,
            Value::SetCompr(_) => 11,
            Value::Call(_) => 12,
        }
    }

    /// Human-readable kind name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Var(_) => "var",
            Value::Ref(_) => "ref",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Set(_) => "set",
            Value::ArrayCompr(_) => "arraycomprehension",
            Value::ObjectCompr(_) => "objectcomprehension",
            Value::SetCompr(_) => "setcomprehension",
            Value::Call(_) => "call",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn is_comprehension(&self) -> bool {
        matches!(
            self,
            Value::ArrayCompr(_) | Value::ObjectCompr(_) | Value::SetCompr(_)
        )
    }

    /// True if the value contains no variables. Comprehensions are never
    /// ground: their bodies close over local variables.
    pub fn is_ground(&self) -> bool {
        match self {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
            Value::Var(_) => false,
            Value::Ref(r) => r.is_ground(),
            Value::Array(elems) => elems.iter().all(|t| t.value.is_ground()),
            Value::Object(obj) => obj
                .iter()
                .all(|(k, v)| k.value.is_ground() && v.value.is_ground()),
            Value::Set(set) => set.iter().all(|t| t.value.is_ground()),
            Value::Call(terms) => terms.iter().all(|t| t.value.is_ground()),
            Value::ArrayCompr(_) | Value::ObjectCompr(_) | Value::SetCompr(_) => false,
        }
    }

    pub fn is_wildcard_var(&self) -> bool {
        matches!(self, Value::Var(v) if v.starts_with('$'))
    }

    /// If the value is an integral, non-negative number, return it as a
    /// collection index.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Value::Number(d) if d.is_integer() && !d.is_sign_negative() => {
                let t = d.trunc();
                u64::try_from(t.mantissa() / 10i128.pow(t.scale()))
                    .ok()
                    .map(|v| v as usize)
            }
            _ => None,
        }
    }

    /// Walk a ground path into this value. Arrays are indexed by integral
    /// numbers, objects by key, sets by membership (finding an element
    /// returns that element).
    pub fn find(&self, path: &[Term]) -> Option<Value> {
        let mut current = self;
        for step in path {
            match current {
                Value::Array(elems) => {
                    let i = step.value.as_index()?;
                    current = &elems.get(i)?.value;
                }
                Value::Object(obj) => {
                    current = &obj.get(step)?.value;
                }
                Value::Set(set) => {
                    current = &set.get(step)?.value;
                }
                _ => return None,
            }
        }
        Some(current.clone())
    }

    /// Convert a JSON document into a value. Numbers become `Decimal`;
    /// object keys become string terms.
    pub fn from_json(v: &serde_json::Value) -> Result<Value, String> {
        match v {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .to_string()
                .parse::<Decimal>()
                .map(Value::Number)
                .map_err(|e| format!("invalid number {}: {}", n, e)),
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Array(elems) => {
                let mut out = Vec::with_capacity(elems.len());
                for e in elems {
                    out.push(Term::new(Value::from_json(e)?));
                }
                Ok(Value::Array(out))
            }
            serde_json::Value::Object(fields) => {
                let mut obj = Object::new();
                for (k, v) in fields {
                    obj.insert(Term::string(k), Term::new(Value::from_json(v)?));
                }
                Ok(Value::Object(obj))
            }
        }
    }

    /// Convert a value back to JSON. Sets serialize as sorted arrays;
    /// non-string object keys, vars, refs, calls, and comprehensions are
    /// rejected.
    pub fn to_json(&self) -> Result<serde_json::Value, String> {
        match self {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(d) => d
                .to_string()
                .parse::<serde_json::Number>()
                .map(serde_json::Value::Number)
                .map_err(|e| format!("invalid number {}: {}", d, e)),
            Value::String(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Array(elems) => {
                let mut out = Vec::with_capacity(elems.len());
                for e in elems {
                    out.push(e.value.to_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Set(set) => {
                let mut out = Vec::with_capacity(set.len());
                for e in set {
                    out.push(e.value.to_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Object(obj) => {
                let mut fields = serde_json::Map::new();
                for (k, v) in obj {
                    match &k.value {
                        Value::String(s) => {
                            fields.insert(s.clone(), v.value.to_json()?);
                        }
                        other => {
                            return Err(format!(
                                "object key must be a string, got {}",
                                other.type_name()
                            ))
                        }
                    }
                }
                Ok(serde_json::Value::Object(fields))
            }
            other => Err(format!("cannot serialize {}", other.type_name())),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Var(a), Value::Var(b)) => a.cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (Value::ArrayCompr(a), Value::ArrayCompr(b)) => a.cmp(b),
            (Value::ObjectCompr(a), Value::ObjectCompr(b)) => a.cmp(b),
            (Value::SetCompr(a), Value::SetCompr(b)) => a.cmp(b),
            (Value::Call(a), Value::Call(b)) => a.cmp(b),
            (a, b) => a.sort_order().cmp(&b.sort_order()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Var(v) => write!(f, "{}", v),
            Value::Ref(r) => write!(f, "{}", r),
            Value::Array(elems) => {
                write!(f, "[")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            Value::Object(obj) => {
                write!(f, "{{")?;
                for (i, (k, v)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Set(set) => {
                if set.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, e) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "}}")
            }
            Value::ArrayCompr(c) => write!(f, "[{} | {}]", c.term, c.body),
            Value::SetCompr(c) => write!(f, "{{{} | {}}}", c.term, c.body),
            Value::ObjectCompr(c) => write!(f, "{{{}: {} | {}}}", c.key, c.value, c.body),
            Value::Call(terms) => {
                if terms.is_empty() {
                    return write!(f, "call()");
                }
                write!(f, "{}(", terms[0])?;
                for (i, a) in terms[1..].iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A value paired with its source location. Equality, ordering, and
/// hashing consider the value only.
#[derive(Debug, Clone, Default)]
pub struct Term {
    pub value: Value,
    pub location: Location,
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Term {
    pub fn new(value: Value) -> Self {
        Term {
            value,
            location: Location::default(),
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn null() -> Self {
        Term::new(Value::Null)
    }

    pub fn bool(b: bool) -> Self {
        Term::new(Value::Bool(b))
    }

    pub fn int(n: i64) -> Self {
        Term::new(Value::Number(Decimal::from(n)))
    }

    pub fn number(d: Decimal) -> Self {
        Term::new(Value::Number(d))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Term::new(Value::String(s.into()))
    }

    pub fn var(v: impl Into<String>) -> Self {
        Term::new(Value::Var(v.into()))
    }

    pub fn array(elems: Vec<Term>) -> Self {
        Term::new(Value::Array(elems))
    }

    /// Build an object term. Duplicate keys are an error.
    pub fn object(items: Vec<(Term, Term)>) -> Self {
        let mut obj = Object::new();
        for (k, v) in items {
            obj.insert(k, v);
        }
        Term::new(Value::Object(obj))
    }

    pub fn set(elems: Vec<Term>) -> Self {
        Term::new(Value::Set(elems.into_iter().collect()))
    }

    pub fn reference(r: Ref) -> Self {
        Term::new(Value::Ref(r))
    }

    /// Build a call term: operator reference followed by arguments.
    pub fn call(operator: Ref, args: Vec<Term>) -> Self {
        let mut terms = Vec::with_capacity(args.len() + 1);
        terms.push(Term::reference(operator));
        terms.extend(args);
        Term::new(Value::Call(terms))
    }

    pub fn is_ground(&self) -> bool {
        self.value.is_ground()
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Term {}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.value.cmp(&other.value))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl std::hash::Hash for Term {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

// ──────────────────────────────────────────────
// References
// ──────────────────────────────────────────────

/// An ordered sequence of terms naming a path into the document tree.
/// The first element is one of the document roots (`data`, `input`, the
/// function-arg root) or, in synthesized generators, an arbitrary term.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref(pub Vec<Term>);

impl Ref {
    pub fn new(terms: Vec<Term>) -> Self {
        Ref(terms)
    }

    /// A reference rooted at `data`, with string path segments.
    pub fn data(path: &[&str]) -> Self {
        let mut terms = vec![Term::var(DATA_ROOT)];
        terms.extend(path.iter().map(|s| Term::string(*s)));
        Ref(terms)
    }

    /// A reference rooted at `input`, with string path segments.
    pub fn input(path: &[&str]) -> Self {
        let mut terms = vec![Term::var(INPUT_ROOT)];
        terms.extend(path.iter().map(|s| Term::string(*s)));
        Ref(terms)
    }

    /// A single-element reference naming a built-in operator.
    pub fn operator(name: &str) -> Self {
        Ref(vec![Term::var(name)])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_ground(&self) -> bool {
        self.0.iter().all(|t| t.value.is_ground())
    }

    /// The longest prefix of ground terms.
    pub fn ground_prefix(&self) -> Ref {
        let n = self
            .0
            .iter()
            .position(|t| !t.value.is_ground())
            .unwrap_or(self.0.len());
        Ref(self.0[..n].to_vec())
    }

    pub fn has_prefix(&self, prefix: &Ref) -> bool {
        prefix.len() <= self.len() && self.0[..prefix.len()] == prefix.0[..]
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> Ref {
        Ref(self.0[range].to_vec())
    }

    pub fn prefix(&self, end: usize) -> Ref {
        Ref(self.0[..end].to_vec())
    }

    pub fn concat(&self, suffix: &[Term]) -> Ref {
        let mut terms = self.0.clone();
        terms.extend_from_slice(suffix);
        Ref(terms)
    }

    pub fn append(&self, term: Term) -> Ref {
        let mut terms = self.0.clone();
        terms.push(term);
        Ref(terms)
    }

    /// Return a copy with `term` inserted at position `idx`.
    pub fn insert(&self, idx: usize, term: Term) -> Ref {
        let mut terms = self.0.clone();
        terms.insert(idx, term);
        Ref(terms)
    }

    pub fn root_is(&self, root: &str) -> bool {
        matches!(self.0.first().map(|t| &t.value), Some(Value::Var(v)) if v == root)
    }

    /// True if any position after the root holds a non-scalar term.
    pub fn contains_non_scalar(&self) -> bool {
        self.0[1..].iter().any(|t| !t.value.is_scalar())
    }
}

impl std::ops::Deref for Ref {
    type Target = [Term];

    fn deref(&self) -> &[Term] {
        &self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.0.iter().enumerate() {
            if i == 0 {
                write!(f, "{}", t)?;
                continue;
            }
            match &t.value {
                Value::String(s)
                    if !s.is_empty()
                        && s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
                        && s.chars().all(|c| c.is_alphanumeric() || c == '_') =>
                {
                    write!(f, ".{}", s)?;
                }
                _ => write!(f, "[{}]", t)?,
            }
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_kind_ordering_is_total() {
        let vals = vec![
            Value::Null,
            Value::Bool(false),
            Value::Number(Decimal::from(1)),
            Value::String("a".to_string()),
            Value::Var("x".to_string()),
            Value::Ref(Ref::data(&["a"])),
            Value::Array(vec![]),
            Value::Object(Object::new()),
            Value::Set(Set::new()),
        ];
        for (i, a) in vals.iter().enumerate() {
            for (j, b) in vals.iter().enumerate() {
                assert_eq!(a.cmp(b), i.cmp(&j), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn term_equality_ignores_location() {
        let a = Term::string("x").with_location(Location::new(1, 1));
        let b = Term::string("x").with_location(Location::new(9, 9));
        assert_eq!(a, b);
        let mut set = Set::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn find_walks_arrays_objects_and_sets() {
        let doc = Value::from_json(&serde_json::json!({
            "a": [{"b": 1}, {"b": 2}],
        }))
        .unwrap();
        let found = doc
            .find(&[Term::string("a"), Term::int(1), Term::string("b")])
            .unwrap();
        assert_eq!(found, Value::Number(Decimal::from(2)));
        assert!(doc.find(&[Term::string("missing")]).is_none());

        let set = Value::Set([Term::int(1), Term::int(2)].into_iter().collect());
        assert_eq!(
            set.find(&[Term::int(2)]),
            Some(Value::Number(Decimal::from(2)))
        );
        assert_eq!(set.find(&[Term::int(3)]), None);
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let js = serde_json::json!({"x": [1, "two", null, true], "y": {"z": 3.5}});
        let val = Value::from_json(&js).unwrap();
        assert_eq!(val.to_json().unwrap(), js);
    }

    #[test]
    fn ground_prefix_stops_at_first_var() {
        let r = Ref::new(vec![
            Term::var(DATA_ROOT),
            Term::string("a"),
            Term::var("x"),
            Term::string("b"),
        ]);
        assert_eq!(r.ground_prefix().len(), 2);
        assert!(!r.is_ground());
        assert!(r.has_prefix(&Ref::data(&["a"])));
    }

    #[test]
    fn ref_display_uses_dot_for_identifier_keys() {
        let r = Ref::new(vec![
            Term::var(DATA_ROOT),
            Term::string("pkg"),
            Term::string("two words"),
            Term::int(3),
        ]);
        assert_eq!(r.to_string(), "data.pkg[\"two words\"][3]");
    }

    #[test]
    fn as_index_rejects_fractions_and_negatives() {
        assert_eq!(Value::Number(Decimal::from(2)).as_index(), Some(2));
        assert_eq!(Value::Number(Decimal::new(25, 1)).as_index(), None);
        assert_eq!(Value::Number(Decimal::from(-1)).as_index(), None);
        assert_eq!(Value::String("2".into()).as_index(), None);
    }
}
