//! arbiter-ast: value model and policy AST for the Arbiter evaluator.
//!
//! The evaluator consumes compiled policies, not source text. This crate
//! defines the runtime value model (`Value`, `Term`, `Ref`), the policy
//! AST (`Module`, `Rule`, `Body`, `Expr`), and the compiled-policy
//! container (`Compiler`) together with the rule tree and rule index
//! interface the evaluator dispatches through.
//!
//! # Public API
//!
//! Key types are re-exported at the crate root:
//!
//! - [`Value`], [`Term`], [`Ref`], [`Location`] -- the value model
//! - [`Module`], [`Package`], [`Rule`], [`Head`], [`Body`], [`Expr`],
//!   [`With`], [`Every`] -- the policy AST
//! - [`Compiler`], [`TreeNode`] -- the compiled-policy container
//! - [`RuleIndex`], [`IndexResult`], [`RuleKind`] -- rule dispatch

pub mod compiler;
pub mod index;
pub mod policy;
pub mod value;

pub use compiler::{Compiler, ComprehensionIndex, TreeNode};
pub use index::{BaseRuleIndex, IndexResolver, IndexResult, RuleIndex, RuleKind};
pub use policy::{
    body_vars, expr_vars, term_vars, walk_expr_terms, walk_terms, Body, Every, Expr, ExprTerms,
    Head, Module, Package, Rule, RuleHeadKind, VarVisitorParams, With, EQUALITY_OP,
};
pub use value::{
    ArrayComprehension, Location, Object, ObjectComprehension, Ref, Set, SetComprehension, Term,
    Value, Var, DATA_ROOT, FUNC_ARGS_ROOT, INPUT_ROOT, SYSTEM_DOCUMENT_KEY,
};
