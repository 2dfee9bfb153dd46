//! Compiled-policy container.
//!
//! The `Compiler` owns the loaded modules, the rule tree, the function
//! arity table, the rewritten-variable map, and the comprehension index
//! registry. It is read-only and shared across queries; all per-query
//! state lives in the evaluator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::index::BaseRuleIndex;
use crate::policy::{Body, Module, Rule};
use crate::value::{Location, Ref, Term, Value, Var, DATA_ROOT, SYSTEM_DOCUMENT_KEY};

/// A node of the rule tree. Children are keyed by path-segment value;
/// rules attach at the node for the ground prefix of their path.
#[derive(Debug)]
pub struct TreeNode {
    pub key: Value,
    pub values: Vec<Arc<Rule>>,
    pub children: BTreeMap<Value, Arc<TreeNode>>,
    pub hide: bool,
}

impl TreeNode {
    pub fn child(&self, key: &Value) -> Option<&Arc<TreeNode>> {
        self.children.get(key)
    }

    /// Child keys in canonical order.
    pub fn sorted_keys(&self) -> impl Iterator<Item = &Value> {
        self.children.keys()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Index keys for one comprehension, supplied by query compilation.
#[derive(Debug, Clone)]
pub struct ComprehensionIndex {
    pub keys: Vec<Term>,
}

type TypeCheckFn = Arc<dyn Fn(&Body) -> bool + Send + Sync>;

/// The compiled-policy container consumed by the evaluator.
pub struct Compiler {
    modules: Vec<Module>,
    rule_tree: Arc<TreeNode>,
    functions: HashMap<Ref, usize>,
    rewritten_vars: HashMap<Var, Var>,
    comprehension_indices: HashMap<Location, ComprehensionIndex>,
    type_check: Option<TypeCheckFn>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("modules", &self.modules.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            modules: Vec::new(),
            rule_tree: Arc::new(TreeNode {
                key: Value::Null,
                values: Vec::new(),
                children: BTreeMap::new(),
                hide: false,
            }),
            functions: HashMap::new(),
            rewritten_vars: HashMap::new(),
            comprehension_indices: HashMap::new(),
            type_check: None,
        }
    }

    /// Load modules: compute absolute rule paths, build the rule tree and
    /// the function arity table. Rule references must root at `data`.
    pub fn with_modules(mut self, modules: Vec<Module>) -> Result<Self, String> {
        let mut prepared = Vec::with_capacity(modules.len());

        for module in modules {
            if !module.package.path.root_is(DATA_ROOT) {
                return Err(format!(
                    "package path must be rooted at {}: {}",
                    DATA_ROOT, module.package.path
                ));
            }
            let mut rules = Vec::with_capacity(module.rules.len());
            for mut rule in module.rules {
                assign_path(&mut rule, &module.package.path)?;
                rules.push(rule);
            }
            prepared.push(Module::new(module.package.clone(), rules));
        }

        let mut root = MutNode::default();
        for module in &prepared {
            for rule in &module.rules {
                let shared = Arc::new(rule.clone());
                if shared.is_function() {
                    self.functions
                        .insert(shared.path.clone(), shared.head.args.len());
                }
                let prefix = shared.path.ground_prefix();
                root.insert(&prefix, shared);
            }
        }

        self.rule_tree = Arc::new(root.freeze(Value::Null, false));
        self.modules = prepared;
        Ok(self)
    }

    /// Install a type-check hook applied to residual bodies before they
    /// are retained as support rules. Absent a hook, every body passes.
    pub fn with_type_check(mut self, f: TypeCheckFn) -> Self {
        self.type_check = Some(f);
        self
    }

    pub fn with_rewritten_vars(mut self, map: HashMap<Var, Var>) -> Self {
        self.rewritten_vars = map;
        self
    }

    /// Register comprehension index keys for the comprehension term at
    /// `location`.
    pub fn register_comprehension_index(&mut self, location: Location, keys: Vec<Term>) {
        self.comprehension_indices
            .insert(location, ComprehensionIndex { keys });
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn rule_tree(&self) -> &Arc<TreeNode> {
        &self.rule_tree
    }

    /// The rule index for a reference, if any rules attach at it.
    ///
    /// When the rule set carries variable ref positions, descendant rules
    /// are folded in: the evaluator stops its tree walk at this node, so
    /// deeper rules are only reachable through this index.
    pub fn rule_index(&self, reference: &Ref) -> Option<BaseRuleIndex> {
        let node = self.node_at(reference)?;
        if node.values.is_empty() {
            return None;
        }
        let mut rules = node.values.clone();
        if rules.iter().any(|r| !r.path.is_ground()) {
            collect_descendant_rules(node, &mut rules);
        }
        Some(BaseRuleIndex::from_rules(&rules))
    }

    fn node_at(&self, reference: &Ref) -> Option<&Arc<TreeNode>> {
        let mut node = self.rule_tree.child(&reference.first()?.value)?;
        for t in &reference[1..] {
            node = node.child(&t.value)?;
        }
        Some(node)
    }

    /// Does the reference name (or pass through) a virtual document?
    /// True when the path reaches into the rule tree: an intermediate
    /// namespace node, a rule node, or a path beneath one.
    pub fn is_virtual(&self, reference: &Ref) -> bool {
        let mut node = match reference
            .first()
            .and_then(|t| self.rule_tree.child(&t.value))
        {
            Some(n) => n,
            None => return false,
        };
        for t in &reference[1..] {
            if !node.values.is_empty() {
                return true;
            }
            match node.child(&t.value) {
                Some(c) => node = c,
                None => return false,
            }
        }
        true
    }

    pub fn is_function(&self, reference: &Ref) -> bool {
        self.functions.contains_key(reference)
    }

    pub fn function_arity(&self, reference: &Ref) -> Option<usize> {
        self.functions.get(reference).copied()
    }

    pub fn rewritten_var(&self, v: &str) -> Option<&Var> {
        self.rewritten_vars.get(v)
    }

    pub fn comprehension_index(&self, location: &Location) -> Option<&ComprehensionIndex> {
        self.comprehension_indices.get(location)
    }

    /// Whether a residual body passes type checking. A failing body can
    /// never succeed and is dropped by the partial evaluator.
    pub fn passes_type_check(&self, body: &Body) -> bool {
        match &self.type_check {
            Some(f) => f(body),
            None => true,
        }
    }
}

/// Compute the absolute data-rooted path for a rule and its else chain.
/// The head reference's leading var becomes a string path segment.
fn assign_path(rule: &mut Rule, package: &Ref) -> Result<(), String> {
    let head_ref = &rule.head.reference;
    let name = match head_ref.first().map(|t| &t.value) {
        Some(Value::Var(v)) => v.clone(),
        _ => {
            return Err(format!(
                "rule head reference must begin with a name var: {}",
                head_ref
            ))
        }
    };
    let mut path = package.append(Term::string(name));
    path = path.concat(&head_ref[1..]);
    rule.path = path.clone();

    // else chains share the primary head's path all the way down
    let mut cur = rule.els.as_deref_mut();
    while let Some(r) = cur {
        r.path = path.clone();
        cur = r.els.as_deref_mut();
    }
    Ok(())
}

fn collect_descendant_rules(node: &TreeNode, out: &mut Vec<Arc<Rule>>) {
    for child in node.children.values() {
        out.extend(child.values.iter().cloned());
        collect_descendant_rules(child, out);
    }
}

#[derive(Default)]
struct MutNode {
    values: Vec<Arc<Rule>>,
    children: BTreeMap<Value, MutNode>,
}

impl MutNode {
    fn insert(&mut self, path: &Ref, rule: Arc<Rule>) {
        let mut node = self;
        for t in path.iter() {
            node = node.children.entry(t.value.clone()).or_default();
        }
        node.values.push(rule);
    }

    fn freeze(self, key: Value, hide: bool) -> TreeNode {
        let under_data = matches!(&key, Value::Var(v) if v == DATA_ROOT);
        let children = self
            .children
            .into_iter()
            .map(|(k, v)| {
                let hide_child = hide
                    || (under_data
                        && matches!(&k, Value::String(s) if s == SYSTEM_DOCUMENT_KEY));
                let frozen = v.freeze(k.clone(), hide_child);
                (k, Arc::new(frozen))
            })
            .collect();
        TreeNode {
            key,
            values: self.values,
            children,
            hide,
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Expr, Head, Package};

    fn module_with(rules: Vec<Rule>) -> Module {
        Module::new(Package::new(Ref::data(&["example"])), rules)
    }

    #[test]
    fn rule_paths_are_absolute_and_tree_attaches_at_ground_prefix() {
        let rule = Rule::new(
            Head::single(
                Ref::new(vec![Term::var("a"), Term::var("x"), Term::string("b")]),
                Term::int(1),
            ),
            Body::from_expr(Expr::term(Term::bool(true))),
        );
        let compiler = Compiler::new()
            .with_modules(vec![module_with(vec![rule])])
            .unwrap();

        let node = compiler
            .node_at(&Ref::data(&["example", "a"]))
            .expect("node at ground prefix");
        assert_eq!(node.values.len(), 1);
        assert_eq!(
            node.values[0].path.to_string(),
            "data.example.a[x].b"
        );
    }

    #[test]
    fn functions_are_tabulated_by_arity() {
        let rule = Rule::new(
            Head::func("f", vec![Term::var("a"), Term::var("b")], Term::var("a")),
            Body::from_expr(Expr::term(Term::bool(true))),
        );
        let compiler = Compiler::new()
            .with_modules(vec![module_with(vec![rule])])
            .unwrap();
        let path = Ref::data(&["example", "f"]);
        assert!(compiler.is_function(&path));
        assert_eq!(compiler.function_arity(&path), Some(2));
    }

    #[test]
    fn system_subtree_is_hidden() {
        let module = Module::new(
            Package::new(Ref::data(&["system", "internal"])),
            vec![Rule::new(
                Head::single(Ref::operator("p"), Term::int(1)),
                Body::from_expr(Expr::term(Term::bool(true))),
            )],
        );
        let compiler = Compiler::new().with_modules(vec![module]).unwrap();
        let data = compiler
            .rule_tree()
            .child(&Value::Var(DATA_ROOT.to_string()))
            .unwrap();
        let system = data
            .child(&Value::String(SYSTEM_DOCUMENT_KEY.to_string()))
            .unwrap();
        assert!(system.hide);
    }

    #[test]
    fn else_rules_share_the_primary_path() {
        let els = Rule::new(Head::single(Ref::operator("p"), Term::int(2)), Body::default());
        let rule = Rule::new(Head::single(Ref::operator("p"), Term::int(1)), Body::default())
            .with_else(els);
        let compiler = Compiler::new()
            .with_modules(vec![module_with(vec![rule])])
            .unwrap();
        let node = compiler.node_at(&Ref::data(&["example", "p"])).unwrap();
        let primary = &node.values[0];
        assert_eq!(
            primary.els.as_ref().unwrap().path,
            primary.path
        );
    }
}
