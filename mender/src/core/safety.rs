//! Static pre-execution policy check for generated Python programs.
//!
//! The program is parsed into a syntax tree and walked once. The check fails
//! closed: code that does not parse is never executed.
//!
//! Known gap: calls through attributes (`x.system(...)`) are not resolved by
//! type. Only the import of the owning module is blocked, so an aliased
//! reference to a banned capability obtained some other way is not caught.

use std::collections::BTreeSet;

use tree_sitter::{Language, Node, Parser};

use crate::core::types::SafetyVerdict;

/// Capability modules that may not be imported (matched on the root package).
pub const DENIED_IMPORTS: [&str; 6] = [
    "os",
    "subprocess",
    "sys",
    "shutil",
    "builtins",
    "importlib",
];

/// Dynamic-execution primitives that may not be called by name.
pub const DENIED_CALLS: [&str; 4] = ["exec", "eval", "open", "compile"];

/// Denylists applied by [`SafetyPolicy::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyPolicy {
    imports: BTreeSet<String>,
    calls: BTreeSet<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            imports: DENIED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            calls: DENIED_CALLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SafetyPolicy {
    /// Default policy extended with extra denied imports and calls.
    ///
    /// The built-in lists cannot be shrunk.
    pub fn with_extra<I, C>(imports: I, calls: C) -> Self
    where
        I: IntoIterator<Item = String>,
        C: IntoIterator<Item = String>,
    {
        let mut policy = Self::default();
        policy.imports.extend(imports);
        policy.calls.extend(calls);
        policy
    }

    pub fn denies_import(&self, module: &str) -> bool {
        self.imports.contains(root_package(module))
    }

    pub fn denies_call(&self, name: &str) -> bool {
        self.calls.contains(name)
    }

    /// Check `code` against the policy.
    ///
    /// Returns `(true, "Safe")` only if no rule fires.
    pub fn check(&self, code: &str) -> SafetyVerdict {
        let mut parser = Parser::new();
        let language: Language = tree_sitter_python::LANGUAGE.into();
        if let Err(err) = parser.set_language(&language) {
            return SafetyVerdict::rejected(format!("Syntax Error: parser unavailable: {err}"));
        }
        let Some(tree) = parser.parse(code, None) else {
            return SafetyVerdict::rejected("Syntax Error: program could not be parsed");
        };

        let root = tree.root_node();
        if root.has_error() {
            return SafetyVerdict::rejected(syntax_error_reason(root));
        }

        let source = code.as_bytes();
        let mut cursor = root.walk();
        loop {
            if let Some(reason) = self.inspect(cursor.node(), source) {
                return SafetyVerdict::rejected(reason);
            }
            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return SafetyVerdict::safe();
                }
            }
        }
    }

    /// Apply the import and call rules to a single node.
    fn inspect(&self, node: Node<'_>, source: &[u8]) -> Option<String> {
        match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                let names: Vec<Node<'_>> = node
                    .children_by_field_name("name", &mut cursor)
                    .collect();
                names.into_iter().find_map(|name| {
                    // `import a.b as c` nests the dotted name under `aliased_import`.
                    let dotted = if name.kind() == "aliased_import" {
                        name.child_by_field_name("name")?
                    } else {
                        name
                    };
                    let module = node_text(dotted, source);
                    self.denies_import(&module)
                        .then(|| format!("Importing '{module}' is not allowed."))
                })
            }
            "import_from_statement" => {
                let module_node = node.child_by_field_name("module_name")?;
                let module = from_module(module_node, source)?;
                self.denies_import(&module)
                    .then(|| format!("Importing from '{module}' is not allowed."))
            }
            "call" => {
                let function = unparenthesize(node.child_by_field_name("function")?);
                if function.kind() != "identifier" {
                    return None;
                }
                let name = node_text(function, source);
                self.denies_call(&name)
                    .then(|| format!("Calling '{name}' is not allowed."))
            }
            _ => None,
        }
    }
}

/// Check `code` against the default policy.
pub fn check(code: &str) -> SafetyVerdict {
    SafetyPolicy::default().check(code)
}

/// Module named by a `from ... import` clause, without leading dots.
///
/// A bare relative import (`from . import x`) names no module.
fn from_module(node: Node<'_>, source: &[u8]) -> Option<String> {
    if node.kind() == "relative_import" {
        let mut cursor = node.walk();
        let dotted = node
            .named_children(&mut cursor)
            .find(|child| child.kind() == "dotted_name")?;
        return Some(node_text(dotted, source));
    }
    Some(node_text(node, source))
}

/// `(eval)` and `((eval))` name the same call target as `eval`.
fn unparenthesize(mut node: Node<'_>) -> Node<'_> {
    while node.kind() == "parenthesized_expression" && node.named_child_count() == 1 {
        match node.named_child(0) {
            Some(inner) => node = inner,
            None => break,
        }
    }
    node
}

fn root_package(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

fn node_text(node: Node<'_>, source: &[u8]) -> String {
    node.utf8_text(source)
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn syntax_error_reason(root: Node<'_>) -> String {
    match first_error(root) {
        Some(node) => {
            let pos = node.start_position();
            format!(
                "Syntax Error: invalid syntax at line {}, column {}",
                pos.row + 1,
                pos.column + 1
            )
        }
        None => "Syntax Error: invalid syntax".to_string(),
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}
