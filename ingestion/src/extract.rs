use mnemolite_core::model::Language;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use tree_sitter::{Node, Query, QueryCursor, Tree};

/// Facts pulled from a chunk's syntax subtree. Extraction is best-effort:
/// a partial parse or failed query degrades to an empty record, never an
/// error. Type fields (`return_type`, `param_types`) are left for the
/// oracle enrichment step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFacts {
    pub signature: Option<String>,
    pub imports: Vec<String>,
    pub re_exports: Vec<String>,
    pub calls: Vec<String>,
    pub cyclomatic: Option<u32>,
    pub docstring: Option<String>,
}

/// File-level references shared by every structural chunk of the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleRefs {
    pub imports: Vec<String>,
    pub re_exports: Vec<String>,
}

pub struct ExtractionContext<'a> {
    pub source: &'a str,
    pub node: Node<'a>,
    pub tree: &'a Tree,
    pub language: Language,
    pub module_imports: &'a [String],
    pub module_re_exports: &'a [String],
}

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, ctx: &ExtractionContext<'_>) -> ExtractedFacts;

    /// Imports/re-exports declared at file scope.
    fn module_references(&self, source: &str, tree: &Tree) -> ModuleRefs;
}

/// Routing table: language tag → extractor. Adding a language means one
/// registry entry plus a query set.
pub struct ExtractorRegistry {
    map: HashMap<Language, Arc<dyn MetadataExtractor>>,
}

impl ExtractorRegistry {
    pub fn with_defaults() -> Self {
        let mut map: HashMap<Language, Arc<dyn MetadataExtractor>> = HashMap::new();
        map.insert(Language::Python, Arc::new(PythonAstExtractor));
        map.insert(
            Language::TypeScript,
            Arc::new(QueryExtractor::for_language(Language::TypeScript)),
        );
        map.insert(
            Language::JavaScript,
            Arc::new(QueryExtractor::for_language(Language::JavaScript)),
        );
        map.insert(
            Language::Rust,
            Arc::new(QueryExtractor::for_language(Language::Rust)),
        );
        Self { map }
    }

    pub fn register(&mut self, language: Language, extractor: Arc<dyn MetadataExtractor>) {
        self.map.insert(language, extractor);
    }

    pub fn resolve(&self, language: Language) -> Option<Arc<dyn MetadataExtractor>> {
        self.map.get(&language).cloned()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn for_each_descendant<'t>(node: Node<'t>, f: &mut dyn FnMut(Node<'t>)) {
    f(node);
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            for_each_descendant(child, f);
        }
    }
}

fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn first_line_signature(node: Node<'_>, source: &str) -> Option<String> {
    let text = node_text(node, source);
    let line = text.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(
            line.trim_end_matches('{')
                .trim_end_matches(':')
                .trim()
                .to_string(),
        )
    }
}

fn cyclomatic(node: Node<'_>, branch_kinds: &[&str]) -> u32 {
    let mut branches = 0u32;
    for_each_descendant(node, &mut |n| {
        if branch_kinds.contains(&n.kind()) {
            branches += 1;
        }
    });
    branches + 1
}

/// `"./math"` / `"../lib/math"` / `"math_utils"` → `math` / `math` /
/// `math_utils`: module specifiers are reduced to the module segment that
/// roots qualified names.
fn normalize_module(specifier: &str) -> String {
    let trimmed = specifier.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    Path::new(trimmed)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}

// ---------------------------------------------------------------------------
// Native-AST extractor: Python
// ---------------------------------------------------------------------------

const PYTHON_BRANCH_KINDS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "except_clause",
    "conditional_expression",
    "boolean_operator",
];

/// Walks the Python CST directly, no queries involved.
pub struct PythonAstExtractor;

impl MetadataExtractor for PythonAstExtractor {
    fn extract(&self, ctx: &ExtractionContext<'_>) -> ExtractedFacts {
        ExtractedFacts {
            signature: first_line_signature(ctx.node, ctx.source),
            imports: ctx.module_imports.to_vec(),
            re_exports: ctx.module_re_exports.to_vec(),
            calls: python_calls(ctx.node, ctx.source),
            cyclomatic: Some(cyclomatic(ctx.node, PYTHON_BRANCH_KINDS)),
            docstring: python_docstring(ctx.node, ctx.source),
        }
    }

    fn module_references(&self, source: &str, tree: &Tree) -> ModuleRefs {
        let mut refs = ModuleRefs::default();
        let root = tree.root_node();

        for i in 0..root.child_count() {
            let Some(node) = root.child(i) else { continue };
            match node.kind() {
                "import_statement" => {
                    // `import a, b.c as d`
                    for j in 0..node.child_count() {
                        let Some(child) = node.child(j) else { continue };
                        match child.kind() {
                            "dotted_name" => {
                                refs.imports.push(node_text(child, source).to_string());
                            }
                            "aliased_import" => {
                                if let Some(name) = child.child_by_field_name("name") {
                                    refs.imports.push(node_text(name, source).to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "import_from_statement" => {
                    // Python modules are already dotted paths; relative
                    // imports only shed their leading dots.
                    let module = node
                        .child_by_field_name("module_name")
                        .map(|n| node_text(n, source).trim_start_matches('.').to_string())
                        .unwrap_or_default();
                    let qualify = |symbol: &str| {
                        if module.is_empty() {
                            symbol.to_string()
                        } else {
                            format!("{module}.{symbol}")
                        }
                    };
                    let mut any_symbol = false;
                    for j in 0..node.child_count() {
                        let Some(child) = node.child(j) else { continue };
                        match child.kind() {
                            "dotted_name" if Some(child) != node.child_by_field_name("module_name") => {
                                refs.imports.push(qualify(node_text(child, source)));
                                any_symbol = true;
                            }
                            "aliased_import" => {
                                if let Some(name) = child.child_by_field_name("name") {
                                    refs.imports.push(qualify(node_text(name, source)));
                                    any_symbol = true;
                                }
                            }
                            "wildcard_import" => {
                                if !module.is_empty() {
                                    refs.imports.push(module.clone());
                                }
                                any_symbol = true;
                            }
                            _ => {}
                        }
                    }
                    if !any_symbol && !module.is_empty() {
                        refs.imports.push(module);
                    }
                }
                _ => {}
            }
        }

        refs
    }
}

fn python_calls(node: Node<'_>, source: &str) -> Vec<String> {
    let mut calls = Vec::new();
    for_each_descendant(node, &mut |n| {
        if n.kind() != "call" {
            return;
        }
        let Some(function) = n.child_by_field_name("function") else {
            return;
        };
        match function.kind() {
            "identifier" => calls.push(node_text(function, source).to_string()),
            "attribute" => {
                let object = function.child_by_field_name("object");
                let attribute = function.child_by_field_name("attribute");
                if let (Some(object), Some(attribute)) = (object, attribute) {
                    if object.kind() == "identifier" {
                        calls.push(format!(
                            "{}.{}",
                            node_text(object, source),
                            node_text(attribute, source)
                        ));
                    } else {
                        calls.push(node_text(attribute, source).to_string());
                    }
                }
            }
            _ => {}
        }
    });
    calls
}

fn python_docstring(node: Node<'_>, source: &str) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let first = body.child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.child(0)?;
    if string.kind() != "string" {
        return None;
    }
    let text = node_text(string, source)
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Tree-query extractor: any language with a grammar and a query set
// ---------------------------------------------------------------------------

const TS_BRANCH_KINDS: &[&str] = &[
    "if_statement",
    "for_statement",
    "for_in_statement",
    "while_statement",
    "do_statement",
    "switch_case",
    "catch_clause",
    "ternary_expression",
];

const RUST_BRANCH_KINDS: &[&str] = &[
    "if_expression",
    "match_arm",
    "while_expression",
    "for_expression",
];

const TS_CALL_QUERY: &str = r#"
(call_expression function: (identifier) @direct)
(call_expression
  function: (member_expression
    object: (identifier) @object
    property: (property_identifier) @method))
(call_expression
  function: (member_expression
    object: (this) @this_object
    property: (property_identifier) @this_method))
(new_expression constructor: (identifier) @ctor)
"#;

const TS_IMPORT_QUERY: &str = r#"
(import_statement
  (import_clause
    (named_imports
      (import_specifier name: (identifier) @named)))
  source: (string) @named_source)
(import_statement
  (import_clause (identifier) @default)
  source: (string) @default_source)
(import_statement
  (import_clause (namespace_import (identifier) @namespace))
  source: (string) @namespace_source)
"#;

const TS_REEXPORT_QUERY: &str = r#"
(export_statement
  (export_clause
    (export_specifier name: (identifier) @symbol))
  source: (string) @source)
"#;

const RUST_CALL_QUERY: &str = r#"
(call_expression function: (identifier) @direct)
(call_expression
  function: (field_expression
    value: (identifier) @object
    field: (field_identifier) @method))
"#;

const RUST_IMPORT_QUERY: &str = r#"
(use_declaration argument: (scoped_identifier) @path)
(use_declaration argument: (identifier) @path)
"#;

/// Query-driven extractor. Queries that fail to compile for a grammar are
/// skipped with a warning; the record degrades instead of erroring.
pub struct QueryExtractor {
    language: Language,
    call_query: Option<Query>,
    import_query: Option<Query>,
    reexport_query: Option<Query>,
    branch_kinds: &'static [&'static str],
}

impl QueryExtractor {
    pub fn for_language(language: Language) -> Self {
        let grammar = crate::parser::grammar(language);
        let (call_src, import_src, reexport_src, branch_kinds) = match language {
            Language::TypeScript | Language::JavaScript => (
                TS_CALL_QUERY,
                TS_IMPORT_QUERY,
                Some(TS_REEXPORT_QUERY),
                TS_BRANCH_KINDS,
            ),
            Language::Rust => (RUST_CALL_QUERY, RUST_IMPORT_QUERY, None, RUST_BRANCH_KINDS),
            Language::Python => (TS_CALL_QUERY, TS_IMPORT_QUERY, None, PYTHON_BRANCH_KINDS),
        };

        Self {
            language,
            call_query: compile(&grammar, call_src, "calls"),
            import_query: compile(&grammar, import_src, "imports"),
            reexport_query: reexport_src.and_then(|src| compile(&grammar, src, "re-exports")),
            branch_kinds,
        }
    }

    fn collect_calls(&self, node: Node<'_>, source: &str) -> Vec<String> {
        let Some(query) = &self.call_query else {
            return Vec::new();
        };

        let direct = query.capture_index_for_name("direct");
        let object = query.capture_index_for_name("object");
        let method = query.capture_index_for_name("method");
        let this_method = query.capture_index_for_name("this_method");
        let ctor = query.capture_index_for_name("ctor");

        let mut calls = Vec::new();
        let mut cursor = QueryCursor::new();
        for m in cursor.matches(query, node, source.as_bytes()) {
            let mut call_object: Option<&str> = None;
            let mut call_method: Option<&str> = None;

            for capture in m.captures {
                let index = Some(capture.index);
                let text = node_text(capture.node, source);
                if index == direct || index == ctor {
                    calls.push(text.to_string());
                } else if index == object {
                    call_object = Some(text);
                } else if index == method {
                    call_method = Some(text);
                } else if index == this_method {
                    // Method calls keep the receiver: `o.m`, `this.m`.
                    calls.push(format!("this.{}", text));
                }
            }

            if let (Some(object), Some(method)) = (call_object, call_method) {
                calls.push(format!("{object}.{method}"));
            }
        }

        calls
    }
}

impl MetadataExtractor for QueryExtractor {
    fn extract(&self, ctx: &ExtractionContext<'_>) -> ExtractedFacts {
        ExtractedFacts {
            signature: first_line_signature(ctx.node, ctx.source),
            imports: ctx.module_imports.to_vec(),
            re_exports: ctx.module_re_exports.to_vec(),
            calls: self.collect_calls(ctx.node, ctx.source),
            cyclomatic: Some(cyclomatic(ctx.node, self.branch_kinds)),
            docstring: None,
        }
    }

    fn module_references(&self, source: &str, tree: &Tree) -> ModuleRefs {
        let mut refs = ModuleRefs::default();
        let root = tree.root_node();

        if let Some(query) = &self.import_query {
            let named = query.capture_index_for_name("named");
            let default = query.capture_index_for_name("default");
            let namespace = query.capture_index_for_name("namespace");
            let path = query.capture_index_for_name("path");

            let mut cursor = QueryCursor::new();
            for m in cursor.matches(query, root, source.as_bytes()) {
                let mut symbol: Option<&str> = None;
                let mut module: Option<String> = None;
                let mut module_only = false;

                for capture in m.captures {
                    let index = Some(capture.index);
                    let text = node_text(capture.node, source);
                    if index == named {
                        symbol = Some(text);
                    } else if index == default || index == namespace {
                        module_only = true;
                    } else if index == path {
                        // Rust paths: `crate::math::multiply` → `math.multiply`.
                        let dotted = text.replace("::", ".");
                        let trimmed = dotted
                            .strip_prefix("crate.")
                            .or_else(|| dotted.strip_prefix("self."))
                            .unwrap_or(&dotted);
                        refs.imports.push(trimmed.to_string());
                    } else if capture.node.kind() == "string" {
                        module = Some(normalize_module(text));
                    }
                }

                match (symbol, &module) {
                    (Some(symbol), Some(module)) => {
                        refs.imports.push(format!("{module}.{symbol}"))
                    }
                    (None, Some(module)) if module_only => refs.imports.push(module.clone()),
                    _ => {}
                }
            }
        }

        // Side-effect imports (`import "./polyfill"`) carry no clause; the
        // query patterns above never bind them.
        if matches!(self.language, Language::TypeScript | Language::JavaScript) {
            for i in 0..root.child_count() {
                let Some(node) = root.child(i) else { continue };
                if node.kind() != "import_statement" {
                    continue;
                }
                let has_clause = (0..node.child_count())
                    .filter_map(|j| node.child(j))
                    .any(|child| child.kind() == "import_clause");
                if !has_clause {
                    if let Some(source_node) = node.child_by_field_name("source") {
                        refs.imports
                            .push(normalize_module(node_text(source_node, source)));
                    }
                }
            }
        }

        if let Some(query) = &self.reexport_query {
            let symbol = query.capture_index_for_name("symbol");
            let mut cursor = QueryCursor::new();
            for m in cursor.matches(query, root, source.as_bytes()) {
                let mut name: Option<&str> = None;
                let mut module: Option<String> = None;
                for capture in m.captures {
                    let text = node_text(capture.node, source);
                    if Some(capture.index) == symbol {
                        name = Some(text);
                    } else if capture.node.kind() == "string" {
                        module = Some(normalize_module(text));
                    }
                }
                if let (Some(name), Some(module)) = (name, module) {
                    refs.re_exports.push(format!("{module}.{name}"));
                }
            }

            // `export * from "./mod"` re-exports the whole module.
            for i in 0..root.child_count() {
                let Some(node) = root.child(i) else { continue };
                if node.kind() != "export_statement" {
                    continue;
                }
                let has_clause = (0..node.child_count())
                    .filter_map(|j| node.child(j))
                    .any(|child| child.kind() == "export_clause");
                if !has_clause {
                    if let Some(source_node) = node.child_by_field_name("source") {
                        refs.re_exports
                            .push(normalize_module(node_text(source_node, source)));
                    }
                }
            }
        }

        refs
    }
}

fn compile(grammar: &tree_sitter::Language, source: &str, label: &str) -> Option<Query> {
    match Query::new(grammar, source) {
        Ok(query) => Some(query),
        Err(err) => {
            warn!(%label, error = %err, "query failed to compile; extraction degrades");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{self, ChunkOutline};
    use crate::parser;

    fn outline_named<'a>(outlines: &'a [ChunkOutline], name: &str) -> &'a ChunkOutline {
        outlines
            .iter()
            .find(|o| o.name == name)
            .unwrap_or_else(|| panic!("no chunk named {name}"))
    }

    fn facts_for(
        language: Language,
        file: &str,
        source: &str,
        chunk_name: &str,
    ) -> ExtractedFacts {
        let tree = parser::parse(language, source).unwrap();
        let outlines = chunker::chunk_source(language, file, source, &tree);
        let outline = outline_named(&outlines, chunk_name);
        let registry = ExtractorRegistry::with_defaults();
        let extractor = registry.resolve(language).unwrap();
        let refs = extractor.module_references(source, &tree);

        let node = tree
            .root_node()
            .descendant_for_byte_range(outline.start_byte, outline.end_byte)
            .unwrap();
        extractor.extract(&ExtractionContext {
            source,
            node,
            tree: &tree,
            language,
            module_imports: &refs.imports,
            module_re_exports: &refs.re_exports,
        })
    }

    #[test]
    fn python_extractor_collects_imports_and_calls() {
        let source = r#"
import os
from math_utils import multiply, divide

def compute(x):
    """Compute a value."""
    total = multiply(x, 2)
    return os.path.join("a", str(total))
"#;
        let facts = facts_for(Language::Python, "calc.py", source, "compute");

        assert!(facts.imports.contains(&"os".to_string()));
        assert!(facts.imports.contains(&"math_utils.multiply".to_string()));
        assert!(facts.imports.contains(&"math_utils.divide".to_string()));
        assert!(facts.calls.contains(&"multiply".to_string()));
        assert!(facts.calls.contains(&"str".to_string()));
        assert_eq!(facts.docstring.as_deref(), Some("Compute a value."));
        assert_eq!(facts.signature.as_deref(), Some("def compute(x)"));
    }

    #[test]
    fn python_method_calls_keep_the_receiver() {
        let source = r#"
def run(calc):
    return calc.multiply(2, 3)
"#;
        let facts = facts_for(Language::Python, "main.py", source, "run");
        assert!(facts.calls.contains(&"calc.multiply".to_string()));
    }

    #[test]
    fn python_cyclomatic_counts_branches() {
        let source = r#"
def branchy(x):
    if x > 0:
        for i in range(x):
            if i % 2 == 0:
                x += 1
    return x
"#;
        let facts = facts_for(Language::Python, "b.py", source, "branchy");
        assert_eq!(facts.cyclomatic, Some(4));
    }

    #[test]
    fn typescript_import_forms_are_recognized() {
        let source = r#"
import { multiply, divide } from "./math";
import Calculator from "./calculator";
import * as helpers from "./helpers";
import "./polyfill";

export function noop(): void {}
"#;
        let tree = parser::parse(Language::TypeScript, source).unwrap();
        let registry = ExtractorRegistry::with_defaults();
        let extractor = registry.resolve(Language::TypeScript).unwrap();
        let refs = extractor.module_references(source, &tree);

        assert!(refs.imports.contains(&"math.multiply".to_string()));
        assert!(refs.imports.contains(&"math.divide".to_string()));
        assert!(refs.imports.contains(&"calculator".to_string()));
        assert!(refs.imports.contains(&"helpers".to_string()));
        assert!(refs.imports.contains(&"polyfill".to_string()));
    }

    #[test]
    fn typescript_reexports_are_separate_from_imports() {
        let source = r#"
export { multiply } from "./math";
export * from "./shapes";
"#;
        let tree = parser::parse(Language::TypeScript, source).unwrap();
        let registry = ExtractorRegistry::with_defaults();
        let extractor = registry.resolve(Language::TypeScript).unwrap();
        let refs = extractor.module_references(source, &tree);

        assert!(refs.re_exports.contains(&"math.multiply".to_string()));
        assert!(refs.re_exports.contains(&"shapes".to_string()));
        assert!(refs.imports.is_empty());
    }

    #[test]
    fn typescript_calls_use_the_dotted_convention() {
        let source = r#"
function run(service: MathService): number {
    const direct = helper();
    const viaMethod = service.multiply(2, 3);
    const built = new Calculator();
    return direct + viaMethod;
}
"#;
        let facts = facts_for(Language::TypeScript, "run.ts", source, "run");

        assert!(facts.calls.contains(&"helper".to_string()));
        assert!(facts.calls.contains(&"service.multiply".to_string()));
        assert!(facts.calls.contains(&"Calculator".to_string()));
    }

    #[test]
    fn type_fields_are_left_to_the_oracle() {
        let source = r#"
export function typed(a: number, b: number): number {
    return a + b;
}
"#;
        let facts = facts_for(Language::TypeScript, "typed.ts", source, "typed");
        // Even for a fully annotated source the extractor leaves type
        // enrichment to the oracle path.
        assert!(facts.signature.is_some());
        assert!(facts.calls.is_empty());
    }

    #[test]
    fn rust_use_declarations_become_dotted_imports() {
        let source = r#"
use crate::engine::start;

fn main() {
    start();
}
"#;
        let tree = parser::parse(Language::Rust, source).unwrap();
        let registry = ExtractorRegistry::with_defaults();
        let extractor = registry.resolve(Language::Rust).unwrap();
        let refs = extractor.module_references(source, &tree);
        assert!(refs.imports.contains(&"engine.start".to_string()));
    }
}
