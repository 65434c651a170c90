use mnemolite_core::model::{ChunkKind, Language};
use std::collections::HashMap;
use std::path::Path;
use tree_sitter::{Node, Tree};

/// Number of lines per fallback slice when a file yields no structural units.
const FALLBACK_SLICE_LINES: usize = 60;

/// A code unit located in the parse tree, before metadata and embeddings
/// are attached. Byte offsets let later stages re-find the syntax node.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutline {
    pub kind: ChunkKind,
    pub name: String,
    pub qualified_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub start_byte: usize,
    pub end_byte: usize,
}

/// Module segment rooting every qualified name in this file.
pub fn module_name(file_path: &str) -> String {
    Path::new(file_path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("module")
        .to_string()
}

pub fn chunk_source(
    language: Language,
    file_path: &str,
    source: &str,
    tree: &Tree,
) -> Vec<ChunkOutline> {
    let module = module_name(file_path);
    let root = tree.root_node();
    let mut out = Vec::new();

    match language {
        Language::Python => chunk_python(root, source, &module, &mut out),
        Language::TypeScript | Language::JavaScript => {
            chunk_typescript(root, source, &module, &mut out)
        }
        Language::Rust => chunk_rust(root, source, &module, &mut out),
    }

    disambiguate(&mut out);

    if out.is_empty() && !source.trim().is_empty() {
        fallback_slices(source, &module, &mut out);
    }

    out
}

fn chunk_python(root: Node<'_>, source: &str, module: &str, out: &mut Vec<ChunkOutline>) {
    for i in 0..root.child_count() {
        let Some(child) = root.child(i) else { continue };
        let node = unwrap_decorated(child);

        match node.kind() {
            "function_definition" => {
                push_named(out, node, source, module, None, ChunkKind::Function);
            }
            "class_definition" => {
                if let Some(class_name) = field_text(node, "name", source) {
                    push_outline(out, node, module, None, &class_name, ChunkKind::Class);
                    if let Some(body) = node.child_by_field_name("body") {
                        chunk_python_methods(body, source, module, &class_name, out);
                    }
                }
            }
            _ => {}
        }
    }
}

fn chunk_python_methods(
    body: Node<'_>,
    source: &str,
    module: &str,
    class_name: &str,
    out: &mut Vec<ChunkOutline>,
) {
    for i in 0..body.child_count() {
        let Some(child) = body.child(i) else { continue };
        let node = unwrap_decorated(child);
        if node.kind() == "function_definition" {
            push_named(out, node, source, module, Some(class_name), ChunkKind::Method);
        }
    }
}

fn chunk_typescript(root: Node<'_>, source: &str, module: &str, out: &mut Vec<ChunkOutline>) {
    for i in 0..root.child_count() {
        let Some(child) = root.child(i) else { continue };
        // `export function f …` wraps the declaration one level down.
        let node = if child.kind() == "export_statement" {
            child.child_by_field_name("declaration").unwrap_or(child)
        } else {
            child
        };

        match node.kind() {
            "function_declaration" => {
                push_named(out, node, source, module, None, ChunkKind::Function);
            }
            "class_declaration" | "abstract_class_declaration" => {
                if let Some(class_name) = field_text(node, "name", source) {
                    push_outline(out, node, module, None, &class_name, ChunkKind::Class);
                    if let Some(body) = node.child_by_field_name("body") {
                        chunk_typescript_methods(body, source, module, &class_name, out);
                    }
                }
            }
            "interface_declaration" => {
                push_named(out, node, source, module, None, ChunkKind::Interface);
            }
            "enum_declaration" => {
                push_named(out, node, source, module, None, ChunkKind::Enum);
            }
            "lexical_declaration" | "variable_declaration" => {
                chunk_typescript_function_bindings(node, source, module, out);
            }
            _ => {}
        }
    }
}

fn chunk_typescript_methods(
    body: Node<'_>,
    source: &str,
    module: &str,
    class_name: &str,
    out: &mut Vec<ChunkOutline>,
) {
    for i in 0..body.child_count() {
        let Some(node) = body.child(i) else { continue };
        if node.kind() == "method_definition" {
            push_named(out, node, source, module, Some(class_name), ChunkKind::Method);
        }
    }
}

/// `const f = (x) => …` and `const f = function …` count as functions.
fn chunk_typescript_function_bindings(
    node: Node<'_>,
    source: &str,
    module: &str,
    out: &mut Vec<ChunkOutline>,
) {
    for i in 0..node.child_count() {
        let Some(declarator) = node.child(i) else { continue };
        if declarator.kind() != "variable_declarator" {
            continue;
        }
        let Some(value) = declarator.child_by_field_name("value") else {
            continue;
        };
        if !matches!(value.kind(), "arrow_function" | "function_expression" | "function") {
            continue;
        }
        if let Some(name) = field_text(declarator, "name", source) {
            push_outline(out, node, module, None, &name, ChunkKind::Function);
        }
    }
}

fn chunk_rust(root: Node<'_>, source: &str, module: &str, out: &mut Vec<ChunkOutline>) {
    for i in 0..root.child_count() {
        let Some(node) = root.child(i) else { continue };
        match node.kind() {
            "function_item" => {
                push_named(out, node, source, module, None, ChunkKind::Function);
            }
            "struct_item" => {
                push_named(out, node, source, module, None, ChunkKind::Class);
            }
            "enum_item" => {
                push_named(out, node, source, module, None, ChunkKind::Enum);
            }
            "trait_item" => {
                push_named(out, node, source, module, None, ChunkKind::Interface);
            }
            "impl_item" => {
                let type_name = node
                    .child_by_field_name("type")
                    .and_then(|n| n.utf8_text(source.as_bytes()).ok())
                    .unwrap_or("impl")
                    .to_string();
                if let Some(body) = node.child_by_field_name("body") {
                    for j in 0..body.child_count() {
                        let Some(item) = body.child(j) else { continue };
                        if item.kind() == "function_item" {
                            push_named(out, item, source, module, Some(type_name.as_str()), ChunkKind::Method);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn unwrap_decorated(node: Node<'_>) -> Node<'_> {
    if node.kind() == "decorated_definition" {
        node.child_by_field_name("definition").unwrap_or(node)
    } else {
        node
    }
}

fn field_text(node: Node<'_>, field: &str, source: &str) -> Option<String> {
    node.child_by_field_name(field)
        .and_then(|n| n.utf8_text(source.as_bytes()).ok())
        .map(|s| s.to_string())
}

fn push_named(
    out: &mut Vec<ChunkOutline>,
    node: Node<'_>,
    source: &str,
    module: &str,
    parent: Option<&str>,
    kind: ChunkKind,
) {
    if let Some(name) = field_text(node, "name", source) {
        push_outline(out, node, module, parent, &name, kind);
    }
}

fn push_outline(
    out: &mut Vec<ChunkOutline>,
    node: Node<'_>,
    module: &str,
    parent: Option<&str>,
    name: &str,
    kind: ChunkKind,
) {
    let qualified_name = match parent {
        Some(parent) => format!("{module}.{parent}.{name}"),
        None => format!("{module}.{name}"),
    };

    out.push(ChunkOutline {
        kind,
        name: name.to_string(),
        qualified_name,
        start_line: node.start_position().row as u32 + 1,
        end_line: node.end_position().row as u32 + 1,
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
    });
}

/// `(qualified_name, kind)` must be unique per file; same-name siblings
/// (overloads, re-declarations) get a positional suffix.
fn disambiguate(out: &mut [ChunkOutline]) {
    let mut seen: HashMap<(String, ChunkKind), usize> = HashMap::new();
    for outline in out.iter_mut() {
        let key = (outline.qualified_name.clone(), outline.kind);
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        if *count > 1 {
            outline.qualified_name = format!("{}#{}", outline.qualified_name, count);
        }
    }
}

fn fallback_slices(source: &str, module: &str, out: &mut Vec<ChunkOutline>) {
    let lines: Vec<&str> = source.lines().collect();
    let mut offset = 0usize;
    let mut line_starts = Vec::with_capacity(lines.len());
    for line in &lines {
        line_starts.push(offset);
        offset += line.len() + 1;
    }

    for (slice_index, window) in lines.chunks(FALLBACK_SLICE_LINES).enumerate() {
        let start_line = slice_index * FALLBACK_SLICE_LINES;
        let end_line = start_line + window.len() - 1;
        let start_byte = line_starts[start_line];
        let end_byte = (line_starts[end_line] + lines[end_line].len()).min(source.len());

        out.push(ChunkOutline {
            kind: ChunkKind::FallbackFixed,
            name: format!("{module}_part{slice_index}"),
            qualified_name: format!("{module}.part_{slice_index}"),
            start_line: start_line as u32 + 1,
            end_line: end_line as u32 + 1,
            start_byte,
            end_byte,
        });
    }
}
