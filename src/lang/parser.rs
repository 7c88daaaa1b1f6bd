//! Tree-sitter based parsing for syntax validation and symbol extraction

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use thiserror::Error;
use tree_sitter::{Node, Parser, Tree};

use super::TargetLanguage;

// Parsers are reused per thread; generation and analysis run on the tokio
// blocking pool as well as on worker threads.
thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
    Struct,
    Enum,
    Trait,
    Module,
    Constant,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Trait => "trait",
            SymbolKind::Module => "module",
            SymbolKind::Constant => "constant",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    pub line: usize,
    /// Defined directly at module level (not nested in a class/impl/function)
    pub top_level: bool,
    /// First line of the definition, trimmed
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSource {
    pub symbols: Vec<SymbolInfo>,
    pub imports: Vec<String>,
    pub syntax_error: Option<SyntaxIssue>,
}

impl ParsedSource {
    pub fn top_level_names(&self) -> Vec<&str> {
        self.symbols
            .iter()
            .filter(|s| s.top_level)
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

fn parse_tree(content: &str, language: TargetLanguage) -> Result<Tree, SyntaxIssue> {
    let tree = match language {
        TargetLanguage::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        TargetLanguage::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
    };
    tree.ok_or_else(|| SyntaxIssue {
        line: 0,
        column: 0,
        message: format!("{language} parser produced no tree"),
    })
}

/// Full syntax parse. Returns the first error or missing node.
pub fn syntax_check(content: &str, language: TargetLanguage) -> Result<(), SyntaxIssue> {
    let tree = parse_tree(content, language)?;
    match first_error(&tree.root_node(), content) {
        Some(issue) => Err(issue),
        None => Ok(()),
    }
}

/// Parse `content` into a symbol table and import list. A source with syntax
/// errors still yields whatever symbols tree-sitter recovered.
pub fn parse_source(content: &str, language: TargetLanguage) -> Result<ParsedSource, SyntaxIssue> {
    let tree = parse_tree(content, language)?;
    let root = tree.root_node();
    let (symbols, imports) = match language {
        TargetLanguage::Python => extract_python(&root, content),
        TargetLanguage::Rust => extract_rust(&root, content),
    };
    Ok(ParsedSource {
        symbols,
        imports,
        syntax_error: first_error(&root, content),
    })
}

fn first_error(root: &Node, content: &str) -> Option<SyntaxIssue> {
    if !root.has_error() {
        return None;
    }
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            let message = if node.is_missing() {
                format!("missing `{}`", node.kind())
            } else {
                let snippet: String = node_text(&node, content).chars().take(40).collect();
                format!("unexpected `{}`", snippet.trim())
            };
            return Some(SyntaxIssue {
                line: pos.row + 1,
                column: pos.column + 1,
                message,
            });
        }

        // only descend into subtrees that contain the error
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                let pos = root.start_position();
                return Some(SyntaxIssue {
                    line: pos.row + 1,
                    column: pos.column + 1,
                    message: "unrecognised syntax error".into(),
                });
            }
        }
    }
}

fn extract_python(root: &Node, content: &str) -> (Vec<SymbolInfo>, Vec<String>) {
    let mut symbols = Vec::new();
    let mut imports = Vec::new();
    let mut cursor = root.walk();

    loop {
        let node = cursor.node();
        match node.kind() {
            "function_definition" | "class_definition" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    let kind = if node.kind() == "class_definition" {
                        SymbolKind::Class
                    } else {
                        SymbolKind::Function
                    };
                    symbols.push(symbol(&node, &name_node, kind, content, is_python_top_level(&node)));
                }
            }
            "expression_statement" if is_python_top_level(&node) => {
                // MODULE_CONSTANT = ...
                if let Some(assign) = node.named_child(0).filter(|n| n.kind() == "assignment") {
                    if let Some(left) = assign.child_by_field_name("left") {
                        let name = node_text(&left, content);
                        if !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit()) {
                            symbols.push(symbol(&node, &left, SymbolKind::Constant, content, true));
                        }
                    }
                }
            }
            "import_statement" | "import_from_statement" => {
                imports.push(node_text(&node, content).trim().to_string());
            }
            _ => {}
        }

        if cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return (symbols, imports);
            }
        }
    }
}

fn is_python_top_level(node: &Node) -> bool {
    match node.parent() {
        Some(parent) if parent.kind() == "module" => true,
        Some(parent) if parent.kind() == "decorated_definition" => parent
            .parent()
            .map(|gp| gp.kind() == "module")
            .unwrap_or(false),
        _ => false,
    }
}

fn extract_rust(root: &Node, content: &str) -> (Vec<SymbolInfo>, Vec<String>) {
    let mut symbols = Vec::new();
    let mut imports = Vec::new();
    let mut cursor = root.walk();

    loop {
        let node = cursor.node();
        let kind = match node.kind() {
            "function_item" => Some(SymbolKind::Function),
            "struct_item" => Some(SymbolKind::Struct),
            "enum_item" => Some(SymbolKind::Enum),
            "trait_item" => Some(SymbolKind::Trait),
            "mod_item" => Some(SymbolKind::Module),
            "const_item" | "static_item" => Some(SymbolKind::Constant),
            "use_declaration" => {
                imports.push(node_text(&node, content).trim().to_string());
                None
            }
            _ => None,
        };
        if let Some(kind) = kind {
            if let Some(name_node) = node.child_by_field_name("name") {
                let top_level = node
                    .parent()
                    .map(|p| p.kind() == "source_file")
                    .unwrap_or(false);
                symbols.push(symbol(&node, &name_node, kind, content, top_level));
            }
        }

        if cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return (symbols, imports);
            }
        }
    }
}

fn symbol(node: &Node, name_node: &Node, kind: SymbolKind, content: &str, top_level: bool) -> SymbolInfo {
    let signature: String = node_text(node, content)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .chars()
        .take(120)
        .collect();
    SymbolInfo {
        name: node_text(name_node, content).to_string(),
        kind,
        line: node.start_position().row + 1,
        top_level,
        signature,
    }
}

fn node_text<'a>(node: &Node, content: &'a str) -> &'a str {
    node.utf8_text(content.as_bytes()).unwrap_or("")
}
