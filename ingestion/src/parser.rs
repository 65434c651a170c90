use mnemolite_core::error::{ErrorKind, KindedError};
use mnemolite_core::model::Language;
use thiserror::Error;
use tree_sitter::{Parser, Tree};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("grammar rejected for {0}: {1}")]
    Grammar(&'static str, String),
    #[error("parser produced no tree")]
    NoTree,
    #[error("source contains syntax errors")]
    SyntaxErrors,
}

impl KindedError for ParseError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::ParseError
    }
}

/// Grammar for a language tag. JavaScript is parsed with the TypeScript
/// grammar (a superset), keeping the grammar set to one proven pin set.
pub fn grammar(language: Language) -> tree_sitter::Language {
    match language {
        Language::Python => tree_sitter_python::language(),
        Language::TypeScript | Language::JavaScript => {
            tree_sitter_typescript::language_typescript()
        }
        Language::Rust => tree_sitter_rust::language(),
    }
}

pub fn parse(language: Language, source: &str) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&grammar(language))
        .map_err(|e| ParseError::Grammar(language.as_str(), e.to_string()))?;

    let tree = parser.parse(source, None).ok_or(ParseError::NoTree)?;

    if tree.root_node().has_error() {
        return Err(ParseError::SyntaxErrors);
    }

    Ok(tree)
}
