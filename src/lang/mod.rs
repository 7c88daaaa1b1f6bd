//! Target-language support: file naming conventions and tree-sitter parsing.

pub mod parser;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub use parser::{parse_source, syntax_check, ParsedSource, SymbolKind, SymbolInfo, SyntaxIssue};

/// Language the destination codebase is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    #[default]
    Python,
    Rust,
}

impl TargetLanguage {
    pub fn extension(self) -> &'static str {
        match self {
            TargetLanguage::Python => "py",
            TargetLanguage::Rust => "rs",
        }
    }

    pub fn fence_tags(self) -> &'static [&'static str] {
        match self {
            TargetLanguage::Python => &["python", "py", "python3"],
            TargetLanguage::Rust => &["rust", "rs"],
        }
    }

    pub fn line_comment(self) -> &'static str {
        match self {
            TargetLanguage::Python => "#",
            TargetLanguage::Rust => "//",
        }
    }

    /// Whether `path` is a source file of this language.
    pub fn matches(self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(self.extension()))
            .unwrap_or(false)
    }

    /// Module name as used in imports: `src/analytics/fg_pct.py` -> `fg_pct`.
    pub fn module_name(self, path: &Path) -> String {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
            .to_string()
    }

    /// Where generated tests for `source_path` are written inside the
    /// isolated workspace.
    pub fn test_path_for(self, source_path: &Path) -> std::path::PathBuf {
        let module = self.module_name(source_path);
        match self {
            TargetLanguage::Python => Path::new("tests").join(format!("test_{module}_generated.py")),
            TargetLanguage::Rust => Path::new("tests").join(format!("{module}_generated.rs")),
        }
    }
}

impl fmt::Display for TargetLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetLanguage::Python => write!(f, "Python"),
            TargetLanguage::Rust => write!(f, "Rust"),
        }
    }
}
