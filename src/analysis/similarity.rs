//! Lexical similarity between recommendation text and code identifiers.

use std::collections::BTreeSet;

use crate::text::tokenize;

/// Weight applied to matches against the full recommendation text, which is
/// noisier than the title.
const CONTEXT_WEIGHT: f64 = 0.6;

/// Sørensen-Dice coefficient.
pub fn dice(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    2.0 * shared / (a.len() + b.len()) as f64
}

/// Share of `part` found in `whole`.
pub fn containment(part: &BTreeSet<String>, whole: &BTreeSet<String>) -> f64 {
    if part.is_empty() {
        return 0.0;
    }
    part.intersection(whole).count() as f64 / part.len() as f64
}

/// Recommendation text prepared once for scoring many symbols.
#[derive(Debug, Clone, Default)]
pub struct QueryTokens {
    pub title: BTreeSet<String>,
    pub context: BTreeSet<String>,
}

impl QueryTokens {
    pub fn new(title: &str, full_text: &str) -> Self {
        Self {
            title: tokenize(title),
            context: tokenize(full_text),
        }
    }

    /// Score of an identifier against the title, falling back to a
    /// down-weighted match against the full text.
    pub fn score_identifier(&self, identifier: &str) -> f64 {
        let tokens = tokenize(identifier);
        let title = dice(&tokens, &self.title);
        let context = containment(&tokens, &self.context) * CONTEXT_WEIGHT;
        title.max(context)
    }

    /// Whether any token of `text` also appears in the query.
    pub fn mentions(&self, text: &str) -> bool {
        tokenize(text).iter().any(|t| self.context.contains(t))
    }
}
