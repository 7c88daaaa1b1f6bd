//! Text helpers shared by path mapping, similarity scoring and branch naming.

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "into", "is",
    "it", "its", "of", "on", "or", "per", "that", "the", "this", "to", "with", "add", "new",
    "use", "using", "implement", "create", "support", "should", "will", "can", "we", "our",
    "self", "def", "fn", "pub", "return", "none", "true", "false",
];

/// Lowercase `title`, keep ASCII alphanumerics, and join words with `sep`,
/// truncating at a word boundary so the result is at most `max_len` long.
/// A single word longer than `max_len` is cut at `max_len`.
pub fn slugify(title: &str, sep: char, max_len: usize) -> String {
    let normalized: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    let mut slug = String::new();
    for word in normalized.split_whitespace() {
        let needed = if slug.is_empty() { word.len() } else { word.len() + 1 };
        if slug.len() + needed > max_len {
            if slug.is_empty() {
                slug.push_str(&word[..max_len.min(word.len())]);
            }
            break;
        }
        if !slug.is_empty() {
            slug.push(sep);
        }
        slug.push_str(word);
    }
    slug
}

/// Split an identifier into lowercase words: `fieldGoalPct` and
/// `field_goal_pct` both yield `field`, `goal`, `pct`.
pub fn split_identifier(ident: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in ident.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Content words of free text or identifiers, without stopwords or
/// single characters.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .flat_map(split_identifier)
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(&w.as_str()))
        .map(|w| normalize_token(&w))
        .collect()
}

/// Crude plural folding so `games`/`game` and `stats`/`stat` match.
fn normalize_token(word: &str) -> String {
    if word.len() > 3 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Truncate to at most `max_chars` characters, appending a marker when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker = "\n... [truncated]";
    let keep = max_chars.saturating_sub(marker.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(marker);
    out
}
