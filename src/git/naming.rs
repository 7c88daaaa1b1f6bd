//! Branch naming: `feature/<slug(title)>-<unix_ts>-<random_suffix>`.

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::text::slugify;

const MAX_SLUG_LEN: usize = 40;
const SUFFIX_LEN: usize = 8;

/// Deterministic part of every branch generated for `title`.
pub fn branch_prefix(title: &str) -> String {
    let slug = slugify(title, '-', MAX_SLUG_LEN);
    let slug = if slug.is_empty() { "recommendation".to_string() } else { slug };
    format!("feature/{slug}-")
}

/// A fresh branch name for `title`. Unique across concurrent callers through
/// the timestamp and random suffix.
pub fn generate_branch_name(title: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}{timestamp}-{suffix}", branch_prefix(title))
}

/// Whether `branch` was generated for `title`, as opposed to a longer title
/// sharing the same leading words.
pub fn is_branch_for(title: &str, branch: &str) -> bool {
    let Some(rest) = branch.strip_prefix(&branch_prefix(title)) else {
        return false;
    };
    match rest.split_once('-') {
        Some((ts, suffix)) => {
            !ts.is_empty()
                && ts.chars().all(|c| c.is_ascii_digit())
                && !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}
