//! Query normalization, keyword extraction and excerpt generation.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// Letters and digits, allowing inner apostrophes and hyphens ("don't", "state-of-the-art")
static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+(?:['-][\p{L}\p{N}]+)*").unwrap());

/// Tokens shorter than this never count as keywords
pub const MIN_KEYWORD_CHARS: usize = 3;

const ELLIPSIS: &str = "...";

/// Trim, collapse runs of whitespace, and lowercase single-token queries of
/// at most `short_query_max_chars` characters.
pub fn preprocess_query(raw: &str, short_query_max_chars: usize) -> String {
    let collapsed = WHITESPACE.replace_all(raw.trim(), " ").into_owned();
    if !collapsed.contains(' ') && collapsed.chars().count() <= short_query_max_chars {
        collapsed.to_lowercase()
    } else {
        collapsed
    }
}

/// Lowercased word tokens in order of appearance
pub fn tokenize(text: &str) -> Vec<String> {
    WORD.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

/// Distinct lowercased tokens of at least [`MIN_KEYWORD_CHARS`] characters,
/// in order of first appearance
pub fn keyword_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() >= MIN_KEYWORD_CHARS)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Query keywords that occur in `content` or equal one of `metadata_keywords`,
/// case-insensitively.
pub fn match_keywords(query_keywords: &[String], content: &str, metadata_keywords: &[String]) -> Vec<String> {
    let content = content.to_lowercase();
    query_keywords
        .iter()
        .filter(|keyword| {
            content.contains(keyword.as_str())
                || metadata_keywords.iter().any(|k| k.eq_ignore_ascii_case(keyword))
        })
        .cloned()
        .collect()
}

/// Jaccard overlap of the keyword token sets of `a` and `b`
pub fn jaccard_overlap(a: &str, b: &str) -> f32 {
    let left: HashSet<String> = keyword_tokens(a).into_iter().collect();
    let right: HashSet<String> = keyword_tokens(b).into_iter().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f32 / union as f32
}

/// Excerpt of at most `max_chars` characters (ellipses included).
///
/// Short content is returned whole with whitespace collapsed. Otherwise the
/// `window_words` window with the most keyword-bearing words is chosen,
/// earliest on ties, and marked with `...` where it was cut.
pub fn generate_excerpt(content: &str, keywords: &[String], max_chars: usize, window_words: usize) -> String {
    let collapsed = WHITESPACE.replace_all(content.trim(), " ");
    if collapsed.chars().count() <= max_chars {
        return collapsed.into_owned();
    }

    let words: Vec<&str> = collapsed.split(' ').collect();
    let window = window_words.max(1).min(words.len());

    let hits: Vec<usize> = words
        .iter()
        .map(|w| {
            let lower = w.to_lowercase();
            usize::from(keywords.iter().any(|k| lower.contains(k.as_str())))
        })
        .collect();

    let mut best_start = 0;
    let mut best_hits: usize = hits[..window].iter().sum();
    let mut current = best_hits;
    for start in 1..=(words.len() - window) {
        current = current + hits[start + window - 1] - hits[start - 1];
        if current > best_hits {
            best_hits = current;
            best_start = start;
        }
    }

    let prefix = if best_start > 0 { ELLIPSIS } else { "" };
    let budget = max_chars.saturating_sub(prefix.len() + ELLIPSIS.len());

    let mut body = String::new();
    let mut used_words = 0;
    for word in &words[best_start..best_start + window] {
        let extra = word.chars().count() + usize::from(!body.is_empty());
        if body.chars().count() + extra > budget {
            break;
        }
        if !body.is_empty() {
            body.push(' ');
        }
        body.push_str(word);
        used_words += 1;
    }
    if body.is_empty() {
        // A single word longer than the budget
        body = words[best_start].chars().take(budget).collect();
    }

    let cut_at_end = best_start + used_words < words.len();
    let suffix = if cut_at_end { ELLIPSIS } else { "" };
    format!("{}{}{}", prefix, body, suffix)
}
