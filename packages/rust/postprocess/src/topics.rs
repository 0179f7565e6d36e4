//! Topic extraction from the generator's numbered "themes" answer.
//!
//! The generator enumerates topics in whatever style it likes (keycap emoji,
//! `1)`, `1.`) and sometimes repeats the whole list. Extraction runs an
//! ordered list of matchers, pools their hits, normalizes each hit, and
//! deduplicates down to [`TOPIC_LIMIT`] entries.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument};

use natrium_shared::TOPIC_LIMIT;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Ordered, duplicate-free list of topics (at most [`TOPIC_LIMIT`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TopicList(Vec<String>);

impl TopicList {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Topic by its 1-based menu number.
    pub fn by_number(&self, number: usize) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|idx| self.0.get(idx))
            .map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<'a> IntoIterator for &'a TopicList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// One enumeration style the generator may use.
struct TopicMatcher {
    name: &'static str,
    regex: Regex,
}

impl TopicMatcher {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("valid topic regex"),
        }
    }

    /// Raw item texts in order of appearance.
    fn find<'t>(&self, raw: &'t str) -> Vec<&'t str> {
        self.regex
            .captures_iter(raw)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .collect()
    }
}

/// Matchers in priority order. Item text runs to the first `[` or end of line.
static MATCHERS: LazyLock<Vec<TopicMatcher>> = LazyLock::new(|| {
    vec![
        // 1️⃣ … 9️⃣ (the variation selector is sometimes dropped)
        TopicMatcher::new("keycap", r"[1-9]\x{FE0F}?\x{20E3}[^\S\n]+([^\[\n]+)"),
        // 🔟
        TopicMatcher::new("keycap_ten", r"\x{1F51F}[^\S\n]+([^\[\n]+)"),
        // 1) Тема
        TopicMatcher::new("paren", r"(?m)^[^\S\n]*(?:10|[1-9])\)[^\S\n]+([^\[\n]+)"),
        // 1. Тема
        TopicMatcher::new("period", r"(?m)^[^\S\n]*(?:10|[1-9])\.[^\S\n]+([^\[\n]+)"),
    ]
});

/// Opening brackets of a citation fragment; the topic ends before them.
const CITATION_OPENERS: [char; 2] = ['(', '['];

/// Bold markers removed wherever they appear in a topic.
const BOLD_MARKERS: [&str; 2] = ["**", "__"];

/// Separators trimmed from both ends of a topic after citation removal.
const SEPARATORS: &[char] = &['—', '–', '-', ':'];

/// Open/close pairs stripped when they enclose a topic, or when one of them
/// dangles at an end without its partner.
const ENCLOSING: [(char, char); 5] = [('*', '*'), ('_', '_'), ('"', '"'), ('«', '»'), ('“', '”')];

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract up to [`TOPIC_LIMIT`] unique topics from raw generator output.
///
/// Never fails: an answer without a recognizable enumeration yields an empty
/// list, and the caller should ask the user to name a topic instead.
#[instrument(skip_all, fields(len = raw.len()))]
pub fn extract_topics(raw: &str) -> TopicList {
    extract_topics_with_limit(raw, TOPIC_LIMIT)
}

/// [`extract_topics`] with an explicit ceiling.
pub fn extract_topics_with_limit(raw: &str, limit: usize) -> TopicList {
    let mut candidates: Vec<String> = Vec::new();

    for matcher in MATCHERS.iter() {
        let hits = matcher.find(raw);
        debug!(matcher = matcher.name, hits = hits.len(), "topic matcher ran");
        candidates.extend(hits.into_iter().filter_map(normalize_topic));
    }

    let found = candidates.len();
    let topics = select_unique(candidates, limit);

    info!(found, kept = topics.len(), "topics extracted");

    TopicList(topics)
}

/// Cut the citation fragment, drop bold markers, and trim enclosing
/// punctuation. `None` if nothing is left.
fn normalize_topic(raw: &str) -> Option<String> {
    let without_citation = raw.split(CITATION_OPENERS).next().unwrap_or_default();
    let unmarked = BOLD_MARKERS
        .iter()
        .fold(without_citation.to_string(), |acc, marker| acc.replace(marker, ""));
    let topic = trim_enclosing(&unmarked);

    (!topic.is_empty()).then(|| topic.to_string())
}

/// Peel separators and enclosing pairs until the topic stops changing.
///
/// A quote that closes inside the topic (`«Креатин» и сон`) is kept.
fn trim_enclosing(mut topic: &str) -> &str {
    loop {
        topic = topic.trim_matches(|c: char| c.is_whitespace() || SEPARATORS.contains(&c));

        let peeled = ENCLOSING.iter().find_map(|&(open, close)| {
            if let Some(inner) = topic.strip_prefix(open).and_then(|r| r.strip_suffix(close)) {
                return Some(inner);
            }
            if let Some(rest) = topic.strip_prefix(open).filter(|r| !r.contains(close)) {
                return Some(rest);
            }
            topic.strip_suffix(close).filter(|r| !r.contains(open))
        });

        match peeled {
            Some(inner) => topic = inner,
            None => return topic,
        }
    }
}

/// Deduplicate candidates down to `limit` entries.
///
/// More than `limit` candidates means the generator echoed its list, so the
/// last `limit` unique entries win; their original relative order is kept.
fn select_unique(candidates: Vec<String>, limit: usize) -> Vec<String> {
    if candidates.len() > limit {
        let mut kept: Vec<String> = Vec::with_capacity(limit);
        for candidate in candidates.into_iter().rev() {
            if kept.len() == limit {
                break;
            }
            if !kept.contains(&candidate) {
                kept.push(candidate);
            }
        }
        kept.reverse();
        return kept;
    }

    let mut unique: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique.truncate(limit);
    unique
}

// ---------------------------------------------------------------------------
// Selection and display
// ---------------------------------------------------------------------------

/// Resolve what the user typed into a topic.
///
/// A menu number selects that topic; anything else is taken as a custom topic.
pub fn resolve_topic_choice(choice: &str, topics: &TopicList) -> String {
    let choice = choice.trim();
    choice
        .parse::<usize>()
        .ok()
        .and_then(|n| topics.by_number(n))
        .unwrap_or(choice)
        .to_string()
}

/// Button label: `"{number}. {Topic}"` with the first letter upper-cased.
pub fn display_label(number: usize, topic: &str) -> String {
    let mut chars = topic.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    format!("{number}. {capitalized}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
