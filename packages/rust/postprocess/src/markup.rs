//! Helpers for the HTML subset understood by the chat transport.
//!
//! The transport rejects the whole message on any markup error, so everything
//! the sanitizer emits goes through [`validate_markup`] before delivery.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// Tags the sanitizer emits. Anything else is a markup error.
const ALLOWED_TAGS: &[&str] = &["b", "i", "a"];

/// Why a string is not valid transport markup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkupError {
    #[error("unsupported tag <{0}>")]
    UnknownTag(String),

    #[error("tag <{0}> is never closed")]
    Unclosed(String),

    #[error("expected </{expected}>, found </{found}>")]
    Mismatched { expected: String, found: String },

    #[error("closing </{0}> without a matching opening tag")]
    UnexpectedClose(String),

    #[error("<a> tag without an href attribute at byte {offset}")]
    MissingHref { offset: usize },

    #[error("unterminated tag at byte {offset}")]
    UnterminatedTag { offset: usize },

    #[error("unescaped '>' at byte {offset}")]
    StrayAngle { offset: usize },

    #[error("invalid entity at byte {offset}")]
    BadEntity { offset: usize },
}

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^a\s+href="[^"<>]*"\s*$"#).expect("href regex"));

static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<a\s+href="([^"]*)"\s*>(.*?)</a>"#).expect("anchor regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^<>]*>").expect("tag regex"));

/// Escape the three characters the transport treats as markup.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Reverse [`escape_html`] (plus `&quot;`).
pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Build a native hyperlink. `href` and `text` must already be HTML-escaped.
pub(crate) fn anchor(href: &str, text: &str) -> String {
    let href = href.replace('"', "&quot;");
    format!(r#"<a href="{href}">{text}</a>"#)
}

/// Byte ranges of every `<a …>…</a>` element in `html`.
pub(crate) fn anchor_spans(html: &str) -> Vec<Range<usize>> {
    ANCHOR_RE.find_iter(html).map(|m| m.range()).collect()
}

/// Check that `html` only uses allowed tags, nests them properly, and
/// contains no stray `<`, `>` or `&`.
pub fn validate_markup(html: &str) -> Result<(), MarkupError> {
    let mut stack: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < html.len() {
        let rest = &html[i..];

        if rest.starts_with('<') {
            let end = rest
                .find('>')
                .filter(|&end| !rest[1..end].contains('<'))
                .ok_or(MarkupError::UnterminatedTag { offset: i })?;
            let inner = &rest[1..end];

            if let Some(name) = inner.strip_prefix('/') {
                let name = name.trim();
                match stack.pop() {
                    Some(open) if open == name => {}
                    Some(open) => {
                        return Err(MarkupError::Mismatched {
                            expected: open.to_string(),
                            found: name.to_string(),
                        });
                    }
                    None => return Err(MarkupError::UnexpectedClose(name.to_string())),
                }
            } else {
                let name = inner.split_whitespace().next().unwrap_or_default();
                if !ALLOWED_TAGS.contains(&name) {
                    return Err(MarkupError::UnknownTag(name.to_string()));
                }
                if name == "a" && !HREF_RE.is_match(inner) {
                    return Err(MarkupError::MissingHref { offset: i });
                }
                stack.push(name);
            }
            i += end + 1;
        } else if rest.starts_with('>') {
            return Err(MarkupError::StrayAngle { offset: i });
        } else if rest.starts_with('&') {
            let end = rest
                .find(';')
                .filter(|&end| is_valid_entity(&rest[..=end]))
                .ok_or(MarkupError::BadEntity { offset: i })?;
            i += end + 1;
        } else {
            i += rest.chars().next().map_or(1, char::len_utf8);
        }
    }

    match stack.pop() {
        Some(open) => Err(MarkupError::Unclosed(open.to_string())),
        None => Ok(()),
    }
}

fn is_valid_entity(entity: &str) -> bool {
    match entity {
        "&amp;" | "&lt;" | "&gt;" | "&quot;" => true,
        _ => {
            let Some(body) = entity.strip_prefix("&#").and_then(|e| e.strip_suffix(';')) else {
                return false;
            };
            match body.strip_prefix(['x', 'X']) {
                Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
                None => !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()),
            }
        }
    }
}

/// Reduce transport markup to plain text.
///
/// Hyperlinks keep their target as `text (url)` so nothing the reader needs
/// disappears with the tags.
pub fn strip_markup(html: &str) -> String {
    let text = ANCHOR_RE.replace_all(html, |caps: &regex::Captures| {
        let href = &caps[1];
        let inner = TAG_RE.replace_all(&caps[2], "");
        if inner == href {
            inner.into_owned()
        } else {
            format!("{inner} ({href})")
        }
    });
    let text = TAG_RE.replace_all(&text, "");
    unescape_html(&text)
}
