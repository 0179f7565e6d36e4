//! Post sanitizer: raw generator answer → transport-safe HTML.
//!
//! Each stage is a function over the whole text applied in a fixed order;
//! later stages rely on the earlier ones (citation bracketing expects links to
//! already be anchors, trailing trim expects markup to be converted).

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use url::Url;

use natrium_shared::ParseMode;

use crate::markup::{
    anchor, anchor_spans, escape_html, strip_markup, unescape_html, validate_markup,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A post ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizedPost {
    /// Message body.
    pub text: String,
    /// How the transport must render `text`.
    pub parse_mode: ParseMode,
    /// Recovered anomalies, in the order they were hit.
    pub warnings: Vec<SanitizeWarning>,
}

impl SanitizedPost {
    pub fn is_degraded(&self) -> bool {
        self.parse_mode == ParseMode::Plain
    }
}

/// Something in the generator's answer did not have the expected shape.
///
/// None of these stop delivery; they are logged and counted so prompt drift
/// can be spotted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SanitizeWarning {
    /// Neither the content marker nor a post heading was found.
    NoContentMarker,
    /// Trimming the reasoning trace left nothing; the untrimmed text was used.
    EmptyAfterTrim,
    /// An odd number of `**` survived conversion; all of them were removed.
    UnpairedBold { count: usize },
    /// Final markup failed validation; the post was downgraded to plain text.
    InvalidMarkup { reason: String },
    /// Sanitizing produced an empty post; the fence-free raw text was used.
    EmptyResult,
}

impl std::fmt::Display for SanitizeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoContentMarker => f.write_str("no content marker or post heading found"),
            Self::EmptyAfterTrim => f.write_str("reasoning trim left an empty post"),
            Self::UnpairedBold { count } => write!(f, "{count} unpaired ** markers stripped"),
            Self::InvalidMarkup { reason } => write!(f, "invalid markup: {reason}"),
            Self::EmptyResult => f.write_str("sanitized post was empty"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the full sanitizer on a raw generated post.
///
/// Never fails. Anything that cannot be rendered as valid markup comes back
/// as plain text with [`ParseMode::Plain`].
#[instrument(skip_all, fields(len = raw.len()))]
pub fn sanitize_post(raw: &str) -> SanitizedPost {
    let mut warnings = Vec::new();

    let mut text = trim_reasoning(raw, &mut warnings);
    text = remove_fences(&text);
    text = normalize_terminology(&text);
    text = escape_html(&text);
    text = convert_links(&text);
    text = convert_bold(&text, &mut warnings);
    text = convert_italic(&text);
    text = bracket_citations(&text);
    text = repair_malformed_citations(&text);
    text = trim_trailing_artifacts(&text);

    finalize(raw, text.trim(), warnings)
}

/// Validate the converted text and pick the parse mode.
fn finalize(raw: &str, html: &str, mut warnings: Vec<SanitizeWarning>) -> SanitizedPost {
    if html.is_empty() {
        let fallback = remove_fences(raw).trim().to_string();
        if !fallback.is_empty() {
            warn!("sanitized post is empty, sending raw text as plain");
            warnings.push(SanitizeWarning::EmptyResult);
        }
        return SanitizedPost {
            text: fallback,
            parse_mode: ParseMode::Plain,
            warnings,
        };
    }

    match validate_markup(html) {
        Ok(()) => SanitizedPost {
            text: html.to_string(),
            parse_mode: ParseMode::Html,
            warnings,
        },
        Err(e) => {
            warn!(error = %e, "sanitized post has invalid markup, degrading to plain text");
            warnings.push(SanitizeWarning::InvalidMarkup {
                reason: e.to_string(),
            });
            SanitizedPost {
                text: strip_markup(html),
                parse_mode: ParseMode::Plain,
                warnings,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 1: Reasoning-trace trim
// ---------------------------------------------------------------------------

/// Line announcing that the deliverable starts on the next line.
const CONTENT_MARKER: &str = "ГОТОВЫЙ ПОСТ:";

/// Substrings that only appear in reasoning/tool-call lines.
const REASONING_ARTIFACTS: &[&str] = &["ГЕНЕРИРУЮ", "Шаг", "FileSearch", "Web Search"];

/// Emoji a post heading starts with (🔄 and 🏋️ belong to reasoning steps).
const HEADING_EMOJI: &[&str] = &[
    "💪", "🧠", "💤", "🔥", "⚡️", "⚡", "💓", "🍽️", "🏃", "📊", "🎯",
];

/// Lines shorter than this (in characters) are never a heading.
const MIN_HEADING_CHARS: usize = 10;

/// Where the deliverable starts.
#[derive(Debug, PartialEq, Eq)]
enum ContentStart {
    /// Line index right after the content marker.
    AfterMarker(usize),
    /// Line index of the first post heading.
    Heading(usize),
    NotFound,
}

fn locate_content_start(lines: &[&str]) -> ContentStart {
    if let Some(idx) = lines.iter().position(|l| l.contains(CONTENT_MARKER)) {
        return ContentStart::AfterMarker(idx + 1);
    }

    lines
        .iter()
        .position(|line| is_post_heading(line.trim()))
        .map_or(ContentStart::NotFound, ContentStart::Heading)
}

fn is_post_heading(line: &str) -> bool {
    if line.chars().count() < MIN_HEADING_CHARS {
        return false;
    }
    if line.starts_with('{') || REASONING_ARTIFACTS.iter().any(|a| line.contains(a)) {
        return false;
    }

    HEADING_EMOJI.iter().any(|e| line.starts_with(e))
        && line.contains("**")
        && line.chars().any(char::is_uppercase)
}

/// Drop everything before the deliverable, then leading blank and `>` lines.
fn trim_reasoning(raw: &str, warnings: &mut Vec<SanitizeWarning>) -> String {
    let lines: Vec<&str> = raw.lines().collect();

    let start = match locate_content_start(&lines) {
        ContentStart::AfterMarker(idx) => {
            debug!(line = idx - 1, "found content marker");
            idx
        }
        ContentStart::Heading(idx) => {
            debug!(line = idx, "found post heading");
            idx
        }
        ContentStart::NotFound => {
            warn!("no reasoning trace detected, using full response");
            warnings.push(SanitizeWarning::NoContentMarker);
            0
        }
    };

    let body: Vec<&str> = lines[start.min(lines.len())..]
        .iter()
        .copied()
        .skip_while(|l| {
            let t = l.trim();
            t.is_empty() || t.starts_with('>')
        })
        .collect();

    let trimmed = body.join("\n").trim().to_string();
    if trimmed.is_empty() && !raw.trim().is_empty() {
        warn!(removed = start, "reasoning trim removed the whole post, keeping it");
        warnings.push(SanitizeWarning::EmptyAfterTrim);
        return raw.trim().to_string();
    }

    debug!(removed = start, "reasoning lines removed");
    trimmed
}

// ---------------------------------------------------------------------------
// Stage 2: Fence removal
// ---------------------------------------------------------------------------

fn remove_fences(text: &str) -> String {
    text.replace("```", "")
}

// ---------------------------------------------------------------------------
// Stage 3: Terminology normalization
// ---------------------------------------------------------------------------

fn normalize_terminology(text: &str) -> String {
    text.replace("(WHO)", "(ВОЗ)").replace("WHO", "ВОЗ")
}

// ---------------------------------------------------------------------------
// Stage 4: Markup conversion
// ---------------------------------------------------------------------------

/// `[text](url)` → `<a href="url">text</a>`.
fn convert_links(text: &str) -> String {
    static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"!?\[([^\]\n]+)\]\(([^)\s]+)\)").expect("valid regex")
    });

    LINK_RE
        .replace_all(text, |caps: &regex::Captures| {
            let label = &caps[1];
            let href = &caps[2];
            if is_web_url(href) {
                anchor(href, label)
            } else {
                caps[0].to_string()
            }
        })
        .to_string()
}

/// Absolute `http`/`https` URL. `href` is HTML-escaped text.
fn is_web_url(href: &str) -> bool {
    Url::parse(&unescape_html(href))
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// `**text**` → `<b>text</b>`; strips leftovers when they cannot pair up.
fn convert_bold(text: &str, warnings: &mut Vec<SanitizeWarning>) -> String {
    static BOLD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\*\*([^\n]+?)\*\*").expect("valid regex"));

    let converted = BOLD_RE.replace_all(text, "<b>$1</b>").to_string();

    let leftover = converted.matches("**").count();
    if leftover % 2 == 1 {
        warn!(count = leftover, "unpaired ** markers, removing all of them");
        warnings.push(SanitizeWarning::UnpairedBold { count: leftover });
        return converted.replace("**", "");
    }

    converted
}

/// `*text*` → `<i>text</i>`, line by line.
fn convert_italic(text: &str) -> String {
    text.split('\n')
        .map(italicize_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn italicize_line(line: &str) -> String {
    let bytes = line.as_bytes();

    // A `*` followed by whitespace at the start of a line is a bullet.
    let indent = line.len() - line.trim_start().len();
    let bullet = (bytes.get(indent) == Some(&b'*')
        && bytes.get(indent + 1).is_some_and(|b| b.is_ascii_whitespace()))
    .then_some(indent);

    let mut stars = Vec::new();
    let mut in_tag = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => in_tag = true,
            b'>' => in_tag = false,
            b'*' if !in_tag => {
                let run = bytes[i..].iter().take_while(|&&b| b == b'*').count();
                if run == 1 && Some(i) != bullet {
                    stars.push(i);
                }
                i += run;
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    let mut pairs = Vec::new();
    let mut k = 0;
    while k + 1 < stars.len() {
        let (open, close) = (stars[k], stars[k + 1]);
        let inner = &line[open + 1..close];
        let well_formed = !inner.starts_with(char::is_whitespace)
            && !inner.ends_with(char::is_whitespace)
            && !inner.is_empty()
            && validate_markup(inner).is_ok();
        if well_formed {
            pairs.push((open, close));
            k += 2;
        } else {
            k += 1;
        }
    }

    if pairs.is_empty() {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len() + pairs.len() * 7);
    let mut last = 0;
    for (open, close) in pairs {
        out.push_str(&line[last..open]);
        out.push_str("<i>");
        out.push_str(&line[open + 1..close]);
        out.push_str("</i>");
        last = close + 1;
    }
    out.push_str(&line[last..]);
    out
}

// ---------------------------------------------------------------------------
// Stage 5: Citation bracketing
// ---------------------------------------------------------------------------

/// Wrap bare source keywords at the end of a sentence or line in parentheses.
///
/// A keyword may also open its own line (a trailing "sources" line); the
/// line break is kept. The domain keyword goes first: its own `.` would
/// otherwise read as a sentence end.
fn bracket_citations(text: &str) -> String {
    static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?im)(^|[^\S\n]+)crossfit\.com(\.|\n|$)").expect("valid regex")
    });
    static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)(^|[^\S\n]+)(ВОЗ|PubMed|Исследования|Исследование)(\.|\n|$)")
            .expect("valid regex")
    });

    let text = wrap_outside_anchors(text, &DOMAIN_RE, |_| "crossfit.com".to_string());
    wrap_outside_anchors(&text, &SOURCE_RE, |caps| caps[2].to_string())
}

/// Replace `re` matches with `(keyword)tail`, leaving anchor contents alone.
///
/// Group 1 is the leading whitespace (empty at line start), the last group
/// the tail. Leading whitespace collapses to one space.
fn wrap_outside_anchors(
    text: &str,
    re: &Regex,
    keyword: impl Fn(&regex::Captures) -> String,
) -> String {
    let anchors = anchor_spans(text);

    re.replace_all(text, |caps: &regex::Captures| {
        let start = caps.get(0).map_or(0, |m| m.start());
        if anchors.iter().any(|span| span.contains(&start)) {
            return caps[0].to_string();
        }
        let lead = if caps[1].is_empty() { "" } else { " " };
        let tail = caps.get(caps.len() - 1).map_or("", |m| m.as_str());
        format!("{lead}({}){tail}", keyword(caps))
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Stage 6: Malformed-citation repair
// ---------------------------------------------------------------------------

/// `(Label)(https://…)` → `<a href="https://…">Label</a>`.
fn repair_malformed_citations(text: &str) -> String {
    static MALFORMED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\(([^()\n]{1,60})\)\((https?://[^()\s]+)\)").expect("valid regex")
    });

    MALFORMED_RE
        .replace_all(text, |caps: &regex::Captures| {
            let label = caps[1].trim();
            if label.is_empty() || validate_markup(label).is_err() {
                return caps[0].to_string();
            }
            anchor(&caps[2], label)
        })
        .to_string()
}

// ---------------------------------------------------------------------------
// Stage 7: Trailing-artifact trim
// ---------------------------------------------------------------------------

/// Drop everything after the last hashtag line.
fn trim_trailing_artifacts(text: &str) -> String {
    static HASHTAG_LINE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*#[^\s#]").expect("valid regex"));

    let lines: Vec<&str> = text.lines().collect();
    match lines.iter().rposition(|l| HASHTAG_LINE_RE.is_match(l)) {
        Some(last) => {
            if last + 1 < lines.len() {
                debug!(dropped = lines.len() - last - 1, "removed lines after hashtags");
            }
            lines[..=last].join("\n")
        }
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_post_is_trimmed_converted_and_cut() {
        let raw = "🔄 Шаг 1: поиск\n💪 **ЗАГОЛОВОК**\nТекст поста. ВОЗ.\n#хештег\nлишний текст";
        let post = sanitize_post(raw);

        assert_eq!(post.parse_mode, ParseMode::Html);
        assert!(post.text.starts_with("💪 <b>ЗАГОЛОВОК</b>"));
        assert!(post.text.contains("(ВОЗ)"));
        assert!(!post.text.contains(" ВОЗ."));
        assert!(post.text.ends_with("#хештег"));
        assert!(!post.text.contains("лишний текст"));
        assert!(post.warnings.is_empty());
    }

    #[test]
    fn content_marker_wins_over_heading_scan() {
        let raw = "🔥 **ЧЕРНОВИК** без проверки\nГОТОВЫЙ ПОСТ:\n\n> цитата модели\n🧠 **МОЗГ И СОН**\nТекст";
        let post = sanitize_post(raw);
        assert_eq!(post.text, "🧠 <b>МОЗГ И СОН</b>\nТекст");
    }

    #[test]
    fn heading_scan_skips_reasoning_lines() {
        let lines = [
            "ГЕНЕРИРУЮ 💪 **ПОСТ** сейчас",
            r#"{"tool": "FileSearch"}"#,
            "💪 **ок**",
            "🎯 **Web Search** ЗАПРОС",
            "🎯 **ГЛАВНОЕ** о белке",
        ];
        assert_eq!(locate_content_start(&lines), ContentStart::Heading(4));
    }

    #[test]
    fn heading_requires_uppercase_and_bold() {
        assert!(!is_post_heading("💪 **только строчные буквы**"));
        assert!(!is_post_heading("💪 ЗАГОЛОВОК БЕЗ ЖИРНОГО"));
        assert!(is_post_heading("⚡️ **ЭНЕРГИЯ** дня"));
    }

    #[test]
    fn missing_marker_keeps_text_and_warns() {
        let post = sanitize_post("Просто текст поста без заголовка.");
        assert_eq!(post.text, "Просто текст поста без заголовка.");
        assert_eq!(post.warnings, vec![SanitizeWarning::NoContentMarker]);
    }

    #[test]
    fn marker_on_last_line_falls_back_to_full_text() {
        let post = sanitize_post("Текст поста\nГОТОВЫЙ ПОСТ:");
        assert!(post.text.contains("Текст поста"));
        assert!(post.warnings.contains(&SanitizeWarning::EmptyAfterTrim));
    }

    #[test]
    fn fences_never_survive() {
        let post = sanitize_post("💪 **ЗАГОЛОВОК ПОСТА**\n```\nкод```\n#тег");
        assert!(!post.text.contains("```"));
        assert!(post.text.contains("код"));
    }

    #[test]
    fn who_is_localized() {
        assert_eq!(
            normalize_terminology("Данные WHO и (WHO)"),
            "Данные ВОЗ и (ВОЗ)"
        );
    }

    #[test]
    fn html_specials_are_escaped() {
        let post = sanitize_post("💪 **СИЛА & ВЫНОСЛИВОСТЬ**\n3 < 5 > 2");
        assert_eq!(post.parse_mode, ParseMode::Html);
        assert!(post.text.contains("<b>СИЛА &amp; ВЫНОСЛИВОСТЬ</b>"));
        assert!(post.text.contains("3 &lt; 5 &gt; 2"));
    }

    #[test]
    fn markdown_link_becomes_anchor_without_extra_brackets() {
        let post = sanitize_post("Подробнее: [PubMed](https://pubmed.example/x)");
        assert!(
            post.text
                .contains(r#"<a href="https://pubmed.example/x">PubMed</a>"#)
        );
        assert!(!post.text.contains("(PubMed)"));
    }

    #[test]
    fn non_web_link_is_left_as_text() {
        assert_eq!(convert_links("[см.](раздел 2)"), "[см.](раздел 2)");
        assert_eq!(
            convert_links("[x](javascript:alert)"),
            "[x](javascript:alert)"
        );
    }

    #[test]
    fn link_with_query_keeps_escaped_ampersand() {
        let escaped = escape_html("[тут](https://x.org/?a=1&b=2)");
        assert_eq!(
            convert_links(&escaped),
            r#"<a href="https://x.org/?a=1&amp;b=2">тут</a>"#
        );
    }

    #[test]
    fn bold_and_italic_convert_in_order() {
        let mut warnings = Vec::new();
        let bold = convert_bold("**жирный** и *курсив*", &mut warnings);
        assert_eq!(convert_italic(&bold), "<b>жирный</b> и <i>курсив</i>");
        assert!(warnings.is_empty());
    }

    #[test]
    fn unpaired_bold_is_stripped() {
        let mut warnings = Vec::new();
        let out = convert_bold("**раз** и **два", &mut warnings);
        assert_eq!(out, "<b>раз</b> и два");
        assert_eq!(warnings, vec![SanitizeWarning::UnpairedBold { count: 1 }]);
    }

    #[test]
    fn bullet_stars_are_not_italicized() {
        assert_eq!(
            convert_italic("* пункт один\n* пункт *два*"),
            "* пункт один\n* пункт <i>два</i>"
        );
    }

    #[test]
    fn spaced_stars_are_not_italicized() {
        assert_eq!(italicize_line("2 * 3 * 4"), "2 * 3 * 4");
    }

    #[test]
    fn italic_may_not_cross_tags() {
        assert_eq!(
            italicize_line("*a <b>b* c</b>"),
            "*a <b>b* c</b>"
        );
    }

    #[test]
    fn citations_are_bracketed_at_sentence_and_line_end() {
        let text = "Рекомендации ВОЗ.\nДанные PubMed\nНовые Исследования";
        assert_eq!(
            bracket_citations(text),
            "Рекомендации (ВОЗ).\nДанные (PubMed)\nНовые (Исследования)"
        );
    }

    #[test]
    fn keyword_opening_its_own_line_is_bracketed() {
        assert_eq!(
            bracket_citations("Текст\nPubMed.\n#тег"),
            "Текст\n(PubMed).\n#тег"
        );
        assert_eq!(
            bracket_citations("ВОЗ\ncrossfit.com"),
            "(ВОЗ)\n(crossfit.com)"
        );
    }

    #[test]
    fn sources_line_survives_the_whole_pipeline() {
        let post = sanitize_post("💪 **ЗАГОЛОВОК** поста\nТекст\nPubMed.\n#тег");
        assert_eq!(post.parse_mode, ParseMode::Html);
        assert!(post.text.contains("Текст\n(PubMed).\n#тег"));
    }

    #[test]
    fn citations_mid_sentence_are_untouched() {
        let text = "По данным ВОЗ, сон важен. Исследование показало пользу";
        assert_eq!(bracket_citations(text), text);
    }

    #[test]
    fn domain_is_bracketed_before_keywords() {
        assert_eq!(
            bracket_citations("Методика CrossFit.com."),
            "Методика (crossfit.com)."
        );
    }

    #[test]
    fn keywords_inside_anchors_are_skipped() {
        let text = r#"Источник <a href="https://x.org">данные ВОЗ.</a> и обзор PubMed."#;
        assert_eq!(
            bracket_citations(text),
            r#"Источник <a href="https://x.org">данные ВОЗ.</a> и обзор (PubMed)."#
        );
    }

    #[test]
    fn malformed_citation_collapses_to_single_anchor() {
        let post = sanitize_post("Белок важен (PubMed)(https://pubmed.example/x).");
        assert!(
            post.text
                .contains(r#"<a href="https://pubmed.example/x">PubMed</a>"#)
        );
        assert!(!post.text.contains("(PubMed)"));
        assert!(!post.text.contains("(https://"));
    }

    #[test]
    fn trailing_lines_after_last_hashtag_are_dropped() {
        let text = "Текст\n#первый #второй\nмысли модели\n#финал\n{\"usage\": 1}";
        assert_eq!(
            trim_trailing_artifacts(text),
            "Текст\n#первый #второй\nмысли модели\n#финал"
        );
        assert_eq!(trim_trailing_artifacts("Без тегов\n# Заголовок"), "Без тегов\n# Заголовок");
    }

    #[test]
    fn invalid_markup_degrades_to_plain_text() {
        let post = finalize("raw", "<b>жирный <i>курсив</b></i>", Vec::new());
        assert_eq!(post.parse_mode, ParseMode::Plain);
        assert_eq!(post.text, "жирный курсив");
        assert!(matches!(
            post.warnings.as_slice(),
            [SanitizeWarning::InvalidMarkup { .. }]
        ));
    }

    #[test]
    fn empty_input_is_empty_plain_post() {
        let post = sanitize_post("   \n");
        assert!(post.text.is_empty());
        assert!(post.is_degraded());
        assert!(!post.warnings.contains(&SanitizeWarning::EmptyResult));
    }

    #[test]
    fn output_never_has_odd_bold_markers() {
        let inputs = [
            "💪 **ЗАГОЛОВОК** и **хвост",
            "**a**b**c**d**",
            "🔥 **ОДИН**\n**через\nстроку**",
            "****",
        ];
        for raw in inputs {
            let post = sanitize_post(raw);
            assert_eq!(post.text.matches("**").count() % 2, 0, "input: {raw:?}");
            assert!(!post.text.contains("```"));
        }
    }
}
