//! Text pipelines applied to generator output.
//!
//! - [`extract_topics`] pulls a numbered topic list out of a free-form answer.
//! - [`sanitize_post`] turns a raw post (reasoning trace, Markdown, citations)
//!   into markup the chat transport accepts, falling back to plain text.
//!
//! Both are pure functions: no I/O, no shared state.

mod markup;
mod sanitize;
mod topics;

pub use markup::{MarkupError, escape_html, strip_markup, unescape_html, validate_markup};
pub use sanitize::{SanitizeWarning, SanitizedPost, sanitize_post};
pub use topics::{
    TopicList, display_label, extract_topics, extract_topics_with_limit, resolve_topic_choice,
};
