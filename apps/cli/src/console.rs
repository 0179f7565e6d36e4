//! Terminal rendering of chat messages.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use natrium_core::{ChatTransport, OutgoingMessage};
use natrium_postprocess::strip_markup;
use natrium_shared::{NatriumError, ParseMode, Result, UserId};

/// [`ChatTransport`] that prints messages and their buttons.
///
/// HTML bodies are shown as plain text unless `raw` is set, in which case the
/// exact markup the chat would receive is printed.
pub(crate) struct ConsoleTransport<W> {
    out: Mutex<W>,
    raw: bool,
}

impl ConsoleTransport<std::io::Stdout> {
    pub(crate) fn stdout(raw: bool) -> Self {
        Self::new(std::io::stdout(), raw)
    }
}

impl<W: Write> ConsoleTransport<W> {
    pub(crate) fn new(out: W, raw: bool) -> Self {
        Self {
            out: Mutex::new(out),
            raw,
        }
    }

    fn render(&self, message: &OutgoingMessage) -> String {
        let mut text = match message.parse_mode {
            ParseMode::Html if !self.raw => strip_markup(&message.text),
            _ => message.text.clone(),
        };

        if let Some(keyboard) = &message.keyboard {
            text.push('\n');
            for (i, button) in keyboard.buttons().enumerate() {
                text.push_str(&format!("\n  [{}] {}  ({})", i + 1, button.label, button.token));
            }
        }
        text
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ChatTransport for ConsoleTransport<W> {
    fn send(&self, _user: UserId, message: &OutgoingMessage) -> Result<()> {
        message.check()?;

        let rendered = self.render(message);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{rendered}\n")
            .and_then(|()| out.flush())
            .map_err(|e| NatriumError::transport(format!("console write failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use natrium_core::transport;
    use natrium_postprocess::extract_topics;

    use super::*;

    fn rendered(raw: bool, message: &OutgoingMessage) -> String {
        let console = ConsoleTransport::new(Vec::new(), raw);
        console.send(UserId(0), message).unwrap();
        String::from_utf8(console.into_inner()).unwrap()
    }

    #[test]
    fn html_is_stripped_for_display() {
        let out = rendered(false, &OutgoingMessage::html("💪 <b>СИЛА &amp; ВОЛЯ</b>"));
        assert_eq!(out, "💪 СИЛА & ВОЛЯ\n\n");
    }

    #[test]
    fn raw_mode_keeps_markup() {
        let out = rendered(true, &OutgoingMessage::html("<i>курсив</i>"));
        assert!(out.starts_with("<i>курсив</i>"));
    }

    #[test]
    fn buttons_are_numbered_with_tokens() {
        let topics = extract_topics("1. сон\n2. белок");
        let out = rendered(false, &transport::topics_prompt(&topics));
        assert!(out.contains("[1] 1. Сон  (theme_1)"));
        assert!(out.contains("[3] ✏️ Написать свою тему  (custom_theme)"));
    }

    #[test]
    fn invalid_markup_is_refused() {
        let console = ConsoleTransport::new(Vec::new(), false);
        let err = console
            .send(UserId(0), &OutgoingMessage::html("<b>open"))
            .unwrap_err();
        assert!(matches!(err, NatriumError::Transport(_)));
        assert!(console.into_inner().is_empty());
    }
}
