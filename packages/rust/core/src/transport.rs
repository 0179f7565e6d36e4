//! Chat transport contract, keyboards and the fixed bot messages.

use natrium_postprocess::{TopicList, display_label, escape_html, validate_markup};
use natrium_shared::{Focus, NatriumError, ParseMode, Result, UserId};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One button: the label the user sees and the token sent back on press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub token: String,
}

impl Button {
    pub fn new(label: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            token: token.into(),
        }
    }
}

/// Inline keyboard, one button per row unless built otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    fn single_column(buttons: impl IntoIterator<Item = Button>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }

    /// Focus choices for the next batch of topics.
    pub fn focus_menu() -> Self {
        Self::single_column(
            Focus::ALL
                .into_iter()
                .map(|f| Button::new(f.label(), Action::Focus(f).token())),
        )
    }

    /// One button per topic, numbered from 1, plus the custom-topic button.
    pub fn topics(topics: &TopicList) -> Self {
        let mut keyboard = Self::single_column(
            topics
                .iter()
                .enumerate()
                .map(|(i, t)| Button::new(display_label(i + 1, t), Action::Topic(i + 1).token())),
        );
        keyboard.rows.push(vec![custom_topic_button()]);
        keyboard
    }

    /// Offered when no topics could be extracted.
    pub fn custom_topic_only() -> Self {
        Self::single_column([custom_topic_button()])
    }

    pub fn lengths(presets: &[u32]) -> Self {
        Self::single_column(
            presets
                .iter()
                .map(|&n| Button::new(format!("📏 {n} символов"), Action::Length(n).token())),
        )
    }

    /// What to do after a post was delivered.
    pub fn next_action() -> Self {
        Self::single_column([
            Button::new("🔄 Новый пост на эту тему", Action::Regenerate.token()),
            Button::new("📋 Другая тема", Action::OtherTopic.token()),
            Button::new("🆕 Новые темы", Action::NewTopics.token()),
            Button::new("🏁 Завершить", Action::Finish.token()),
        ])
    }

    /// All buttons in reading order.
    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }
}

fn custom_topic_button() -> Button {
    Button::new("✏️ Написать свою тему", Action::CustomTopic.token())
}

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub parse_mode: ParseMode,
    pub keyboard: Option<Keyboard>,
}

impl OutgoingMessage {
    /// Message whose body is already valid transport markup.
    pub fn html(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: ParseMode::Html,
            keyboard: None,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: ParseMode::Plain,
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    /// Reject HTML bodies the transport would refuse.
    pub fn check(&self) -> Result<()> {
        if self.parse_mode == ParseMode::Html {
            validate_markup(&self.text)
                .map_err(|e| NatriumError::transport(format!("refusing to send: {e}")))?;
        }
        Ok(())
    }
}

/// Delivers messages to a chat user.
///
/// Implementations must call [`OutgoingMessage::check`] before sending.
pub trait ChatTransport: Send + Sync {
    fn send(&self, user: UserId, message: &OutgoingMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Button tokens
// ---------------------------------------------------------------------------

/// What a button press asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Focus(Focus),
    /// 1-based topic number.
    Topic(usize),
    CustomTopic,
    Length(u32),
    Regenerate,
    OtherTopic,
    NewTopics,
    Finish,
}

impl Action {
    pub fn token(&self) -> String {
        match self {
            Self::Focus(f) => format!("focus_{}", f.as_str()),
            Self::Topic(n) => format!("theme_{n}"),
            Self::CustomTopic => "custom_theme".into(),
            Self::Length(n) => format!("len_{n}"),
            Self::Regenerate => "regen".into(),
            Self::OtherTopic => "other_theme".into(),
            Self::NewTopics => "new_themes".into(),
            Self::Finish => "finish".into(),
        }
    }

    /// Parse a button token. Unknown tokens yield `None`.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "custom_theme" => return Some(Self::CustomTopic),
            "regen" => return Some(Self::Regenerate),
            "other_theme" => return Some(Self::OtherTopic),
            "new_themes" => return Some(Self::NewTopics),
            "finish" => return Some(Self::Finish),
            _ => {}
        }

        if let Some(focus) = token.strip_prefix("focus_") {
            return focus.parse().ok().map(Self::Focus);
        }
        if let Some(n) = token.strip_prefix("theme_") {
            return n.parse().ok().filter(|&n| n > 0).map(Self::Topic);
        }
        if let Some(n) = token.strip_prefix("len_") {
            return n.parse().ok().map(Self::Length);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Fixed bot messages
// ---------------------------------------------------------------------------

pub fn focus_prompt() -> OutgoingMessage {
    OutgoingMessage::html("🎯 <b>НА ЧТО СДЕЛАТЬ УПОР В ТЕМАХ?</b>\n\nВыберите направление:")
        .with_keyboard(Keyboard::focus_menu())
}

/// Topic picker, or a "write your own" prompt when the list is empty.
pub fn topics_prompt(topics: &TopicList) -> OutgoingMessage {
    if topics.is_empty() {
        return OutgoingMessage::html(
            "🤔 Не удалось выделить темы из ответа.\n\nНапишите свою тему для поста:",
        )
        .with_keyboard(Keyboard::custom_topic_only());
    }
    OutgoingMessage::html("💡 Выберите тему:\n\n<i>Длинная тема → 🔄📱</i>")
        .with_keyboard(Keyboard::topics(topics))
}

pub fn custom_topic_prompt() -> OutgoingMessage {
    OutgoingMessage::html("✏️ Напишите свою тему для поста:")
}

pub fn length_prompt(theme: &str, presets: &[u32]) -> OutgoingMessage {
    OutgoingMessage::html(format!(
        "✅ Тема: <b>{}</b>\n\nВыберите длину поста:",
        escape_html(theme)
    ))
    .with_keyboard(Keyboard::lengths(presets))
}

pub fn generating_notice(theme: &str, chars: u32) -> OutgoingMessage {
    OutgoingMessage::html(format!(
        "✍️ Генерирую пост на тему: <b>{}</b>\n📊 Длина: {chars} символов\n\n⏳ Пожалуйста, подождите...",
        escape_html(theme)
    ))
}

pub fn next_action_prompt() -> OutgoingMessage {
    OutgoingMessage::html("🎯 <b>Что делать дальше?</b>").with_keyboard(Keyboard::next_action())
}

pub fn finished() -> OutgoingMessage {
    OutgoingMessage::plain("✅ Работа завершена!\n\nИспользуйте /start для новой сессии.")
}

/// Turn any failure into a message safe to show the user.
///
/// Error payloads from the generator never reach the chat.
pub fn user_facing_error(err: &NatriumError) -> OutgoingMessage {
    let text = match err {
        NatriumError::Timeout { .. } => {
            "⏳ Генерация заняла слишком много времени.\n\nПопробуйте ещё раз или используйте /start"
        }
        NatriumError::Generation(_) => {
            "❌ Не удалось сгенерировать ответ.\n\nПопробуйте ещё раз или используйте /start"
        }
        NatriumError::Validation { .. } => {
            "⚠️ Некорректный выбор.\n\nПопробуйте ещё раз или используйте /start"
        }
        _ => "❌ Что-то пошло не так.\n\nПопробуйте ещё раз или используйте /start",
    };
    OutgoingMessage::plain(text)
}
