//! Core domain types shared by the pipelines, the service layer and the CLI.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NatriumError, Result};

/// Hard ceiling on the number of topics offered to a user.
pub const TOPIC_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Chat-platform user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Technique
// ---------------------------------------------------------------------------

/// Prompting technique the generator should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Technique {
    /// Fast generation without examples.
    #[serde(rename = "zero_shot")]
    ZeroShot,
    /// Chain-of-verification plus chain-of-knowledge fact checking.
    #[default]
    #[serde(rename = "cov+cok")]
    CovCok,
    /// Generation guided by examples from the knowledge base.
    #[serde(rename = "few_shot")]
    FewShot,
}

impl Technique {
    /// Identifier understood by the generator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZeroShot => "zero_shot",
            Self::CovCok => "cov+cok",
            Self::FewShot => "few_shot",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technique {
    type Err = NatriumError;

    /// Accepts the identifier or the menu number (`1`–`3`).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "zero_shot" | "1" => Ok(Self::ZeroShot),
            "cov+cok" | "2" => Ok(Self::CovCok),
            "few_shot" | "3" => Ok(Self::FewShot),
            other => Err(NatriumError::validation(format!(
                "unknown technique '{other}': expected zero_shot, cov+cok or few_shot"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Focus
// ---------------------------------------------------------------------------

/// What the next batch of topics should emphasize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Focus {
    Nutrition,
    Sport,
    Sleep,
    Technique,
    Health,
    Random,
}

impl Focus {
    /// All focus options in menu order.
    pub const ALL: [Focus; 6] = [
        Self::Nutrition,
        Self::Sport,
        Self::Sleep,
        Self::Technique,
        Self::Health,
        Self::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nutrition => "nutrition",
            Self::Sport => "sport",
            Self::Sleep => "sleep",
            Self::Technique => "technique",
            Self::Health => "health",
            Self::Random => "random",
        }
    }

    /// Button label shown in the focus menu.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Nutrition => "🍽️ Питание и диета",
            Self::Sport => "💪 Спорт и тренировки (CrossFit, силовые)",
            Self::Sleep => "💤 Сон и восстановление",
            Self::Technique => "🤸 Техника упражнений (гимнастика, атлетика)",
            Self::Health => "🏥 Здоровье и профилактика (ВОЗ)",
            Self::Random => "🎲 Разное (без фокуса)",
        }
    }

    /// Keyword phrase injected into the topic request, `None` for no focus.
    pub fn keywords(&self) -> Option<&'static str> {
        match self {
            Self::Nutrition => Some("питание, диета, спортивное питание"),
            Self::Sport => Some("спорт, тренировки, CrossFit, силовые упражнения, меткон"),
            Self::Sleep => Some("сон, восстановление, регенерация"),
            Self::Technique => {
                Some("техника упражнений, гимнастика, олимпийская атлетика, прогрессии")
            }
            Self::Health => Some("здоровье, профилактика, рекомендации ВОЗ, научные исследования"),
            Self::Random => None,
        }
    }
}

impl fmt::Display for Focus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Focus {
    type Err = NatriumError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| NatriumError::validation(format!("unknown focus '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// PostLength
// ---------------------------------------------------------------------------

/// Target post length in characters, validated against configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostLength(u32);

impl PostLength {
    pub const DEFAULT: PostLength = PostLength(500);
    pub const MIN: u32 = 200;
    pub const MAX: u32 = 1000;

    /// Validate `chars` against an inclusive `[min, max]` range.
    pub fn new(chars: u32, min: u32, max: u32) -> Result<Self> {
        if (min..=max).contains(&chars) {
            Ok(Self(chars))
        } else {
            Err(NatriumError::validation(format!(
                "post length must be between {min} and {max} characters, got {chars}"
            )))
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for PostLength {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PostLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ParseMode
// ---------------------------------------------------------------------------

/// How the transport must interpret a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Telegram-style HTML subset (`<b>`, `<i>`, `<a href>`).
    #[default]
    Html,
    /// No markup at all.
    Plain,
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Token accounting reported by the generator for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Prompt tokens served from the provider cache.
    #[serde(default)]
    pub cached_tokens: u64,
    /// Hidden reasoning tokens billed as output.
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl TokenUsage {
    /// Total tokens, falling back to input + output when the provider omits it.
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens + self.output_tokens
        }
    }

    /// Add another usage record into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total();
        self.cached_tokens += other.cached_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

/// `in 120, out 80, total 200`, plus cached / reasoning counts when non-zero.
impl fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in {}, out {}, total {}",
            self.input_tokens,
            self.output_tokens,
            self.total()
        )?;
        if self.cached_tokens > 0 {
            write!(f, ", cached {}", self.cached_tokens)?;
        }
        if self.reasoning_tokens > 0 {
            write!(f, ", reasoning {}", self.reasoning_tokens)?;
        }
        Ok(())
    }
}
