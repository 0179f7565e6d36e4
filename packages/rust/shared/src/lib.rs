//! Shared types, error model, and configuration for the Natrium post generator.
//!
//! This crate is the foundation depended on by all other Natrium crates.
//! It provides:
//! - [`NatriumError`], the unified error type
//! - Domain types ([`Technique`], [`Focus`], [`PostLength`], [`TokenUsage`], [`UserId`])
//! - Configuration ([`AppConfig`], [`GenerationConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BotConfig, BridgeConfig, GenerationConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_bot_token,
};
pub use error::{NatriumError, Result};
pub use types::{
    Focus, ParseMode, PostLength, TOPIC_LIMIT, Technique, TokenUsage, UserId,
};
