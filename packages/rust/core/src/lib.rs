//! Service layer for the Natrium post generator.
//!
//! Connects the external content generator, the text pipelines from
//! `natrium-postprocess`, and a chat transport, and keeps per-user state.

pub mod generator;
pub mod service;
pub mod stats;
pub mod store;
pub mod transport;

pub use generator::{
    BridgeGenerator, ContentGenerator, Generation, GenerationKind, GenerationRequest,
    GenerationVariables,
};
pub use service::ContentService;
pub use stats::{PipelineStats, StatsSnapshot};
pub use store::{UsageTotals, UserRecord, UserSettings, UserStore};
pub use transport::{
    Action, Button, ChatTransport, Keyboard, OutgoingMessage, user_facing_error,
};
