//! In-memory per-user state.
//!
//! The outer map lock is only held to find or create a user's slot; each
//! read-modify-write then runs under that user's own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use natrium_postprocess::TopicList;
use natrium_shared::{GenerationConfig, PostLength, Technique, TokenUsage, UserId};

/// Per-user generation preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserSettings {
    pub technique: Technique,
    pub post_length: PostLength,
}

impl UserSettings {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            technique: config.default_technique,
            post_length: config.default_length(),
        }
    }
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            technique: Technique::default(),
            post_length: PostLength::default(),
        }
    }
}

/// Cumulative generator usage for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub topic_requests: u64,
    pub post_requests: u64,
    pub failed_requests: u64,
    pub tokens: TokenUsage,
    /// Usage of the most recent successful call, if the generator reported it.
    pub last: Option<TokenUsage>,
}

/// Everything remembered about one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub settings: UserSettings,
    /// Topics from the latest extraction, for number lookup.
    pub topics: TopicList,
    /// Topic the user is currently writing about.
    pub current_theme: Option<String>,
    /// The next text message is a custom topic.
    pub awaiting_custom_topic: bool,
    pub usage: UsageTotals,
    /// Touched by every [`UserStore::update`]; drives idle eviction.
    pub last_active: DateTime<Utc>,
}

impl UserRecord {
    fn new(settings: UserSettings) -> Self {
        Self {
            settings,
            topics: TopicList::default(),
            current_theme: None,
            awaiting_custom_topic: false,
            usage: UsageTotals::default(),
            last_active: Utc::now(),
        }
    }

    /// Drop session state, keeping preferences and counters.
    pub fn reset_session(&mut self) {
        self.topics = TopicList::default();
        self.current_theme = None;
        self.awaiting_custom_topic = false;
    }
}

/// Keyed store of [`UserRecord`]s.
#[derive(Debug, Default)]
pub struct UserStore {
    defaults: UserSettings,
    records: Mutex<HashMap<UserId, Arc<Mutex<UserRecord>>>>,
}

impl UserStore {
    /// New records start with `defaults`.
    pub fn new(defaults: UserSettings) -> Self {
        Self {
            defaults,
            records: Mutex::default(),
        }
    }

    fn slot(&self, user: UserId) -> Arc<Mutex<UserRecord>> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            records
                .entry(user)
                .or_insert_with(|| Arc::new(Mutex::new(UserRecord::new(self.defaults)))),
        )
    }

    /// Atomically read and modify one user's record, creating it if needed.
    pub fn update<R>(&self, user: UserId, f: impl FnOnce(&mut UserRecord) -> R) -> R {
        let slot = self.slot(user);
        let mut record = slot.lock().unwrap_or_else(PoisonError::into_inner);
        record.last_active = Utc::now();
        f(&mut record)
    }

    /// Copy of a user's record, if one exists.
    pub fn get(&self, user: UserId) -> Option<UserRecord> {
        let slot = {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.get(&user).cloned()
        }?;
        let record = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(record.clone())
    }

    /// Drop records untouched for longer than `max_idle`. Returns how many went.
    ///
    /// A record whose lock is held right now is in use and always kept.
    pub fn evict_idle(&self, max_idle: TimeDelta) -> usize {
        let cutoff = Utc::now() - max_idle;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();

        records.retain(|_, slot| match slot.try_lock() {
            Ok(record) => record.last_active >= cutoff,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().last_active >= cutoff,
            Err(TryLockError::WouldBlock) => true,
        });

        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
