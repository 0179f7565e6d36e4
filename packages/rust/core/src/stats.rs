//! Process-wide pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use natrium_postprocess::{SanitizeWarning, SanitizedPost, TopicList};

/// Lock-free counters of pipeline outcomes and recovered anomalies.
#[derive(Debug, Default)]
pub struct PipelineStats {
    topic_extractions: AtomicU64,
    empty_topic_lists: AtomicU64,
    posts_sanitized: AtomicU64,
    missing_markers: AtomicU64,
    unpaired_bold: AtomicU64,
    plain_fallbacks: AtomicU64,
    generation_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub topic_extractions: u64,
    pub empty_topic_lists: u64,
    pub posts_sanitized: u64,
    pub missing_markers: u64,
    pub unpaired_bold: u64,
    pub plain_fallbacks: u64,
    pub generation_failures: u64,
}

impl PipelineStats {
    pub fn record_topics(&self, topics: &TopicList) {
        self.topic_extractions.fetch_add(1, Ordering::Relaxed);
        if topics.is_empty() {
            self.empty_topic_lists.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_post(&self, post: &SanitizedPost) {
        self.posts_sanitized.fetch_add(1, Ordering::Relaxed);
        for warning in &post.warnings {
            let counter = match warning {
                SanitizeWarning::NoContentMarker | SanitizeWarning::EmptyAfterTrim => {
                    &self.missing_markers
                }
                SanitizeWarning::UnpairedBold { .. } => &self.unpaired_bold,
                SanitizeWarning::InvalidMarkup { .. } | SanitizeWarning::EmptyResult => {
                    &self.plain_fallbacks
                }
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            topic_extractions: self.topic_extractions.load(Ordering::Relaxed),
            empty_topic_lists: self.empty_topic_lists.load(Ordering::Relaxed),
            posts_sanitized: self.posts_sanitized.load(Ordering::Relaxed),
            missing_markers: self.missing_markers.load(Ordering::Relaxed),
            unpaired_bold: self.unpaired_bold.load(Ordering::Relaxed),
            plain_fallbacks: self.plain_fallbacks.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use natrium_postprocess::{extract_topics, sanitize_post};

    use super::*;

    #[test]
    fn counts_topics_and_empty_lists() {
        let stats = PipelineStats::default();
        stats.record_topics(&extract_topics("1. Сон"));
        stats.record_topics(&extract_topics("ничего"));

        let snap = stats.snapshot();
        assert_eq!(snap.topic_extractions, 2);
        assert_eq!(snap.empty_topic_lists, 1);
    }

    #[test]
    fn counts_sanitizer_warnings() {
        let stats = PipelineStats::default();
        stats.record_post(&sanitize_post("текст без заголовка и **хвост"));
        stats.record_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.posts_sanitized, 1);
        assert_eq!(snap.missing_markers, 1);
        assert_eq!(snap.unpaired_bold, 1);
        assert_eq!(snap.plain_fallbacks, 0);
        assert_eq!(snap.generation_failures, 1);
    }
}
