//! Content service: generator → pipeline → transport.
//!
//! Owns the per-user store and pipeline counters. Generator calls block, so
//! they run on the blocking pool under a request-level deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{info, instrument, warn};

use natrium_postprocess::{
    SanitizedPost, TopicList, extract_topics_with_limit, resolve_topic_choice, sanitize_post,
};
use natrium_shared::{
    Focus, GenerationConfig, NatriumError, PostLength, Result, TOPIC_LIMIT, UserId,
};

use crate::generator::{ContentGenerator, Generation, GenerationKind, GenerationRequest};
use crate::stats::PipelineStats;
use crate::store::{UsageTotals, UserSettings, UserStore};

/// Users idle for longer than this are forgotten when another session starts.
const DEFAULT_IDLE_HOURS: i64 = 24;
use crate::transport::{self, Action, ChatTransport, OutgoingMessage};

pub struct ContentService {
    generator: Arc<dyn ContentGenerator>,
    transport: Arc<dyn ChatTransport>,
    config: GenerationConfig,
    timeout: Duration,
    idle_ttl: TimeDelta,
    store: UserStore,
    stats: PipelineStats,
}

impl ContentService {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        transport: Arc<dyn ChatTransport>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            generator,
            transport,
            timeout: Duration::from_secs(config.timeout_secs),
            idle_ttl: TimeDelta::hours(DEFAULT_IDLE_HOURS),
            store: UserStore::new(UserSettings::from_config(&config)),
            stats: PipelineStats::default(),
            config,
        }
    }

    /// Override the per-request generator deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override how long an idle user's state is kept.
    pub fn with_idle_ttl(mut self, idle_ttl: TimeDelta) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Run one generator call off the async executor and book its usage.
    async fn run_generator(&self, user: UserId, request: GenerationRequest) -> Result<Generation> {
        let kind = request.kind;
        let generator = Arc::clone(&self.generator);
        let task = tokio::task::spawn_blocking(move || generator.generate(&request));

        // On timeout the blocking call keeps running; its result is dropped.
        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(NatriumError::generation(format!("generator task failed: {e}"))),
            Err(_) => Err(NatriumError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        };

        self.store.update(user, |rec| {
            match kind {
                GenerationKind::Themes => rec.usage.topic_requests += 1,
                GenerationKind::Post => rec.usage.post_requests += 1,
            }
            match &outcome {
                Ok(generation) => {
                    if let Some(usage) = &generation.usage {
                        rec.usage.tokens.accumulate(usage);
                    }
                    rec.usage.last = generation.usage;
                }
                Err(_) => {
                    rec.usage.failed_requests += 1;
                    rec.usage.last = None;
                }
            }
        });

        match &outcome {
            Ok(Generation {
                usage: Some(usage), ..
            }) => info!(
                %user,
                ?kind,
                input = usage.input_tokens,
                output = usage.output_tokens,
                total = usage.total(),
                cached = usage.cached_tokens,
                reasoning = usage.reasoning_tokens,
                "token usage"
            ),
            Ok(_) => {}
            Err(e) => {
                self.stats.record_failure();
                warn!(%user, ?kind, error = %e, "generation failed");
            }
        }
        outcome
    }

    /// Generate a fresh topic list for `user` and remember it.
    #[instrument(skip_all, fields(%user, ?focus))]
    pub async fn generate_topics(&self, user: UserId, focus: Option<Focus>) -> Result<TopicList> {
        let limit = self.config.topic_limit.clamp(1, TOPIC_LIMIT);
        let technique = self.store.update(user, |rec| rec.settings.technique);

        let request = GenerationRequest::themes(technique, focus, limit);
        let generation = self.run_generator(user, request).await?;

        let topics = extract_topics_with_limit(&generation.text, limit);
        self.stats.record_topics(&topics);
        if topics.is_empty() {
            warn!(chars = generation.text.len(), "no topics recognized in generator output");
        }

        self.store.update(user, |rec| {
            rec.topics = topics.clone();
            rec.awaiting_custom_topic = false;
        });

        info!(count = topics.len(), "topics ready");
        Ok(topics)
    }

    /// Generate and sanitize a post on `theme`.
    #[instrument(skip_all, fields(%user, %length))]
    pub async fn generate_post(
        &self,
        user: UserId,
        theme: &str,
        length: PostLength,
    ) -> Result<SanitizedPost> {
        let technique = self.store.update(user, |rec| {
            rec.current_theme = Some(theme.to_string());
            rec.settings.post_length = length;
            rec.settings.technique
        });

        let request = GenerationRequest::post(technique, theme, length);
        let generation = self.run_generator(user, request).await?;

        let post = sanitize_post(&generation.text);
        self.stats.record_post(&post);
        if post.text.trim().is_empty() {
            return Err(NatriumError::generation("generator returned an empty post"));
        }
        if post.is_degraded() {
            warn!(warnings = post.warnings.len(), "post degraded to plain text");
        }

        info!(
            chars = post.text.chars().count(),
            parse_mode = ?post.parse_mode,
            "post ready"
        );
        Ok(post)
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    pub fn deliver(&self, user: UserId, message: &OutgoingMessage) -> Result<()> {
        self.transport.send(user, message)
    }

    /// Send a post followed by the next-action menu.
    pub fn deliver_post(&self, user: UserId, post: &SanitizedPost) -> Result<()> {
        let message = OutgoingMessage {
            text: post.text.clone(),
            parse_mode: post.parse_mode,
            keyboard: None,
        };
        self.deliver(user, &message)?;
        self.deliver(user, &transport::next_action_prompt())
    }

    /// Tell the user something went wrong, without the error details.
    pub fn report_error(&self, user: UserId, err: &NatriumError) -> Result<()> {
        self.deliver(user, &transport::user_facing_error(err))
    }

    // -----------------------------------------------------------------------
    // Interaction
    // -----------------------------------------------------------------------

    /// Cumulative usage for `user`; zero for unknown users.
    pub fn usage(&self, user: UserId) -> UsageTotals {
        self.store.get(user).map(|rec| rec.usage).unwrap_or_default()
    }

    /// Session start: forget idle users, then ask what the topics should focus on.
    pub fn start(&self, user: UserId) -> Result<()> {
        let evicted = self.store.evict_idle(self.idle_ttl);
        if evicted > 0 {
            info!(evicted, "forgot idle users");
        }
        self.store.update(user, |rec| rec.reset_session());
        self.deliver(user, &transport::focus_prompt())
    }

    /// React to a button press.
    ///
    /// Generation failures are reported to the user; only transport failures
    /// come back as errors.
    #[instrument(skip_all, fields(%user, ?action))]
    pub async fn handle_action(&self, user: UserId, action: Action) -> Result<()> {
        match action {
            Action::Focus(focus) => match self.generate_topics(user, Some(focus)).await {
                Ok(topics) => self.deliver(user, &transport::topics_prompt(&topics)),
                Err(e) => self.report_error(user, &e),
            },
            Action::Topic(number) => {
                let theme = self.store.update(user, |rec| {
                    let theme = rec.topics.by_number(number).map(str::to_string);
                    if theme.is_some() {
                        rec.current_theme = theme.clone();
                    }
                    theme
                });
                match theme {
                    Some(theme) => self.ask_length(user, &theme),
                    None => self.report_error(
                        user,
                        &NatriumError::validation(format!("no topic number {number}")),
                    ),
                }
            }
            Action::CustomTopic => {
                self.store.update(user, |rec| rec.awaiting_custom_topic = true);
                self.deliver(user, &transport::custom_topic_prompt())
            }
            Action::Length(chars) => {
                let theme = self.store.update(user, |rec| rec.current_theme.clone());
                let Some(theme) = theme else {
                    return self.report_error(user, &NatriumError::validation("no topic selected"));
                };
                let length = match self.config.validate_length(chars) {
                    Ok(length) => length,
                    Err(e) => return self.report_error(user, &e),
                };

                self.deliver(user, &transport::generating_notice(&theme, length.get()))?;
                match self.generate_post(user, &theme, length).await {
                    Ok(post) => self.deliver_post(user, &post),
                    Err(e) => self.report_error(user, &e),
                }
            }
            Action::Regenerate => {
                match self.store.update(user, |rec| rec.current_theme.clone()) {
                    Some(theme) => self.ask_length(user, &theme),
                    None => self.report_error(user, &NatriumError::validation("no topic selected")),
                }
            }
            Action::OtherTopic => {
                let topics = self.store.update(user, |rec| rec.topics.clone());
                self.deliver(user, &transport::topics_prompt(&topics))
            }
            Action::NewTopics => self.deliver(user, &transport::focus_prompt()),
            Action::Finish => {
                self.store.update(user, |rec| rec.reset_session());
                self.deliver(user, &transport::finished())
            }
        }
    }

    /// React to free text: a custom topic when one was requested.
    #[instrument(skip_all, fields(%user))]
    pub fn handle_text(&self, user: UserId, text: &str) -> Result<()> {
        let text = text.trim();
        let theme = self.store.update(user, |rec| {
            if !rec.awaiting_custom_topic || text.is_empty() {
                return None;
            }
            rec.awaiting_custom_topic = false;
            let theme = resolve_topic_choice(text, &rec.topics);
            rec.current_theme = Some(theme.clone());
            Some(theme)
        });

        match theme {
            Some(theme) => self.ask_length(user, &theme),
            None => self.deliver(
                user,
                &OutgoingMessage::plain(
                    "⚠️ Пожалуйста, используйте кнопки для выбора темы.\n\n\
                     Если хотите написать свою тему, нажмите «✏️ Написать свою тему»",
                ),
            ),
        }
    }

    fn ask_length(&self, user: UserId, theme: &str) -> Result<()> {
        self.deliver(
            user,
            &transport::length_prompt(theme, &self.config.length_presets),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use natrium_shared::{ParseMode, TokenUsage};

    use super::*;

    /// Returns canned text for each kind, optionally after a delay.
    struct FakeGenerator {
        themes: String,
        post: String,
        delay: Duration,
        fail: bool,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl FakeGenerator {
        fn new(themes: &str, post: &str) -> Self {
            Self {
                themes: themes.into(),
                post: post.into(),
                delay: Duration::ZERO,
                fail: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ContentGenerator for FakeGenerator {
        fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
            self.seen.lock().unwrap().push(request.clone());
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(NatriumError::generation("upstream 500: secret body"));
            }
            let text = match request.kind {
                GenerationKind::Themes => self.themes.clone(),
                GenerationKind::Post => self.post.clone(),
            };
            Ok(Generation {
                text,
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                }),
            })
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(UserId, OutgoingMessage)>>,
    }

    impl RecordingTransport {
        fn messages(&self) -> Vec<OutgoingMessage> {
            self.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
        }
    }

    impl ChatTransport for RecordingTransport {
        fn send(&self, user: UserId, message: &OutgoingMessage) -> Result<()> {
            message.check()?;
            self.sent.lock().unwrap().push((user, message.clone()));
            Ok(())
        }
    }

    const THEMES: &str = "Вот темы:\n1️⃣ Белок после тренировки\n2️⃣ Сон и восстановление (ВОЗ)\n🔟 Мобильность";
    const POST: &str = "🔄 Шаг 1: поиск\n💪 **ЗАГОЛОВОК**\nТекст поста. ВОЗ.\n#хештег\nлишний текст";

    fn fixture(
        generator: FakeGenerator,
    ) -> (ContentService, Arc<FakeGenerator>, Arc<RecordingTransport>) {
        let generator = Arc::new(generator);
        let transport = Arc::new(RecordingTransport::default());
        let service = ContentService::new(
            generator.clone(),
            transport.clone(),
            GenerationConfig::default(),
        );
        (service, generator, transport)
    }

    #[tokio::test]
    async fn token_usage_is_booked_per_call_and_in_total() {
        let (service, _, _) = fixture(FakeGenerator::new(THEMES, POST));
        let user = UserId(8);
        assert_eq!(service.usage(user), UsageTotals::default());

        service.generate_topics(user, None).await.unwrap();
        let length = service.config().default_length();
        service.generate_post(user, "Сон", length).await.unwrap();

        let usage = service.usage(user);
        assert_eq!(usage.topic_requests, 1);
        assert_eq!(usage.post_requests, 1);
        assert_eq!(usage.tokens.input_tokens, 20);
        assert_eq!(usage.tokens.total(), 30);
        assert_eq!(usage.last.unwrap().to_string(), "in 10, out 5, total 15");
    }

    #[tokio::test]
    async fn start_forgets_idle_users() {
        let (service, _, _) = fixture(FakeGenerator::new(THEMES, POST));
        let service = service.with_idle_ttl(TimeDelta::hours(1));
        service.store().update(UserId(1), |rec| {
            rec.last_active = chrono::Utc::now() - TimeDelta::hours(2);
        });

        service.start(UserId(2)).unwrap();

        assert!(service.store().get(UserId(1)).is_none());
        assert!(service.store().get(UserId(2)).is_some());
    }

    #[tokio::test]
    async fn topics_are_extracted_and_remembered() {
        let (service, generator, _) = fixture(FakeGenerator::new(THEMES, POST));
        let user = UserId(42);

        let topics = service.generate_topics(user, Some(Focus::Sleep)).await.unwrap();
        assert_eq!(
            topics.as_slice(),
            ["Белок после тренировки", "Сон и восстановление", "Мобильность"]
        );

        let rec = service.store().get(user).unwrap();
        assert_eq!(rec.topics, topics);
        assert_eq!(rec.usage.topic_requests, 1);
        assert_eq!(rec.usage.tokens.total_tokens, 15);

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen[0].kind, GenerationKind::Themes);
        assert!(seen[0].variables.user_input.as_deref().unwrap().contains("сон"));
    }

    #[tokio::test]
    async fn post_is_sanitized() {
        let (service, _, _) = fixture(FakeGenerator::new(THEMES, POST));
        let length = service.config().validate_length(700).unwrap();

        let post = service.generate_post(UserId(1), "Сон", length).await.unwrap();
        assert_eq!(post.parse_mode, ParseMode::Html);
        assert!(post.text.starts_with("💪 <b>ЗАГОЛОВОК</b>"));
        assert!(post.text.ends_with("#хештег"));

        let rec = service.store().get(UserId(1)).unwrap();
        assert_eq!(rec.current_theme.as_deref(), Some("Сон"));
        assert_eq!(rec.settings.post_length.get(), 700);
        assert_eq!(service.stats().snapshot().posts_sanitized, 1);
    }

    #[tokio::test]
    async fn slow_generator_times_out() {
        let mut generator = FakeGenerator::new(THEMES, POST);
        generator.delay = Duration::from_millis(300);
        let (service, _, _) = fixture(generator);
        let service = service.with_timeout(Duration::from_millis(20));

        let err = service.generate_topics(UserId(3), None).await.unwrap_err();
        assert!(matches!(err, NatriumError::Timeout { .. }));

        let rec = service.store().get(UserId(3)).unwrap();
        assert_eq!(rec.usage.failed_requests, 1);
        assert_eq!(service.stats().snapshot().generation_failures, 1);
    }

    #[tokio::test]
    async fn full_button_flow_delivers_post_and_menu() {
        let (service, _, transport) = fixture(FakeGenerator::new(THEMES, POST));
        let user = UserId(7);

        service.start(user).unwrap();
        service
            .handle_action(user, Action::Focus(Focus::Nutrition))
            .await
            .unwrap();
        service.handle_action(user, Action::Topic(2)).await.unwrap();
        service.handle_action(user, Action::Length(500)).await.unwrap();

        let messages = transport.messages();
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert!(texts[0].contains("НА ЧТО СДЕЛАТЬ УПОР"));
        assert!(texts[1].starts_with("💡 Выберите тему"));
        assert!(texts[2].contains("<b>Сон и восстановление</b>"));
        assert!(texts[3].starts_with("✍️ Генерирую пост"));
        assert!(texts[4].starts_with("💪 <b>ЗАГОЛОВОК</b>"));
        assert!(texts[5].contains("Что делать дальше"));

        let topic_tokens: Vec<_> = messages[1]
            .keyboard
            .as_ref()
            .unwrap()
            .buttons()
            .map(|b| b.token.clone())
            .collect();
        assert_eq!(topic_tokens, ["theme_1", "theme_2", "theme_3", "custom_theme"]);
    }

    #[tokio::test]
    async fn custom_topic_is_taken_from_text() {
        let (service, _, transport) = fixture(FakeGenerator::new(THEMES, POST));
        let user = UserId(8);

        service.handle_text(user, "Случайный текст").unwrap();
        service.handle_action(user, Action::CustomTopic).await.unwrap();
        service.handle_text(user, "Кето-диета").unwrap();

        let messages = transport.messages();
        assert!(messages[0].text.starts_with("⚠️"));
        assert!(messages[2].text.contains("<b>Кето-диета</b>"));
        assert_eq!(
            service.store().get(user).unwrap().current_theme.as_deref(),
            Some("Кето-диета")
        );
    }

    #[tokio::test]
    async fn generation_failure_is_reported_without_details() {
        let mut generator = FakeGenerator::new(THEMES, POST);
        generator.fail = true;
        let (service, _, transport) = fixture(generator);
        let user = UserId(9);

        service.handle_action(user, Action::Focus(Focus::Random)).await.unwrap();

        let messages = transport.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.contains("Попробуйте ещё раз"));
        assert!(!messages[0].text.contains("secret"));
    }

    #[tokio::test]
    async fn unrecognized_topics_offer_custom_prompt() {
        let (service, _, transport) = fixture(FakeGenerator::new("Не могу помочь.", POST));
        let user = UserId(10);

        service.handle_action(user, Action::Focus(Focus::Sport)).await.unwrap();
        service.handle_action(user, Action::Topic(1)).await.unwrap();

        let messages = transport.messages();
        let tokens: Vec<_> = messages[0]
            .keyboard
            .as_ref()
            .unwrap()
            .buttons()
            .map(|b| b.token.as_str())
            .collect();
        assert_eq!(tokens, ["custom_theme"]);
        assert_eq!(messages[1].parse_mode, ParseMode::Plain);
        assert_eq!(service.stats().snapshot().empty_topic_lists, 1);
    }

    #[tokio::test]
    async fn out_of_range_length_is_rejected() {
        let (service, generator, transport) = fixture(FakeGenerator::new(THEMES, POST));
        let user = UserId(11);
        service.store().update(user, |rec| rec.current_theme = Some("Сон".into()));

        service.handle_action(user, Action::Length(5000)).await.unwrap();

        assert!(generator.seen.lock().unwrap().is_empty());
        assert!(transport.messages()[0].text.starts_with("⚠️"));
    }
}
