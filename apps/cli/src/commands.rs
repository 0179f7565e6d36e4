//! CLI command definitions, routing, and tracing setup.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use natrium_core::{BridgeGenerator, ContentService, UsageTotals, transport};
use natrium_postprocess::{
    TopicList, display_label, extract_topics, extract_topics_with_limit, resolve_topic_choice,
    sanitize_post,
};
use natrium_shared::{
    AppConfig, Focus, TOPIC_LIMIT, Technique, UserId, init_config, load_config, load_config_from,
};

use crate::console::ConsoleTransport;
use crate::lock::InstanceLock;

/// The terminal stands in for a single chat user.
const CONSOLE_USER: UserId = UserId(0);

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Natrium: fitness channel topics and posts, ready for chat.
#[derive(Parser)]
#[command(
    name = "natrium",
    version,
    about = "Generate topics and posts for the Natrium Fitness channel and clean up generator output.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.natrium/natrium.toml.
    #[arg(long, global = true, env = "NATRIUM_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Extract the topic list from saved generator output.
    Topics {
        /// Input file (reads stdin when omitted).
        file: Option<PathBuf>,

        /// Print JSON instead of button labels.
        #[arg(long)]
        json: bool,
    },

    /// Sanitize a raw generated post for the chat.
    Sanitize {
        /// Input file (reads stdin when omitted).
        file: Option<PathBuf>,

        /// Print JSON (text, parse mode, warnings).
        #[arg(long)]
        json: bool,
    },

    /// Generate a topic list through the generator bridge.
    Themes {
        /// Focus: nutrition, sport, sleep, technique, health, or random.
        #[arg(short, long)]
        focus: Option<Focus>,

        /// Technique: zero_shot, cov+cok, or few_shot (or 1-3).
        #[arg(short, long)]
        technique: Option<Technique>,

        /// Print the markup the chat would receive.
        #[arg(long)]
        raw: bool,
    },

    /// Generate a post through the generator bridge.
    Post {
        /// Topic text, or its number in --themes-file.
        #[arg(long)]
        theme: String,

        /// Target length in characters.
        #[arg(short, long)]
        length: Option<u32>,

        /// Technique: zero_shot, cov+cok, or few_shot (or 1-3).
        #[arg(short, long)]
        technique: Option<Technique>,

        /// Saved generator output to resolve a numeric --theme against.
        #[arg(long)]
        themes_file: Option<PathBuf>,

        /// Print the markup the chat would receive.
        #[arg(long)]
        raw: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "natrium=info",
        1 => "natrium=debug",
        _ => "natrium=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Topics { file, json } => cmd_topics(config_path, file.as_deref(), json),
        Command::Sanitize { file, json } => cmd_sanitize(file.as_deref(), json),
        Command::Themes {
            focus,
            technique,
            raw,
        } => cmd_themes(config_path, focus, technique, raw).await,
        Command::Post {
            theme,
            length,
            technique,
            themes_file,
            raw,
        } => {
            cmd_post(
                config_path,
                &theme,
                length,
                technique,
                themes_file.as_deref(),
                raw,
            )
            .await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Read a file, or stdin when no path is given.
fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .wrap_err("failed to read stdin")?;
            Ok(buf)
        }
    }
}

// ---------------------------------------------------------------------------
// Offline pipelines
// ---------------------------------------------------------------------------

fn cmd_topics(config_path: Option<&Path>, file: Option<&Path>, json: bool) -> Result<()> {
    let config = resolve_config(config_path)?;
    let raw = read_input(file)?;
    let limit = config.generation.topic_limit.clamp(1, TOPIC_LIMIT);
    let topics = extract_topics_with_limit(&raw, limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&topics)?);
    } else if topics.is_empty() {
        eprintln!("No topics recognized.");
    } else {
        print_topics(&topics);
    }
    Ok(())
}

fn print_topics(topics: &TopicList) {
    for (i, topic) in topics.iter().enumerate() {
        println!("{}", display_label(i + 1, topic));
    }
}

fn cmd_sanitize(file: Option<&Path>, json: bool) -> Result<()> {
    let raw = read_input(file)?;
    let post = sanitize_post(&raw);

    if json {
        println!("{}", serde_json::to_string_pretty(&post)?);
        return Ok(());
    }

    println!("{}", post.text);
    for warning in &post.warnings {
        eprintln!("warning: {warning}");
    }
    if post.is_degraded() {
        eprintln!("note: markup could not be validated, post is plain text");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Generation through the bridge
// ---------------------------------------------------------------------------

/// Everything a generating command holds for its duration.
struct Session {
    service: ContentService,
    bridge: Arc<BridgeGenerator>,
    _lock: InstanceLock,
}

impl Session {
    fn open(config: AppConfig, technique: Option<Technique>, raw: bool) -> Result<Self> {
        let lock = InstanceLock::acquire(&config.bot.lock_file)?;

        let progress = CliProgress::new();
        progress.phase("Starting generator bridge");
        let bridge = Arc::new(BridgeGenerator::spawn(&config.bridge)?);
        progress.finish();

        let service = ContentService::new(
            bridge.clone(),
            Arc::new(ConsoleTransport::stdout(raw)),
            config.generation,
        );
        if let Some(technique) = technique {
            service
                .store()
                .update(CONSOLE_USER, |rec| rec.settings.technique = technique);
        }

        Ok(Self {
            service,
            bridge,
            _lock: lock,
        })
    }

    fn close(self) {
        let Self {
            service,
            bridge,
            _lock,
        } = self;
        let usage = service.usage(CONSOLE_USER);
        info!(
            stats = ?service.stats().snapshot(),
            requests = usage.topic_requests + usage.post_requests,
            failed = usage.failed_requests,
            tokens = %usage.tokens,
            "session finished"
        );
        drop(service);

        match Arc::try_unwrap(bridge) {
            Ok(bridge) => bridge.shutdown(),
            Err(_) => warn!("generator bridge still busy, leaving it to exit on its own"),
        }
    }
}

async fn cmd_themes(
    config_path: Option<&Path>,
    focus: Option<Focus>,
    technique: Option<Technique>,
    raw: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let session = Session::open(config, technique, raw)?;

    let progress = CliProgress::new();
    progress.phase("Generating topics");
    let result = session.service.generate_topics(CONSOLE_USER, focus).await;
    progress.finish();
    print_token_usage(&session.service.usage(CONSOLE_USER));

    let outcome = match result {
        Ok(topics) => session
            .service
            .deliver(CONSOLE_USER, &transport::topics_prompt(&topics)),
        Err(e) => {
            session.service.report_error(CONSOLE_USER, &e)?;
            Err(e)
        }
    };

    session.close();
    outcome.wrap_err("topic generation failed")
}

async fn cmd_post(
    config_path: Option<&Path>,
    theme: &str,
    length: Option<u32>,
    technique: Option<Technique>,
    themes_file: Option<&Path>,
    raw: bool,
) -> Result<()> {
    let config = resolve_config(config_path)?;

    let length = match length {
        Some(chars) => config.generation.validate_length(chars)?,
        None => config.generation.default_length(),
    };

    let theme = match themes_file {
        Some(path) => resolve_topic_choice(theme, &extract_topics(&read_input(Some(path))?)),
        None => theme.trim().to_string(),
    };
    if theme.is_empty() {
        return Err(eyre!("theme must not be empty"));
    }

    let session = Session::open(config, technique, raw)?;
    info!(%theme, %length, "generating post");

    let progress = CliProgress::new();
    progress.phase(&format!("Writing a {length}-character post"));
    let result = session
        .service
        .generate_post(CONSOLE_USER, &theme, length)
        .await;
    progress.finish();
    print_token_usage(&session.service.usage(CONSOLE_USER));

    let outcome = match result {
        Ok(post) => {
            for warning in &post.warnings {
                warn!(%warning, "post was repaired");
            }
            session.service.deliver_post(CONSOLE_USER, &post)
        }
        Err(e) => {
            session.service.report_error(CONSOLE_USER, &e)?;
            Err(e)
        }
    };

    session.close();
    outcome.wrap_err("post generation failed")
}

/// Usage line for the latest call, on stderr so stdout stays the message.
fn print_token_usage(usage: &UsageTotals) {
    if let Some(line) = token_usage_line(usage) {
        eprintln!("{line}");
    }
}

fn token_usage_line(usage: &UsageTotals) -> Option<String> {
    usage.last.map(|last| format!("Tokens: {last}"))
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner shown while the generator works.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn post_arguments_parse_technique_and_length() {
        let cli = Cli::try_parse_from([
            "natrium", "post", "--theme", "3", "--length", "700", "-t", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Post {
                theme,
                length,
                technique,
                ..
            } => {
                assert_eq!(theme, "3");
                assert_eq!(length, Some(700));
                assert_eq!(technique, Some(Technique::CovCok));
            }
            _ => panic!("expected post command"),
        }
    }

    #[test]
    fn token_usage_line_reports_the_latest_call() {
        assert_eq!(token_usage_line(&UsageTotals::default()), None);

        let usage = UsageTotals {
            post_requests: 2,
            last: Some(natrium_shared::TokenUsage {
                input_tokens: 900,
                output_tokens: 400,
                reasoning_tokens: 150,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            token_usage_line(&usage).as_deref(),
            Some("Tokens: in 900, out 400, total 1300, reasoning 150")
        );
    }

    #[test]
    fn unknown_focus_is_rejected() {
        assert!(Cli::try_parse_from(["natrium", "themes", "--focus", "music"]).is_err());
        assert!(Cli::try_parse_from(["natrium", "themes", "--focus", "sleep", "-vv"]).is_ok());
    }
}
