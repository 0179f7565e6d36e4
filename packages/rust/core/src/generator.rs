//! Content generator contract and the subprocess bridge implementation.
//!
//! The generator itself (model provider, vector store, web search) lives in an
//! external process. It is spawned once and spoken to over a JSON-lines
//! protocol on stdin/stdout.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use natrium_shared::{BridgeConfig, Focus, NatriumError, PostLength, Result, Technique, TokenUsage};

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// What the generator is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    /// A numbered list of candidate topics.
    Themes,
    /// A finished post on one topic.
    Post,
}

/// Template variables passed through to the generator prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationVariables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
}

/// A single generator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub technique: Technique,
    pub variables: GenerationVariables,
}

impl GenerationRequest {
    /// Ask for `count` topics, optionally steered towards `focus`.
    pub fn themes(technique: Technique, focus: Option<Focus>, count: usize) -> Self {
        let user_input = match focus.and_then(|f| f.keywords()) {
            Some(keywords) => format!(
                "Сгенерируй {count} актуальных тем для постов с ФОКУСОМ НА: {keywords}. \
                 Обязательно используй разнообразные форматы из книги о соцсетях!"
            ),
            None => format!(
                "Сгенерируй {count} актуальных тем. Обязательно используй FileSearch \
                 (загруженные файлы) и Web Search (свежие новости: CrossFit Open, ВОЗ, PubMed)."
            ),
        };

        Self {
            kind: GenerationKind::Themes,
            technique,
            variables: GenerationVariables {
                user_input: Some(user_input),
                ..Default::default()
            },
        }
    }

    /// Ask for a post on `theme` of roughly `length` characters.
    pub fn post(technique: Technique, theme: &str, length: PostLength) -> Self {
        Self {
            kind: GenerationKind::Post,
            technique,
            variables: GenerationVariables {
                theme: Some(theme.to_string()),
                post_length: Some(length.get()),
                user_input: None,
            },
        }
    }
}

/// Raw generator output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Anything that turns a [`GenerationRequest`] into raw text.
///
/// Calls block; the service runs them on the blocking pool.
pub trait ContentGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// Message sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "generate")]
    Generate {
        id: String,
        request: &'a GenerationRequest,
    },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Message received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, result: Generation },
    #[serde(rename = "error")]
    Error { id: String, error: String },
}

/// Request/response channel over any line-oriented reader and writer.
struct BridgeChannel<R, W> {
    reader: R,
    writer: W,
    request_counter: u64,
}

impl<R: BufRead, W: Write> BridgeChannel<R, W> {
    fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            request_counter: 0,
        }
    }

    /// Read one line; an empty read means the bridge closed stdout.
    fn read_message(&mut self) -> Result<ResponseMessage> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| NatriumError::generation(format!("bridge read error: {e}")))?;

        if line.is_empty() {
            return Err(NatriumError::generation("bridge closed stdout unexpectedly"));
        }

        serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.chars().take(200).collect();
            NatriumError::generation(format!("invalid bridge message: {e} (got: {preview})"))
        })
    }

    fn write_message(&mut self, message: &RequestMessage<'_>) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| NatriumError::generation(format!("failed to serialize request: {e}")))?;

        writeln!(self.writer, "{json}")
            .and_then(|()| self.writer.flush())
            .map_err(|e| NatriumError::generation(format!("failed to write to bridge: {e}")))
    }

    /// Block until the bridge announces it is ready.
    fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message()? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(NatriumError::generation(format!(
                "expected ready message, got {other:?}"
            ))),
        }
    }

    /// Send one request and wait for its answer.
    fn request(&mut self, request: &GenerationRequest) -> Result<Generation> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        self.write_message(&RequestMessage::Generate {
            id: id.clone(),
            request,
        })?;

        match self.read_message()? {
            ResponseMessage::Result { id: resp_id, result } if resp_id == id => Ok(result),
            ResponseMessage::Result { id: resp_id, .. } => Err(NatriumError::generation(format!(
                "bridge answered {resp_id} while {id} was pending"
            ))),
            ResponseMessage::Error { id: resp_id, error } => {
                debug!(%resp_id, "bridge reported an error");
                Err(NatriumError::generation(error))
            }
            ResponseMessage::Ready => Err(NatriumError::generation(
                "unexpected ready message during generation",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge generator
// ---------------------------------------------------------------------------

/// [`ContentGenerator`] backed by the external bridge process.
///
/// One request is in flight at a time; concurrent callers queue on the
/// channel mutex.
pub struct BridgeGenerator {
    child: Child,
    channel: Mutex<BridgeChannel<BufReader<ChildStdout>, ChildStdin>>,
}

impl BridgeGenerator {
    /// Spawn the bridge and wait for its ready signal.
    #[instrument(skip_all, fields(cmd = %config.command))]
    pub fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(args = ?config.args, "spawning generator bridge");

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            NatriumError::generation(format!(
                "failed to spawn bridge: {e}. Is `{}` installed?",
                config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| NatriumError::generation("failed to capture bridge stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NatriumError::generation("failed to capture bridge stdout"))?;

        let mut channel = BridgeChannel::new(BufReader::new(stdout), stdin);
        if let Err(e) = channel.wait_for_ready() {
            let _ = child.kill();
            return Err(e);
        }

        Ok(Self {
            child,
            channel: Mutex::new(channel),
        })
    }

    /// Ask the bridge to exit and wait for it.
    pub fn shutdown(mut self) {
        let mut channel = self
            .channel
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = channel.write_message(&RequestMessage::Shutdown) {
            warn!(error = %e, "could not send shutdown to bridge");
        }
        drop(channel);

        match self.child.wait() {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

impl ContentGenerator for BridgeGenerator {
    #[instrument(skip_all, fields(kind = ?request.kind, technique = %request.technique))]
    fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = channel.request(request)?;
        debug!(chars = generation.text.chars().count(), "bridge returned text");
        Ok(generation)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn channel(input: &str) -> BridgeChannel<Cursor<Vec<u8>>, Vec<u8>> {
        BridgeChannel::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn themes_request_carries_focus_keywords() {
        let request = GenerationRequest::themes(Technique::CovCok, Some(Focus::Sleep), 10);
        let input = request.variables.user_input.unwrap();
        assert!(input.contains("ФОКУСОМ НА: сон, восстановление"));
        assert!(input.starts_with("Сгенерируй 10"));
        assert!(request.variables.theme.is_none());
    }

    #[test]
    fn themes_request_without_focus_is_generic() {
        let request = GenerationRequest::themes(Technique::ZeroShot, Some(Focus::Random), 10);
        let input = request.variables.user_input.unwrap();
        assert!(!input.contains("ФОКУСОМ"));
        assert!(input.contains("Web Search"));
    }

    #[test]
    fn request_message_serializes_correctly() {
        let request = GenerationRequest::post(Technique::CovCok, "Сон", PostLength::DEFAULT);
        let msg = RequestMessage::Generate {
            id: "req-1".into(),
            request: &request,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"generate","id":"req-1","request":{"kind":"post","technique":"cov+cok","variables":{"theme":"Сон","post_length":500}}}"#
        );
    }

    #[test]
    fn shutdown_message_serializes_correctly() {
        let json = serde_json::to_string(&RequestMessage::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn response_result_tolerates_missing_usage() {
        let json = r#"{"type":"result","id":"req-1","result":{"text":"1. Тема"}}"#;
        match serde_json::from_str::<ResponseMessage>(json).unwrap() {
            ResponseMessage::Result { id, result } => {
                assert_eq!(id, "req-1");
                assert_eq!(result.text, "1. Тема");
                assert!(result.usage.is_none());
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn channel_exchanges_ready_and_result() {
        let mut ch = channel(concat!(
            r#"{"type":"ready"}"#,
            "\n",
            r#"{"type":"result","id":"req-1","result":{"text":"пост","usage":{"input_tokens":3,"output_tokens":4}}}"#,
            "\n",
        ));
        ch.wait_for_ready().unwrap();

        let request = GenerationRequest::themes(Technique::FewShot, None, 10);
        let generation = ch.request(&request).unwrap();
        assert_eq!(generation.text, "пост");
        assert_eq!(generation.usage.unwrap().total(), 7);

        let sent = String::from_utf8(ch.writer).unwrap();
        assert!(sent.starts_with(r#"{"type":"generate","id":"req-1""#));
        assert!(sent.ends_with('\n'));
    }

    #[test]
    fn channel_surfaces_bridge_errors() {
        let mut ch = channel(concat!(
            r#"{"type":"error","id":"req-1","error":"rate limited"}"#,
            "\n"
        ));
        let request = GenerationRequest::post(Technique::CovCok, "x", PostLength::DEFAULT);
        let err = ch.request(&request).unwrap_err();
        assert!(err.is_upstream());
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn channel_rejects_mismatched_id_and_eof() {
        let mut ch = channel(concat!(
            r#"{"type":"result","id":"req-9","result":{"text":"x"}}"#,
            "\n"
        ));
        let request = GenerationRequest::post(Technique::CovCok, "x", PostLength::DEFAULT);
        assert!(ch.request(&request).unwrap_err().to_string().contains("req-9"));
        assert!(
            ch.request(&request)
                .unwrap_err()
                .to_string()
                .contains("closed stdout")
        );
    }

    #[test]
    fn ready_is_required_first() {
        let mut ch = channel("{\"type\":\"error\",\"id\":\"x\",\"error\":\"boom\"}\n");
        assert!(ch.wait_for_ready().is_err());
    }
}
