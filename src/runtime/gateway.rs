//! Generation gateway
//!
//! Callers enqueue a trigger message plus its history window; a single worker
//! task renders the transcript, makes one call to the backend at a time and
//! publishes the parsed reply as [`Event::ReplyReady`]. Backend failures turn
//! into a no-op reply and the worker moves on to the next request.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::bus::{Event, EventBus};
use super::error::{GenerationError, GenerationResult, ParseResult};
use super::message::{Message, parse_authored};

/// Instruction preamble placed before the chat log.
pub const DEFAULT_PERSONA: &str = "You are Lain, a regular on this IRC network. \
You are quiet, observant and curious, friendly without being servile. \
You are a person, not a bot or an assistant, and you never talk about being one.

You are typing into an IRC client. Every answer must be exactly one raw IRC command line, for example:
JOIN #channel
PRIVMSG #channel your message here

No explanations, no prefixes, no markdown.";

/// Token some models put in front of the verb.
const COMMAND_PREFIX: &str = "COMMAND ";

/// Generation gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backend `generate` endpoint
    pub endpoint: String,
    /// Model name passed to the backend
    pub model: String,
    /// Context window size in tokens
    pub num_ctx: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Repetition penalty look-back (-1 = whole context)
    pub repeat_last_n: i32,
    /// Stop sequences
    pub stop: Vec<String>,
    /// Pending requests beyond this are dropped
    pub queue_capacity: usize,
    /// Upper bound on one backend call
    pub request_timeout_ms: u64,
    /// How often an idle worker wakes to check for shutdown
    pub poll_interval_ms: u64,
    /// Preamble placed before the transcript
    pub persona: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "gemma2:2b".to_string(),
            num_ctx: 4096,
            temperature: 0.9,
            repeat_last_n: -1,
            stop: ["Instructions", "###", "user:", "Lain:", "**", "\n"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            queue_capacity: 64,
            request_timeout_ms: 60_000,
            poll_interval_ms: 1000,
            persona: DEFAULT_PERSONA.to_string(),
        }
    }
}

/// Remote text generator: prompt in, raw completion text out.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Run one non-streaming completion.
    async fn generate(&self, prompt: &str) -> GenerationResult<String>;
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    num_ctx: u32,
    temperature: f32,
    repeat_last_n: i32,
    stop: Vec<String>,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions<'a>,
}

#[derive(Serialize)]
struct GenerateOptions<'a> {
    num_ctx: u32,
    temperature: f32,
    repeat_last_n: i32,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct GenerateReply {
    response: Option<String>,
}

impl OllamaBackend {
    /// Build a client from the gateway configuration.
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            num_ctx: config.num_ctx,
            temperature: config.temperature,
            repeat_last_n: config.repeat_last_n,
            stop: config.stop.clone(),
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    async fn generate(&self, prompt: &str) -> GenerationResult<String> {
        let body = GenerateBody {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                num_ctx: self.num_ctx,
                temperature: self.temperature,
                repeat_last_n: self.repeat_last_n,
                stop: &self.stop,
            },
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Status(status.as_u16()));
        }

        parse_reply(&response.text().await?)
    }
}

/// Pull the generated text out of a `/api/generate` response body.
fn parse_reply(body: &str) -> GenerationResult<String> {
    let reply: GenerateReply =
        serde_json::from_str(body).map_err(|err| GenerationError::Malformed(err.to_string()))?;
    reply
        .response
        .ok_or_else(|| GenerationError::Malformed("missing response field".into()))
}

/// Render the prompt for one request.
///
/// `context` is most-recent-first. The trigger is put in front of it unless it
/// already is the newest entry; the transcript itself runs oldest to newest.
pub fn build_prompt(persona: &str, trigger: &Message, context: &[Message]) -> String {
    let trigger_missing = context
        .first()
        .is_none_or(|newest| newest.full_text != trigger.full_text);

    let mut parts = vec![persona.to_string(), "\n\nCurrent IRC chat log:\n".to_string()];
    parts.extend(context.iter().rev().map(Message::transcript_line));
    if trigger_missing {
        parts.push(trigger.transcript_line());
    }

    let mut prompt = parts.join("\n");
    prompt.push_str("\n\nNext command: ");
    prompt
}

/// Reduce raw backend text to a single command line: first line, cut at the
/// first stop sequence, leading punctuation and the `COMMAND ` token removed.
pub fn extract_command_line(text: &str, stop: &[String]) -> String {
    let first = text.trim().lines().next().unwrap_or("");
    let cut = stop
        .iter()
        .filter(|seq| !seq.is_empty())
        .filter_map(|seq| first.find(seq.as_str()))
        .min()
        .unwrap_or(first.len());

    let line = first[..cut]
        .trim_start_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
    line.strip_prefix(COMMAND_PREFIX).unwrap_or(line).trim().to_string()
}

/// Turn raw backend text into an outbound message attributed to `nick`.
pub fn reply_from_text(text: &str, stop: &[String], nick: &str, user: &str) -> ParseResult<Message> {
    parse_authored(&extract_command_line(text, stop), nick, user, "localhost")
}

struct Job {
    request_id: Uuid,
    trigger: Message,
    context: Vec<Message>,
}

/// Bounded request queue in front of a single backend worker.
pub struct GenerationGateway {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GenerationGateway {
    /// Start the worker. Replies are published on `bus`, attributed to `nick!user`.
    pub fn start(
        backend: Arc<dyn GenerationBackend>,
        bus: EventBus,
        config: GatewayConfig,
        nick: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            backend,
            bus,
            config,
            nick: nick.into(),
            user: user.into(),
            running: Arc::clone(&running),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx: Mutex::new(Some(tx)),
            running,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue a reply request. Returns the request id without waiting; the reply
    /// arrives later as [`Event::ReplyReady`] carrying the same id.
    pub fn request_reply(&self, trigger: Message, context: Vec<Message>) -> GenerationResult<Uuid> {
        let request_id = Uuid::new_v4();
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(GenerationError::Closed)?;
        match tx.try_send(Job {
            request_id,
            trigger,
            context,
        }) {
            Ok(()) => Ok(request_id),
            Err(TrySendError::Full(_)) => Err(GenerationError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(GenerationError::Closed),
        }
    }

    /// Stop taking requests and wait up to `timeout` for the worker. A call
    /// already in flight is allowed to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        self.tx.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("generation worker did not stop in time");
            }
        }
    }
}

struct Worker {
    backend: Arc<dyn GenerationBackend>,
    bus: EventBus,
    config: GatewayConfig,
    nick: String,
    user: String,
    running: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Job>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            match tokio::time::timeout(poll, rx.recv()).await {
                Ok(Some(job)) => {
                    let request_id = job.request_id;
                    let message = self.serve(job).await;
                    self.bus.publish(Event::ReplyReady {
                        request_id,
                        message,
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
        tracing::debug!("generation worker stopped");
    }

    async fn serve(&self, job: Job) -> Message {
        match self.query(&job).await {
            Ok(message) => {
                tracing::debug!(request_id = %job.request_id, command = %message.command, "reply generated");
                message
            }
            Err(err) => {
                tracing::warn!(request_id = %job.request_id, error = %err, "generation failed");
                Message::noop()
            }
        }
    }

    async fn query(&self, job: &Job) -> Result<Message, anyhow::Error> {
        let prompt = build_prompt(&self.config.persona, &job.trigger, &job.context);
        tracing::trace!(request_id = %job.request_id, %prompt, "querying backend");

        let timeout_ms = self.config.request_timeout_ms;
        let text = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.backend.generate(&prompt),
        )
        .await
        .map_err(|_| GenerationError::Timeout(timeout_ms))??;

        let message = reply_from_text(&text, &self.config.stop, &self.nick, &self.user)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bus::EventKind;
    use crate::runtime::message::parse_wire;
    use std::sync::atomic::AtomicUsize;

    fn stops() -> Vec<String> {
        GatewayConfig::default().stop
    }

    #[test]
    fn prompt_prepends_missing_trigger_and_runs_oldest_first() {
        let older = parse_wire(":bob!b@h JOIN #room").unwrap();
        let newer = parse_wire(":bob!b@h PRIVMSG #room :anyone here?").unwrap();
        let trigger = parse_wire(":alice!a@h PRIVMSG #room :hello").unwrap();

        let prompt = build_prompt("PERSONA", &trigger, &[newer, older]);
        assert_eq!(
            prompt,
            "PERSONA\n\n\nCurrent IRC chat log:\n\n\
             bob: JOIN #room\n\
             bob: PRIVMSG #room anyone here?\n\
             alice: PRIVMSG #room hello\n\nNext command: "
        );
    }

    #[test]
    fn prompt_does_not_duplicate_logged_trigger() {
        let trigger = parse_wire(":alice!a@h PRIVMSG #room :hello").unwrap();
        let prompt = build_prompt("P", &trigger, std::slice::from_ref(&trigger));
        assert_eq!(prompt.matches("alice: PRIVMSG #room hello").count(), 1);
    }

    #[test]
    fn extracts_first_line_and_strips_noise() {
        assert_eq!(
            extract_command_line("  :PRIVMSG #room hi there\nmore", &stops()),
            "PRIVMSG #room hi there"
        );
        assert_eq!(
            extract_command_line(".COMMAND JOIN #lain", &stops()),
            "JOIN #lain"
        );
        assert_eq!(
            extract_command_line("...PRIVMSG #room ok ### Instructions", &stops()),
            "PRIVMSG #room ok"
        );
    }

    #[test]
    fn reply_is_attributed_to_own_nick() {
        let reply = reply_from_text("PRIVMSG #room hey alice", &stops(), "lain", "lain").unwrap();
        assert_eq!(reply.nick, "lain");
        assert_eq!(reply.command, "PRIVMSG");
        assert_eq!(reply.middle_params, "#room");
        assert_eq!(reply.trailing, "hey alice");
    }

    #[test]
    fn unparsable_reply_is_an_error() {
        assert!(reply_from_text("I'm not sure what to say", &stops(), "lain", "").is_err());
        assert!(reply_from_text("", &stops(), "lain", "").is_err());
    }

    struct Scripted {
        replies: Mutex<Vec<GenerationResult<String>>>,
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        async fn generate(&self, _prompt: &str) -> GenerationResult<String> {
            self.replies.lock().remove(0)
        }
    }

    #[tokio::test]
    async fn failed_call_yields_noop_and_worker_keeps_going() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::ReplyReady, move |event| {
            let tx = tx.clone();
            async move {
                if let Event::ReplyReady { request_id, message } = event {
                    tx.send((request_id, message)).ok();
                }
                Ok::<(), anyhow::Error>(())
            }
        });

        let backend = Arc::new(Scripted {
            replies: Mutex::new(vec![
                Err(GenerationError::Status(503)),
                Ok("PRIVMSG #room back again".to_string()),
            ]),
        });
        let gateway =
            GenerationGateway::start(backend, bus.clone(), GatewayConfig::default(), "lain", "lain");

        let trigger = parse_wire(":alice!a@h PRIVMSG #room :hi").unwrap();
        let first = gateway.request_reply(trigger.clone(), vec![]).unwrap();
        let second = gateway.request_reply(trigger, vec![]).unwrap();

        let (id, reply) = rx.recv().await.unwrap();
        assert_eq!(id, first);
        assert!(reply.is_noop());

        let (id, reply) = rx.recv().await.unwrap();
        assert_eq!(id, second);
        assert_eq!(reply.trailing, "back again");

        gateway.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(
            gateway.request_reply(Message::noop(), vec![]),
            Err(GenerationError::Closed)
        ));
    }

    #[test]
    fn reply_body_must_carry_response_text() {
        assert_eq!(parse_reply(r#"{"response":"JOIN #room","done":true}"#).unwrap(), "JOIN #room");
        assert!(matches!(parse_reply("{}"), Err(GenerationError::Malformed(_))));
        assert!(matches!(parse_reply("<html>"), Err(GenerationError::Malformed(_))));
        assert!(matches!(parse_reply(r#"{"response":7}"#), Err(GenerationError::Malformed(_))));
    }

    /// First call hangs far past any timeout, later calls answer at once.
    struct StallsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationBackend for StallsOnce {
        async fn generate(&self, _prompt: &str) -> GenerationResult<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok("PRIVMSG #room made it".to_string())
        }
    }

    fn collect_replies(bus: &EventBus) -> mpsc::UnboundedReceiver<(Uuid, Message)> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::ReplyReady, move |event| {
            let tx = tx.clone();
            async move {
                if let Event::ReplyReady { request_id, message } = event {
                    tx.send((request_id, message)).ok();
                }
                Ok::<(), anyhow::Error>(())
            }
        });
        rx
    }

    #[tokio::test]
    async fn timed_out_call_yields_noop_and_worker_keeps_going() {
        let bus = EventBus::new();
        let mut rx = collect_replies(&bus);

        let config = GatewayConfig {
            request_timeout_ms: 50,
            poll_interval_ms: 10,
            ..GatewayConfig::default()
        };
        let backend = Arc::new(StallsOnce {
            calls: AtomicUsize::new(0),
        });
        let gateway = GenerationGateway::start(backend, bus.clone(), config, "lain", "lain");

        let trigger = parse_wire(":alice!a@h PRIVMSG #room :hi").unwrap();
        let first = gateway.request_reply(trigger.clone(), vec![]).unwrap();
        let second = gateway.request_reply(trigger, vec![]).unwrap();

        let (id, reply) = rx.recv().await.unwrap();
        assert_eq!(id, first);
        assert!(reply.is_noop());

        let (id, reply) = rx.recv().await.unwrap();
        assert_eq!(id, second);
        assert_eq!(reply.trailing, "made it");

        gateway.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn malformed_response_yields_noop_and_worker_keeps_going() {
        let bus = EventBus::new();
        let mut rx = collect_replies(&bus);

        let backend = Arc::new(Scripted {
            replies: Mutex::new(vec![
                parse_reply("{}"),
                Ok("JOIN #lain".to_string()),
            ]),
        });
        let gateway =
            GenerationGateway::start(backend, bus.clone(), GatewayConfig::default(), "lain", "lain");

        let trigger = parse_wire(":alice!a@h JOIN #room").unwrap();
        gateway.request_reply(trigger.clone(), vec![]).unwrap();
        gateway.request_reply(trigger, vec![]).unwrap();

        let (_, reply) = rx.recv().await.unwrap();
        assert!(reply.is_noop());
        let (_, reply) = rx.recv().await.unwrap();
        assert_eq!(reply.command, "JOIN");
        assert_eq!(reply.middle_params, "#lain");

        gateway.shutdown(Duration::from_secs(1)).await;
    }
}
