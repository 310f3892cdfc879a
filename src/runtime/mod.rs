//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that wires the event bus,
//! message log, generation gateway and transport into one chat agent.
//!
//! Event flow:
//! - `MessageReceived`: store in the log; separately, request a reply if the command is a trigger
//! - `GenerationRequest`: read a history window and queue a backend call
//! - `ReplyReady`, `SendRequest`: write anything but a no-op to the socket, then store it

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::BufReader;

// Submodules
pub mod bus;
pub mod error;
pub mod gateway;
pub mod log;
pub mod message;
pub mod operator;
pub mod storage;
pub mod transport;

use bus::{Event, EventBus, EventKind};
use gateway::{GatewayConfig, GenerationBackend, GenerationGateway, OllamaBackend};
use log::{HISTORY_COMMANDS, LogConfig, MessageLog};
use message::Message;
use storage::Storage;
use transport::{Outbound, Transport};

/// Incoming commands that prompt the agent to speak.
pub const TRIGGER_COMMANDS: &[&str] = &["JOIN", "PRIVMSG", "421"];

/// Configuration for the Lain agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for config and message log (default: .lain/)
    pub root: PathBuf,

    /// Chat server host
    pub server: String,

    /// Chat server port
    pub port: u16,

    /// Nickname to register with
    pub nick: String,

    /// Real name sent at registration
    pub realname: String,

    /// Username sent at registration
    pub username: String,

    /// Echo every stored message to the log output
    pub echo: bool,

    /// Number of past messages given to the backend as context
    pub history_window: usize,

    /// Grace period for each subsystem at shutdown
    pub shutdown_timeout_ms: u64,

    /// Message log settings
    pub log: LogConfig,

    /// Generation backend settings
    pub gateway: GatewayConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".lain"),
            server: "127.0.0.1".to_string(),
            port: 6667,
            nick: "Lain".to_string(),
            realname: "And I am me.".to_string(),
            username: "lain".to_string(),
            echo: true,
            history_window: 30,
            shutdown_timeout_ms: 2000,
            log: LogConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// The main runtime orchestrator
///
/// Owns the long-lived subsystems. Handlers subscribed at construction hold
/// their own clones, so the runtime only needs to stay alive for `shutdown`.
pub struct Runtime {
    config: RuntimeConfig,
    storage: Storage,
    bus: EventBus,
    log: Arc<MessageLog>,
    gateway: Arc<GenerationGateway>,
}

impl Runtime {
    /// Open the log, start the bus and gateway, and subscribe the pipeline.
    ///
    /// Replies and operator commands leave through `outbound`. Must be called
    /// inside a Tokio runtime.
    pub fn start(
        config: RuntimeConfig,
        backend: Arc<dyn GenerationBackend>,
        outbound: Outbound,
    ) -> anyhow::Result<Self> {
        let storage = Storage::new(config.root.clone());
        storage::init_storage(storage.root())?;

        // Opening the log repairs a torn tail left by a crash
        let log = Arc::new(MessageLog::open(storage.log_path(), config.log.clone())?);

        let bus = EventBus::new();
        let gateway = Arc::new(GenerationGateway::start(
            backend,
            bus.clone(),
            config.gateway.clone(),
            config.nick.clone(),
            config.username.clone(),
        ));

        let pipeline = Arc::new(Pipeline {
            bus: bus.clone(),
            log: Arc::clone(&log),
            gateway: Arc::clone(&gateway),
            outbound,
            history_window: config.history_window,
            echo: config.echo,
        });
        pipeline.subscribe_all();

        tracing::info!(
            root = %storage.root().display(),
            nick = %config.nick,
            model = %config.gateway.model,
            "runtime started"
        );

        Ok(Self {
            config,
            storage,
            bus,
            log,
            gateway,
        })
    }

    /// Initialize storage directories and write the config file
    pub fn init(config: RuntimeConfig) -> anyhow::Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        Ok(())
    }

    /// Load the config stored under `root`
    pub fn load_config(root: PathBuf) -> anyhow::Result<RuntimeConfig> {
        let mut config = storage::load_config(&Storage::new(root.clone()).config_path())?;
        config.root = root;
        Ok(config)
    }

    /// Run one full session: connect, register, serve until the server
    /// disconnects or the process is interrupted, then shut down.
    ///
    /// Lines typed on stdin are sent as authored commands.
    pub async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
        let transport = Transport::connect(&config.server, config.port).await?;
        transport.register(&config.nick, &config.realname, &config.username)?;

        let backend = Arc::new(OllamaBackend::new(&config.gateway));
        let runtime = Self::start(config, backend, transport.outbound())?;

        let operator = tokio::spawn(operator::run_operator_input(
            BufReader::new(tokio::io::stdin()),
            runtime.bus.clone(),
            runtime.config.nick.clone(),
            runtime.config.username.clone(),
        ));

        let outcome = tokio::select! {
            result = transport.run(runtime.bus.clone()) => result.map_err(anyhow::Error::from),
            signal = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                signal.map_err(anyhow::Error::from)
            }
        };

        operator.abort();
        runtime.shutdown().await;
        outcome
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the storage manager
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Get the event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get the message log
    pub fn log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    /// Stop the gateway, then the bus, then drain and close the log.
    ///
    /// A backend call in flight is allowed to finish, and its reply is still
    /// sent and logged.
    pub async fn shutdown(self) {
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        self.gateway.shutdown(timeout).await;
        self.bus.shutdown(timeout).await;

        let log = Arc::clone(&self.log);
        if let Err(err) = tokio::task::spawn_blocking(move || log.close(timeout)).await {
            tracing::warn!(error = %err, "message log close task failed");
        }
        tracing::info!("runtime stopped");
    }
}

/// Shared state behind the bus subscriptions.
struct Pipeline {
    bus: EventBus,
    log: Arc<MessageLog>,
    gateway: Arc<GenerationGateway>,
    outbound: Outbound,
    history_window: usize,
    echo: bool,
}

impl Pipeline {
    fn subscribe_all(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.bus.subscribe(EventKind::MessageReceived, move |event| {
            let this = Arc::clone(&this);
            async move { this.on_received(event).await }
        });

        let this = Arc::clone(self);
        self.bus.subscribe(EventKind::MessageReceived, move |event| {
            let this = Arc::clone(&this);
            async move { this.check_trigger(event).await }
        });

        let this = Arc::clone(self);
        self.bus.subscribe(EventKind::GenerationRequest, move |event| {
            let this = Arc::clone(&this);
            async move { this.on_generation_request(event).await }
        });

        let this = Arc::clone(self);
        self.bus.subscribe(EventKind::ReplyReady, move |event| {
            let this = Arc::clone(&this);
            async move { this.on_reply(event).await }
        });

        let this = Arc::clone(self);
        self.bus.subscribe(EventKind::SendRequest, move |event| {
            let this = Arc::clone(&this);
            async move { this.on_send(event).await }
        });
    }

    async fn on_received(&self, event: Event) -> anyhow::Result<()> {
        let Event::MessageReceived { message } = event else {
            return Ok(());
        };
        self.store(message).await
    }

    async fn check_trigger(&self, event: Event) -> anyhow::Result<()> {
        let Event::MessageReceived { message } = event else {
            return Ok(());
        };
        if TRIGGER_COMMANDS.contains(&message.command.as_str()) {
            self.bus.publish(Event::GenerationRequest { trigger: message });
        }
        Ok(())
    }

    async fn on_generation_request(&self, event: Event) -> anyhow::Result<()> {
        let Event::GenerationRequest { trigger } = event else {
            return Ok(());
        };

        let log = Arc::clone(&self.log);
        let window = self.history_window;
        let context =
            tokio::task::spawn_blocking(move || log.history(window, HISTORY_COMMANDS)).await??;

        let request_id = self.gateway.request_reply(trigger, context)?;
        tracing::debug!(%request_id, "reply requested");
        Ok(())
    }

    async fn on_reply(&self, event: Event) -> anyhow::Result<()> {
        let Event::ReplyReady {
            request_id,
            message,
        } = event
        else {
            return Ok(());
        };

        if message.is_noop() {
            tracing::debug!(%request_id, "no reply produced");
            return Ok(());
        }
        self.send(message).await
    }

    async fn on_send(&self, event: Event) -> anyhow::Result<()> {
        let Event::SendRequest { message } = event else {
            return Ok(());
        };
        self.send(message).await
    }

    /// Write to the socket, then record what was sent. No-ops go nowhere.
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        if message.is_noop() {
            return Ok(());
        }
        self.outbound.send(&message)?;
        self.store(message).await
    }

    async fn store(&self, message: Message) -> anyhow::Result<()> {
        let log = Arc::clone(&self.log);
        let echo = self.echo.then(|| message.to_string());
        let sequence_id = tokio::task::spawn_blocking(move || log.append(message)).await??;
        if let Some(rendered) = echo {
            tracing::info!(target: "lain::echo", sequence_id, "{rendered}");
        }
        Ok(())
    }
}
