//! Transcode bridge actor
//!
//! A single task owns the bridge session and processes commands one at a
//! time, so concurrent produce notifications can never start two
//! transcoders. The current state is published through a `watch` channel.

use stagecast_core::config::TranscodeConfig;
use stagecast_sfu::{
    ConsumeOptions, Consumer, MediaEngine, PlainTransport, ProducerId, SessionRegistry, Teardown,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::artifacts::HlsArtifacts;
use crate::error::{BridgeError, Result};
use crate::process::{self, ProcessHandle};
use crate::sdp::StreamDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Active,
    Stopping,
    Failed,
}

impl BridgeState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub state: BridgeState,
    /// Video producer being transcoded
    pub producer_id: Option<ProducerId>,
    /// Incremented for every session start
    pub generation: u64,
    pub last_error: Option<String>,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            state: BridgeState::Idle,
            producer_id: None,
            generation: 0,
            last_error: None,
        }
    }
}

enum Command {
    VideoProduced(ProducerId),
    ProducersClosed {
        producers: Vec<ProducerId>,
        remaining: usize,
    },
    ProcessExited {
        generation: u64,
        code: Option<i32>,
    },
    Stop(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the bridge actor
#[derive(Clone)]
pub struct TranscodeBridge {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<BridgeStatus>,
}

impl TranscodeBridge {
    /// Start the actor task; it runs until `shutdown` or until every handle
    /// is dropped
    pub fn spawn(
        config: TranscodeConfig,
        engine: Arc<dyn MediaEngine>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(BridgeStatus::default());

        let actor = BridgeActor {
            artifacts: HlsArtifacts::new(&config),
            config,
            engine,
            registry,
            status: status_tx,
            commands: commands.downgrade(),
            session: None,
            generation: 0,
        };
        tokio::spawn(actor.run(rx));

        Self { commands, status }
    }

    /// A video producer was registered
    pub fn video_produced(&self, producer_id: ProducerId) {
        self.send(Command::VideoProduced(producer_id));
    }

    /// Producers were removed from the registry
    pub fn producers_closed(&self, teardown: &Teardown) {
        self.send(Command::ProducersClosed {
            producers: teardown.closed_producers.iter().map(|p| p.id.clone()).collect(),
            remaining: teardown.remaining_producers,
        });
    }

    /// Stop the current session, if any
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx));
        let _ = rx.await;
    }

    /// Stop the current session and end the actor
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx));
        let _ = rx.await;
    }

    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Transcode bridge is shut down");
        }
    }
}

struct TranscodeSession {
    generation: u64,
    producer_id: ProducerId,
    transport: Arc<dyn PlainTransport>,
    consumer: Arc<dyn Consumer>,
    process: ProcessHandle,
}

struct BridgeActor {
    config: TranscodeConfig,
    engine: Arc<dyn MediaEngine>,
    registry: Arc<SessionRegistry>,
    artifacts: HlsArtifacts,
    status: watch::Sender<BridgeStatus>,
    commands: mpsc::WeakUnboundedSender<Command>,
    session: Option<TranscodeSession>,
    generation: u64,
}

impl BridgeActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::VideoProduced(producer_id) => {
                    debug!(producer_id = %producer_id, "Video producer registered");
                    self.start().await;
                }
                Command::ProducersClosed {
                    producers,
                    remaining,
                } => self.on_producers_closed(&producers, remaining).await,
                Command::ProcessExited { generation, code } => {
                    self.on_process_exited(generation, code).await;
                }
                Command::Stop(reply) => {
                    self.stop("requested").await;
                    let _ = reply.send(());
                }
                Command::Shutdown(reply) => {
                    self.stop("shutdown").await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        self.stop("bridge dropped").await;
    }

    fn publish(&self, state: BridgeState, producer_id: Option<ProducerId>) {
        self.status.send_modify(|status| {
            status.state = state;
            status.producer_id = producer_id;
            status.generation = self.generation;
        });
    }

    async fn start(&mut self) {
        if self.session.is_some() {
            return;
        }

        let Some(producer_id) = self.registry.select_video_producer(self.config.selection) else {
            debug!("No video producer to transcode");
            return;
        };

        self.generation += 1;
        self.publish(BridgeState::Starting, Some(producer_id.clone()));
        info!(
            producer_id = %producer_id,
            generation = self.generation,
            "Starting transcode session"
        );

        match self.open_session(producer_id.clone()).await {
            Ok(session) => {
                info!(
                    producer_id = %producer_id,
                    pid = session.process.pid(),
                    manifest = %self.artifacts.manifest_path().display(),
                    "Transcode session active"
                );
                self.session = Some(session);
                self.publish(BridgeState::Active, Some(producer_id));
            }
            Err(e) => {
                error!(producer_id = %producer_id, error = %e, "Failed to start transcode session");
                self.status
                    .send_modify(|status| status.last_error = Some(e.to_string()));
                self.publish(BridgeState::Failed, Some(producer_id));
                self.artifacts.cleanup().await;
                self.publish(BridgeState::Idle, None);
            }
        }
    }

    async fn open_session(&self, producer_id: ProducerId) -> Result<TranscodeSession> {
        self.artifacts.prepare().await?;

        let transport = self
            .engine
            .create_plain_transport(&self.config.listen_ip)
            .await?;

        match self.attach(&transport, &producer_id).await {
            Ok((consumer, process)) => Ok(TranscodeSession {
                generation: self.generation,
                producer_id,
                transport,
                consumer,
                process,
            }),
            Err(e) => {
                // closes the consumer too
                transport.close();
                Err(e)
            }
        }
    }

    async fn attach(
        &self,
        transport: &Arc<dyn PlainTransport>,
        producer_id: &ProducerId,
    ) -> Result<(Arc<dyn Consumer>, ProcessHandle)> {
        transport
            .connect(&self.config.rtp_address, self.config.rtp_port)
            .await?;

        let consumer = transport
            .consume(ConsumeOptions {
                producer_id: producer_id.clone(),
                rtp_capabilities: self.engine.rtp_capabilities(),
                paused: true,
            })
            .await?;

        let description = StreamDescription::from_parameters(
            consumer.kind(),
            &consumer.rtp_parameters(),
            &self.config.rtp_address,
            self.config.rtp_port,
        )?;
        self.artifacts.write_sdp(&description.to_sdp()).await?;

        let generation = self.generation;
        let commands = self.commands.clone();
        let process = process::spawn(&self.config.program, &self.command_args(), move |code| {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::ProcessExited { generation, code });
            }
        })?;

        // media flows only once the transcoder is listening
        if let Err(e) = consumer.resume().await {
            process.terminate(self.grace_period()).await;
            return Err(BridgeError::from(e));
        }

        Ok((consumer, process))
    }

    fn grace_period(&self) -> Duration {
        Duration::from_millis(self.config.stop_grace_period_ms)
    }

    fn command_args(&self) -> Vec<String> {
        let sdp = self.artifacts.sdp_path().display().to_string();
        let manifest = self.artifacts.manifest_path().display().to_string();

        if !self.config.args.is_empty() {
            let output_dir = self.artifacts.dir().display().to_string();
            return self
                .config
                .args
                .iter()
                .map(|arg| {
                    arg.replace("{sdp}", &sdp)
                        .replace("{manifest}", &manifest)
                        .replace("{output_dir}", &output_dir)
                })
                .collect();
        }

        hls_args(
            &sdp,
            &manifest,
            self.config.hls_time,
            self.config.hls_list_size,
        )
    }

    async fn stop(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };

        info!(
            producer_id = %session.producer_id,
            generation = session.generation,
            reason,
            "Stopping transcode session"
        );
        self.publish(BridgeState::Stopping, Some(session.producer_id.clone()));
        self.teardown(session).await;
        self.publish(BridgeState::Idle, None);
    }

    async fn teardown(&self, session: TranscodeSession) {
        let graceful = session.process.terminate(self.grace_period()).await;
        if !graceful {
            warn!(generation = session.generation, "Transcoder was killed");
        }

        session.consumer.close();
        session.transport.close();
        self.artifacts.cleanup().await;
    }

    async fn on_producers_closed(&mut self, producers: &[ProducerId], remaining: usize) {
        let Some(session) = &self.session else {
            return;
        };

        // `remaining` was counted at removal time and may be stale by now;
        // only the selected producer's presence decides
        let selected_gone = producers.contains(&session.producer_id)
            || self.registry.find_producer(&session.producer_id).is_none();
        if !selected_gone {
            debug!(remaining, "Closed producers do not affect the transcode session");
            return;
        }

        self.stop("selected producer closed").await;
        // another video producer may take over
        self.start().await;
    }

    async fn on_process_exited(&mut self, generation: u64, code: Option<i32>) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|session| session.generation == generation);
        if !current {
            // exit of a session we stopped ourselves
            return;
        }

        let Some(session) = self.session.take() else {
            return;
        };

        error!(
            producer_id = %session.producer_id,
            generation,
            code,
            "Transcoder exited unexpectedly"
        );
        let message = match code {
            Some(code) => format!("transcoder exited with status {code}"),
            None => "transcoder terminated by signal".to_string(),
        };
        self.status
            .send_modify(|status| status.last_error = Some(message));
        self.publish(BridgeState::Failed, Some(session.producer_id.clone()));
        self.teardown(session).await;
        self.publish(BridgeState::Idle, None);
    }
}

/// Built-in transcoder arguments: copy the video stream into rolling HLS
#[must_use]
pub fn hls_args(sdp: &str, manifest: &str, hls_time: u32, hls_list_size: u32) -> Vec<String> {
    let hls_time = hls_time.to_string();
    let hls_list_size = hls_list_size.to_string();
    [
        "-protocol_whitelist",
        "file,udp,rtp",
        "-i",
        sdp,
        "-c:v",
        "copy",
        "-an",
        "-f",
        "hls",
        "-hls_time",
        hls_time.as_str(),
        "-hls_list_size",
        hls_list_size.as_str(),
        "-hls_flags",
        "delete_segments",
        "-y",
        manifest,
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
