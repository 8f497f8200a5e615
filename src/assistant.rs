use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::audio::CapturePipeline;
use crate::audio::buffer::OutboundFrame;
use crate::audio::capture::Microphone;
use crate::audio::codec::{
    Blob, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE, decode_pcm, encode_pcm, rms,
};
use crate::audio::scheduler::{AudioSink, PlaybackScheduler};
use crate::config::Config;
use crate::error::{ChimeError, Result};
use crate::net::protocol::{ClientMessage, ServerContent, ServerMessage, ToolCall};
use crate::net::session::{ConnectionState, Connector, Envelope, SessionChannel, SessionEvent};
use crate::tools::{DirectionSignal, ToolAction, ToolCallHandler};
use crate::transcript::{Transcript, TranscriptEntry};

const FRAME_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 16;
const REAP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Reset,
    Shutdown,
}

/// Everything a presentation layer needs to draw the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantState {
    pub status: String,
    pub error: Option<String>,
    pub is_recording: bool,
    pub connection: ConnectionState,
    pub direction: DirectionSignal,
    pub history: Vec<TranscriptEntry>,
    pub partial_user: String,
    pub partial_model: String,
    /// RMS of the last forwarded microphone frame, 0.0 to 1.0.
    pub input_level: f32,
    /// RMS of the last scheduled output chunk, 0.0 once playback drains.
    pub output_level: f32,
}

impl Default for AssistantState {
    fn default() -> Self {
        Self {
            status: "Idle".to_string(),
            error: None,
            is_recording: false,
            connection: ConnectionState::Closed,
            direction: DirectionSignal::None,
            history: Vec::new(),
            partial_user: String::new(),
            partial_model: String::new(),
            input_level: 0.0,
            output_level: 0.0,
        }
    }
}

/// Cloneable control surface for a running [`Assistant`].
#[derive(Clone)]
pub struct AssistantHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<AssistantState>,
}

impl AssistantHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChimeError::Other("assistant is not running".to_string()))
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.send(Command::Reset).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AssistantState> {
        self.state.clone()
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn state(&self) -> AssistantState {
        self.state.borrow().clone()
    }
}

pub struct Assistant {
    capture: CapturePipeline,
    frames: mpsc::Receiver<OutboundFrame>,
    scheduler: PlaybackScheduler,
    session: SessionChannel,
    events: mpsc::Receiver<Envelope>,
    transcript: Transcript,
    tools: ToolCallHandler,
    timer_tx: mpsc::UnboundedSender<String>,
    timer_rx: mpsc::UnboundedReceiver<String>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<AssistantState>,

    status: String,
    error: Option<String>,
    connection: ConnectionState,
    input_level: f32,
    output_level: f32,
}

impl Assistant {
    #[must_use]
    pub fn new(
        config: Config,
        microphone: Box<dyn Microphone>,
        sink: Box<dyn AudioSink>,
        connector: Arc<dyn Connector>,
    ) -> (Self, AssistantHandle) {
        let config = Arc::new(config);

        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AssistantState::default());

        let display = Duration::from_millis(config.tools.direction_display_ms);

        let assistant = Self {
            capture: CapturePipeline::new(microphone, config.audio.frame_samples, frame_tx),
            frames,
            scheduler: PlaybackScheduler::new(sink),
            session: SessionChannel::new(connector, Arc::clone(&config), event_tx),
            events,
            transcript: Transcript::new(),
            tools: ToolCallHandler::new(display),
            timer_tx,
            timer_rx,
            commands,
            state_tx,
            status: "Idle".to_string(),
            error: None,
            connection: ConnectionState::Closed,
            input_level: 0.0,
            output_level: 0.0,
        };

        let handle = AssistantHandle {
            commands: command_tx,
            state: state_rx,
        };

        (assistant, handle)
    }

    /// Drive everything until shutdown is requested or every handle is gone.
    ///
    /// The future is not `Send` when the sink wraps a device stream, so run it
    /// on the current task (or a `LocalSet`) rather than spawning it.
    pub async fn run(mut self) {
        self.connect();

        let mut reap = tokio::time::interval(REAP_INTERVAL);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if !self.handle_command(command.unwrap_or(Command::Shutdown)) {
                        break;
                    }
                }
                Some(envelope) = self.events.recv() => self.handle_envelope(envelope),
                Some(frame) = self.frames.recv() => self.forward_frame(&frame),
                Some(id) = self.timer_rx.recv() => self.expire_tool_call(&id),
                _ = reap.tick() => self.reap_playback(),
            }
        }

        self.shutdown();
    }

    fn publish(&self) {
        self.state_tx.send_replace(AssistantState {
            status: self.status.clone(),
            error: self.error.clone(),
            is_recording: self.capture.is_capturing(),
            connection: self.connection,
            direction: self.tools.signal(),
            history: self.transcript.history().to_vec(),
            partial_user: self.transcript.partial_user().to_string(),
            partial_model: self.transcript.partial_model().to_string(),
            input_level: self.input_level,
            output_level: self.output_level,
        });
    }

    fn connect(&mut self) {
        self.session.connect();
        self.connection = ConnectionState::Connecting;
        self.status = "Connecting".to_string();
        self.publish();
    }

    /// Returns `false` once the loop should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => match self.capture.start() {
                Ok(true) => {
                    self.status = "Listening".to_string();
                    self.error = None;
                }
                Ok(false) => {}
                Err(e) => self.report(&e),
            },
            Command::Stop => {
                if self.capture.stop() {
                    self.status = "Stopped".to_string();
                    self.input_level = 0.0;
                }
            }
            Command::Reset => {
                tracing::info!("resetting session");
                self.session.close();
                self.transcript.reset();
                self.error = None;
                self.connect();
            }
            Command::Shutdown => return false,
        }
        self.publish();
        true
    }

    /// Surface a failure. User-facing errors stop capture until the user
    /// starts it again; everything else is only logged.
    fn report(&mut self, e: &ChimeError) {
        if !e.is_user_facing() {
            tracing::warn!("{e}");
            return;
        }

        tracing::error!("{e}");
        self.status = match e {
            ChimeError::Permission(_) => "Microphone access denied",
            ChimeError::Device(_) => "Microphone unavailable",
            ChimeError::Connection(_) => "Disconnected",
            _ => "Configuration error",
        }
        .to_string();
        self.error = Some(e.to_string());

        if self.capture.stop() {
            self.input_level = 0.0;
        }
    }

    fn forward_frame(&mut self, frame: &OutboundFrame) {
        if !self.capture.accepts(frame) {
            tracing::debug!("dropping stale frame from epoch {}", frame.epoch);
            return;
        }

        self.input_level = rms(&frame.samples).min(1.0);
        self.session
            .send(ClientMessage::audio(encode_pcm(&frame.samples, CAPTURE_SAMPLE_RATE)));
        self.publish();
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        let generation = envelope.generation;
        if !self.session.is_current(generation) {
            tracing::debug!("dropping event from superseded session {generation}");
            return;
        }

        match envelope.event {
            SessionEvent::Opened => {
                self.connection = ConnectionState::Open;
                self.status = if self.capture.is_capturing() {
                    "Listening".to_string()
                } else {
                    "Connected".to_string()
                };
            }
            SessionEvent::Message(message) => self.handle_message(&message, generation),
            SessionEvent::Closed { reason } => {
                self.connection = ConnectionState::Closed;
                self.report(&ChimeError::Connection(reason));
            }
            SessionEvent::Failed(e) => {
                self.connection = ConnectionState::Failed;
                self.report(&e);
            }
        }
        self.publish();
    }

    fn handle_message(&mut self, message: &ServerMessage, generation: u64) {
        let content = message.server_content.as_ref();

        if content.is_some_and(|c| c.interrupted) {
            self.scheduler.interrupt();
            self.output_level = 0.0;
        }

        for blob in message.audio_parts() {
            self.play(blob);
        }

        if let Some(content) = content {
            self.handle_transcription(content);
        }

        if let Some(tool_call) = &message.tool_call {
            self.handle_tool_call(tool_call, generation);
        }

        if let Some(cancellation) = &message.tool_call_cancellation {
            tracing::info!(
                "server cancelled tool calls {:?}; cues run to completion",
                cancellation.ids
            );
        }

        if let Some(go_away) = &message.go_away {
            let left = go_away.time_left.as_deref().unwrap_or("unknown");
            tracing::warn!("server will close the session, time left: {left}");
            self.status = format!("Session ending soon ({left} left)");
        }
    }

    fn play(&mut self, blob: &Blob) {
        let buffer = match decode_pcm(blob, PLAYBACK_SAMPLE_RATE, 1) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("dropping audio chunk: {e}");
                return;
            }
        };
        let level = rms(&buffer.samples).min(1.0);
        match self.scheduler.enqueue(buffer) {
            Ok(_) => self.output_level = level,
            Err(e) => tracing::warn!("could not schedule audio chunk: {e}"),
        }
    }

    fn handle_transcription(&mut self, content: &ServerContent) {
        if let Some(t) = &content.input_transcription {
            self.transcript.append_user(&t.text);
        }
        if let Some(t) = &content.output_transcription {
            self.transcript.append_model(&t.text);
        }

        if content.turn_complete {
            for entry in self.transcript.complete_turn() {
                tracing::info!("{}: {}", entry.speaker.label(), entry.text);
            }
        }
    }

    fn handle_tool_call(&mut self, tool_call: &ToolCall, generation: u64) {
        for call in &tool_call.function_calls {
            match self.tools.handle(call, generation) {
                ToolAction::Respond(response) => {
                    self.session.send(ClientMessage::tool_response(response));
                }
                ToolAction::Schedule { id, after } => {
                    // Make the cue visible before anything else can happen.
                    self.publish();
                    let timer_tx = self.timer_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = timer_tx.send(id);
                    });
                }
                ToolAction::Ignore => {}
            }
        }
    }

    fn expire_tool_call(&mut self, id: &str) {
        let Some(expired) = self.tools.expire(id) else {
            return;
        };

        // The cleared signal is observable before the response leaves.
        self.publish();

        if self.session.is_current(expired.generation) {
            self.session
                .send(ClientMessage::tool_response(expired.response));
        } else {
            tracing::info!(
                "not answering call {id}: its session {} was replaced",
                expired.generation
            );
        }
    }

    fn reap_playback(&mut self) {
        let finished = self.scheduler.reap();
        if finished > 0 && !self.scheduler.is_playing() && self.output_level > 0.0 {
            self.output_level = 0.0;
            self.publish();
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("shutting down");
        self.capture.stop();
        self.scheduler.interrupt();
        self.session.close();
        self.connection = ConnectionState::Closed;
        self.status = "Shut down".to_string();
        self.input_level = 0.0;
        self.output_level = 0.0;
        self.publish();
    }
}
