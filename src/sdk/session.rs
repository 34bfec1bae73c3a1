use crate::media::device::{DEFAULT_CAPTURE_RATE, DEFAULT_FRAME_SAMPLES};
use crate::media::{
    AudioCaptureEncoder, AudioFrame, AudioOutput, AudioTrack, DeviceArbiter, DeviceLease,
    DeviceOwner, MediaDevices, NullOutput, PlaybackScheduler, VideoFrame, VideoFrameSampler,
    VideoInput,
};
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{ClientContent, OUTPUT_SAMPLE_RATE, SetupConfig};
use crate::protocol::server_events::ServerEvent;
use crate::{Error, Result};

use super::events::{EventStream, SessionEvent, SessionState};
use super::tools::{ToolCall, ToolRegistry, ToolResult};
use super::transport::Transport;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a session needs besides the transport and the devices.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Sent as the first message. Tool declarations are filled in from `tools`.
    pub setup: SetupConfig,
    pub tools: ToolRegistry,
    /// Open the camera at start. A missing camera only disables video.
    pub camera: bool,
    pub video: VideoFrameSampler,
    /// Native rate of the service's synthesized audio.
    pub output_sample_rate: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            setup: SetupConfig::default(),
            tools: ToolRegistry::new(),
            camera: false,
            video: VideoFrameSampler::default(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    sender: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

/// One open connection to the streaming service plus its audio and video pipelines.
///
/// The session's event loop owns the transport, the devices and the device
/// lease; all of them are released when the session closes.
pub struct Session {
    handle: SessionHandle,
    sample_rate: u32,
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl Session {
    /// Open a session over an established transport.
    ///
    /// A microphone that cannot be opened is replaced by a silent source and
    /// reported as [`SessionEvent::MicrophoneUnavailable`].
    ///
    /// # Errors
    /// Returns [`Error::DeviceBusy`] if a call holds the capture device, or
    /// [`Error::Connection`] if the setup message cannot be sent. Nothing stays
    /// acquired on failure.
    pub async fn open(
        mut transport: Box<dyn Transport>,
        options: SessionOptions,
        devices: &dyn MediaDevices,
        arbiter: &DeviceArbiter,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        emit(&event_tx, SessionEvent::StateChanged(SessionState::Connecting));

        let lease = arbiter.acquire(DeviceOwner::StreamingSession)?;

        let mut mic = match devices.open_microphone().await {
            Ok(track) => track,
            Err(err) => {
                tracing::warn!(session = %id, "Microphone unavailable, continuing with silence: {err}");
                emit(&event_tx, SessionEvent::MicrophoneUnavailable { reason: err.to_string() });
                AudioTrack::silent(DEFAULT_CAPTURE_RATE, DEFAULT_FRAME_SAMPLES)
            }
        };
        let sample_rate = mic.sample_rate();

        let output = devices.open_speaker(options.output_sample_rate).unwrap_or_else(|err| {
            tracing::warn!(session = %id, "Speaker unavailable, discarding inbound audio: {err}");
            Box::new(NullOutput::new()) as Box<dyn AudioOutput>
        });

        let mut camera = if options.camera {
            devices
                .open_camera()
                .inspect_err(|err| tracing::info!(session = %id, "Camera unavailable: {err}"))
                .ok()
        } else {
            None
        };

        let mut setup = options.setup;
        setup.tools = match options.tools.declarations() {
            Ok(decls) => decls,
            Err(err) => {
                release_on_failure(&mut mic, &mut camera);
                return Err(err);
            }
        };
        tracing::info!(session = %id, model = %setup.model, sample_rate, "Opening streaming session");
        if let Err(err) = transport.send(ClientEvent::Setup(Box::new(setup))).await {
            let _ = transport.close().await;
            release_on_failure(&mut mic, &mut camera);
            state_tx.send_replace(SessionState::Errored);
            return Err(Error::Connection(err.to_string()));
        }

        let frames = mic.take_frames();
        let video_timer = camera.as_ref().map(|_| {
            let mut timer = tokio::time::interval(options.video.interval());
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let event_loop = SessionLoop {
            id,
            transport,
            tools: options.tools,
            tools_in_flight: JoinSet::new(),
            encoder: AudioCaptureEncoder::new(sample_rate),
            scheduler: PlaybackScheduler::new(options.output_sample_rate),
            sampler: options.video,
            encoding: JoinSet::new(),
            mic,
            frames,
            camera,
            camera_enabled: true,
            video_timer,
            output,
            lease: Some(lease),
            transmitting: true,
            state_tx,
            event_tx,
        };
        event_loop.set_state(SessionState::Open);
        tokio::spawn(event_loop.run(cmd_rx));

        Ok(Self {
            handle: SessionHandle { id, sender: cmd_tx, state: state_rx },
            sample_rate,
            event_rx,
        })
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.handle.id
    }

    /// Capture rate fixed at open.
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.handle.state.clone()
    }

    /// Await the next session event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Stream session events.
    #[must_use]
    pub fn events(&mut self) -> EventStream<'_> {
        EventStream::new(&mut self.event_rx)
    }

    /// Gate transmission of captured audio. Capture itself keeps running.
    ///
    /// # Errors
    /// Returns [`Error::ConnectionClosed`] if the session has closed.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<()> {
        self.handle.set_mic_enabled(enabled).await
    }

    /// Gate video sampling.
    ///
    /// # Errors
    /// Returns [`Error::ConnectionClosed`] if the session has closed.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<()> {
        self.handle.set_camera_enabled(enabled).await
    }

    /// Send a complete user text turn.
    ///
    /// # Errors
    /// Returns an error if the session has closed or the send fails.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.handle.send_text(text).await
    }

    /// Close the session and release its devices. Closing twice is a no-op.
    ///
    /// # Errors
    /// Currently never fails.
    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

impl SessionHandle {
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// # Errors
    /// Returns [`Error::ConnectionClosed`] if the session has closed.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|respond| Command::SetMic { enabled, respond }).await
    }

    /// # Errors
    /// Returns [`Error::ConnectionClosed`] if the session has closed.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|respond| Command::SetCamera { enabled, respond }).await
    }

    /// # Errors
    /// Returns an error if the session has closed or the send fails.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::SendText { text: text.to_string(), respond: tx })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// # Errors
    /// Currently never fails.
    pub async fn close(&self) -> Result<()> {
        match self.request(|respond| Command::Close { respond }).await {
            Ok(()) | Err(Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(command(tx)).await.map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }
}

enum Command {
    SetMic { enabled: bool, respond: oneshot::Sender<()> },
    SetCamera { enabled: bool, respond: oneshot::Sender<()> },
    SendText { text: String, respond: oneshot::Sender<Result<()>> },
    Close { respond: oneshot::Sender<()> },
}

fn emit(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    // The loop must never wait on a slow consumer.
    if event_tx.try_send(event).is_err() {
        tracing::debug!("Session event dropped, consumer is behind or gone");
    }
}

fn release_on_failure(mic: &mut AudioTrack, camera: &mut Option<Box<dyn VideoInput>>) {
    mic.stop();
    if let Some(mut camera) = camera.take() {
        camera.stop();
    }
}

struct SessionLoop {
    id: Uuid,
    transport: Box<dyn Transport>,
    tools: ToolRegistry,
    tools_in_flight: JoinSet<ToolResult>,
    encoder: AudioCaptureEncoder,
    scheduler: PlaybackScheduler,
    sampler: VideoFrameSampler,
    /// At most one snapshot being encoded off the loop.
    encoding: JoinSet<Result<VideoFrame>>,
    mic: AudioTrack,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    camera: Option<Box<dyn VideoInput>>,
    camera_enabled: bool,
    video_timer: Option<Interval>,
    output: Box<dyn AudioOutput>,
    lease: Option<DeviceLease>,
    transmitting: bool,
    state_tx: watch::Sender<SessionState>,
    event_tx: mpsc::Sender<SessionEvent>,
}

/// Why the loop stopped.
struct Ending {
    state: SessionState,
    reason: Option<String>,
}

impl Ending {
    const fn closed(reason: Option<String>) -> Self {
        Self { state: SessionState::Closed, reason }
    }

    const fn errored(reason: String) -> Self {
        Self { state: SessionState::Errored, reason: Some(reason) }
    }
}

impl SessionLoop {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut close_ack = None;
        let ending = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::SetMic { enabled, respond }) => {
                        tracing::debug!(session = %self.id, enabled, "Microphone transmission toggled");
                        self.encoder.set_mic_enabled(enabled);
                        let _ = respond.send(());
                    }
                    Some(Command::SetCamera { enabled, respond }) => {
                        tracing::debug!(session = %self.id, enabled, "Camera sampling toggled");
                        self.camera_enabled = enabled;
                        let _ = respond.send(());
                    }
                    Some(Command::SendText { text, respond }) => {
                        let event = ClientEvent::ClientContent(ClientContent { text, turn_complete: true });
                        let _ = respond.send(self.transport.send(event).await);
                    }
                    Some(Command::Close { respond }) => {
                        close_ack = Some(respond);
                        break Ending::closed(None);
                    }
                    None => break Ending::closed(None),
                },
                frame = recv_frame(&mut self.frames) => match frame {
                    Some(frame) => self.on_frame(&frame).await,
                    None => {
                        tracing::warn!(session = %self.id, "Microphone stream ended");
                        self.frames = None;
                    }
                },
                () = tick(&mut self.video_timer) => self.on_video_tick(),
                Some(encoded) = self.encoding.join_next(), if !self.encoding.is_empty() => {
                    self.on_video_encoded(encoded).await;
                }
                message = self.transport.next_event() => match message {
                    Ok(Some(message)) => {
                        if let Some(ending) = self.on_server_message(message.into_events()) {
                            break ending;
                        }
                    }
                    Ok(None) => break Ending::closed(Some("connection closed by server".to_string())),
                    Err(err) => break Ending::errored(err.to_string()),
                },
                Some(joined) = self.tools_in_flight.join_next(), if !self.tools_in_flight.is_empty() => {
                    match joined {
                        Ok(result) => self.on_tool_result(result).await,
                        Err(err) => tracing::warn!(session = %self.id, "Tool task did not complete: {err}"),
                    }
                }
            }
        };
        self.shutdown(ending).await;
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
        // Later close requests find the loop gone and succeed as no-ops.
    }

    async fn on_frame(&mut self, frame: &AudioFrame) {
        let captured = self.encoder.process(frame);
        emit(&self.event_tx, SessionEvent::Volume { level: captured.level });
        if let Some(chunk) = captured.chunk {
            self.send_quietly(ClientEvent::Media(chunk.to_media())).await;
        }
    }

    fn on_video_tick(&mut self) {
        let Some(camera) = self.camera.as_deref_mut() else {
            return;
        };
        if !self.encoding.is_empty() {
            tracing::trace!(session = %self.id, "Previous video frame still encoding, skipping tick");
            return;
        }
        let open = *self.state_tx.borrow() == SessionState::Open;
        let Some(snapshot) = self.sampler.capture(camera, self.camera_enabled, open) else {
            return;
        };
        let sampler = self.sampler.clone();
        self.encoding.spawn_blocking(move || sampler.encode(snapshot));
    }

    async fn on_video_encoded(
        &mut self,
        encoded: std::result::Result<Result<VideoFrame>, JoinError>,
    ) {
        let frame = match encoded {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                tracing::warn!(session = %self.id, "Dropping video frame: {err}");
                return;
            }
            Err(err) => {
                tracing::warn!(session = %self.id, "Video encode did not complete: {err}");
                return;
            }
        };
        // The camera may have been switched off while the frame was encoding.
        if !self.camera_enabled {
            return;
        }
        tracing::trace!(width = frame.width, height = frame.height, bytes = frame.jpeg.len(), "Sending video frame");
        self.send_quietly(ClientEvent::Media(frame.to_media())).await;
    }

    fn on_server_message(&mut self, events: Vec<ServerEvent>) -> Option<Ending> {
        for event in events {
            match event {
                ServerEvent::Ready => {
                    tracing::info!(session = %self.id, "Streaming session ready");
                    emit(&self.event_tx, SessionEvent::Ready);
                }
                ServerEvent::Audio { pcm } => {
                    let now = self.output.now();
                    if let Some(item) = self.scheduler.schedule(&pcm, now) {
                        emit(
                            &self.event_tx,
                            SessionEvent::AudioScheduled {
                                seq: item.seq,
                                start: item.start,
                                duration: item.duration,
                            },
                        );
                        self.output.enqueue(item);
                    }
                }
                ServerEvent::Text(text) => emit(&self.event_tx, SessionEvent::Text(text)),
                ServerEvent::ToolCall(calls) => {
                    for call in calls {
                        let call = ToolCall::from(call);
                        emit(&self.event_tx, SessionEvent::ToolCall(call.clone()));
                        self.tools_in_flight.spawn(self.tools.dispatch(call));
                    }
                }
                ServerEvent::Interrupted => {
                    tracing::debug!(session = %self.id, "Model output interrupted");
                    self.scheduler.reset();
                    self.output.clear();
                    emit(&self.event_tx, SessionEvent::Interrupted);
                }
                ServerEvent::TurnComplete => emit(&self.event_tx, SessionEvent::TurnComplete),
                ServerEvent::Close { reason } => return Some(Ending::closed(reason)),
                ServerEvent::Error(error) => {
                    let reason = error.message.clone();
                    emit(&self.event_tx, SessionEvent::Error(error));
                    return Some(Ending::errored(reason));
                }
            }
        }
        None
    }

    async fn on_tool_result(&mut self, result: ToolResult) {
        emit(&self.event_tx, SessionEvent::ToolResult(result.clone()));
        self.send_quietly(ClientEvent::ToolResponse(result.into())).await;
    }

    /// Outbound sends never fail the loop.
    async fn send_quietly(&mut self, event: ClientEvent) {
        if !self.transmitting {
            return;
        }
        let kind = event.kind();
        if let Err(err) = self.transport.send(event).await {
            tracing::warn!(session = %self.id, kind, "Dropping outbound message: {err}");
        }
    }

    async fn shutdown(mut self, ending: Ending) {
        self.set_state(SessionState::Closing);
        self.transmitting = false;
        if let Err(err) = self.transport.close().await {
            tracing::debug!(session = %self.id, "Transport close failed: {err}");
        }
        self.frames = None;
        self.mic.stop();
        if let Some(mut camera) = self.camera.take() {
            camera.stop();
        }
        self.video_timer = None;
        self.encoding.abort_all();
        self.tools_in_flight.abort_all();
        self.lease = None;

        match ending.state {
            SessionState::Errored => tracing::warn!(
                session = %self.id,
                reason = ending.reason.as_deref().unwrap_or_default(),
                "Streaming session failed"
            ),
            _ => tracing::info!(session = %self.id, "Streaming session closed"),
        }
        self.set_state(ending.state);
        emit(&self.event_tx, SessionEvent::Closed { reason: ending.reason });
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(session = %self.id, from = previous.as_str(), to = state.as_str(), "Session state changed");
            emit(&self.event_tx, SessionEvent::StateChanged(state));
        }
    }
}

async fn recv_frame(frames: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.handle.id)
            .field("state", &self.state())
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}
