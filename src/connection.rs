//! Connection lifecycle: one background task per device stream.
//!
//! [`PmuConnection::start`] spawns a driver task that owns the transport's
//! receiving half and runs the read → reassemble → decode pipeline in
//! strict frame-completion order. Results flow out through an unbounded
//! event channel, so a slow observer never stalls the stream. The sending
//! half lives behind an async mutex and is shared with
//! [`send_command`](PmuConnection::send_command), independent of inbound
//! parsing.
//!
//! State transitions are strictly sequential:
//! `Idle → Connecting → [Listening →] Connected → Disconnecting → Idle`,
//! with `Error` on transport fault and `Error → Connecting` under a
//! bounded reconnect policy. Framing and decode failures are counted and
//! reported as one [`PmuEvent::Fault`] each; they never change state.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, FrameCodec};
use crate::config::{ConnectionConfig, ProtocolVariant, TransportKind};
use crate::error::{DecodeError, PmuError, ProtocolError, Result, TransportError};
use crate::framing::FrameReassembler;
use crate::transport::{self, ByteSink, TransportPair};
use crate::types::{
    CommandCode, CommandFrame, ConfigurationFrame, ConnectionState, FrameType, RawFrameImage,
};

/// Data frames that cannot be decoded yet, because no configuration is
/// held or the held one covers a different device, are kept and replayed
/// once a usable configuration arrives; beyond this depth the oldest is
/// dropped.
const PENDING_DATA_DEPTH: usize = 16;

const READ_CHUNK: usize = 8192;

/// Everything a connection reports to its observer.
#[derive(Debug)]
pub enum PmuEvent {
    /// The state machine moved.
    StatusChanged(ConnectionState),
    /// A configuration frame was decoded and installed.
    ConfigurationReceived(Arc<ConfigurationFrame>),
    /// A data frame was decoded against the current configuration.
    DataReceived(crate::types::DataFrame),
    /// The device echoed or issued a command frame.
    CommandReceived(CommandFrame),
    /// The device sent its human-readable header record.
    HeaderReceived(String),
    /// One counted failure. Recoverable faults leave the state alone.
    Fault(PmuError),
}

/// Point-in-time counter snapshot for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_received: u64,
    pub frames_received: u64,
    pub data_frames: u64,
    pub commands_sent: u64,
    pub checksum_failures: u64,
    pub framing_errors: u64,
    pub decode_errors: u64,
    pub transport_errors: u64,
    pub reconnect_attempts: u64,
    /// Pre-configuration data frames dropped when the holding queue
    /// overflowed.
    pub frames_dropped: u64,
}

#[derive(Default)]
struct StatCounters {
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    data_frames: AtomicU64,
    commands_sent: AtomicU64,
    checksum_failures: AtomicU64,
    framing_errors: AtomicU64,
    decode_errors: AtomicU64,
    transport_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    frames_dropped: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            data_frames: self.data_frames.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A running connection to one PMU device.
///
/// Dropping the handle cancels the background task; [`stop`](Self::stop)
/// does the same but waits for the orderly `Disconnecting → Idle` walk.
pub struct PmuConnection {
    config: Arc<ConnectionConfig>,
    codec: Arc<dyn FrameCodec>,
    state: watch::Receiver<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedReceiver<PmuEvent>,
    sink: Arc<tokio::sync::Mutex<Option<Box<dyn ByteSink>>>>,
    current_config: Arc<RwLock<Option<Arc<ConfigurationFrame>>>>,
    counters: Arc<StatCounters>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PmuConnection {
    /// Start a connection with no cached configuration. On Connected the
    /// driver requests the device's configuration automatically.
    pub async fn start(config: ConnectionConfig) -> Result<Self> {
        Self::start_inner(config, None).await
    }

    /// Start a connection seeded with a cached configuration (see
    /// [`snapshot`](crate::snapshot)). Data frames decode immediately and
    /// no configuration request is sent; a live configuration frame still
    /// replaces the seed when the device offers one.
    pub async fn start_with_snapshot(
        config: ConnectionConfig,
        snapshot: ConfigurationFrame,
    ) -> Result<Self> {
        Self::start_inner(config, Some(Arc::new(snapshot))).await
    }

    async fn start_inner(
        config: ConnectionConfig,
        snapshot: Option<Arc<ConfigurationFrame>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let codec = codec::for_variant(config.protocol);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(tokio::sync::Mutex::new(None));
        let seeded = snapshot.is_some();
        let current_config = Arc::new(RwLock::new(snapshot));
        let counters = Arc::new(StatCounters::default());
        let cancel = CancellationToken::new();

        let driver = Driver {
            config: Arc::clone(&config),
            codec: Arc::clone(&codec),
            state: state_tx.clone(),
            events: event_tx,
            sink: Arc::clone(&sink),
            current_config: Arc::clone(&current_config),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            seeded,
        };

        driver.set_state(ConnectionState::Connecting);

        // Without a reconnect policy a transport failure belongs to the
        // caller, synchronously. Listening kinds establish in the task so
        // start() returns while the socket waits for the device.
        let initial = if config.reconnect.enabled() || is_listener(&config.transport) {
            None
        } else {
            match transport::establish(&config).await {
                Ok(pair) => Some(pair),
                Err(e) => {
                    driver.set_state(ConnectionState::Error);
                    return Err(e.into());
                }
            }
        };

        let task = tokio::spawn(driver.run(initial));

        Ok(Self {
            config,
            codec,
            state: state_rx,
            state_tx,
            events: event_rx,
            sink,
            current_config,
            counters,
            cancel,
            task: Some(task),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// The configuration currently used to decode data frames, if any.
    pub fn configuration(&self) -> Option<Arc<ConfigurationFrame>> {
        self.current_config.read().ok().and_then(|guard| guard.clone())
    }

    /// Receive the next event; `None` once the connection has fully shut
    /// down and the channel drained.
    pub async fn next_event(&mut self) -> Option<PmuEvent> {
        self.events.recv().await
    }

    /// Consume the handle into an event `Stream`. The background task
    /// stays alive for as long as the stream does.
    pub fn into_event_stream(mut self) -> EventStream {
        let (_, dummy) = mpsc::unbounded_channel();
        let events = std::mem::replace(&mut self.events, dummy);
        EventStream { inner: UnboundedReceiverStream::new(events), _connection: self }
    }

    /// Encode and send a command frame to the device.
    ///
    /// Outside `Connected` this fails with `NotConnected` and never
    /// touches the transport.
    pub async fn send_command(&self, code: CommandCode, payload: Vec<u8>) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ProtocolError::NotConnected { state: state.name() }.into());
        }
        if !command_supported(self.config.protocol, code) {
            return Err(ProtocolError::UnsupportedCommand {
                code: code.code(),
                variant: self.config.protocol.name(),
            }
            .into());
        }

        let frame = if payload.is_empty() {
            CommandFrame::new(self.config.device_id, code)
        } else {
            CommandFrame::with_payload(self.config.device_id, code, payload)
        };
        let encoded = self.codec.encode_command(&frame)?;

        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or(PmuError::Protocol(ProtocolError::NotConnected { state: "Disconnecting" }))?;
        sink.send_all(&encoded).await?;
        self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
        debug!(code = ?code, len = encoded.len(), "command sent");
        Ok(())
    }

    /// Acknowledge a failed connection: the `Error → Idle` transition.
    ///
    /// Only legal from `Error`; the driver task (already parked or gone
    /// by then) is reaped along the way.
    pub async fn reset(&mut self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Error {
            return Err(ProtocolError::NotConnected { state: state.name() }.into());
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        *self.sink.lock().await = None;
        self.state_tx.send_replace(ConnectionState::Idle);
        debug!("connection reset to Idle");
        Ok(())
    }

    /// Stop the connection and wait for the orderly shutdown walk. Frames
    /// caught mid-reassembly are discarded, never emitted.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PmuConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Event stream wrapper that keeps the connection (and thus its driver
/// task) alive while being consumed.
pub struct EventStream {
    inner: UnboundedReceiverStream<PmuEvent>,
    _connection: PmuConnection,
}

impl Stream for EventStream {
    type Item = PmuEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

fn is_listener(kind: &TransportKind) -> bool {
    matches!(kind, TransportKind::TcpServer { .. })
}

/// Whether a command is meaningful under the given protocol variant.
/// CFG-3 exists only in the 2011 revision of C37.118.
fn command_supported(variant: ProtocolVariant, code: CommandCode) -> bool {
    code != CommandCode::SendConfig3 || variant == ProtocolVariant::IeeeC37118V2
}

struct Driver {
    config: Arc<ConnectionConfig>,
    codec: Arc<dyn FrameCodec>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<PmuEvent>,
    sink: Arc<tokio::sync::Mutex<Option<Box<dyn ByteSink>>>>,
    current_config: Arc<RwLock<Option<Arc<ConfigurationFrame>>>>,
    counters: Arc<StatCounters>,
    cancel: CancellationToken,
    /// A snapshot was installed at start; skip the configuration request.
    seeded: bool,
}

/// Why the read loop ended.
enum SessionEnd {
    Cancelled,
    Transport(TransportError),
}

impl Driver {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = previous.name(), to = next.name(), "connection state changed");
            let _ = self.events.send(PmuEvent::StatusChanged(next));
        }
    }

    fn emit(&self, event: PmuEvent) {
        let _ = self.events.send(event);
    }

    fn fault(&self, error: PmuError) {
        match &error {
            PmuError::Framing(_) => &self.counters.framing_errors,
            PmuError::Decode(DecodeError::ChecksumMismatch { .. }) => {
                &self.counters.checksum_failures
            }
            PmuError::Decode(_) => &self.counters.decode_errors,
            PmuError::Transport(_) => &self.counters.transport_errors,
            _ => &self.counters.decode_errors,
        }
        .fetch_add(1, Ordering::Relaxed);
        warn!(%error, "connection fault");
        self.emit(PmuEvent::Fault(error));
    }

    async fn run(self, mut ready: Option<TransportPair>) {
        info!(
            endpoint = %self.config.transport.endpoint(),
            protocol = %self.config.protocol,
            device_id = self.config.device_id,
            "connection driver started"
        );
        let mut retries_left = self.config.reconnect.max_retries;

        loop {
            let pair = match ready.take() {
                Some(pair) => pair,
                None => {
                    if is_listener(&self.config.transport) {
                        self.set_state(ConnectionState::Listening);
                    }
                    let established = tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.finish_idle().await;
                            return;
                        }
                        result = transport::establish(&self.config) => result,
                    };
                    match established {
                        Ok(pair) => pair,
                        Err(e) => {
                            self.fault(e.into());
                            self.set_state(ConnectionState::Error);
                            if !self.backoff_or_give_up(&mut retries_left).await {
                                return;
                            }
                            self.set_state(ConnectionState::Connecting);
                            continue;
                        }
                    }
                }
            };

            let TransportPair { source, sink } = pair;
            *self.sink.lock().await = Some(sink);
            self.set_state(ConnectionState::Connected);
            retries_left = self.config.reconnect.max_retries;

            if !self.seeded && self.current_config.read().is_ok_and(|g| g.is_none()) {
                self.request_configuration().await;
            }

            match self.read_session(source).await {
                SessionEnd::Cancelled => {
                    self.finish_idle().await;
                    return;
                }
                SessionEnd::Transport(e) => {
                    *self.sink.lock().await = None;
                    self.fault(e.into());
                    self.set_state(ConnectionState::Error);
                    if !self.backoff_or_give_up(&mut retries_left).await {
                        return;
                    }
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }

    /// Sleep out the reconnect backoff. Returns false when the policy is
    /// exhausted (or disabled, or stop was requested): the task ends and
    /// the connection stays in `Error`.
    async fn backoff_or_give_up(&self, retries_left: &mut u32) -> bool {
        if !self.config.reconnect.enabled() || *retries_left == 0 {
            if self.config.reconnect.enabled() {
                warn!("reconnect attempts exhausted");
            }
            return false;
        }
        *retries_left -= 1;
        self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        debug!(remaining = *retries_left, backoff_ms = self.config.reconnect.backoff_ms, "reconnecting");
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.finish_idle().await;
                false
            }
            _ = tokio::time::sleep(self.config.reconnect.backoff()) => true,
        }
    }

    /// Orderly shutdown walk; also releases the shared sink.
    async fn finish_idle(&self) {
        self.set_state(ConnectionState::Disconnecting);
        *self.sink.lock().await = None;
        self.set_state(ConnectionState::Idle);
        info!("connection driver ended");
    }

    /// Ask the device for its configuration frame.
    async fn request_configuration(&self) {
        let frame = CommandFrame::new(self.config.device_id, CommandCode::SendConfig2);
        let encoded = match self.codec.encode_command(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "configuration request failed");
                return;
            }
        };
        let mut guard = self.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            match sink.send_all(&encoded).await {
                Ok(()) => {
                    self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
                    debug!("configuration requested");
                }
                Err(e) => warn!(error = %e, "configuration request failed"),
            }
        }
    }

    /// Read loop for one established transport. Returns why it stopped;
    /// recoverable faults are handled inside and never end the session.
    async fn read_session(&self, mut source: Box<dyn crate::transport::ByteSource>) -> SessionEnd {
        let mut reassembler =
            FrameReassembler::new(Arc::clone(&self.codec), self.config.max_frame_size);
        let mut pending: VecDeque<RawFrameImage> = VecDeque::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                result = Self::recv(&mut source, &mut buf, self.config.idle_timeout()) => result,
            };

            let n = match read {
                Ok(n) => n,
                Err(e) => return SessionEnd::Transport(e),
            };
            self.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            reassembler.push(&buf[..n]);

            loop {
                match reassembler.next_frame() {
                    Ok(Some(image)) => {
                        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                        self.dispatch(image, &mut pending);
                    }
                    Ok(None) => break,
                    Err(e) => self.fault(e.into()),
                }
            }
        }
    }

    async fn recv(
        source: &mut Box<dyn crate::transport::ByteSource>,
        buf: &mut [u8],
        idle: Option<std::time::Duration>,
    ) -> Result<usize, TransportError> {
        match idle {
            None => source.recv_chunk(buf).await,
            Some(limit) => match tokio::time::timeout(limit, source.recv_chunk(buf)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::timed_out(limit)),
            },
        }
    }

    /// Route one complete frame image. Decode failures are counted faults;
    /// data frames without a usable configuration are queued for replay.
    fn dispatch(&self, image: RawFrameImage, pending: &mut VecDeque<RawFrameImage>) {
        match image.frame_type {
            FrameType::Configuration => match self.codec.decode_configuration(&image) {
                Ok(config) => {
                    let config = Arc::new(config);
                    info!(
                        device_id = config.device_id,
                        station = %config.station_name,
                        revision = config.revision,
                        "configuration installed"
                    );
                    if let Ok(mut guard) = self.current_config.write() {
                        *guard = Some(Arc::clone(&config));
                    }
                    self.emit(PmuEvent::ConfigurationReceived(Arc::clone(&config)));
                    let held: Vec<RawFrameImage> = pending.drain(..).collect();
                    for image in held {
                        self.decode_data(image, &config, pending);
                    }
                }
                Err(e) => self.fault(e.into()),
            },
            FrameType::Data => match self.configuration() {
                Some(config) => self.decode_data(image, &config, pending),
                None => {
                    trace!("data frame ahead of configuration, holding");
                    self.hold(image, pending);
                }
            },
            FrameType::Command => match self.codec.decode_command(&image) {
                Ok(frame) => self.emit(PmuEvent::CommandReceived(frame)),
                Err(e) => self.fault(e.into()),
            },
            FrameType::Header => match self.codec.decode_header_record(&image) {
                Ok(text) => self.emit(PmuEvent::HeaderReceived(text)),
                Err(e) => self.fault(e.into()),
            },
        }
    }

    fn decode_data(
        &self,
        image: RawFrameImage,
        config: &Arc<ConfigurationFrame>,
        pending: &mut VecDeque<RawFrameImage>,
    ) {
        match self.codec.decode_data(&image, config) {
            Ok(frame) => {
                self.counters.data_frames.fetch_add(1, Ordering::Relaxed);
                trace!(soc = frame.soc, fracsec = frame.fracsec, "data frame decoded");
                self.emit(PmuEvent::DataReceived(frame));
            }
            // The frame belongs to a device the held configuration does not
            // cover: keep the raw image so it replays when that device's
            // configuration lands.
            Err(e @ DecodeError::MissingConfiguration { .. }) => {
                self.hold(image, pending);
                self.fault(e.into());
            }
            Err(e) => self.fault(e.into()),
        }
    }

    fn hold(&self, image: RawFrameImage, pending: &mut VecDeque<RawFrameImage>) {
        if pending.len() == PENDING_DATA_DEPTH {
            pending.pop_front();
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        pending.push_back(image);
    }

    fn configuration(&self) -> Option<Arc<ConfigurationFrame>> {
        self.current_config.read().ok().and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cfg3_request_needs_the_2011_variant() {
        assert!(command_supported(ProtocolVariant::IeeeC37118V2, CommandCode::SendConfig3));
        assert!(!command_supported(ProtocolVariant::IeeeC37118V1, CommandCode::SendConfig3));
        assert!(!command_supported(ProtocolVariant::Ieee1344, CommandCode::SendConfig3));
        assert!(command_supported(ProtocolVariant::BpaPdcStream, CommandCode::TurnOnTransmission));
    }

    #[test]
    fn counters_snapshot_is_consistent() {
        let counters = StatCounters::default();
        counters.frames_received.fetch_add(3, Ordering::Relaxed);
        counters.checksum_failures.fetch_add(1, Ordering::Relaxed);

        let stats = counters.snapshot();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.data_frames, 0);
    }

    #[test]
    fn listener_classification() {
        assert!(is_listener(&TransportKind::TcpServer {
            interface: "0.0.0.0".into(),
            port: 4712,
            policy: Default::default(),
        }));
        assert!(!is_listener(&TransportKind::TcpClient { host: "10.0.0.5".into(), port: 4712 }));
    }
}
