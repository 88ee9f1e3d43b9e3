//! Session orchestrator: the engine owning state machine, handshake, and
//! command dispatch.
//!
//! One [`Engine`] value owns the correlation table, the link adapter, the
//! peer store, and the registered callbacks. Two long-lived tasks run under
//! a cancellation token: the notification worker (all frame decoding and
//! delivery happens there, never in the radio callback path) and the
//! correlation sweeper. Callers block on waiter signals with per-call
//! timeouts; timeouts are the only cancellation mechanism.

mod status;

pub use status::CameraState;

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use strum::{Display, FromRepr};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{self, CatalogError, Payload};
use crate::correlation::{CorrelationError, CorrelationTable};
use crate::frame::{self, CmdType, CodecError, ReplyPolicy};
use crate::link::{self, LinkAdapter, LinkError, LinkEvent, Radio, RadioEvent};
use crate::records::{
    ConnectReply, ConnectRequest, GpsPush, KeyReport, ModeSwitch, NewStatusPush, RecordControl,
    StatusPush, StatusSubscribe, VersionReply,
};
use crate::store::PeerStore;
use crate::types::{
    CameraMode, PushMode, RecordAction, STATUS_PUSH_FREQ_2HZ, key_code,
};

/// Command set/id of the connection handshake.
const HANDSHAKE_CMD: (u8, u8) = (0x00, 0x19);
/// Commands fanned out to the status callbacks.
const LEGACY_STATUS_CMD: (u8, u8) = (0x1D, 0x02);
const NEW_STATUS_CMD: (u8, u8) = (0x1D, 0x06);

/// Reserved tail the camera expects on mode-switch commands.
const MODE_SWITCH_RESERVED: [u8; 4] = [0x01, 0x47, 0x39, 0x36];

/// Handshake verify modes.
const VERIFY_MODE_RECONNECT: u8 = 0;
const VERIFY_MODE_PAIR: u8 = 1;
/// The camera answers the handshake with this mode.
const VERIFY_MODE_CAMERA: u8 = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state, advanced by [`Engine::connect`] and the disconnect
/// handler. `NotInit` and `InitComplete` are the only states without a
/// session in some stage of existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, FromRepr)]
#[repr(u8)]
pub enum SessionState {
    #[strum(serialize = "not initialized")]
    NotInit = 0,
    #[strum(serialize = "initialized")]
    InitComplete = 1,
    #[strum(serialize = "scanning")]
    Scanning = 2,
    #[strum(serialize = "BLE connected")]
    BleConnected = 3,
    #[strum(serialize = "protocol connected")]
    ProtocolConnected = 4,
    #[strum(serialize = "disconnecting")]
    Disconnecting = 5,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SessionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    fn load(&self) -> SessionState {
        SessionState::from_repr(self.0.load(Ordering::SeqCst)).unwrap_or(SessionState::NotInit)
    }

    fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation invalid in state \"{0}\"")]
    WrongState(SessionState),
    #[error("camera rejected the handshake")]
    HandshakeRejected,
    #[error("reconnect attempt exhausted")]
    ReconnectExhausted,
    #[error("unexpected reply payload")]
    UnexpectedReply,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Every timeout and identity parameter of the engine. Defaults carry the
/// reference values of the camera protocol.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait for the BLE connection after a scan starts.
    pub ble_connect_timeout: Duration,
    /// Wait for the vendor characteristic handles after connecting.
    pub discovery_timeout: Duration,
    /// First handshake branch: the camera's optional response frame.
    pub handshake_reply_timeout: Duration,
    /// Second handshake branch: the camera's own command frame.
    pub handshake_command_timeout: Duration,
    /// Default per-command reply wait.
    pub command_timeout: Duration,
    /// Polling bound for the single reconnect attempt.
    pub reconnect_timeout: Duration,
    /// Cadence of the correlation staleness sweep.
    pub sweep_interval: Duration,
    /// Correlation entry retention bound.
    pub entry_max_age: Duration,
    /// The controller's own BT MAC, sent in the handshake.
    pub controller_mac: [u8; 6],
    /// Firmware version advertised in the handshake.
    pub fw_version: u32,
    /// Camera slot tag placed in the handshake acknowledgment.
    pub camera_slot: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ble_connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(15),
            handshake_reply_timeout: Duration::from_secs(1),
            handshake_command_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            entry_max_age: Duration::from_secs(120),
            controller_mac: [0; 6],
            fw_version: 0,
            camera_slot: 0,
        }
    }
}

type StatusCallback = Arc<dyn Fn(StatusPush) + Send + Sync>;
type NewStatusCallback = Arc<dyn Fn(NewStatusPush) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// The protocol engine. Created with [`Engine::start`], shared as an
/// `Arc`, shut down with [`Engine::shutdown`].
pub struct Engine {
    link: Arc<LinkAdapter>,
    table: CorrelationTable,
    store: Arc<dyn PeerStore>,
    config: SessionConfig,
    state: StateCell,
    seq: AtomicU16,
    camera: Mutex<CameraState>,
    status_cb: Mutex<Option<StatusCallback>>,
    new_status_cb: Mutex<Option<NewStatusCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    shutdown: CancellationToken,
    // Seeded from OS randomness at construction; hashed with a counter to
    // produce handshake verify codes without a dedicated RNG dependency.
    verify_seed: RandomState,
    verify_step: AtomicU64,
}

impl Engine {
    /// Build the engine and spawn its tasks: the link pump over
    /// `radio_events`, the notification worker, and the sweeper.
    pub fn start(
        radio: Arc<dyn Radio>,
        radio_events: mpsc::Receiver<RadioEvent>,
        store: Arc<dyn PeerStore>,
        config: SessionConfig,
    ) -> Arc<Engine> {
        let shutdown = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::channel(link::NOTIFY_QUEUE_DEPTH);
        let (link_tx, link_rx) = mpsc::channel(8);

        let link = Arc::new(LinkAdapter::new(radio));
        Arc::clone(&link).spawn_pump(radio_events, notify_tx, link_tx, shutdown.child_token());

        let engine = Arc::new(Engine {
            link,
            table: CorrelationTable::new(config.entry_max_age),
            store,
            config,
            state: StateCell::new(SessionState::NotInit),
            seq: AtomicU16::new(0),
            camera: Mutex::new(CameraState::default()),
            status_cb: Mutex::new(None),
            new_status_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            shutdown,
            verify_seed: RandomState::new(),
            verify_step: AtomicU64::new(0),
        });

        Arc::clone(&engine).spawn_worker(notify_rx, link_rx);
        Arc::clone(&engine).spawn_sweeper();
        engine
    }

    /// Stop the worker, sweeper, and link pump.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Snapshot of the camera state mirrored from status pushes.
    pub fn camera_state(&self) -> CameraState {
        *self.camera.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.camera.lock().is_recording()
    }

    /// Register the legacy status push callback. The callback receives an
    /// owned copy per delivery.
    pub fn on_status_push(&self, callback: impl Fn(StatusPush) + Send + Sync + 'static) {
        *self.status_cb.lock() = Some(Arc::new(callback));
    }

    /// Register the new-format status push callback.
    pub fn on_new_status_push(&self, callback: impl Fn(NewStatusPush) + Send + Sync + 'static) {
        *self.new_status_cb.lock() = Some(Arc::new(callback));
    }

    /// Register the error hook (the LED blink path on real hardware).
    pub fn on_error(&self, callback: impl Fn(&SessionError) + Send + Sync + 'static) {
        *self.error_cb.lock() = Some(Arc::new(callback));
    }

    /// Mark the engine ready. The radio collaborator is assumed brought up
    /// by the platform before this point.
    pub fn initialize(&self) -> Result<(), SessionError> {
        if self.state.load() == SessionState::NotInit {
            self.state.store(SessionState::InitComplete);
            info!("engine initialized");
        }
        Ok(())
    }

    /// Scan, connect, subscribe, and run the protocol handshake.
    ///
    /// `prefer_last` targets the stored peer address (first advertisement
    /// match wins); otherwise the strongest vendor advertisement is
    /// chosen. `force_pairing` requests a fresh pairing handshake even for
    /// a known peer.
    pub async fn connect(&self, prefer_last: bool, force_pairing: bool) -> Result<(), SessionError> {
        match self.state.load() {
            SessionState::ProtocolConnected => return Ok(()),
            SessionState::NotInit => return Err(SessionError::WrongState(SessionState::NotInit)),
            SessionState::Scanning => return Err(LinkError::AlreadyConnecting.into()),
            _ => {}
        }

        // Tear down whatever session came before.
        let _ = self.link.disconnect().await;
        self.state.store(SessionState::Scanning);

        let target = if prefer_last { self.store.last_peer() } else { None };
        let known_peer = target.is_some();

        if let Err(err) = self.link.scan_and_connect(target).await {
            self.state.store(SessionState::InitComplete);
            return Err(err.into());
        }

        info!("waiting for BLE connection");
        if !self
            .poll(self.config.ble_connect_timeout, || self.link.is_connected())
            .await
        {
            warn!("BLE connection timed out");
            let _ = self.link.disconnect().await;
            self.state.store(SessionState::InitComplete);
            let err = self
                .link
                .take_last_error()
                .unwrap_or(LinkError::DiscoveryTimeout);
            return Err(err.into());
        }

        info!("waiting for characteristic discovery");
        if !self
            .poll(self.config.discovery_timeout, || {
                self.link.handles_discovered()
            })
            .await
        {
            warn!("characteristic discovery timed out");
            let _ = self.link.disconnect().await;
            self.state.store(SessionState::InitComplete);
            return Err(LinkError::DiscoveryTimeout.into());
        }

        if let Err(err) = self.link.subscribe_notify().await {
            error!(error = %err, "failed to enable notifications");
            let _ = self.link.disconnect().await;
            self.state.store(SessionState::InitComplete);
            return Err(err.into());
        }

        self.state.store(SessionState::BleConnected);
        info!("BLE link established");

        let verify_mode = if force_pairing || !known_peer {
            VERIFY_MODE_PAIR
        } else {
            // The stored address alone selects the reconnect handshake;
            // the paired flag is not consulted here.
            VERIFY_MODE_RECONNECT
        };
        self.handshake(verify_mode).await?;

        // Connection ritual: query the version (result discarded) and
        // subscribe to periodic status pushes at 2 Hz.
        if let Err(err) = self.get_version().await {
            warn!(error = %err, "version query after handshake failed");
        }
        if let Err(err) = self.subscribe_status(PushMode::PeriodicOnChange).await {
            warn!(error = %err, "status subscription failed");
        }

        if let Some(peer) = self.link.peer() {
            self.store.set_last_peer(peer);
            self.store.set_paired(true);
        }
        Ok(())
    }

    /// Close the session. Completes through the `Disconnecting` state once
    /// the link reports the drop.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        info!("disconnecting camera");
        self.teardown().await;
        Ok(())
    }

    /// Query the camera's product id and SDK version.
    pub async fn get_version(&self) -> Result<VersionReply, SessionError> {
        self.require_protocol()?;
        let seq = self.next_seq();
        let reply = self
            .dispatch(0x00, 0x00, CmdType::CmdWaitResult, None, seq, self.config.command_timeout)
            .await?;
        match reply {
            Some(Payload::VersionReply(version)) => {
                info!(
                    product = %version.product_id_str(),
                    sdk = %version.sdk_version_str(),
                    "camera version"
                );
                Ok(version)
            }
            _ => Err(SessionError::UnexpectedReply),
        }
    }

    pub async fn start_record(&self) -> Result<Option<u8>, SessionError> {
        self.record_control(RecordAction::Start).await
    }

    pub async fn stop_record(&self) -> Result<Option<u8>, SessionError> {
        self.record_control(RecordAction::Stop).await
    }

    async fn record_control(&self, action: RecordAction) -> Result<Option<u8>, SessionError> {
        self.require_protocol()?;
        info!(%action, "record control");
        let command = RecordControl {
            device_id: self.store.device_id(),
            record_ctrl: action as u8,
            reserved: [0; 4],
        };
        let seq = self.next_seq();
        let reply = self
            .dispatch(
                0x1D,
                0x03,
                CmdType::CmdResponseOrNot,
                Some(&Payload::RecordControl(command)),
                seq,
                self.config.command_timeout,
            )
            .await?;
        match reply {
            Some(Payload::RecordControlAck(ack)) => Ok(Some(ack.ret_code)),
            Some(_) => Err(SessionError::UnexpectedReply),
            None => Ok(None),
        }
    }

    /// Switch the camera's shooting mode.
    pub async fn switch_mode(&self, mode: CameraMode) -> Result<Option<u8>, SessionError> {
        self.require_protocol()?;
        info!(%mode, "switching camera mode");
        let command = ModeSwitch {
            device_id: self.store.device_id(),
            mode: mode as u8,
            reserved: MODE_SWITCH_RESERVED,
        };
        let seq = self.next_seq();
        let reply = self
            .dispatch(
                0x1D,
                0x04,
                CmdType::CmdResponseOrNot,
                Some(&Payload::ModeSwitch(command)),
                seq,
                self.config.command_timeout,
            )
            .await?;
        match reply {
            Some(Payload::ModeSwitchAck(ack)) => Ok(Some(ack.ret_code)),
            Some(_) => Err(SessionError::UnexpectedReply),
            None => Ok(None),
        }
    }

    /// Push one GPS fix for geotagging. Fire-and-forget.
    pub async fn push_gps(&self, fix: &GpsPush) -> Result<(), SessionError> {
        self.require_protocol()?;
        let seq = self.next_seq();
        self.dispatch(
            0x00,
            0x17,
            CmdType::CmdNoResponse,
            Some(&Payload::GpsPush(*fix)),
            seq,
            self.config.command_timeout,
        )
        .await?;
        Ok(())
    }

    /// Report a short press of the quick-switch key.
    pub async fn key_report_qs(&self) -> Result<Option<u8>, SessionError> {
        self.key_report(key_code::MODE_SWITCH).await
    }

    /// Report a short press of the snapshot key.
    pub async fn key_report_snapshot(&self) -> Result<Option<u8>, SessionError> {
        self.key_report(key_code::SNAPSHOT).await
    }

    async fn key_report(&self, key_code: u8) -> Result<Option<u8>, SessionError> {
        self.require_protocol()?;
        debug!(key_code = format!("{key_code:#04x}"), "reporting key press");
        let command = KeyReport {
            key_code,
            mode: 0x01,      // event reporting
            key_value: 0x00, // short press
        };
        let seq = self.next_seq();
        let reply = self
            .dispatch(
                0x00,
                0x11,
                CmdType::CmdResponseOrNot,
                Some(&Payload::KeyReport(command)),
                seq,
                self.config.command_timeout,
            )
            .await?;
        match reply {
            Some(Payload::KeyReportAck(ack)) => Ok(Some(ack.ret_code)),
            Some(_) => Err(SessionError::UnexpectedReply),
            None => Ok(None),
        }
    }

    /// Subscribe to camera status pushes. The frequency is fixed at 2 Hz.
    pub async fn subscribe_status(&self, mode: PushMode) -> Result<(), SessionError> {
        self.require_protocol()?;
        info!(%mode, "subscribing to camera status");
        let command = StatusSubscribe {
            push_mode: mode as u8,
            push_freq: STATUS_PUSH_FREQ_2HZ,
            reserved: [0; 4],
        };
        let seq = self.next_seq();
        self.dispatch(
            0x1D,
            0x05,
            CmdType::CmdNoResponse,
            Some(&Payload::StatusSubscribe(command)),
            seq,
            self.config.command_timeout,
        )
        .await?;
        Ok(())
    }

    /// Wake a sleeping camera by advertising the wake-up record toward the
    /// stored peer.
    pub async fn wake_camera(&self) -> Result<(), SessionError> {
        let peer = self.store.last_peer().ok_or(LinkError::NoDevice)?;
        self.link.advertise_wakeup(peer).await?;
        Ok(())
    }

    // ---- handshake ------------------------------------------------------

    /// Two-phase handshake on `(0x00, 0x19)`.
    ///
    /// The camera may answer our command with a response frame on our
    /// sequence, or skip straight to sending its own command frame. A
    /// short by-seq wait covers the first shape; the unconditional by-cmd
    /// wait that follows is the source of truth either way.
    async fn handshake(&self, verify_mode: u8) -> Result<(), SessionError> {
        let device_id = self.store.device_id();
        let mut mac = [0u8; 16];
        mac[..6].copy_from_slice(&self.config.controller_mac);
        let request = ConnectRequest {
            device_id,
            mac_len: 6,
            mac,
            fw_version: self.config.fw_version,
            conidx: 0,
            verify_mode,
            verify_data: self.verify_data(),
            reserved: [0; 4],
        };

        info!(verify_mode, "starting protocol handshake");
        let seq = self.next_seq();
        let result = self
            .dispatch(
                HANDSHAKE_CMD.0,
                HANDSHAKE_CMD.1,
                CmdType::CmdWaitResult,
                Some(&Payload::ConnectRequest(request)),
                seq,
                self.config.handshake_reply_timeout,
            )
            .await;
        match result {
            Ok(Some(Payload::ConnectReply(reply))) => {
                if reply.ret_code != 0 {
                    warn!(ret_code = reply.ret_code, "handshake refused by camera");
                    self.teardown().await;
                    return Err(SessionError::HandshakeRejected);
                }
                debug!("handshake response accepted, waiting for camera command");
            }
            Ok(_) => {
                warn!("unexpected handshake reply shape");
                self.teardown().await;
                return Err(SessionError::HandshakeRejected);
            }
            Err(SessionError::Correlation(CorrelationError::Timeout)) => {
                debug!("no handshake response, camera went command-only");
            }
            Err(err) => {
                self.teardown().await;
                return Err(err);
            }
        }

        let (camera_seq, payload) = match self
            .table
            .wait_for_cmd(
                HANDSHAKE_CMD.0,
                HANDSHAKE_CMD.1,
                self.config.handshake_command_timeout,
            )
            .await
        {
            Ok(found) => found,
            Err(err) => {
                error!(error = %err, "camera never sent its connection command");
                self.teardown().await;
                return Err(err.into());
            }
        };

        let Payload::ConnectRequest(camera_request) = payload else {
            warn!("camera connection frame had an unexpected shape");
            self.teardown().await;
            return Err(SessionError::HandshakeRejected);
        };
        if camera_request.verify_mode != VERIFY_MODE_CAMERA {
            error!(
                verify_mode = camera_request.verify_mode,
                "unexpected verify mode from camera"
            );
            self.teardown().await;
            return Err(SessionError::HandshakeRejected);
        }
        if camera_request.verify_data != 0 {
            warn!(
                verify_data = camera_request.verify_data,
                "camera rejected the connection"
            );
            self.teardown().await;
            return Err(SessionError::HandshakeRejected);
        }

        // Acknowledge on the sequence the camera chose; the first reserved
        // byte carries the camera slot tag.
        let mut reserved = [0u8; 4];
        reserved[0] = self.config.camera_slot;
        let reply = ConnectReply {
            device_id,
            ret_code: 0,
            reserved,
        };
        self.dispatch(
            HANDSHAKE_CMD.0,
            HANDSHAKE_CMD.1,
            CmdType::AckNoResponse,
            Some(&Payload::ConnectReply(reply)),
            camera_seq,
            self.config.command_timeout,
        )
        .await?;

        self.state.store(SessionState::ProtocolConnected);
        info!("protocol connection established");
        Ok(())
    }

    // ---- dispatch -------------------------------------------------------

    /// Encode and send one frame, then wait according to its reply policy.
    ///
    /// A by-seq waiter is allocated before the write so the reply can
    /// never race the allocation. No-reply frames free the waiter
    /// immediately; optional-reply frames tolerate a timeout; required
    /// replies surface it. A write failure drops the link.
    async fn dispatch(
        &self,
        cmd_set: u8,
        cmd_id: u8,
        cmd_type: CmdType,
        payload: Option<&Payload>,
        seq: u16,
        timeout: Duration,
    ) -> Result<Option<Payload>, SessionError> {
        let state = self.state.load();
        if state <= SessionState::InitComplete {
            return Err(SessionError::WrongState(state));
        }

        let body = match payload {
            Some(payload) => catalog::encode(cmd_set, cmd_id, cmd_type.raw(), payload)?,
            None => Vec::new(),
        };
        let frame_bytes = frame::encode(cmd_set, cmd_id, cmd_type, seq, &body)?;

        self.table.allocate_by_seq(seq)?;
        debug!(
            cmd_set = format!("{cmd_set:#04x}"),
            cmd_id = format!("{cmd_id:#04x}"),
            seq = format!("{seq:#06x}"),
            len = frame_bytes.len(),
            "sending frame"
        );

        let written = match cmd_type.reply() {
            ReplyPolicy::None => self.link.write_without_response(&frame_bytes).await,
            _ => self.link.write_with_response(&frame_bytes).await,
        };
        if let Err(err) = written {
            self.table.release_seq(seq);
            warn!(error = %err, "write failed, dropping the link");
            self.teardown().await;
            return Err(err.into());
        }

        match cmd_type.reply() {
            ReplyPolicy::None => {
                self.table.release_seq(seq);
                Ok(None)
            }
            ReplyPolicy::Optional => match self.table.wait_for_seq(seq, timeout).await {
                Ok(payload) => Ok(Some(payload)),
                Err(CorrelationError::Timeout) => {
                    debug!(seq = format!("{seq:#06x}"), "no reply, continuing");
                    Ok(None)
                }
                Err(err) => Err(err.into()),
            },
            ReplyPolicy::Required => Ok(Some(self.table.wait_for_seq(seq, timeout).await?)),
        }
    }

    fn require_protocol(&self) -> Result<(), SessionError> {
        let state = self.state.load();
        if state != SessionState::ProtocolConnected {
            return Err(SessionError::WrongState(state));
        }
        Ok(())
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Random handshake verify code in `[0, 10000)`. Hashes a per-engine
    /// random seed with a step counter, the same trick tokio uses for
    /// jittered timeouts.
    fn verify_data(&self) -> u16 {
        let mut hasher = self.verify_seed.build_hasher();
        hasher.write_u64(self.verify_step.fetch_add(1, Ordering::Relaxed));
        (hasher.finish() % 10_000) as u16
    }

    async fn poll(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn raise_error(&self, err: &SessionError) {
        let callback = self.error_cb.lock().clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }

    /// Close the session, routing the disconnect event through the
    /// `Disconnecting` state so the handler treats it as intentional.
    async fn teardown(&self) {
        self.state.store(SessionState::Disconnecting);
        self.camera.lock().reset();
        if self.link.is_connected() {
            let _ = self.link.disconnect().await;
        } else {
            self.state.store(SessionState::InitComplete);
        }
    }

    // ---- background tasks ----------------------------------------------

    fn spawn_worker(
        self: Arc<Self>,
        mut notify_rx: mpsc::Receiver<Vec<u8>>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
    ) {
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(bytes) = notify_rx.recv() => self.process_notification(&bytes),
                    Some(event) = link_rx.recv() => match event {
                        LinkEvent::Disconnected { reason } => self.handle_disconnect(reason).await,
                    },
                    _ = shutdown.cancelled() => break,
                    else => break,
                }
            }
            debug!("notification worker stopped");
        });
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.table.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Decode one queued notification and route it. Codec and catalog
    /// failures are logged and dropped; a stale or adversarial frame must
    /// not disturb in-flight waiters.
    fn process_notification(&self, bytes: &[u8]) {
        let decoded = match frame::decode(bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "dropping undecodable notification");
                return;
            }
        };
        let Some((cmd_set, cmd_id)) = decoded.command() else {
            warn!("dropping notification with empty data segment");
            return;
        };

        let payload = match catalog::decode(cmd_set, cmd_id, decoded.cmd_type, decoded.payload()) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(
                    cmd_set = format!("{cmd_set:#04x}"),
                    cmd_id = format!("{cmd_id:#04x}"),
                    error = %err,
                    "dropping notification payload"
                );
                return;
            }
        };

        // Status pushes fan out an owned copy before the correlation table
        // takes ownership of the original.
        match &payload {
            Payload::StatusPush(push) if (cmd_set, cmd_id) == LEGACY_STATUS_CMD => {
                let changed = self.camera.lock().apply(push);
                if changed {
                    let camera = *self.camera.lock();
                    info!(
                        mode = camera.mode().map(|m| m.to_string()).unwrap_or_else(|| format!("{:#04x}", camera.camera_mode)),
                        status = camera.status().map(|s| s.to_string()).unwrap_or_else(|| format!("{:#04x}", camera.camera_status)),
                        record_time = camera.record_time,
                        "camera status changed"
                    );
                }
                let callback = self.status_cb.lock().clone();
                if let Some(callback) = callback {
                    callback(push.clone());
                }
            }
            Payload::NewStatusPush(push) if (cmd_set, cmd_id) == NEW_STATUS_CMD => {
                let callback = self.new_status_cb.lock().clone();
                if let Some(callback) = callback {
                    callback(push.clone());
                }
            }
            _ => {}
        }

        self.table.deliver(decoded.seq, cmd_set, cmd_id, payload);
    }

    /// React to a link drop according to the state it interrupts: normal
    /// completion out of `Disconnecting`, a single reconnect attempt out
    /// of a live session.
    async fn handle_disconnect(&self, reason: u8) {
        match self.state.load() {
            SessionState::NotInit | SessionState::Scanning => {}
            SessionState::InitComplete => {
                debug!("already disconnected");
            }
            SessionState::Disconnecting => {
                info!("disconnect complete");
                self.camera.lock().reset();
                self.state.store(SessionState::InitComplete);
            }
            SessionState::BleConnected | SessionState::ProtocolConnected => {
                warn!(
                    reason = format!("{reason:#04x}"),
                    "unexpected disconnect, attempting one reconnect"
                );
                self.camera.lock().reset();

                let target = self.store.last_peer();
                let reconnected = match self.link.scan_and_connect(target).await {
                    Ok(()) => {
                        self.poll(self.config.reconnect_timeout, || self.link.is_connected())
                            .await
                    }
                    Err(err) => {
                        warn!(error = %err, "reconnect scan failed");
                        false
                    }
                };

                if reconnected {
                    // The BLE link is back; the protocol session is not,
                    // and the caller decides whether to handshake again.
                    info!("reconnected to stored peer");
                    self.state.store(SessionState::BleConnected);
                } else {
                    error!("reconnect failed");
                    self.state.store(SessionState::InitComplete);
                    let _ = self.link.disconnect().await;
                    self.raise_error(&SessionError::ReconnectExhausted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_reference_timeouts() {
        let config = SessionConfig::default();
        assert_eq!(config.ble_connect_timeout, Duration::from_secs(15));
        assert_eq!(config.handshake_reply_timeout, Duration::from_secs(1));
        assert_eq!(config.handshake_command_timeout, Duration::from_secs(60));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.entry_max_age, Duration::from_secs(120));
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new(SessionState::NotInit);
        for state in [
            SessionState::InitComplete,
            SessionState::Scanning,
            SessionState::BleConnected,
            SessionState::ProtocolConnected,
            SessionState::Disconnecting,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn states_below_scanning_are_the_idle_ones() {
        assert!(SessionState::NotInit <= SessionState::InitComplete);
        assert!(SessionState::Scanning > SessionState::InitComplete);
        assert!(SessionState::Disconnecting > SessionState::InitComplete);
    }
}
