//! Link adapter: one BLE session between the controller and a camera.
//!
//! The adapter sits between the session engine and the platform's radio
//! driver. The driver is reached through the [`Radio`] trait and reports
//! back through a [`RadioEvent`] channel; the adapter's pump task turns
//! those events into scan candidate selection, the open → MTU → discovery
//! chain, notification forwarding, and disconnect reporting.
//!
//! Notifications are only copied and queued here. Decoding happens in the
//! engine's worker; the queue is bounded and overflow drops the newest
//! frame with an error log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::PeerAddr;

/// Vendor GATT service on the camera.
pub const VENDOR_SERVICE_UUID: u16 = 0xFFF0;
/// Characteristic the camera notifies responses and pushes on.
pub const NOTIFY_CHAR_UUID: u16 = 0xFFF4;
/// Characteristic the controller writes frames to.
pub const WRITE_CHAR_UUID: u16 = 0xFFF5;
/// Client Characteristic Configuration descriptor.
pub const CCCD_UUID: u16 = 0x2902;

/// Negotiated MTU target; frames never exceed the 10-bit length bound.
pub const TARGET_MTU: u16 = 500;

/// Weakest advertisement considered in fresh-pairing scans.
pub const MIN_RSSI_DBM: i8 = -80;

/// Hard scan stop, issued regardless of the radio's own duration.
pub const SCAN_WATCHDOG: Duration = Duration::from_secs(4);

/// Duration passed to the radio's start-scan, in radio-defined units.
pub const SCAN_DURATION_UNITS: u32 = 6;

/// Wake-up advertising auto-stops after this long.
pub const WAKEUP_ADV_DURATION: Duration = Duration::from_secs(2);

/// Bounded notification queue depth between the radio and the engine
/// worker.
pub const NOTIFY_QUEUE_DEPTH: usize = 10;

/// Advertising data type for manufacturer-specific fields.
const MANUFACTURER_DATA_TYPE: u8 = 0xFF;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("a connection attempt is already in flight")]
    AlreadyConnecting,
    #[error("radio failure (code {0})")]
    RadioFailure(i32),
    #[error("service discovery timed out")]
    DiscoveryTimeout,
    #[error("no suitable device found")]
    NoDevice,
    #[error("rejected by peer")]
    Rejected,
}

/// Characteristic handle assigned by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharHandle(pub u16);

/// Descriptor handle assigned by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Events the radio driver reports back to the adapter.
///
/// Completion of `open`, MTU negotiation, and service discovery arrives
/// here rather than as return values: the driver's calls initiate work and
/// the matching event closes it, mirroring callback-style BLE stacks.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    ScanResult {
        addr: PeerAddr,
        rssi: i8,
        adv: Vec<u8>,
    },
    ScanStopped,
    Opened,
    MtuNegotiated(u16),
    DiscoveryComplete,
    Notify(Vec<u8>),
    Disconnected {
        reason: u8,
    },
}

/// The platform radio driver. All calls initiate work; completion of the
/// connection-establishment steps is reported via [`RadioEvent`]s.
#[async_trait]
pub trait Radio: Send + Sync {
    async fn set_scan_params(&self) -> Result<(), LinkError>;
    async fn start_scan(&self, duration_units: u32) -> Result<(), LinkError>;
    async fn stop_scan(&self) -> Result<(), LinkError>;
    /// Open a GATT connection to the address. Completion arrives as
    /// [`RadioEvent::Opened`].
    async fn open(&self, addr: PeerAddr) -> Result<(), LinkError>;
    async fn request_mtu(&self, mtu: u16) -> Result<(), LinkError>;
    async fn search_services(&self) -> Result<(), LinkError>;
    async fn characteristic_by_uuid(
        &self,
        service: u16,
        characteristic: u16,
    ) -> Result<CharHandle, LinkError>;
    async fn descriptor_by_char(
        &self,
        characteristic: CharHandle,
        descriptor: u16,
    ) -> Result<DescHandle, LinkError>;
    async fn write_characteristic(
        &self,
        handle: CharHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), LinkError>;
    async fn write_descriptor(&self, handle: DescHandle, data: &[u8]) -> Result<(), LinkError>;
    async fn register_notify(&self, characteristic: CharHandle) -> Result<(), LinkError>;
    async fn advertise_raw(&self, data: &[u8]) -> Result<(), LinkError>;
    async fn stop_advertising(&self) -> Result<(), LinkError>;
    async fn close(&self) -> Result<(), LinkError>;
}

/// Events the adapter surfaces to the session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected { reason: u8 },
}

/// Whether an advertisement carries the camera vendor marker: a
/// manufacturer-specific field beginning `AA 08 ?? ?? FA`, found by a TLV
/// walk over the advertising data.
pub fn is_vendor_advertisement(adv: &[u8]) -> bool {
    let mut i = 0;
    while i < adv.len() {
        let len = adv[i] as usize;
        if len == 0 || i + len + 1 > adv.len() {
            break;
        }
        let field_type = adv[i + 1];
        let data = &adv[i + 2..i + 1 + len];
        if field_type == MANUFACTURER_DATA_TYPE
            && data.len() >= 5
            && data[0] == 0xAA
            && data[1] == 0x08
            && data[4] == 0xFA
        {
            return true;
        }
        i += len + 1;
    }
    false
}

#[derive(Debug, Default)]
struct ScanState {
    active: bool,
    /// Set in reconnect mode: only this address is accepted, and finding it
    /// stops the scan immediately.
    reconnect_target: Option<PeerAddr>,
    best: Option<(PeerAddr, i8)>,
}

#[derive(Debug, Clone, Copy)]
struct GattHandles {
    notify_char: CharHandle,
    write_char: CharHandle,
}

pub struct LinkAdapter {
    radio: Arc<dyn Radio>,
    connected: AtomicBool,
    /// Single-session latch: set when a scan/connect attempt starts,
    /// cleared when the session is up or the attempt failed.
    connecting: AtomicBool,
    scan: Mutex<ScanState>,
    handles: Mutex<Option<GattHandles>>,
    cccd: Mutex<Option<DescHandle>>,
    current_peer: Mutex<Option<PeerAddr>>,
    last_error: Mutex<Option<LinkError>>,
}

impl LinkAdapter {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        LinkAdapter {
            radio,
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            scan: Mutex::new(ScanState::default()),
            handles: Mutex::new(None),
            cccd: Mutex::new(None),
            current_peer: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the vendor service characteristics have been resolved.
    pub fn handles_discovered(&self) -> bool {
        self.handles.lock().is_some()
    }

    /// Address of the camera this session targets.
    pub fn peer(&self) -> Option<PeerAddr> {
        *self.current_peer.lock()
    }

    /// Last asynchronous failure recorded by the pump (for example
    /// "no device" after an empty scan).
    pub fn take_last_error(&self) -> Option<LinkError> {
        self.last_error.lock().take()
    }

    /// Start scanning and connect to the best candidate.
    ///
    /// With `reconnect_to` set, only that address is accepted and the scan
    /// stops the moment it is seen; otherwise the strongest vendor
    /// advertisement at or above the RSSI floor wins when the scan window
    /// closes. The call returns once scanning is started; connection
    /// progress is observable through [`is_connected`] and
    /// [`handles_discovered`].
    ///
    /// [`is_connected`]: LinkAdapter::is_connected
    /// [`handles_discovered`]: LinkAdapter::handles_discovered
    pub async fn scan_and_connect(&self, reconnect_to: Option<PeerAddr>) -> Result<(), LinkError> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("scan_and_connect rejected, attempt already in flight");
            return Err(LinkError::AlreadyConnecting);
        }

        *self.last_error.lock() = None;
        {
            let mut scan = self.scan.lock();
            scan.active = true;
            scan.best = None;
            scan.reconnect_target = reconnect_to;
        }
        if let Some(target) = reconnect_to {
            info!(%target, "scanning for stored peer");
        } else {
            info!("scanning for strongest camera advertisement");
        }

        if let Err(err) = self.radio.set_scan_params().await {
            self.abort_attempt(&err);
            return Err(err);
        }
        if let Err(err) = self.radio.start_scan(SCAN_DURATION_UNITS).await {
            self.abort_attempt(&err);
            return Err(err);
        }

        // The radio runs its own duration timer; this watchdog issues a
        // hard stop after 4 s no matter which fires first. The pump treats
        // the first scan-stopped event as authoritative and ignores the
        // other.
        let radio = Arc::clone(&self.radio);
        tokio::spawn(async move {
            tokio::time::sleep(SCAN_WATCHDOG).await;
            let _ = radio.stop_scan().await;
        });

        Ok(())
    }

    fn abort_attempt(&self, err: &LinkError) {
        error!(error = %err, "connection attempt aborted");
        self.scan.lock().active = false;
        *self.last_error.lock() = Some(err.clone());
        self.connecting.store(false, Ordering::SeqCst);
    }

    /// Close the session if one is up, or cancel an attempt still waiting
    /// for its connection events. Either way the single-session latch is
    /// released. Best-effort disables notifications before a live close;
    /// the disconnect event completes the teardown.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        if !self.is_connected() {
            self.cancel_attempt().await;
            return Ok(());
        }
        if let Err(err) = self.unsubscribe_notify().await {
            debug!(error = %err, "could not disable notifications before close");
        }
        self.radio.close().await
    }

    /// Abandon an in-flight attempt that has produced no live link. A
    /// radio that goes silent after `open` never delivers the event that
    /// would clear the connecting latch, so the caller's timeout path must
    /// be able to release it here.
    async fn cancel_attempt(&self) {
        if !self.connecting.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("abandoning in-flight connection attempt");
        {
            let mut scan = self.scan.lock();
            scan.active = false;
            scan.best = None;
        }
        // Tears down a pending open, if the radio has one outstanding.
        let _ = self.radio.close().await;
    }

    pub async fn write_with_response(&self, data: &[u8]) -> Result<(), LinkError> {
        self.write(data, WriteMode::WithResponse).await
    }

    pub async fn write_without_response(&self, data: &[u8]) -> Result<(), LinkError> {
        self.write(data, WriteMode::WithoutResponse).await
    }

    async fn write(&self, data: &[u8], mode: WriteMode) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let handles = (*self.handles.lock()).ok_or(LinkError::NotConnected)?;
        self.radio
            .write_characteristic(handles.write_char, data, mode)
            .await
    }

    /// Enable notifications: register with the stack, then write 0x0001 to
    /// the CCCD of the notify characteristic.
    pub async fn subscribe_notify(&self) -> Result<(), LinkError> {
        let handles = (*self.handles.lock()).ok_or(LinkError::NotConnected)?;
        self.radio.register_notify(handles.notify_char).await?;
        let cccd = self
            .radio
            .descriptor_by_char(handles.notify_char, CCCD_UUID)
            .await?;
        self.radio
            .write_descriptor(cccd, &0x0001u16.to_le_bytes())
            .await?;
        *self.cccd.lock() = Some(cccd);
        debug!("notifications enabled");
        Ok(())
    }

    /// Disable notifications by writing 0x0000 to the saved CCCD handle.
    pub async fn unsubscribe_notify(&self) -> Result<(), LinkError> {
        let Some(cccd) = *self.cccd.lock() else {
            return Ok(());
        };
        self.radio
            .write_descriptor(cccd, &0x0000u16.to_le_bytes())
            .await
    }

    /// Advertise the wake-up record for a sleeping camera: an 11-byte raw
    /// advertisement of `WKP` followed by the stored peer address in
    /// byte-reversed order. Auto-stops after 2 s.
    pub async fn advertise_wakeup(&self, peer: PeerAddr) -> Result<(), LinkError> {
        if peer.is_zero() {
            return Err(LinkError::NoDevice);
        }

        let mut record = [0u8; 11];
        record[0] = 10;
        record[1] = MANUFACTURER_DATA_TYPE;
        record[2..5].copy_from_slice(b"WKP");
        for (i, byte) in peer.as_bytes().iter().rev().enumerate() {
            record[5 + i] = *byte;
        }

        info!(%peer, "advertising wake-up record");
        self.radio.advertise_raw(&record).await?;

        let radio = Arc::clone(&self.radio);
        tokio::spawn(async move {
            tokio::time::sleep(WAKEUP_ADV_DURATION).await;
            let _ = radio.stop_advertising().await;
            debug!("wake-up advertising stopped");
        });
        Ok(())
    }

    /// Run the radio event pump until shutdown. Notification bytes go into
    /// `notify_tx` (bounded; overflow drops the newest frame); disconnects
    /// go to `link_tx`.
    pub fn spawn_pump(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RadioEvent>,
        notify_tx: mpsc::Sender<Vec<u8>>,
        link_tx: mpsc::Sender<LinkEvent>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event, &notify_tx, &link_tx).await,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("link pump stopped");
        })
    }

    async fn handle_event(
        &self,
        event: RadioEvent,
        notify_tx: &mpsc::Sender<Vec<u8>>,
        link_tx: &mpsc::Sender<LinkEvent>,
    ) {
        match event {
            RadioEvent::ScanResult { addr, rssi, adv } => {
                let stop = {
                    let mut scan = self.scan.lock();
                    if !scan.active || !is_vendor_advertisement(&adv) {
                        false
                    } else if let Some(target) = scan.reconnect_target {
                        if addr == target {
                            info!(%addr, rssi, "stored peer found");
                            scan.best = Some((addr, rssi));
                            true
                        } else {
                            false
                        }
                    } else {
                        if rssi >= MIN_RSSI_DBM
                            && scan.best.is_none_or(|(_, best_rssi)| rssi > best_rssi)
                        {
                            debug!(%addr, rssi, "new best candidate");
                            scan.best = Some((addr, rssi));
                        }
                        false
                    }
                };
                if stop {
                    let _ = self.radio.stop_scan().await;
                }
            }

            RadioEvent::ScanStopped => {
                let candidate = {
                    let mut scan = self.scan.lock();
                    if !scan.active {
                        return; // duplicate stop from the watchdog or radio timer
                    }
                    scan.active = false;
                    scan.best.take()
                };
                match candidate {
                    Some((addr, rssi)) => {
                        info!(%addr, rssi, "scan complete, opening connection");
                        *self.current_peer.lock() = Some(addr);
                        if let Err(err) = self.radio.open(addr).await {
                            self.abort_attempt(&err);
                        }
                    }
                    None => {
                        warn!("no device");
                        *self.last_error.lock() = Some(LinkError::NoDevice);
                        self.connecting.store(false, Ordering::SeqCst);
                    }
                }
            }

            RadioEvent::Opened => {
                self.connected.store(true, Ordering::SeqCst);
                debug!("link opened, requesting MTU");
                if let Err(err) = self.radio.request_mtu(TARGET_MTU).await {
                    self.fail_setup(err).await;
                }
            }

            RadioEvent::MtuNegotiated(mtu) => {
                debug!(mtu, "MTU negotiated, searching services");
                if let Err(err) = self.radio.search_services().await {
                    self.fail_setup(err).await;
                }
            }

            RadioEvent::DiscoveryComplete => {
                let notify_char = self
                    .radio
                    .characteristic_by_uuid(VENDOR_SERVICE_UUID, NOTIFY_CHAR_UUID)
                    .await;
                let write_char = self
                    .radio
                    .characteristic_by_uuid(VENDOR_SERVICE_UUID, WRITE_CHAR_UUID)
                    .await;
                match (notify_char, write_char) {
                    (Ok(notify_char), Ok(write_char)) => {
                        *self.handles.lock() = Some(GattHandles {
                            notify_char,
                            write_char,
                        });
                        self.connecting.store(false, Ordering::SeqCst);
                        info!(
                            notify = notify_char.0,
                            write = write_char.0,
                            "vendor characteristics resolved"
                        );
                    }
                    (Err(err), _) | (_, Err(err)) => {
                        self.fail_setup(err).await;
                    }
                }
            }

            RadioEvent::Notify(bytes) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = notify_tx.try_send(bytes) {
                    error!("notification queue full, dropping frame");
                }
            }

            RadioEvent::Disconnected { reason } => {
                self.connected.store(false, Ordering::SeqCst);
                *self.handles.lock() = None;
                *self.cccd.lock() = None;
                self.connecting.store(false, Ordering::SeqCst);
                info!(reason = format!("{reason:#04x}"), "link disconnected");
                let _ = link_tx.send(LinkEvent::Disconnected { reason }).await;
            }
        }
    }

    /// A step of the post-open chain failed: record it and tear the
    /// session down.
    async fn fail_setup(&self, err: LinkError) {
        error!(error = %err, "session setup failed, closing");
        *self.last_error.lock() = Some(err);
        self.connecting.store(false, Ordering::SeqCst);
        let _ = self.radio.close().await;
    }
}
