//! Protocol-level domain types shared across the engine.

use std::fmt;

use strum::{Display, FromRepr};

/// A 6-byte BLE device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PeerAddr(pub [u8; 6]);

impl PeerAddr {
    pub const LEN: usize = 6;

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// An all-zero address marks "no stored peer".
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl From<[u8; 6]> for PeerAddr {
    fn from(bytes: [u8; 6]) -> Self {
        PeerAddr(bytes)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Shooting modes the camera reports and accepts in mode-switch commands.
///
/// Values outside this set mean the camera is using the new-format status
/// push for its mode description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum CameraMode {
    #[strum(serialize = "slow motion")]
    SlowMotion = 0x00,
    #[strum(serialize = "video")]
    Video = 0x01,
    #[strum(serialize = "still timelapse")]
    TimelapseStatic = 0x02,
    #[strum(serialize = "photo")]
    Photo = 0x05,
    #[strum(serialize = "motion timelapse")]
    TimelapseMotion = 0x0A,
    #[strum(serialize = "live streaming")]
    LiveStreaming = 0x1A,
    #[strum(serialize = "UVC streaming")]
    UvcStreaming = 0x23,
    #[strum(serialize = "low-light video")]
    LowLightVideo = 0x28,
    #[strum(serialize = "subject follow")]
    SmartTracking = 0x34,
}

/// Coarse activity state from the legacy status push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum CameraStatus {
    #[strum(serialize = "screen off")]
    ScreenOff = 0x00,
    #[strum(serialize = "live view")]
    LiveView = 0x01,
    #[strum(serialize = "playback")]
    Playback = 0x02,
    #[strum(serialize = "capturing")]
    PhotoOrRecording = 0x03,
    #[strum(serialize = "pre-recording")]
    PreRecording = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum VideoResolution {
    #[strum(serialize = "standard 12MP")]
    StandardPhoto = 2,
    #[strum(serialize = "M")]
    PhotoM = 3,
    #[strum(serialize = "L")]
    PhotoL = 4,
    #[strum(serialize = "1080p")]
    R1080p = 10,
    #[strum(serialize = "4K 16:9")]
    R4k169 = 16,
    #[strum(serialize = "2.7K 16:9")]
    R27k169 = 45,
    #[strum(serialize = "1080p 9:16")]
    R1080p916 = 66,
    #[strum(serialize = "2.7K 9:16")]
    R27k916 = 67,
    #[strum(serialize = "2.7K 4:3")]
    R27k43 = 95,
    #[strum(serialize = "4K 4:3")]
    R4k43 = 103,
    #[strum(serialize = "4K 9:16")]
    R4k916 = 109,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum FpsIdx {
    #[strum(serialize = "24fps")]
    Fps24 = 1,
    #[strum(serialize = "25fps")]
    Fps25 = 2,
    #[strum(serialize = "30fps")]
    Fps30 = 3,
    #[strum(serialize = "48fps")]
    Fps48 = 4,
    #[strum(serialize = "50fps")]
    Fps50 = 5,
    #[strum(serialize = "60fps")]
    Fps60 = 6,
    #[strum(serialize = "120fps")]
    Fps120 = 7,
    #[strum(serialize = "240fps")]
    Fps240 = 8,
    #[strum(serialize = "100fps")]
    Fps100 = 10,
    #[strum(serialize = "200fps")]
    Fps200 = 19,
}

/// Electronic image stabilization modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum EisMode {
    #[strum(serialize = "off")]
    Off = 0,
    #[strum(serialize = "RS")]
    Rs = 1,
    #[strum(serialize = "HS")]
    Hs = 2,
    #[strum(serialize = "RS+")]
    RsPlus = 3,
    #[strum(serialize = "HB")]
    Hb = 4,
}

/// Delivery policy for the camera status subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum PushMode {
    #[strum(serialize = "off")]
    Off = 0,
    #[strum(serialize = "once")]
    Single = 1,
    #[strum(serialize = "periodic")]
    Periodic = 2,
    #[strum(serialize = "periodic + on change")]
    PeriodicOnChange = 3,
}

/// The camera only accepts 2 Hz, expressed in 0.1 Hz units.
pub const STATUS_PUSH_FREQ_2HZ: u8 = 20;

/// Record-control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum RecordAction {
    #[strum(serialize = "start")]
    Start = 0x00,
    #[strum(serialize = "stop")]
    Stop = 0x01,
}

/// Physical keys reported to the camera.
pub mod key_code {
    /// Quick-switch key: cycles shooting modes.
    pub const MODE_SWITCH: u8 = 0x02;
    /// Shutter key: takes a snapshot.
    pub const SNAPSHOT: u8 = 0x03;
}
