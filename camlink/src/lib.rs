//! BLE-hosted request/response protocol engine for camera remote control.
//!
//! The engine pairs a small controller with an action camera over a vendor
//! GATT service. It owns the binary frame codec (dual CRC), the payload
//! catalog, a bounded correlation table matching notifications to callers,
//! the link adapter over an abstract BLE radio, and the session state
//! machine with its handshake and reconnection policy.
//!
//! The radio driver and persistent storage are external collaborators,
//! reached through the [`link::Radio`] and [`store::PeerStore`] traits.

pub mod catalog;
pub mod correlation;
pub mod crc;
pub mod frame;
pub mod link;
pub mod records;
pub mod session;
pub mod store;
pub mod types;

pub use catalog::Payload;
pub use session::{Engine, SessionConfig, SessionError, SessionState};
