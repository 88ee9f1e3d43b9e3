//! Persistent peer state behind a trait.
//!
//! The controller remembers one bonded camera: its address, whether pairing
//! completed, and the controller's own derived device id. Real platforms
//! back this with their key/value flash store; [`MemoryStore`] serves tests
//! and hosted runs.

use parking_lot::Mutex;

use crate::types::PeerAddr;

/// Storage keys: `cam_bda` (6 bytes), `paired` (bool), `dev_id` (u32).
pub trait PeerStore: Send + Sync {
    /// Last bonded camera address, if any non-zero one is stored.
    fn last_peer(&self) -> Option<PeerAddr>;

    fn set_last_peer(&self, addr: PeerAddr);

    fn clear_last_peer(&self);

    fn paired(&self) -> bool;

    fn set_paired(&self, paired: bool);

    /// The controller's device id, created on first use.
    fn device_id(&self) -> u32;
}

/// Derive the controller's device id from its own BT MAC: the lower four
/// bytes in big-endian order, XORed with a fixed mask, never zero.
pub fn derive_device_id(bt_mac: &[u8; 6]) -> u32 {
    let id = u32::from_be_bytes([bt_mac[2], bt_mac[3], bt_mac[4], bt_mac[5]]) ^ 0xA5A5_0000;
    if id == 0 { 0xA5A5_0001 } else { id }
}

#[derive(Debug, Default)]
struct MemoryState {
    peer: Option<PeerAddr>,
    paired: bool,
}

/// In-memory [`PeerStore`] seeded with the controller's MAC.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    device_id: u32,
}

impl MemoryStore {
    pub fn new(controller_mac: [u8; 6]) -> Self {
        MemoryStore {
            state: Mutex::new(MemoryState::default()),
            device_id: derive_device_id(&controller_mac),
        }
    }
}

impl PeerStore for MemoryStore {
    fn last_peer(&self) -> Option<PeerAddr> {
        self.state.lock().peer.filter(|addr| !addr.is_zero())
    }

    fn set_last_peer(&self, addr: PeerAddr) {
        if addr.is_zero() {
            return;
        }
        self.state.lock().peer = Some(addr);
    }

    fn clear_last_peer(&self) {
        let mut state = self.state.lock();
        state.peer = None;
        state.paired = false;
    }

    fn paired(&self) -> bool {
        self.state.lock().paired
    }

    fn set_paired(&self, paired: bool) {
        self.state.lock().paired = paired;
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }
}
