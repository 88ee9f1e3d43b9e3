//! Typed payload records for the command catalog.
//!
//! Each record mirrors one wire layout from the camera protocol: fixed-size
//! little-endian fields, with the two status pushes as the only
//! variable-length shapes. Decoders tolerate trailing bytes beyond the
//! fields they know, matching the camera's habit of growing records at the
//! end across firmware revisions.

use bytes::{Buf, BufMut};

use crate::catalog::CatalogError;

fn too_short(what: &'static str, expected: usize, got: usize) -> CatalogError {
    CatalogError::PayloadTooShort {
        what,
        expected,
        got,
    }
}

/// Reply to the version query: ack result, 16-byte ASCII product id, then
/// a variable-length SDK version tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReply {
    pub ack_result: u16,
    pub product_id: [u8; 16],
    pub sdk_version: Vec<u8>,
}

impl VersionReply {
    pub const FIXED_LEN: usize = 18;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        if bytes.len() < Self::FIXED_LEN {
            return Err(too_short("version reply", Self::FIXED_LEN, bytes.len()));
        }
        let mut b = bytes;
        let ack_result = b.get_u16_le();
        let mut product_id = [0u8; 16];
        b.copy_to_slice(&mut product_id);
        Ok(Self {
            ack_result,
            product_id,
            sdk_version: b.to_vec(),
        })
    }

    /// Product id with trailing NULs stripped.
    pub fn product_id_str(&self) -> String {
        let end = self
            .product_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.product_id.len());
        String::from_utf8_lossy(&self.product_id[..end]).into_owned()
    }

    pub fn sdk_version_str(&self) -> String {
        String::from_utf8_lossy(&self.sdk_version).into_owned()
    }
}

/// Key-press report sent to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyReport {
    pub key_code: u8,
    /// 0x00 reports press/release state, 0x01 reports key events.
    pub mode: u8,
    /// Event value; 0x00 is a short press in event mode.
    pub key_value: u16,
}

impl KeyReport {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.put_u8(self.key_code);
        out.put_u8(self.mode);
        out.put_u16_le(self.key_value);
        out
    }
}

/// Single-byte acknowledgment shared by key report and record control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetCodeAck {
    pub ret_code: u8,
}

impl RetCodeAck {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        if bytes.is_empty() {
            return Err(too_short("return code", 1, 0));
        }
        Ok(Self { ret_code: bytes[0] })
    }
}

/// One GPS fix pushed to the camera for video geotagging.
///
/// Dates are `year*10000 + month*100 + day`; the time-of-day field carries
/// UTC+8 as `(hour+8)*10000 + minute*100 + second`. Coordinates are degrees
/// scaled by 1e7, altitude is millimetres, velocities centimetres per
/// second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPush {
    pub year_month_day: i32,
    pub hour_minute_second: i32,
    pub longitude: i32,
    pub latitude: i32,
    pub height_mm: i32,
    pub speed_north: f32,
    pub speed_east: f32,
    pub speed_down: f32,
    pub vertical_accuracy: u32,
    pub horizontal_accuracy: u32,
    pub speed_accuracy: u32,
    pub satellites: u32,
}

impl GpsPush {
    pub const LEN: usize = 48;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_i32_le(self.year_month_day);
        out.put_i32_le(self.hour_minute_second);
        out.put_i32_le(self.longitude);
        out.put_i32_le(self.latitude);
        out.put_i32_le(self.height_mm);
        out.put_f32_le(self.speed_north);
        out.put_f32_le(self.speed_east);
        out.put_f32_le(self.speed_down);
        out.put_u32_le(self.vertical_accuracy);
        out.put_u32_le(self.horizontal_accuracy);
        out.put_u32_le(self.speed_accuracy);
        out.put_u32_le(self.satellites);
        out
    }
}

/// Connection handshake command. Sent by the controller to open the
/// protocol session, and sent back by the camera (with `verify_mode` 2) as
/// its side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub device_id: u32,
    pub mac_len: u8,
    pub mac: [u8; 16],
    pub fw_version: u32,
    pub conidx: u8,
    pub verify_mode: u8,
    pub verify_data: u16,
    pub reserved: [u8; 4],
}

impl ConnectRequest {
    pub const LEN: usize = 33;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u32_le(self.device_id);
        out.put_u8(self.mac_len);
        out.put_slice(&self.mac);
        out.put_u32_le(self.fw_version);
        out.put_u8(self.conidx);
        out.put_u8(self.verify_mode);
        out.put_u16_le(self.verify_data);
        out.put_slice(&self.reserved);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        if bytes.len() < Self::LEN {
            return Err(too_short("connect request", Self::LEN, bytes.len()));
        }
        let mut b = bytes;
        let device_id = b.get_u32_le();
        let mac_len = b.get_u8();
        let mut mac = [0u8; 16];
        b.copy_to_slice(&mut mac);
        let fw_version = b.get_u32_le();
        let conidx = b.get_u8();
        let verify_mode = b.get_u8();
        let verify_data = b.get_u16_le();
        let mut reserved = [0u8; 4];
        b.copy_to_slice(&mut reserved);
        Ok(Self {
            device_id,
            mac_len,
            mac,
            fw_version,
            conidx,
            verify_mode,
            verify_data,
            reserved,
        })
    }
}

/// Connection handshake reply. `reserved[0]` carries the camera slot tag
/// when the controller acknowledges the camera's handshake command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply {
    pub device_id: u32,
    pub ret_code: u8,
    pub reserved: [u8; 4],
}

impl ConnectReply {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u32_le(self.device_id);
        out.put_u8(self.ret_code);
        out.put_slice(&self.reserved);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        if bytes.len() < Self::LEN {
            return Err(too_short("connect reply", Self::LEN, bytes.len()));
        }
        let mut b = bytes;
        let device_id = b.get_u32_le();
        let ret_code = b.get_u8();
        let mut reserved = [0u8; 4];
        b.copy_to_slice(&mut reserved);
        Ok(Self {
            device_id,
            ret_code,
            reserved,
        })
    }
}

/// Legacy camera status push: the full shooting state in one fixed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusPush {
    pub camera_mode: u8,
    pub camera_status: u8,
    pub video_resolution: u8,
    pub fps_idx: u8,
    pub eis_mode: u8,
    /// Seconds while recording; burst time limit in milliseconds when
    /// bursting.
    pub record_time: u16,
    pub fov_type: u8,
    pub photo_ratio: u8,
    pub real_time_countdown: u16,
    /// 0.1 s units in still timelapse; shooting rate in motion timelapse.
    pub timelapse_interval: u16,
    pub timelapse_duration: u16,
    /// Remaining card capacity in MB.
    pub remain_capacity: u32,
    pub remain_photo_num: u32,
    pub remain_time: u32,
    pub user_mode: u8,
    pub power_mode: u8,
    pub camera_mode_next_flag: u8,
    pub temp_over: u8,
    pub photo_countdown_ms: u32,
    pub loop_record_sends: u16,
    pub battery_percent: u8,
}

impl StatusPush {
    pub const LEN: usize = 38;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        if bytes.len() < Self::LEN {
            return Err(too_short("status push", Self::LEN, bytes.len()));
        }
        let mut b = bytes;
        Ok(Self {
            camera_mode: b.get_u8(),
            camera_status: b.get_u8(),
            video_resolution: b.get_u8(),
            fps_idx: b.get_u8(),
            eis_mode: b.get_u8(),
            record_time: b.get_u16_le(),
            fov_type: b.get_u8(),
            photo_ratio: b.get_u8(),
            real_time_countdown: b.get_u16_le(),
            timelapse_interval: b.get_u16_le(),
            timelapse_duration: b.get_u16_le(),
            remain_capacity: b.get_u32_le(),
            remain_photo_num: b.get_u32_le(),
            remain_time: b.get_u32_le(),
            user_mode: b.get_u8(),
            power_mode: b.get_u8(),
            camera_mode_next_flag: b.get_u8(),
            temp_over: b.get_u8(),
            photo_countdown_ms: b.get_u32_le(),
            loop_record_sends: b.get_u16_le(),
            battery_percent: b.get_u8(),
        })
    }

    /// Serialize in the camera's own layout. The engine never sends this
    /// record; camera simulators and test fixtures do.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u8(self.camera_mode);
        out.put_u8(self.camera_status);
        out.put_u8(self.video_resolution);
        out.put_u8(self.fps_idx);
        out.put_u8(self.eis_mode);
        out.put_u16_le(self.record_time);
        out.put_u8(self.fov_type);
        out.put_u8(self.photo_ratio);
        out.put_u16_le(self.real_time_countdown);
        out.put_u16_le(self.timelapse_interval);
        out.put_u16_le(self.timelapse_duration);
        out.put_u32_le(self.remain_capacity);
        out.put_u32_le(self.remain_photo_num);
        out.put_u32_le(self.remain_time);
        out.put_u8(self.user_mode);
        out.put_u8(self.power_mode);
        out.put_u8(self.camera_mode_next_flag);
        out.put_u8(self.temp_over);
        out.put_u32_le(self.photo_countdown_ms);
        out.put_u16_le(self.loop_record_sends);
        out.put_u8(self.battery_percent);
        out
    }
}

/// New-format status push: two tagged, length-prefixed ASCII strings
/// naming the current mode and its parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStatusPush {
    pub mode_name: String,
    pub mode_param: String,
}

impl NewStatusPush {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        let mut b = bytes;
        let mode_name = Self::take_field(&mut b)?;
        let mode_param = Self::take_field(&mut b)?;
        Ok(Self {
            mode_name,
            mode_param,
        })
    }

    // Tag byte, length byte, then that many ASCII bytes. Tag values are not
    // enforced; the camera always sends 0x01 then 0x02.
    fn take_field(b: &mut &[u8]) -> Result<String, CatalogError> {
        if b.len() < 2 {
            return Err(too_short("status field header", 2, b.len()));
        }
        let _tag = b.get_u8();
        let len = b.get_u8() as usize;
        if b.len() < len {
            return Err(too_short("status field", len, b.len()));
        }
        let s = String::from_utf8_lossy(&b[..len]).into_owned();
        b.advance(len);
        Ok(s)
    }

    /// Serialize in the camera's own layout, for simulators and fixtures.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u8(0x01);
        out.put_u8(self.mode_name.len() as u8);
        out.put_slice(self.mode_name.as_bytes());
        out.put_u8(0x02);
        out.put_u8(self.mode_param.len() as u8);
        out.put_slice(self.mode_param.as_bytes());
        out
    }
}

/// Record start/stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordControl {
    pub device_id: u32,
    /// 0 starts recording, 1 stops.
    pub record_ctrl: u8,
    pub reserved: [u8; 4],
}

impl RecordControl {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u32_le(self.device_id);
        out.put_u8(self.record_ctrl);
        out.put_slice(&self.reserved);
        out
    }
}

/// Mode switch command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSwitch {
    pub device_id: u32,
    pub mode: u8,
    pub reserved: [u8; 4],
}

impl ModeSwitch {
    pub const LEN: usize = 9;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u32_le(self.device_id);
        out.put_u8(self.mode);
        out.put_slice(&self.reserved);
        out
    }
}

/// Mode switch acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSwitchAck {
    pub ret_code: u8,
    pub reserved: [u8; 4],
}

impl ModeSwitchAck {
    pub const LEN: usize = 5;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CatalogError> {
        if bytes.len() < Self::LEN {
            return Err(too_short("mode switch ack", Self::LEN, bytes.len()));
        }
        let mut b = bytes;
        let ret_code = b.get_u8();
        let mut reserved = [0u8; 4];
        b.copy_to_slice(&mut reserved);
        Ok(Self { ret_code, reserved })
    }
}

/// Camera status subscription command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSubscribe {
    pub push_mode: u8,
    /// 0.1 Hz units; the camera only accepts 20 (2 Hz).
    pub push_freq: u8,
    pub reserved: [u8; 4],
}

impl StatusSubscribe {
    pub const LEN: usize = 6;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u8(self.push_mode);
        out.put_u8(self.push_freq);
        out.put_slice(&self.reserved);
        out
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn version_reply_splits_fixed_and_flexible_parts() {
        let mut bytes = vec![0x00, 0x00];
        bytes.extend_from_slice(b"DJI-Osmo Action6");
        bytes.extend_from_slice(b"01.02.03");

        let reply = VersionReply::from_bytes(&bytes).unwrap();
        assert_eq!(reply.ack_result, 0);
        assert_eq!(reply.product_id_str(), "DJI-Osmo Action6");
        assert_eq!(reply.sdk_version_str(), "01.02.03");
    }

    #[test]
    fn version_reply_requires_fixed_part() {
        let err = VersionReply::from_bytes(&[0x00; 17]).unwrap_err();
        assert_eq!(
            err,
            CatalogError::PayloadTooShort {
                what: "version reply",
                expected: 18,
                got: 17
            }
        );
    }

    #[test]
    fn key_report_layout() {
        let report = KeyReport {
            key_code: 0x02,
            mode: 0x01,
            key_value: 0x0000,
        };
        assert_eq!(report.to_bytes(), vec![0x02, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn gps_push_is_forty_eight_bytes() {
        let fix = GpsPush {
            year_month_day: 2025_08_01,
            hour_minute_second: (12 + 8) * 10000 + 30 * 100 + 15,
            longitude: 1_139_280_000,
            latitude: 226_180_000,
            height_mm: 52_000,
            speed_north: 12.5,
            speed_east: -3.0,
            speed_down: 0.0,
            vertical_accuracy: 1_500,
            horizontal_accuracy: 900,
            speed_accuracy: 40,
            satellites: 14,
        };
        let bytes = fix.to_bytes();
        assert_eq!(bytes.len(), GpsPush::LEN);
        assert_eq!(&bytes[..4], &2025_08_01_i32.to_le_bytes());
        assert_eq!(&bytes[44..], &14_u32.to_le_bytes());
    }

    #[test]
    fn connect_request_round_trips() {
        let mut mac = [0u8; 16];
        mac[..6].copy_from_slice(&[0x38, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        let request = ConnectRequest {
            device_id: 0x33FF_0000,
            mac_len: 6,
            mac,
            fw_version: 0,
            conidx: 0,
            verify_mode: 1,
            verify_data: 1234,
            reserved: [0; 4],
        };
        let bytes = request.to_bytes();
        assert_eq!(bytes.len(), ConnectRequest::LEN);
        assert_eq!(ConnectRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn connect_reply_round_trips() {
        let reply = ConnectReply {
            device_id: 0xA5A5_0001,
            ret_code: 0,
            reserved: [7, 0, 0, 0],
        };
        let bytes = reply.to_bytes();
        assert_eq!(bytes.len(), ConnectReply::LEN);
        assert_eq!(ConnectReply::from_bytes(&bytes).unwrap(), reply);
    }

    #[test]
    fn status_push_round_trips() {
        let push = StatusPush {
            camera_mode: 0x01,
            camera_status: 0x03,
            video_resolution: 16,
            fps_idx: 6,
            eis_mode: 1,
            record_time: 125,
            remain_capacity: 120_000,
            remain_time: 5_400,
            battery_percent: 87,
            ..StatusPush::default()
        };
        let bytes = push.to_bytes();
        assert_eq!(bytes.len(), StatusPush::LEN);
        assert_eq!(StatusPush::from_bytes(&bytes).unwrap(), push);
    }

    #[test]
    fn status_push_tolerates_trailing_bytes() {
        let mut bytes = StatusPush::default().to_bytes();
        bytes.extend_from_slice(&[0xEE; 7]);
        assert!(StatusPush::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn new_status_push_parses_tagged_strings() {
        let push = NewStatusPush {
            mode_name: "Hyperlapse".to_string(),
            mode_param: "4K/30".to_string(),
        };
        let decoded = NewStatusPush::from_bytes(&push.to_bytes()).unwrap();
        assert_eq!(decoded, push);
    }

    #[test_case(&[]; "empty")]
    #[test_case(&[0x01]; "lone tag")]
    #[test_case(&[0x01, 0x05, b'a', b'b']; "name shorter than declared")]
    #[test_case(&[0x01, 0x02, b'o', b'k', 0x02]; "param header truncated")]
    fn new_status_push_rejects_truncation(bytes: &[u8]) {
        assert!(matches!(
            NewStatusPush::from_bytes(bytes),
            Err(CatalogError::PayloadTooShort { .. })
        ));
    }

    #[test]
    fn mode_switch_ack_needs_reserved_tail() {
        assert!(ModeSwitchAck::from_bytes(&[0x00, 0x00, 0x00, 0x00]).is_err());
        let ack = ModeSwitchAck::from_bytes(&[0x01, 0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        assert_eq!(ack.ret_code, 0x01);
        assert_eq!(ack.reserved, [0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn status_subscribe_layout() {
        let sub = StatusSubscribe {
            push_mode: 3,
            push_freq: 20,
            reserved: [0; 4],
        };
        assert_eq!(sub.to_bytes(), vec![3, 20, 0, 0, 0, 0]);
    }
}
