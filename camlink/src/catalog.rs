//! Command catalog: `(cmd_set, cmd_id)` → payload (de)serializers.
//!
//! A static descriptor table maps each known command family to an optional
//! encoder and an optional decoder. The same entry serves command and
//! response frames, told apart by the response bit of CmdType, because many
//! commands share a layout with their acknowledgment while others do not.
//! The catalog is frame-agnostic: it only ever sees the payload bytes after
//! CmdId.

use thiserror::Error;

use crate::frame::is_response;
use crate::records::{
    ConnectReply, ConnectRequest, GpsPush, KeyReport, ModeSwitch, ModeSwitchAck, NewStatusPush,
    RecordControl, RetCodeAck, StatusPush, StatusSubscribe, VersionReply,
};

/// A decoded (or to-be-encoded) payload, one variant per catalog record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    VersionReply(VersionReply),
    KeyReport(KeyReport),
    KeyReportAck(RetCodeAck),
    GpsPush(GpsPush),
    ConnectRequest(ConnectRequest),
    ConnectReply(ConnectReply),
    StatusPush(StatusPush),
    NewStatusPush(NewStatusPush),
    RecordControl(RecordControl),
    RecordControlAck(RetCodeAck),
    ModeSwitch(ModeSwitch),
    ModeSwitchAck(ModeSwitchAck),
    StatusSubscribe(StatusSubscribe),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("no catalog entry for command {cmd_set:#04x}/{cmd_id:#04x}")]
    UnknownCommand { cmd_set: u8, cmd_id: u8 },
    #[error("command {cmd_set:#04x}/{cmd_id:#04x} is not encodable in this direction")]
    NotEncodable { cmd_set: u8, cmd_id: u8 },
    #[error("command {cmd_set:#04x}/{cmd_id:#04x} is not decodable in this direction")]
    NotDecodable { cmd_set: u8, cmd_id: u8 },
    #[error("{what} needs {expected} bytes, got {got}")]
    PayloadTooShort {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

type Encoder = fn(&Payload, u8) -> Result<Vec<u8>, CatalogError>;
type Decoder = fn(&[u8], u8) -> Result<Payload, CatalogError>;

struct Descriptor {
    cmd_set: u8,
    cmd_id: u8,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
}

static DESCRIPTORS: &[Descriptor] = &[
    // Version query
    Descriptor {
        cmd_set: 0x00,
        cmd_id: 0x00,
        encoder: None,
        decoder: Some(decode_version),
    },
    // Key-press report
    Descriptor {
        cmd_set: 0x00,
        cmd_id: 0x11,
        encoder: Some(encode_key_report),
        decoder: Some(decode_key_report),
    },
    // GPS push
    Descriptor {
        cmd_set: 0x00,
        cmd_id: 0x17,
        encoder: Some(encode_gps),
        decoder: None,
    },
    // Connection handshake
    Descriptor {
        cmd_set: 0x00,
        cmd_id: 0x19,
        encoder: Some(encode_connect),
        decoder: Some(decode_connect),
    },
    // Legacy status push
    Descriptor {
        cmd_set: 0x1D,
        cmd_id: 0x02,
        encoder: None,
        decoder: Some(decode_status_push),
    },
    // Record control
    Descriptor {
        cmd_set: 0x1D,
        cmd_id: 0x03,
        encoder: Some(encode_record_control),
        decoder: Some(decode_record_control),
    },
    // Mode switch
    Descriptor {
        cmd_set: 0x1D,
        cmd_id: 0x04,
        encoder: Some(encode_mode_switch),
        decoder: Some(decode_mode_switch),
    },
    // Status subscription
    Descriptor {
        cmd_set: 0x1D,
        cmd_id: 0x05,
        encoder: Some(encode_status_subscribe),
        decoder: None,
    },
    // New-format status push
    Descriptor {
        cmd_set: 0x1D,
        cmd_id: 0x06,
        encoder: None,
        decoder: Some(decode_new_status_push),
    },
];

fn find(cmd_set: u8, cmd_id: u8) -> Option<&'static Descriptor> {
    DESCRIPTORS
        .iter()
        .find(|d| d.cmd_set == cmd_set && d.cmd_id == cmd_id)
}

/// Serialize a typed payload into frame body bytes for the given command.
pub fn encode(
    cmd_set: u8,
    cmd_id: u8,
    cmd_type: u8,
    payload: &Payload,
) -> Result<Vec<u8>, CatalogError> {
    let descriptor = find(cmd_set, cmd_id).ok_or(CatalogError::UnknownCommand { cmd_set, cmd_id })?;
    let encoder = descriptor
        .encoder
        .ok_or(CatalogError::NotEncodable { cmd_set, cmd_id })?;
    encoder(payload, cmd_type)
}

/// Deserialize frame body bytes into a typed payload for the given command.
pub fn decode(
    cmd_set: u8,
    cmd_id: u8,
    cmd_type: u8,
    body: &[u8],
) -> Result<Payload, CatalogError> {
    let descriptor = find(cmd_set, cmd_id).ok_or(CatalogError::UnknownCommand { cmd_set, cmd_id })?;
    let decoder = descriptor
        .decoder
        .ok_or(CatalogError::NotDecodable { cmd_set, cmd_id })?;
    decoder(body, cmd_type)
}

fn decode_version(body: &[u8], cmd_type: u8) -> Result<Payload, CatalogError> {
    if !is_response(cmd_type) {
        return Err(CatalogError::NotDecodable {
            cmd_set: 0x00,
            cmd_id: 0x00,
        });
    }
    VersionReply::from_bytes(body).map(Payload::VersionReply)
}

fn encode_key_report(payload: &Payload, cmd_type: u8) -> Result<Vec<u8>, CatalogError> {
    match payload {
        Payload::KeyReport(report) if !is_response(cmd_type) => Ok(report.to_bytes()),
        _ => Err(CatalogError::NotEncodable {
            cmd_set: 0x00,
            cmd_id: 0x11,
        }),
    }
}

fn decode_key_report(body: &[u8], cmd_type: u8) -> Result<Payload, CatalogError> {
    if !is_response(cmd_type) {
        return Err(CatalogError::NotDecodable {
            cmd_set: 0x00,
            cmd_id: 0x11,
        });
    }
    RetCodeAck::from_bytes(body).map(Payload::KeyReportAck)
}

fn encode_gps(payload: &Payload, cmd_type: u8) -> Result<Vec<u8>, CatalogError> {
    match payload {
        Payload::GpsPush(fix) if !is_response(cmd_type) => Ok(fix.to_bytes()),
        _ => Err(CatalogError::NotEncodable {
            cmd_set: 0x00,
            cmd_id: 0x17,
        }),
    }
}

// The handshake is the one command exchanged in both directions with both
// layouts: each side sends a command-form request and acknowledges the
// other's with a response-form reply.
fn encode_connect(payload: &Payload, cmd_type: u8) -> Result<Vec<u8>, CatalogError> {
    match (payload, is_response(cmd_type)) {
        (Payload::ConnectRequest(request), false) => Ok(request.to_bytes()),
        (Payload::ConnectReply(reply), true) => Ok(reply.to_bytes()),
        _ => Err(CatalogError::NotEncodable {
            cmd_set: 0x00,
            cmd_id: 0x19,
        }),
    }
}

fn decode_connect(body: &[u8], cmd_type: u8) -> Result<Payload, CatalogError> {
    if is_response(cmd_type) {
        ConnectReply::from_bytes(body).map(Payload::ConnectReply)
    } else {
        ConnectRequest::from_bytes(body).map(Payload::ConnectRequest)
    }
}

// Cameras have been seen tagging status pushes with either direction bit,
// so the push decoders ignore CmdType.
fn decode_status_push(body: &[u8], _cmd_type: u8) -> Result<Payload, CatalogError> {
    StatusPush::from_bytes(body).map(Payload::StatusPush)
}

fn encode_record_control(payload: &Payload, cmd_type: u8) -> Result<Vec<u8>, CatalogError> {
    match payload {
        Payload::RecordControl(cmd) if !is_response(cmd_type) => Ok(cmd.to_bytes()),
        _ => Err(CatalogError::NotEncodable {
            cmd_set: 0x1D,
            cmd_id: 0x03,
        }),
    }
}

fn decode_record_control(body: &[u8], cmd_type: u8) -> Result<Payload, CatalogError> {
    if !is_response(cmd_type) {
        return Err(CatalogError::NotDecodable {
            cmd_set: 0x1D,
            cmd_id: 0x03,
        });
    }
    RetCodeAck::from_bytes(body).map(Payload::RecordControlAck)
}

fn encode_mode_switch(payload: &Payload, cmd_type: u8) -> Result<Vec<u8>, CatalogError> {
    match payload {
        Payload::ModeSwitch(cmd) if !is_response(cmd_type) => Ok(cmd.to_bytes()),
        _ => Err(CatalogError::NotEncodable {
            cmd_set: 0x1D,
            cmd_id: 0x04,
        }),
    }
}

fn decode_mode_switch(body: &[u8], cmd_type: u8) -> Result<Payload, CatalogError> {
    if !is_response(cmd_type) {
        return Err(CatalogError::NotDecodable {
            cmd_set: 0x1D,
            cmd_id: 0x04,
        });
    }
    ModeSwitchAck::from_bytes(body).map(Payload::ModeSwitchAck)
}

fn encode_status_subscribe(payload: &Payload, cmd_type: u8) -> Result<Vec<u8>, CatalogError> {
    match payload {
        Payload::StatusSubscribe(cmd) if !is_response(cmd_type) => Ok(cmd.to_bytes()),
        _ => Err(CatalogError::NotEncodable {
            cmd_set: 0x1D,
            cmd_id: 0x05,
        }),
    }
}

fn decode_new_status_push(body: &[u8], _cmd_type: u8) -> Result<Payload, CatalogError> {
    NewStatusPush::from_bytes(body).map(Payload::NewStatusPush)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const CMD: u8 = 0x01; // command frame, response optional
    const ACK: u8 = 0x21; // response frame

    #[test]
    fn unknown_command_is_rejected_both_ways() {
        assert_eq!(
            decode(0x7F, 0x7F, CMD, &[]),
            Err(CatalogError::UnknownCommand {
                cmd_set: 0x7F,
                cmd_id: 0x7F
            })
        );
        let payload = Payload::KeyReportAck(RetCodeAck { ret_code: 0 });
        assert_eq!(
            encode(0x7F, 0x7F, CMD, &payload),
            Err(CatalogError::UnknownCommand {
                cmd_set: 0x7F,
                cmd_id: 0x7F
            })
        );
    }

    #[test]
    fn version_query_has_no_encoder() {
        let payload = Payload::VersionReply(VersionReply {
            ack_result: 0,
            product_id: [0; 16],
            sdk_version: Vec::new(),
        });
        assert_eq!(
            encode(0x00, 0x00, CMD, &payload),
            Err(CatalogError::NotEncodable {
                cmd_set: 0x00,
                cmd_id: 0x00
            })
        );
    }

    #[test]
    fn version_query_decodes_responses_only() {
        let mut body = vec![0x00, 0x00];
        body.extend_from_slice(b"DJI-Osmo Action6");
        body.extend_from_slice(b"1.0");
        assert!(matches!(
            decode(0x00, 0x00, ACK, &body),
            Ok(Payload::VersionReply(_))
        ));
        assert_eq!(
            decode(0x00, 0x00, CMD, &body),
            Err(CatalogError::NotDecodable {
                cmd_set: 0x00,
                cmd_id: 0x00
            })
        );
    }

    #[test]
    fn gps_push_has_no_decoder() {
        assert_eq!(
            decode(0x00, 0x17, ACK, &[0x00]),
            Err(CatalogError::NotDecodable {
                cmd_set: 0x00,
                cmd_id: 0x17
            })
        );
    }

    #[test]
    fn connect_decodes_either_direction() {
        let mut mac = [0u8; 16];
        mac[..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let request = ConnectRequest {
            device_id: 0x1234,
            mac_len: 6,
            mac,
            fw_version: 0,
            conidx: 0,
            verify_mode: 2,
            verify_data: 0,
            reserved: [0; 4],
        };
        let decoded = decode(0x00, 0x19, 0x02, &request.to_bytes()).unwrap();
        assert_eq!(decoded, Payload::ConnectRequest(request));

        let reply = ConnectReply {
            device_id: 0x1234,
            ret_code: 0,
            reserved: [0; 4],
        };
        let decoded = decode(0x00, 0x19, 0x22, &reply.to_bytes()).unwrap();
        assert_eq!(decoded, Payload::ConnectReply(reply));
    }

    #[test]
    fn connect_encodes_request_and_reply_by_direction() {
        let request = Payload::ConnectRequest(ConnectRequest {
            device_id: 1,
            mac_len: 6,
            mac: [0; 16],
            fw_version: 0,
            conidx: 0,
            verify_mode: 1,
            verify_data: 42,
            reserved: [0; 4],
        });
        assert!(encode(0x00, 0x19, 0x02, &request).is_ok());
        // A request cannot be encoded as a response frame.
        assert!(encode(0x00, 0x19, 0x22, &request).is_err());

        let reply = Payload::ConnectReply(ConnectReply {
            device_id: 1,
            ret_code: 0,
            reserved: [0; 4],
        });
        assert!(encode(0x00, 0x19, 0x20, &reply).is_ok());
        assert!(encode(0x00, 0x19, 0x00, &reply).is_err());
    }

    #[test]
    fn mismatched_payload_variant_is_not_encodable() {
        let wrong = Payload::KeyReport(KeyReport {
            key_code: 0x02,
            mode: 0x01,
            key_value: 0,
        });
        assert_eq!(
            encode(0x1D, 0x03, CMD, &wrong),
            Err(CatalogError::NotEncodable {
                cmd_set: 0x1D,
                cmd_id: 0x03
            })
        );
    }

    // The status pushes decode regardless of the CmdType direction bit.
    #[test_case(0x00; "as command frame")]
    #[test_case(0x20; "as response frame")]
    fn status_push_ignores_direction_bit(cmd_type: u8) {
        let decoded = decode(0x1D, 0x02, cmd_type, &[0u8; 38]).unwrap();
        assert!(matches!(decoded, Payload::StatusPush(_)));
    }

    #[test]
    fn record_control_round_trip_through_catalog() {
        let cmd = RecordControl {
            device_id: 0x33FF_0000,
            record_ctrl: 0,
            reserved: [0; 4],
        };
        let body = encode(0x1D, 0x03, CMD, &Payload::RecordControl(cmd)).unwrap();
        assert_eq!(body.len(), RecordControl::LEN);

        let ack = decode(0x1D, 0x03, ACK, &[0x00]).unwrap();
        assert_eq!(ack, Payload::RecordControlAck(RetCodeAck { ret_code: 0 }));
    }
}
