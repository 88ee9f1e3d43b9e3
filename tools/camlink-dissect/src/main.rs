//! Frame dissector for captured camera protocol traffic.
//!
//! Feeds hex-dumped frames through the same codec the engine uses at
//! runtime and prints a field breakdown with CRC verdicts. Frames come
//! from the command line or, with no arguments, one per line on stdin.
//!
//! Accepted input shapes: `AA1A00...`, `AA 1A 00 ...`, `AA, 1A, 00, ...`,
//! with or without `0x` prefixes.

use std::io::BufRead;

use anyhow::{Context, Result, bail};

use camlink::catalog;
use camlink::crc::{crc16, crc32};
use camlink::frame::{self, CmdType, MIN_FRAME_LEN};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line.context("reading stdin")?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            dissect_input(trimmed)?;
        }
    } else {
        // Either one frame per argument, or one frame spread over all
        // arguments ("AA 1A 00 ..." unquoted).
        let joined = args.join(" ");
        dissect_input(&joined)?;
    }
    Ok(())
}

fn dissect_input(input: &str) -> Result<()> {
    let bytes = parse_hex(input)?;
    println!("frame: {} bytes", bytes.len());
    dissect(&bytes);
    println!();
    Ok(())
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .split([' ', ',', '\t'])
        .map(|tok| tok.trim().trim_start_matches("0x"))
        .collect();
    if cleaned.is_empty() {
        bail!("no hex bytes in input");
    }
    hex::decode(&cleaned).with_context(|| format!("bad hex input {input:?}"))
}

fn dissect(bytes: &[u8]) {
    if bytes.len() < MIN_FRAME_LEN {
        println!(
            "  !! {} bytes is below the {MIN_FRAME_LEN}-byte minimum",
            bytes.len()
        );
        return;
    }

    let sof = bytes[0];
    let ver_len = u16::from_le_bytes([bytes[1], bytes[2]]);
    let declared = (ver_len & 0x03FF) as usize;
    let version = ver_len >> 10;
    let cmd_type = bytes[3];
    let seq = u16::from_le_bytes([bytes[8], bytes[9]]);

    println!("  SOF:      {sof:#04x}{}", if sof == frame::SOF { "" } else { "  !! expected 0xAA" });
    println!("  version:  {version}");
    println!(
        "  length:   {declared}{}",
        if declared == bytes.len() {
            String::new()
        } else {
            format!("  !! received {}", bytes.len())
        }
    );
    println!("  cmd type: {cmd_type:#04x} ({})", describe_cmd_type(cmd_type));
    println!("  seq:      {seq:#06x}");

    let received16 = u16::from_le_bytes([bytes[10], bytes[11]]);
    let calculated16 = crc16(&bytes[..10]);
    println!(
        "  crc16:    {received16:#06x}{}",
        if received16 == calculated16 {
            " (ok)".to_string()
        } else {
            format!("  !! calculated {calculated16:#06x}")
        }
    );

    if declared == bytes.len() {
        let tail = bytes.len() - 4;
        let received32 =
            u32::from_le_bytes([bytes[tail], bytes[tail + 1], bytes[tail + 2], bytes[tail + 3]]);
        let calculated32 = crc32(&bytes[..tail]);
        println!(
            "  crc32:    {received32:#010x}{}",
            if received32 == calculated32 {
                " (ok)".to_string()
            } else {
                format!("  !! calculated {calculated32:#010x}")
            }
        );
    }

    match frame::decode(bytes) {
        Ok(decoded) => {
            let Some((cmd_set, cmd_id)) = decoded.command() else {
                println!("  data:     (empty segment)");
                return;
            };
            println!("  command:  {cmd_set:#04x}/{cmd_id:#04x}");
            println!("  payload:  {} bytes: {}", decoded.payload().len(), hex::encode(decoded.payload()));
            match catalog::decode(cmd_set, cmd_id, decoded.cmd_type, decoded.payload()) {
                Ok(payload) => println!("  decoded:  {payload:?}"),
                Err(err) => println!("  decoded:  ({err})"),
            }
        }
        Err(err) => println!("  !! {err}"),
    }
}

fn describe_cmd_type(raw: u8) -> String {
    match CmdType::from_raw(raw) {
        Some(CmdType::CmdNoResponse) => "command, no reply".into(),
        Some(CmdType::CmdResponseOrNot) => "command, reply optional".into(),
        Some(CmdType::CmdWaitResult) => "command, reply required".into(),
        Some(CmdType::AckNoResponse) => "response, no reply".into(),
        Some(CmdType::AckResponseOrNot) => "response, reply optional".into(),
        Some(CmdType::AckWaitResult) => "response, reply required".into(),
        None => "unknown".into(),
    }
}
