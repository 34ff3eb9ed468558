//! Capture decoding command implementation.
//!
//! Splits a recorded host-to-device byte stream into frames and checks
//! each frame's CRC the way the bootloader would.

use {
    anyhow::{Context, Result},
    console::style,
    otaflash::protocol::HeaderPayload,
    otaflash::{Frame, FrameScanner, PacketType},
    std::path::Path,
};

/// One decoded entry of a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A well-formed frame at `offset`.
    Frame { offset: usize, frame: Frame },
    /// Undecodable bytes at `offset`.
    Error { offset: usize, message: String },
}

/// Decode every frame in `data`.
pub(crate) fn decode_capture(data: &[u8]) -> Vec<Decoded> {
    let mut scanner = FrameScanner::new(data);
    let mut out = Vec::new();
    loop {
        let offset = scanner.position();
        match scanner.next() {
            Some(Ok(frame)) => out.push(Decoded::Frame { offset, frame }),
            Some(Err(e)) => out.push(Decoded::Error {
                offset,
                message: e.to_string(),
            }),
            None => break,
        }
    }
    out
}

/// Short human-readable description of a frame payload.
fn describe(frame: &Frame) -> String {
    match frame.packet_type() {
        PacketType::Command => frame
            .command()
            .map_or_else(|| "unknown command".to_string(), |c| c.to_string()),
        PacketType::Header => match HeaderPayload::from_bytes(frame.payload()) {
            Ok(h) => format!("size {} CRC 0x{:08X}", h.image_size, h.image_crc),
            Err(e) => e.to_string(),
        },
        PacketType::BulkHeader => {
            let mut crc = [0u8; 4];
            crc.copy_from_slice(&frame.payload()[..4]);
            format!("page CRC 0x{:08X}", u32::from_le_bytes(crc))
        },
        PacketType::Data => format!("{} bytes", frame.payload().len()),
        PacketType::Response => format!("status {}", frame.payload()[0]),
    }
}

/// Decode command implementation.
pub(crate) fn cmd_decode(capture: &Path, json: bool) -> Result<()> {
    let data = std::fs::read(capture)
        .with_context(|| format!("Failed to read capture: {}", capture.display()))?;
    let entries = decode_capture(&data);

    let frames = entries
        .iter()
        .filter(|e| matches!(e, Decoded::Frame { .. }))
        .count();
    let errors = entries.len() - frames;

    if json {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| match entry {
                Decoded::Frame { offset, frame } => serde_json::json!({
                    "offset": offset,
                    "type": frame.packet_type().to_string(),
                    "length": frame.payload().len(),
                    "crc": format!("0x{:08X}", frame.crc()),
                    "detail": describe(frame),
                }),
                Decoded::Error { offset, message } => serde_json::json!({
                    "offset": offset,
                    "error": message,
                }),
            })
            .collect();
        let output = serde_json::json!({
            "ok": errors == 0,
            "data": {
                "frames": frames,
                "errors": errors,
                "entries": items,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for entry in &entries {
        match entry {
            Decoded::Frame { offset, frame } => eprintln!(
                "  {:08X}  {} {:<11} {:4} bytes  CRC 0x{:08X}  {}",
                offset,
                style("✓").green(),
                frame.packet_type(),
                frame.payload().len(),
                frame.crc(),
                describe(frame)
            ),
            Decoded::Error { offset, message } => eprintln!(
                "  {:08X}  {} {}",
                offset,
                style("✗").red(),
                style(message).red()
            ),
        }
    }
    eprintln!(
        "\n{} frames, {} errors ({} bytes)",
        frames,
        errors,
        data.len()
    );

    Ok(())
}
