//! Firmware info command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    crate::CliError,
    otaflash::{FirmwareImage, ProtocolConfig},
    std::path::Path,
};

fn load(firmware: &Path, protocol: &ProtocolConfig) -> Result<FirmwareImage> {
    protocol
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware: {}", firmware.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, protocol: &ProtocolConfig, json: bool) -> Result<()> {
    if json {
        return cmd_info_json(firmware, protocol);
    }

    let image = load(firmware, protocol)?;

    eprintln!("{}", style("Firmware Information").bold().underlined());
    eprintln!("  File:       {}", firmware.display());
    eprintln!("  Size:       {} bytes", image.len());
    eprintln!("  CRC-32:     0x{:08X}", image.crc());
    eprintln!(
        "  Geometry:   {} byte pages, {} byte chunks",
        protocol.page_size, protocol.chunk_size
    );
    eprintln!(
        "  Frames:     {} pages, {} data chunks",
        image.page_count(protocol),
        image.chunk_count(protocol)
    );

    eprintln!("\n{}", style("Pages").bold().underlined());
    for page in image.pages(protocol) {
        eprintln!(
            "  [{:3}] {} @ 0x{:08X}  {:5} bytes  {} chunks  CRC 0x{:08X}",
            page.index,
            style("page").cyan(),
            page.offset,
            page.len(),
            page.chunk_count(protocol),
            page.crc()
        );
    }

    Ok(())
}

/// Build the JSON report for `image`.
pub(crate) fn info_json(
    firmware: &Path,
    image: &FirmwareImage,
    protocol: &ProtocolConfig,
) -> serde_json::Value {
    let pages: Vec<serde_json::Value> = image
        .pages(protocol)
        .map(|page| {
            serde_json::json!({
                "index": page.index,
                "offset": page.offset,
                "length": page.len(),
                "chunks": page.chunk_count(protocol),
                "crc": format!("0x{:08X}", page.crc()),
            })
        })
        .collect();

    serde_json::json!({
        "ok": true,
        "data": {
            "file": firmware.display().to_string(),
            "size": image.len(),
            "crc": format!("0x{:08X}", image.crc()),
            "geometry": protocol,
            "page_count": image.page_count(protocol),
            "chunk_count": image.chunk_count(protocol),
            "pages": pages,
        }
    })
}

/// Info command --json output: structured JSON to stdout.
fn cmd_info_json(firmware: &Path, protocol: &ProtocolConfig) -> Result<()> {
    let image = load(firmware, protocol)?;
    let info = info_json(firmware, &image, protocol);
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
