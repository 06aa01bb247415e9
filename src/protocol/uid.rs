//! Device identifier generation
//!
//! Identifiers are derived from a CRC-32 of the device part of a source
//! address (everything before a `:` sub-address), so a device gets the same
//! uid every time it starts. Collisions are possible but unlikely.

use crate::config::ProtocolVersion;

fn source_checksum(source: &str) -> u32 {
    let device = source.split(':').next().unwrap_or_default();
    crc32fast::hash(device.as_bytes())
}

/// v1.2 style uid, `FFxxxx00`
pub fn generate_short_id(source: &str) -> String {
    format!("FF{:04X}00", source_checksum(source) & 0xFFFF)
}

/// v1.3 style uid, `FF.xxxxxxxx:0000`, with configurable part widths
pub fn generate_extended_id(source: &str, device_digits: usize, sub_digits: usize) -> String {
    let hash = format!("{:0width$X}", source_checksum(source), width = device_digits);
    let device = &hash[hash.len() - device_digits..];
    format!("FF.{}:{}", device, "0".repeat(sub_digits))
}

/// uid in the style used by `version`
pub fn generate_id(version: ProtocolVersion, source: &str) -> String {
    match version {
        ProtocolVersion::V12 => generate_short_id(source),
        ProtocolVersion::V13 => generate_extended_id(source, 8, 4),
    }
}
