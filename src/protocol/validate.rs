//! Header and heartbeat validation
//!
//! Extracts typed fields from a block. Identifiers are uppercased and
//! classes, sources and targets lowercased so that later comparisons never
//! depend on the sender's casing.

use thiserror::Error;

use super::{Block, HEADER_REQUIRED_ITEMS};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required item: {0}")]
    MissingRequiredField(&'static str),

    #[error("Invalid value for {field}: {value:?}")]
    InvalidFieldValue { field: &'static str, value: String },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validated header items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    pub version: u32,
    pub hop: u32,
    pub uid: String,
    pub class: String,
    pub source: String,
    pub target: Option<String>,
}

/// Validated heartbeat items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatFields {
    pub version: u32,
    pub hop: u32,
    pub uid: String,
    pub class: String,
    pub source: String,
    pub interval: u32,
    pub port: Option<u16>,
    pub pid: Option<String>,
}

fn invalid(field: &'static str, value: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field,
        value: value.to_string(),
    }
}

fn required<'a>(block: &'a Block, field: &'static str) -> ValidationResult<&'a str> {
    block
        .value(field)
        .ok_or(ValidationError::MissingRequiredField(field))
}

/// Integer item that must be at least `min`
fn number_at_least(field: &'static str, value: &str, min: u32) -> ValidationResult<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n >= min => Ok(n),
        _ => Err(invalid(field, value)),
    }
}

fn non_empty(field: &'static str, value: String) -> ValidationResult<String> {
    if value.is_empty() {
        Err(invalid(field, &value))
    } else {
        Ok(value)
    }
}

/// Items shared by headers and heartbeats:
/// (version, hop, uid, class, source)
fn required_header_items(block: &Block) -> ValidationResult<(u32, u32, String, String, String)> {
    // Report a missing item before judging any values.
    for field in HEADER_REQUIRED_ITEMS {
        required(block, field)?;
    }

    let v = required(block, "v")?;
    let version = match v.trim().parse::<u32>() {
        Ok(n @ (12 | 13)) => n,
        _ => return Err(invalid("v", v)),
    };
    let hop = number_at_least("hop", required(block, "hop")?, 1)?;
    let uid = non_empty("uid", required(block, "uid")?.to_uppercase())?;
    let class = non_empty("class", required(block, "class")?.to_lowercase())?;
    let source = non_empty("source", required(block, "source")?.to_lowercase())?;

    Ok((version, hop, uid, class, source))
}

/// Validate a message header block
pub fn parse_header_fields(block: &Block) -> ValidationResult<HeaderFields> {
    let (version, hop, uid, class, source) = required_header_items(block)?;

    let target = block
        .value("target")
        .map(|t| non_empty("target", t.to_lowercase()))
        .transpose()?;

    Ok(HeaderFields {
        version,
        hop,
        uid,
        class,
        source,
        target,
    })
}

/// Validate a heartbeat block
pub fn parse_heartbeat_fields(block: &Block) -> ValidationResult<HeartbeatFields> {
    let (version, hop, uid, class, source) = required_header_items(block)?;

    let interval = number_at_least("interval", required(block, "interval")?, 1)?;

    let port = block
        .value("port")
        .map(|p| {
            number_at_least("port", p, 1)
                .and_then(|n| u16::try_from(n).map_err(|_| invalid("port", p)))
        })
        .transpose()?;

    let pid = block
        .value("pid")
        .map(|p| non_empty("pid", p.to_string()))
        .transpose()?;

    Ok(HeartbeatFields {
        version,
        hop,
        uid,
        class,
        source,
        interval,
        port,
        pid,
    })
}
