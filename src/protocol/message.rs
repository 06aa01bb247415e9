//! Protocol message definitions
//!
//! Builders for header and heartbeat blocks, and the [`Message`] type: a
//! header block followed by one or more payload blocks.

use std::fmt;

use super::{
    parse_header_fields, Block, BlockItem, BlockKind, HeaderFields, ValidationResult, WireFormat,
    DEFAULT_HEARTBEAT_INTERVAL, HEADER_BLOCK_NAME, HEARTBEAT_BLOCK_NAME, PROTOCOL_VERSION,
};

/// Sub-part width used when a uid has no `:` separator
const DEFAULT_SUBDEVICE_DIGITS: usize = 4;

/// Heartbeat class suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatClass {
    Alive,
    Stopped,
}

impl HeartbeatClass {
    /// Full class value, e.g. `xap-hbeat.alive`
    pub fn class_name(&self) -> &'static str {
        match self {
            HeartbeatClass::Alive => "xap-hbeat.alive",
            HeartbeatClass::Stopped => "xap-hbeat.stopped",
        }
    }
}

/// Optional addressing applied when building a header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    /// Written as the `target` item
    pub target: Option<String>,
    /// Appended to the source as `source:subdevice`
    pub subdevice_source: Option<String>,
    /// Written into the uid's sub-part when non-zero
    pub subdevice_id: u32,
}

impl Routing {
    pub fn to_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    pub fn with_subdevice(mut self, source: impl Into<String>, id: u32) -> Self {
        self.subdevice_source = Some(source.into());
        self.subdevice_id = id;
        self
    }
}

fn push_fixed(block: &mut Block, name: &str, value: impl ToString) {
    // Names come from the fixed item lists, so they cannot collide.
    let _ = block.push_item(BlockItem::new(name, value.to_string()));
}

/// Replace the sub-part of `uid` with `id` in hex, keeping the sub-part width
fn subdevice_uid(uid: &str, id: u32) -> String {
    let mut parts = uid.split(':');
    let device = parts.next().unwrap_or_default();
    let width = parts.next().map_or(DEFAULT_SUBDEVICE_DIGITS, str::len);
    let digits = format!("{:0width$X}", id, width = width);
    format!("{}:{}", device, &digits[digits.len() - width..])
}

/// Build a message header block
pub fn build_header(class: &str, uid: &str, source: &str, routing: &Routing) -> Block {
    let mut source = source.to_string();
    if let Some(sub) = &routing.subdevice_source {
        source = format!("{}:{}", source, sub);
    }

    let uid = if routing.subdevice_id > 0 {
        subdevice_uid(uid, routing.subdevice_id)
    } else {
        uid.to_string()
    };

    let mut block = Block::empty(HEADER_BLOCK_NAME, BlockKind::Header)
        .expect("header block name is not empty");
    push_fixed(&mut block, "v", PROTOCOL_VERSION);
    push_fixed(&mut block, "hop", 1);
    push_fixed(&mut block, "uid", uid);
    push_fixed(&mut block, "class", class);
    push_fixed(&mut block, "source", source);
    if let Some(target) = &routing.target {
        push_fixed(&mut block, "target", target);
    }
    block
}

/// Build a heartbeat block.
///
/// When `port` is given the heartbeat also carries our process id.
pub fn build_heartbeat(
    class: HeartbeatClass,
    uid: &str,
    source: &str,
    interval: u32,
    port: Option<u16>,
) -> Block {
    let mut block = Block::empty(HEARTBEAT_BLOCK_NAME, BlockKind::Heartbeat)
        .expect("heartbeat block name is not empty");
    push_fixed(&mut block, "v", PROTOCOL_VERSION);
    push_fixed(&mut block, "hop", 1);
    push_fixed(&mut block, "uid", uid);
    push_fixed(&mut block, "class", class.class_name());
    push_fixed(&mut block, "source", source);
    push_fixed(&mut block, "interval", interval);
    if let Some(port) = port {
        push_fixed(&mut block, "port", port);
        push_fixed(&mut block, "pid", std::process::id());
    }
    block
}

/// Heartbeat with the default interval and no port
pub fn build_default_heartbeat(class: HeartbeatClass, uid: &str, source: &str) -> Block {
    build_heartbeat(class, uid, source, DEFAULT_HEARTBEAT_INTERVAL, None)
}

/// A header block plus at least one payload block
#[derive(Debug, Clone)]
pub struct Message {
    header: HeaderFields,
    blocks: Vec<Block>,
    original_text: Option<String>,
}

impl Message {
    /// Create a message from a header and the first payload block.
    ///
    /// Fails if the header does not validate.
    pub fn new(header: Block, body: Block) -> ValidationResult<Self> {
        let fields = parse_header_fields(&header)?;
        Ok(Self {
            header: fields,
            blocks: vec![header, body],
            original_text: None,
        })
    }

    /// Append another payload block
    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub(crate) fn set_original_text(&mut self, text: String) {
        self.original_text = Some(text);
    }

    /// Validated header fields
    pub fn header(&self) -> &HeaderFields {
        &self.header
    }

    /// All blocks, header first
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Payload blocks only
    pub fn payload(&self) -> &[Block] {
        &self.blocks[1..]
    }

    /// Lowercased message class
    pub fn class(&self) -> &str {
        &self.header.class
    }

    /// Lowercased message source
    pub fn source(&self) -> &str {
        &self.header.source
    }

    /// The text this message was parsed from, if it was received
    pub fn original_text(&self) -> Option<&str> {
        self.original_text.as_deref()
    }

    pub fn block_value(&self, index: usize, key: &str) -> Option<&str> {
        self.blocks.get(index).and_then(|b| b.value(key))
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.block_value(0, key)
    }

    pub fn first_block_value(&self, key: &str) -> Option<&str> {
        self.block_value(1, key)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
