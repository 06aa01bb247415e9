//! Protocol codec for parsing and rendering xAP text
//!
//! Parsing is total: text that does not look like xAP yields no blocks
//! rather than an error.

use regex::Regex;
use std::sync::OnceLock;

use super::{Block, BlockItem, Message};

/// Block name line, `{`, body, `}`
fn block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"([A-Za-z0-9_.\-]+[ A-Za-z0-9_.\-]*)\s*\n\{\n([^}]*)\}\n")
            .expect("block pattern is valid")
    })
}

/// `key=value` or `key!hexbytes`
fn item_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\s*([A-Za-z0-9_.\-]+[ A-Za-z0-9_.\-]*)([=!])(.*)\n")
            .expect("item pattern is valid")
    })
}

/// Anything that can be written in wire form
pub trait WireFormat {
    fn write_wire(&self, out: &mut String);

    fn to_wire(&self) -> String {
        let mut out = String::new();
        self.write_wire(&mut out);
        out
    }
}

impl WireFormat for Block {
    fn write_wire(&self, out: &mut String) {
        Block::write_wire(self, out)
    }
}

impl WireFormat for [Block] {
    fn write_wire(&self, out: &mut String) {
        for block in self {
            block.write_wire(out);
        }
    }
}

impl WireFormat for Vec<Block> {
    fn write_wire(&self, out: &mut String) {
        self.as_slice().write_wire(out)
    }
}

impl WireFormat for Message {
    fn write_wire(&self, out: &mut String) {
        self.blocks().write_wire(out)
    }
}

/// Render a block, a message or a list of blocks
pub fn serialize<T: WireFormat + ?Sized>(item: &T) -> String {
    item.to_wire()
}

/// Split text into blocks.
///
/// Items using the `!` separator also carry their value decoded from hex
/// pairs; values that are not valid hex keep only the text. A key repeated
/// within one block (ignoring case) keeps its first occurrence.
pub fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();

    for caps in block_pattern().captures_iter(text) {
        let name = caps[1].trim_end();
        let body = &caps[2];

        let Ok(mut block) = Block::empty(name, Default::default()) else {
            continue;
        };

        for item_caps in item_pattern().captures_iter(body) {
            let key = &item_caps[1];
            let value = &item_caps[3];
            let is_hex = &item_caps[2] == "!";
            let raw_bytes = if is_hex { hex::decode(value).ok() } else { None };

            let item = BlockItem {
                name: key.to_string(),
                value: value.to_string(),
                hex: is_hex,
                raw_bytes,
            };
            if block.push_item(item).is_err() {
                tracing::trace!("Ignoring repeated key '{}' in block '{}'", key, name);
            }
        }

        blocks.push(block);
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_header, build_heartbeat, HeartbeatClass, Routing};

    #[test]
    fn test_parse_single_block() {
        let blocks = parse_blocks("block\n{\nkey=value\nother=2\n}\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name(), "block");
        assert_eq!(blocks[0].value("KEY"), Some("value"));
        assert_eq!(blocks[0].value("other"), Some("2"));
    }

    #[test]
    fn test_parse_then_serialize_preserves_order() {
        let block = Block::new("my.block", [("zeta", "1"), ("alpha", "2"), ("Mid", "three")]).unwrap();
        let text = serialize(&block);
        let parsed = parse_blocks(&text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name(), "my.block");
        let names: Vec<_> = parsed[0].items().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "Mid"]);
        assert_eq!(serialize(&parsed[0]), text);
    }

    #[test]
    fn test_parse_message_blocks() {
        let header = build_header("class", "FF.1234:00", "v.d.i", &Routing::default());
        let body = Block::new("block", [("key", "value")]).unwrap();
        let mut msg = Message::new(header, body).unwrap();
        msg.push(Block::new("block2", [("key", "value2")]).unwrap());

        let blocks = parse_blocks(&serialize(&msg));
        let names: Vec<_> = blocks.iter().map(|b| b.name()).collect();
        assert_eq!(names, ["xap-header", "block", "block2"]);
        assert_eq!(blocks[2].value("key"), Some("value2"));
    }

    #[test]
    fn test_hex_value_binds_to_its_own_item() {
        let blocks = parse_blocks("block\n{\nfirst=plain\ndata!0A0bFF\nlast=x\n}\n");
        let block = &blocks[0];
        assert_eq!(block.raw_bytes("data"), Some(&[0x0a, 0x0b, 0xff][..]));
        assert_eq!(block.value("data"), Some("0A0bFF"));
        assert_eq!(block.raw_bytes("first"), None);
        assert_eq!(block.raw_bytes("last"), None);
    }

    #[test]
    fn test_invalid_hex_keeps_text_only() {
        let text = "block\n{\ndata!XYZ\n}\n";
        let blocks = parse_blocks(text);
        assert_eq!(blocks[0].value("data"), Some("XYZ"));
        assert_eq!(blocks[0].raw_bytes("data"), None);
        assert!(blocks[0].item("data").unwrap().hex);
        assert_eq!(serialize(&blocks[0]), text);
    }

    #[test]
    fn test_garbage_yields_no_blocks() {
        assert!(parse_blocks("").is_empty());
        assert!(parse_blocks("hello world").is_empty());
        assert!(parse_blocks("block\n{\nkey=value\n").is_empty());
        assert!(parse_blocks("{\n}\n").is_empty());
    }

    #[test]
    fn test_block_names_may_contain_spaces() {
        let blocks = parse_blocks("input.state 1\n{\nstate=on\n}\n");
        assert_eq!(blocks[0].name(), "input.state 1");
    }

    #[test]
    fn test_repeated_key_keeps_first() {
        let blocks = parse_blocks("block\n{\nkey=one\nKEY=two\n}\n");
        assert_eq!(blocks[0].len(), 1);
        assert_eq!(blocks[0].value("key"), Some("one"));
    }

    #[test]
    fn test_heartbeat_text_roundtrip() {
        let hb = build_heartbeat(HeartbeatClass::Alive, "FF.12345678:0000", "v.d.i", 60, None);
        let text = serialize(&hb);
        let parsed = parse_blocks(&text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(serialize(&parsed[0]), text);
    }
}
