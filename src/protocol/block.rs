//! Message blocks
//!
//! A block is a named, ordered list of key/value items. Item names are unique
//! ignoring case. Header and heartbeat blocks are ordinary blocks tagged with
//! a [`BlockKind`] that fixes the order their items are written in.

use std::fmt::{self, Display, Write};
use thiserror::Error;

use super::{HEADER_ITEM_NAMES, HEARTBEAT_ITEM_NAMES};

/// Block construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block name must not be empty")]
    EmptyName,

    #[error("Duplicate key in block: {0}")]
    DuplicateKey(String),
}

pub type BlockResult<T> = Result<T, BlockError>;

/// Selects how a block is serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    /// Items are written in insertion order
    #[default]
    Generic,
    /// Canonical header items first, then any extras in insertion order
    Header,
    /// Only the canonical heartbeat items, in canonical order
    Heartbeat,
}

/// A single `key=value` line of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockItem {
    pub name: String,
    pub value: String,
    /// Written with the `!` separator
    pub hex: bool,
    /// Decoded bytes for `key!hexvalue` items whose value is valid hex
    pub raw_bytes: Option<Vec<u8>>,
}

impl BlockItem {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            hex: false,
            raw_bytes: None,
        }
    }

    fn write_line(&self, out: &mut String) {
        let sep = if self.hex { '!' } else { '=' };
        let _ = writeln!(out, "{}{}{}", self.name, sep, self.value);
    }
}

/// A named collection of items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    name: String,
    kind: BlockKind,
    items: Vec<BlockItem>,
}

impl Block {
    /// Create a generic block from `(key, value)` pairs, keeping their order.
    ///
    /// Values may be anything printable, so numbers and strings mix freely:
    ///
    /// ```
    /// use xapnet::protocol::Block;
    /// let block = Block::new("my.block", [("text", "hello".to_string()), ("count", 3.to_string())]).unwrap();
    /// assert_eq!(block.value("COUNT"), Some("3"));
    /// ```
    pub fn new<I, K, V>(name: impl Into<String>, content: I) -> BlockResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Display,
    {
        let mut block = Self::empty(name, BlockKind::Generic)?;
        for (key, value) in content {
            block.add(key, value)?;
        }
        Ok(block)
    }

    /// Create a block with no items
    pub fn empty(name: impl Into<String>, kind: BlockKind) -> BlockResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BlockError::EmptyName);
        }
        Ok(Self {
            name,
            kind,
            items: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Items in storage order
    pub fn items(&self) -> &[BlockItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an item; fails if a key differing only in case already exists
    pub fn add(&mut self, key: impl Into<String>, value: impl Display) -> BlockResult<()> {
        self.push_item(BlockItem::new(key, value.to_string()))
    }

    /// Append an item carrying raw bytes, written as `key!HEX`
    pub fn add_hex(&mut self, key: impl Into<String>, bytes: &[u8]) -> BlockResult<()> {
        self.push_item(BlockItem {
            name: key.into(),
            value: hex::encode_upper(bytes),
            hex: true,
            raw_bytes: Some(bytes.to_vec()),
        })
    }

    pub(crate) fn push_item(&mut self, item: BlockItem) -> BlockResult<()> {
        if self.item(&item.name).is_some() {
            return Err(BlockError::DuplicateKey(item.name));
        }
        self.items.push(item);
        Ok(())
    }

    /// Case-insensitive item lookup
    pub fn item(&self, key: &str) -> Option<&BlockItem> {
        self.items.iter().find(|i| i.name.eq_ignore_ascii_case(key))
    }

    /// Case-insensitive value lookup
    pub fn value(&self, key: &str) -> Option<&str> {
        self.item(key).map(|i| i.value.as_str())
    }

    /// Case-insensitive lookup of the decoded bytes of a `key!hex` item
    pub fn raw_bytes(&self, key: &str) -> Option<&[u8]> {
        self.item(key).and_then(|i| i.raw_bytes.as_deref())
    }

    /// Append the wire form of this block to `out`
    pub fn write_wire(&self, out: &mut String) {
        out.push_str(&self.name);
        out.push_str("\n{\n");
        match self.kind {
            BlockKind::Generic => {
                for item in &self.items {
                    item.write_line(out);
                }
            }
            BlockKind::Header => {
                for name in HEADER_ITEM_NAMES {
                    if let Some(item) = self.item(name) {
                        item.write_line(out);
                    }
                }
                let extras = self.items.iter().filter(|i| {
                    !HEADER_ITEM_NAMES
                        .iter()
                        .any(|n| n.eq_ignore_ascii_case(&i.name))
                });
                for item in extras {
                    item.write_line(out);
                }
            }
            BlockKind::Heartbeat => {
                for name in HEARTBEAT_ITEM_NAMES {
                    if let Some(item) = self.item(name) {
                        item.write_line(out);
                    }
                }
            }
        }
        out.push_str("}\n");
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write_wire(&mut s);
        f.write_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_keeps_item_order() {
        let block = Block::new("block", [("key1", "value1"), ("key2", "value2"), ("key3", "value3")]).unwrap();
        assert_eq!(block.len(), 3);
        assert_eq!(
            block.to_string(),
            "block\n{\nkey1=value1\nkey2=value2\nkey3=value3\n}\n"
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = Block::new("", [("key", "value")]);
        assert_eq!(result.unwrap_err(), BlockError::EmptyName);
    }

    #[test]
    fn test_numeric_values_are_stringified() {
        let mut block = Block::new("block", [("num", 2001)]).unwrap();
        block.add("other", 1.5).unwrap();
        assert_eq!(block.value("num"), Some("2001"));
        assert_eq!(block.value("other"), Some("1.5"));
    }

    #[test]
    fn test_value_lookup_ignores_case() {
        let block = Block::new("block", [("key", "value")]).unwrap();
        assert_eq!(block.value("KeY"), Some("value"));
        assert_eq!(block.value("missing"), None);
    }

    #[test]
    fn test_add_rejects_duplicates_ignoring_case() {
        let mut block = Block::new("block", [("key1", "value1")]).unwrap();
        block.add("key2", "value2").unwrap();
        assert_eq!(
            block.add("kEY1", "value3").unwrap_err(),
            BlockError::DuplicateKey("kEY1".to_string())
        );
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_new_rejects_duplicates_in_content() {
        let result = Block::new("block", [("Key", "a"), ("key", "b")]);
        assert!(matches!(result, Err(BlockError::DuplicateKey(_))));
    }

    #[test]
    fn test_hex_item_written_with_bang() {
        let mut block = Block::new("block", [("plain", "x")]).unwrap();
        block.add_hex("data", &[0x01, 0xab, 0xff]).unwrap();
        assert_eq!(block.raw_bytes("DATA"), Some(&[0x01, 0xab, 0xff][..]));
        assert_eq!(block.to_string(), "block\n{\nplain=x\ndata!01ABFF\n}\n");
    }

    #[test]
    fn test_heartbeat_kind_uses_canonical_order() {
        let mut block = Block::empty("xap-hbeat", BlockKind::Heartbeat).unwrap();
        for (k, v) in [
            ("pid", "42"),
            ("interval", "60"),
            ("source", "a.b.c"),
            ("class", "xap-hbeat.alive"),
            ("uid", "FF123400"),
            ("hop", "1"),
            ("v", "12"),
            ("junk", "dropped"),
        ] {
            block.add(k, v).unwrap();
        }
        assert_eq!(
            block.to_string(),
            "xap-hbeat\n{\nv=12\nhop=1\nuid=FF123400\nclass=xap-hbeat.alive\nsource=a.b.c\ninterval=60\npid=42\n}\n"
        );
    }

    #[test]
    fn test_header_kind_keeps_extra_items() {
        let mut block = Block::empty("xap-header", BlockKind::Header).unwrap();
        block.add("extra", "1").unwrap();
        block.add("source", "a.b.c").unwrap();
        block.add("v", "13").unwrap();
        assert_eq!(block.to_string(), "xap-header\n{\nv=13\nsource=a.b.c\nextra=1\n}\n");
    }
}
