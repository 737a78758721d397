//! `MESSAGE_RESOURCE_DATA` parsing.
//!
//! ```text
//! MESSAGE_RESOURCE_DATA   u32 NumberOfBlocks, then NumberOfBlocks x MESSAGE_RESOURCE_BLOCK
//! MESSAGE_RESOURCE_BLOCK  u32 LowId, u32 HighId, u32 OffsetToEntries
//! MESSAGE_RESOURCE_ENTRY  u16 Length, u16 Flags, text (NUL padded to a multiple of 4)
//! ```
//!
//! Entries of one block are stored back-to-back, one per id in `LowId..=HighId`.

use crate::err::MessageFileError;
use crate::message::pe::extract_message_table_resources;
use crate::utils::{bytes, decode_utf16le_bytes_z};

use encoding::{DecoderTrap, Encoding, EncodingRef};
use hashbrown::HashMap;
use log::{debug, trace};

use std::collections::BTreeMap;

/// Language-neutral id, used for raw `.bin` tables.
pub const LANG_NEUTRAL: u32 = 0;
/// en-US.
pub const LANG_EN_US: u32 = 0x0409;

const MESSAGE_RESOURCE_ANSI: u16 = 0x0000;
const MESSAGE_RESOURCE_UNICODE: u16 = 0x0001;
const MESSAGE_RESOURCE_UTF8: u16 = 0x0002;

const BLOCK_SIZE: usize = 12;
const ENTRY_HEADER_SIZE: usize = 4;

fn malformed(message: impl Into<String>) -> MessageFileError {
    MessageFileError::MalformedTable {
        message: message.into(),
    }
}

/// All message tables of one message file, keyed by language id.
#[derive(Debug, Clone, Default)]
pub struct MessageTable {
    languages: HashMap<u32, HashMap<u32, String>>,
}

impl MessageTable {
    /// Parse a message file: either a PE image carrying `RT_MESSAGETABLE` resources, or a raw
    /// `MESSAGE_RESOURCE_DATA` blob (registered as language neutral).
    pub fn from_bytes(data: &[u8], ansi_codec: EncodingRef) -> Result<MessageTable, MessageFileError> {
        let mut table = MessageTable::default();

        if data.starts_with(b"MZ") {
            for resource in extract_message_table_resources(data)? {
                trace!(
                    "message table resource {} for language 0x{:04x} ({} bytes)",
                    resource.resource_id,
                    resource.lang_id,
                    resource.data.len()
                );
                let messages = parse_message_resource_data(&resource.data, ansi_codec)?;
                table
                    .languages
                    .entry(resource.lang_id)
                    .or_default()
                    .extend(messages);
            }
        } else {
            let messages = parse_message_resource_data(data, ansi_codec)?;
            table.languages.insert(LANG_NEUTRAL, messages);
        }

        debug!(
            "loaded {} messages in {} languages",
            table.len(),
            table.languages.len()
        );
        Ok(table)
    }

    /// Look up `message_id`, falling back from `language` to the neutral language, then to
    /// en-US, then to any language that has it.
    pub fn lookup(&self, message_id: u32, language: u32) -> Option<&str> {
        for lang in [language, LANG_NEUTRAL, LANG_EN_US] {
            if let Some(text) = self
                .languages
                .get(&lang)
                .and_then(|messages| messages.get(&message_id))
            {
                return Some(text.as_str());
            }
        }

        let mut languages: Vec<&u32> = self.languages.keys().collect();
        languages.sort_unstable();
        languages
            .into_iter()
            .find_map(|lang| self.languages[lang].get(&message_id))
            .map(String::as_str)
    }

    pub fn languages(&self) -> impl Iterator<Item = u32> + '_ {
        self.languages.keys().copied()
    }

    /// Total number of messages over all languages.
    pub fn len(&self) -> usize {
        self.languages.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse one `MESSAGE_RESOURCE_DATA` blob into `message id -> text`.
pub fn parse_message_resource_data(
    data: &[u8],
    ansi_codec: EncodingRef,
) -> Result<HashMap<u32, String>, MessageFileError> {
    let block_count = bytes::read_u32_le(data, 0)
        .ok_or_else(|| malformed("missing block count"))? as usize;
    let blocks_end = block_count
        .checked_mul(BLOCK_SIZE)
        .and_then(|n| n.checked_add(4))
        .filter(|end| *end <= data.len())
        .ok_or_else(|| malformed(format!("{block_count} blocks do not fit in the table")))?;

    let mut messages = HashMap::new();

    for block_offset in (4..blocks_end).step_by(BLOCK_SIZE) {
        let read = |at: usize| {
            bytes::read_u32_le(data, block_offset + at)
                .ok_or_else(|| malformed(format!("block at {block_offset} out of bounds")))
        };
        let low_id = read(0)?;
        let high_id = read(4)?;
        let mut offset = read(8)? as usize;

        if high_id < low_id {
            return Err(malformed(format!(
                "block at {block_offset} has inverted range {low_id:#x}..={high_id:#x}"
            )));
        }

        for id in low_id..=high_id {
            let length = bytes::read_u16_le(data, offset)
                .ok_or_else(|| malformed(format!("entry {id:#x} out of bounds")))?
                as usize;
            let flags = bytes::read_u16_le(data, offset + 2)
                .ok_or_else(|| malformed(format!("entry {id:#x} out of bounds")))?;
            if length < ENTRY_HEADER_SIZE {
                return Err(malformed(format!("entry {id:#x} has invalid length {length}")));
            }
            let text = data
                .get(offset + ENTRY_HEADER_SIZE..offset + length)
                .ok_or_else(|| malformed(format!("entry {id:#x} text out of bounds")))?;

            messages.insert(id, decode_entry_text(id, flags, text, ansi_codec)?);
            offset += length;
        }
    }

    Ok(messages)
}

fn decode_entry_text(
    id: u32,
    flags: u16,
    text: &[u8],
    ansi_codec: EncodingRef,
) -> Result<String, MessageFileError> {
    match flags {
        MESSAGE_RESOURCE_UNICODE => {
            // Odd padding is tolerated; the terminator always comes first.
            let even = &text[..text.len() & !1];
            decode_utf16le_bytes_z(even)
                .map_err(|e| malformed(format!("entry {id:#x} is not valid UTF-16 ({e:?})")))
        }
        MESSAGE_RESOURCE_UTF8 => {
            let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
            String::from_utf8(text[..end].to_vec())
                .map_err(|e| malformed(format!("entry {id:#x} is not valid UTF-8 ({e})")))
        }
        MESSAGE_RESOURCE_ANSI => {
            let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
            ansi_codec
                .decode(&text[..end], DecoderTrap::Replace)
                .map_err(|e| malformed(format!("entry {id:#x} could not be decoded ({e})")))
        }
        other => Err(malformed(format!(
            "entry {id:#x} has unknown flags {other:#06x}"
        ))),
    }
}

/// Text encoding of the entries written by [`MessageTableBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEncoding {
    /// Latin-1 subset only; other characters are written as `?`.
    Ansi,
    Unicode,
    Utf8,
}

/// Builds raw `MESSAGE_RESOURCE_DATA` blobs, the format emitted by the message compiler.
#[derive(Debug, Clone)]
pub struct MessageTableBuilder {
    messages: BTreeMap<u32, String>,
    encoding: EntryEncoding,
}

impl Default for MessageTableBuilder {
    fn default() -> Self {
        MessageTableBuilder::new()
    }
}

impl MessageTableBuilder {
    pub fn new() -> Self {
        MessageTableBuilder {
            messages: BTreeMap::new(),
            encoding: EntryEncoding::Unicode,
        }
    }

    pub fn encoding(mut self, encoding: EntryEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn message(mut self, message_id: u32, text: impl Into<String>) -> Self {
        self.messages.insert(message_id, text.into());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // Consecutive ids share a block.
        let mut blocks: Vec<(u32, u32)> = Vec::new();
        for &id in self.messages.keys() {
            match blocks.last_mut() {
                Some((_, high)) if high.checked_add(1) == Some(id) => *high = id,
                _ => blocks.push((id, id)),
            }
        }

        let mut entries = Vec::new();
        let mut entry_offsets = Vec::with_capacity(blocks.len());
        let entries_start = 4 + blocks.len() * BLOCK_SIZE;

        for &(low, high) in &blocks {
            entry_offsets.push(entries_start + entries.len());
            for id in low..=high {
                let text = self.encode_text(&self.messages[&id]);
                let length = bytes::align4(ENTRY_HEADER_SIZE + text.len());
                let flags = match self.encoding {
                    EntryEncoding::Ansi => MESSAGE_RESOURCE_ANSI,
                    EntryEncoding::Unicode => MESSAGE_RESOURCE_UNICODE,
                    EntryEncoding::Utf8 => MESSAGE_RESOURCE_UTF8,
                };
                entries.extend_from_slice(&(length as u16).to_le_bytes());
                entries.extend_from_slice(&flags.to_le_bytes());
                entries.extend_from_slice(&text);
                entries.resize(entries.len() + length - ENTRY_HEADER_SIZE - text.len(), 0);
            }
        }

        let mut out = Vec::with_capacity(entries_start + entries.len());
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        for (&(low, high), &offset) in blocks.iter().zip(&entry_offsets) {
            out.extend_from_slice(&low.to_le_bytes());
            out.extend_from_slice(&high.to_le_bytes());
            out.extend_from_slice(&(offset as u32).to_le_bytes());
        }
        out.extend_from_slice(&entries);
        out
    }

    fn encode_text(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::new();
        match self.encoding {
            EntryEncoding::Ansi => {
                out.extend(text.chars().map(|c| u8::try_from(c).unwrap_or(b'?')));
                out.push(0);
            }
            EntryEncoding::Unicode => crate::utils::push_utf16le_z(&mut out, text),
            EntryEncoding::Utf8 => {
                out.extend_from_slice(text.as_bytes());
                out.push(0);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding::all::WINDOWS_1252;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_blocks_with_gaps() {
        let data = MessageTableBuilder::new()
            .message(1, "one\r\n")
            .message(2, "two\r\n")
            .message(0x4000_1b7c, "The %1 service entered the %2 state.\r\n")
            .build();

        let messages = parse_message_resource_data(&data, WINDOWS_1252).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[&2], "two\r\n");
        assert_eq!(
            messages[&0x4000_1b7c],
            "The %1 service entered the %2 state.\r\n"
        );
    }

    #[test]
    fn test_decodes_every_entry_encoding() {
        for encoding in [EntryEncoding::Ansi, EntryEncoding::Unicode, EntryEncoding::Utf8] {
            let data = MessageTableBuilder::new()
                .encoding(encoding)
                .message(10, "caf\u{e9} %1")
                .build();
            let table = MessageTable::from_bytes(&data, WINDOWS_1252).unwrap();
            assert_eq!(table.lookup(10, LANG_EN_US), Some("caf\u{e9} %1"), "{encoding:?}");
        }
    }

    #[test]
    fn test_rejects_entries_past_the_end() {
        let mut data = MessageTableBuilder::new().message(1, "hello").build();
        data.truncate(data.len() - 4);
        assert!(matches!(
            parse_message_resource_data(&data, WINDOWS_1252),
            Err(MessageFileError::MalformedTable { .. })
        ));

        assert!(parse_message_resource_data(&[0xff, 0xff, 0, 0], WINDOWS_1252).is_err());
    }

    #[test]
    fn test_language_fallback_order() {
        let mut table = MessageTable::default();
        table
            .languages
            .insert(0x0407, HashMap::from_iter([(1, "german".to_string())]));
        table
            .languages
            .insert(LANG_EN_US, HashMap::from_iter([(1, "english".to_string())]));
        table
            .languages
            .insert(0x040c, HashMap::from_iter([(2, "french".to_string())]));

        assert_eq!(table.lookup(1, 0x0407), Some("german"));
        assert_eq!(table.lookup(1, 0x0411), Some("english"));
        assert_eq!(table.lookup(2, 0x0407), Some("french"));
        assert_eq!(table.lookup(3, 0x0407), None);
    }
}
