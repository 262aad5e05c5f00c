// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Capacity-bounded metadata record and its flat byte image.
//!
//! Byte image layout (all integers little-endian):
//!
//! ```text
//! header   magic u32 | version u32 | size u32 | entry_count u32
//!          entry_capacity u32 | data_size u32 | data_capacity u32
//! entries  tag u32 | type u8 | pad [u8; 3] | count u32 | offset u32   (x entry_count)
//! data     payloads, concatenated in entry order
//! ```

use crate::core::error::{PipelineError, Result};
use crate::core::types::StreamId;

use super::tags::{MetadataTag, MetadataType, MetadataValue};

const MAGIC: u32 = u32::from_le_bytes(*b"CMDR");
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 7 * 4;
const ENTRY_SIZE: usize = 16;

/// One tag/value pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub tag: MetadataTag,
    pub value: MetadataValue,
}

/// Ordered tag → value set with fixed entry and payload ceilings.
///
/// Writes that would exceed either ceiling fail and leave the record untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    entry_capacity: usize,
    data_capacity: usize,
    data_size: usize,
    entries: Vec<MetadataEntry>,
}

impl MetadataRecord {
    pub fn new(entry_capacity: usize, data_capacity: usize) -> Self {
        Self {
            entry_capacity,
            data_capacity,
            data_size: 0,
            entries: Vec::with_capacity(entry_capacity.min(64)),
        }
    }

    /// Record addressed to `stream_id`, with the stream id already tagged.
    pub fn for_stream(
        stream_id: StreamId,
        entry_capacity: usize,
        data_capacity: usize,
    ) -> Result<Self> {
        let mut record = Self::new(entry_capacity, data_capacity);
        record.add_entry(MetadataTag::StreamId, MetadataValue::I32(vec![stream_id.get()]))?;
        Ok(record)
    }

    pub fn entry_capacity(&self) -> usize {
        self.entry_capacity
    }

    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    /// Payload bytes in use.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.entries.iter()
    }

    pub fn find(&self, tag: MetadataTag) -> Option<&MetadataValue> {
        self.entries.iter().find(|e| e.tag == tag).map(|e| &e.value)
    }

    pub fn contains(&self, tag: MetadataTag) -> bool {
        self.find(tag).is_some()
    }

    /// Stream id carried in the [`MetadataTag::StreamId`] entry, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.find(MetadataTag::StreamId)
            .and_then(MetadataValue::as_i32)
            .and_then(|ids| ids.first().copied())
            .map(StreamId)
    }

    /// Append a new entry.
    pub fn add_entry(&mut self, tag: MetadataTag, value: MetadataValue) -> Result<()> {
        check_value(tag, &value)?;

        if self.contains(tag) {
            return Err(PipelineError::InvalidMetadata(format!(
                "tag {} already present",
                tag
            )));
        }
        if self.entries.len() >= self.entry_capacity {
            return Err(PipelineError::CapacityExceeded(format!(
                "entry capacity {} reached while adding {}",
                self.entry_capacity, tag
            )));
        }
        let needed = value.byte_len();
        if self.data_size + needed > self.data_capacity {
            return Err(PipelineError::CapacityExceeded(format!(
                "{} needs {} bytes, {} of {} left",
                tag,
                needed,
                self.data_capacity - self.data_size,
                self.data_capacity
            )));
        }

        self.data_size += needed;
        self.entries.push(MetadataEntry { tag, value });
        Ok(())
    }

    /// Replace the value of an existing entry.
    pub fn update_entry(&mut self, tag: MetadataTag, value: MetadataValue) -> Result<()> {
        check_value(tag, &value)?;

        let position = self
            .entries
            .iter()
            .position(|e| e.tag == tag)
            .ok_or_else(|| PipelineError::NotFound(format!("metadata tag {}", tag)))?;

        let old = self.entries[position].value.byte_len();
        let new_size = self.data_size - old + value.byte_len();
        if new_size > self.data_capacity {
            return Err(PipelineError::CapacityExceeded(format!(
                "updating {} needs {} bytes total, capacity is {}",
                tag, new_size, self.data_capacity
            )));
        }

        self.data_size = new_size;
        self.entries[position].value = value;
        Ok(())
    }

    /// Add the entry, or update it if the tag is already present.
    pub fn set_entry(&mut self, tag: MetadataTag, value: MetadataValue) -> Result<()> {
        if self.contains(tag) {
            self.update_entry(tag, value)
        } else {
            self.add_entry(tag, value)
        }
    }

    /// Size of the byte image produced by [`to_bytes`](Self::to_bytes).
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + self.entries.len() * ENTRY_SIZE + self.data_size
    }

    /// Serialize into the flat byte image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.serialized_size();
        let mut out = Vec::with_capacity(size);

        for word in [
            MAGIC,
            VERSION,
            size as u32,
            self.entries.len() as u32,
            self.entry_capacity as u32,
            self.data_size as u32,
            self.data_capacity as u32,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }

        let mut offset = 0u32;
        for entry in &self.entries {
            out.extend_from_slice(&entry.tag.code().to_le_bytes());
            out.push(entry.value.value_type() as u8);
            out.extend_from_slice(&[0u8; 3]);
            out.extend_from_slice(&(entry.value.count() as u32).to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            offset += entry.value.byte_len() as u32;
        }

        for entry in &self.entries {
            entry.value.write_le(&mut out);
        }

        debug_assert_eq!(out.len(), size);
        out
    }

    /// Parse a byte image. Trailing bytes after the declared size are ignored,
    /// so a record can be read straight out of a larger buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let word = |index: usize| -> Result<u32> {
            let start = index * 4;
            bytes
                .get(start..start + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| PipelineError::InvalidMetadata("truncated header".into()))
        };

        if word(0)? != MAGIC {
            return Err(PipelineError::InvalidMetadata("bad magic".into()));
        }
        let version = word(1)?;
        if version != VERSION {
            return Err(PipelineError::InvalidMetadata(format!(
                "unsupported version {}",
                version
            )));
        }
        let size = word(2)? as usize;
        let entry_count = word(3)? as usize;
        let entry_capacity = word(4)? as usize;
        let data_size = word(5)? as usize;
        let data_capacity = word(6)? as usize;

        let data_start = HEADER_SIZE + entry_count * ENTRY_SIZE;
        if size != data_start + data_size || bytes.len() < size {
            return Err(PipelineError::InvalidMetadata(format!(
                "declared size {} does not match layout ({} available)",
                size,
                bytes.len()
            )));
        }
        let data = &bytes[data_start..size];

        let mut record = Self::new(entry_capacity, data_capacity);
        for index in 0..entry_count {
            let at = HEADER_SIZE + index * ENTRY_SIZE;
            let raw = &bytes[at..at + ENTRY_SIZE];
            let tag = MetadataTag::from_code(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))?;
            let value_type = MetadataType::from_code(raw[4]).ok_or_else(|| {
                PipelineError::InvalidMetadata(format!("unknown value type {}", raw[4]))
            })?;
            let count = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
            let offset = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]) as usize;

            let len = count * value_type.element_size();
            let payload = data.get(offset..offset + len).ok_or_else(|| {
                PipelineError::InvalidMetadata(format!("payload of {} out of bounds", tag))
            })?;
            record.add_entry(tag, MetadataValue::read_le(value_type, payload))?;
        }

        Ok(record)
    }
}

fn check_value(tag: MetadataTag, value: &MetadataValue) -> Result<()> {
    if value.value_type() != tag.value_type() {
        return Err(PipelineError::TypeMismatch(format!(
            "{} expects {:?}, got {:?}",
            tag,
            tag.value_type(),
            value.value_type()
        )));
    }
    if value.count() == 0 {
        return Err(PipelineError::InvalidMetadata(format!(
            "empty value for {}",
            tag
        )));
    }
    Ok(())
}
