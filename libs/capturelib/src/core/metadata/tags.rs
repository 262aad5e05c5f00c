// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::{PipelineError, Result};

/// Element type of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MetadataType {
    U8 = 0,
    I32 = 1,
    I64 = 2,
    F32 = 3,
    F64 = 4,
}

impl MetadataType {
    pub fn element_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::U8),
            1 => Some(Self::I32),
            2 => Some(Self::I64),
            3 => Some(Self::F32),
            4 => Some(Self::F64),
            _ => None,
        }
    }
}

/// Keys a metadata record may carry. Each tag has one fixed element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum MetadataTag {
    /// Stream the record is addressed to. [`StreamId::DEVICE_CONTROL`](crate::core::StreamId::DEVICE_CONTROL)
    /// marks device reconfiguration requests.
    StreamId = 0x0001_0000,

    // Device controls
    ExposureMode = 0x0002_0000,
    ExposureCompensation = 0x0002_0001,
    ExposureTime = 0x0002_0002,
    FocusMode = 0x0002_0003,
    AwbMode = 0x0002_0004,
    FpsRange = 0x0002_0005,
    ZoomRatio = 0x0002_0006,
    JpegOrientation = 0x0002_0007,
    JpegQuality = 0x0002_0008,

    // Statistics
    FaceDetectSwitch = 0x0003_0000,
    FaceRectangles = 0x0003_0001,
    FaceIds = 0x0003_0002,
}

impl MetadataTag {
    pub const ALL: [MetadataTag; 13] = [
        Self::StreamId,
        Self::ExposureMode,
        Self::ExposureCompensation,
        Self::ExposureTime,
        Self::FocusMode,
        Self::AwbMode,
        Self::FpsRange,
        Self::ZoomRatio,
        Self::JpegOrientation,
        Self::JpegQuality,
        Self::FaceDetectSwitch,
        Self::FaceRectangles,
        Self::FaceIds,
    ];

    pub fn value_type(self) -> MetadataType {
        match self {
            Self::StreamId
            | Self::ExposureCompensation
            | Self::FpsRange
            | Self::JpegOrientation
            | Self::FaceIds => MetadataType::I32,
            Self::ExposureMode
            | Self::FocusMode
            | Self::AwbMode
            | Self::JpegQuality
            | Self::FaceDetectSwitch => MetadataType::U8,
            Self::ExposureTime => MetadataType::I64,
            Self::ZoomRatio | Self::FaceRectangles => MetadataType::F32,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.code() == code)
            .ok_or_else(|| PipelineError::InvalidMetadata(format!("unknown tag 0x{:08x}", code)))
    }
}

impl fmt::Display for MetadataTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Typed payload stored under a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataValue {
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl MetadataValue {
    pub fn value_type(&self) -> MetadataType {
        match self {
            Self::U8(_) => MetadataType::U8,
            Self::I32(_) => MetadataType::I32,
            Self::I64(_) => MetadataType::I64,
            Self::F32(_) => MetadataType::F32,
            Self::F64(_) => MetadataType::F64,
        }
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.count() * self.value_type().element_size()
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Self::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            Self::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn write_le(&self, out: &mut Vec<u8>) {
        match self {
            Self::U8(v) => out.extend_from_slice(v),
            Self::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Self::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
    }

    pub(crate) fn read_le(value_type: MetadataType, bytes: &[u8]) -> Self {
        match value_type {
            MetadataType::U8 => Self::U8(bytes.to_vec()),
            MetadataType::I32 => Self::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            MetadataType::F32 => Self::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            MetadataType::I64 => Self::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
                    .collect(),
            ),
            MetadataType::F64 => Self::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_codes_are_unique() {
        for (i, a) in MetadataTag::ALL.iter().enumerate() {
            for b in &MetadataTag::ALL[i + 1..] {
                assert_ne!(a.code(), b.code(), "{} and {} share a code", a, b);
            }
        }
    }

    #[test]
    fn test_unknown_tag_code_rejected() {
        assert!(MetadataTag::from_code(0xdead_beef).is_err());
        assert_eq!(
            MetadataTag::from_code(0x0003_0002).unwrap(),
            MetadataTag::FaceIds
        );
    }

    #[test]
    fn test_byte_len_uses_element_size() {
        assert_eq!(MetadataValue::F32(vec![0.0; 12]).byte_len(), 48);
        assert_eq!(MetadataValue::U8(vec![1]).byte_len(), 1);
        assert_eq!(MetadataValue::I64(vec![1, 2]).byte_len(), 16);
    }
}
