// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Identifiers and format descriptors shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a logical stream flowing through the graph.
///
/// Every buffer and every port is bound to exactly one stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub i32);

impl StreamId {
    /// Reserved stream id used to route device-control metadata, never image data.
    pub const DEVICE_CONTROL: StreamId = StreamId(0);

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for StreamId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// Identifier of the physical camera a node is associated with.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CameraId {
    fn default() -> Self {
        Self::new("camera_first")
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of a node in the graph's node table.
///
/// Ports refer back to their owner through this index rather than through a
/// shared pointer, so nodes and ports never form ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel layouts negotiated between ports and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Nv12,
    Yuyv,
    Rgba8,
    Bgra8,
    Jpeg,
}

impl PixelFormat {
    /// V4L2 fourcc code for this layout.
    pub fn fourcc(self) -> u32 {
        let code = match self {
            Self::Nv12 => b"NV12",
            Self::Yuyv => b"YUYV",
            Self::Rgba8 => b"AB24",
            Self::Bgra8 => b"AR24",
            Self::Jpeg => b"JPEG",
        };
        u32::from_le_bytes(*code)
    }

    /// Bytes needed to hold one uncompressed frame.
    ///
    /// JPEG is sized as a worst case of one byte per pixel.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Nv12 => pixels * 3 / 2,
            Self::Yuyv => pixels * 2,
            Self::Rgba8 | Self::Bgra8 => pixels * 4,
            Self::Jpeg => pixels,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nv12 => write!(f, "NV12"),
            Self::Yuyv => write!(f, "YUYV"),
            Self::Rgba8 => write!(f, "RGBA8"),
            Self::Bgra8 => write!(f, "BGRA8"),
            Self::Jpeg => write!(f, "JPEG"),
        }
    }
}

/// Format bound to a port: which stream it carries and how its buffers look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortFormat {
    pub stream_id: StreamId,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
}

impl PortFormat {
    pub fn new(stream_id: StreamId, width: u32, height: u32, buffer_count: u32) -> Self {
        Self {
            stream_id,
            width,
            height,
            pixel_format: PixelFormat::default(),
            buffer_count,
        }
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Descriptor handed to the device when this port starts capturing.
    pub fn device_format(&self) -> DeviceFormat {
        DeviceFormat {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Capture format requested from a device controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}
