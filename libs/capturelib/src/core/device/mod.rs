// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device controller boundary.
//!
//! A [`DeviceController`] is the handle a source node uses to drive capture
//! hardware. Hardware-specific implementations live outside this crate;
//! [`VirtualCamera`] is a software device used by the runtime and tests.

mod virtual_camera;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub use virtual_camera::{VirtualCamera, VirtualCameraConfig};

use super::buffer::FrameSpec;
use super::error::{PipelineError, Result};
use super::metadata::MetadataRecord;
use super::types::{CameraId, DeviceFormat, StreamId};

/// Called by the device, on a device-owned thread, for every completed frame.
pub type FrameCallback = Arc<dyn Fn(FrameSpec) + Send + Sync>;

pub trait DeviceController: Send + Sync {
    /// Begin capturing with `buffer_count` buffers in `format`.
    fn start(&self, buffer_count: u32, format: &DeviceFormat) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Discard in-flight buffers for `stream_id`.
    fn flush(&self, stream_id: StreamId) -> Result<()>;

    /// Apply a device-control metadata record.
    fn configure(&self, metadata: &Arc<MetadataRecord>) -> Result<()>;

    /// Queue an empty frame for the next hardware capture.
    fn send_frame_buffer(&self, frame: FrameSpec) -> Result<()>;

    /// Replace the frame-completion callback.
    fn set_node_callback(&self, callback: FrameCallback);
}

/// Resolves camera ids to device controllers.
pub trait DeviceManager: Send + Sync {
    fn controller(&self, camera_id: &CameraId) -> Result<Arc<dyn DeviceController>>;
}

/// Device manager backed by a fixed table.
#[derive(Default)]
pub struct StaticDeviceManager {
    devices: RwLock<HashMap<CameraId, Arc<dyn DeviceController>>>,
}

impl StaticDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, camera_id: CameraId, device: Arc<dyn DeviceController>) -> Self {
        self.insert(camera_id, device);
        self
    }

    /// Register or replace the controller for `camera_id`.
    pub fn insert(&self, camera_id: CameraId, device: Arc<dyn DeviceController>) {
        if self.devices.write().insert(camera_id.clone(), device).is_some() {
            tracing::debug!("[devices] controller for {} replaced", camera_id);
        }
    }

    pub fn remove(&self, camera_id: &CameraId) -> Option<Arc<dyn DeviceController>> {
        self.devices.write().remove(camera_id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl DeviceManager for StaticDeviceManager {
    fn controller(&self, camera_id: &CameraId) -> Result<Arc<dyn DeviceController>> {
        self.devices
            .read()
            .get(camera_id)
            .cloned()
            .ok_or_else(|| {
                PipelineError::DeviceUnavailable(format!("no controller for camera '{}'", camera_id))
            })
    }
}
