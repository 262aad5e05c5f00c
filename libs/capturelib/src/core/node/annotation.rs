// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Stamps a face-statistics metadata record into every passing buffer.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::base::{DeliveryOutcome, NodeBase};
use super::state::LifecycleOp;
use super::{Node, NodeContext, NodeSpec};
use crate::core::buffer::BufferHandle;
use crate::core::error::{PipelineError, Result};
use crate::core::metadata::{MetadataRecord, MetadataTag, MetadataValue};
use crate::core::types::StreamId;

/// Face detection mode written into the record: simple detection.
const FACE_DETECT_MODE_SIMPLE: u8 = 1;

const FACE_RECTANGLES: [[f32; 4]; 3] = [
    [0.0, 0.0, 0.2, 0.3],
    [0.3, 0.3, 0.2, 0.3],
    [0.6, 0.6, 0.2, 0.3],
];

const FACE_IDS: [i32; 3] = [0, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceAnnotationConfig {
    pub entry_capacity: usize,
    pub data_capacity: usize,
}

impl Default for FaceAnnotationConfig {
    fn default() -> Self {
        Self {
            entry_capacity: 30,
            data_capacity: 2000,
        }
    }
}

/// Published record and its byte image, swapped as one unit.
#[derive(Debug)]
struct Published {
    record: Arc<MetadataRecord>,
    bytes: Arc<[u8]>,
}

pub struct FaceAnnotationNode {
    base: NodeBase,
    config: FaceAnnotationConfig,
    published: RwLock<Option<Published>>,
}

impl FaceAnnotationNode {
    pub const TYPE_NAME: &'static str = "face_annotation";

    pub fn new(spec: &NodeSpec, ctx: &NodeContext, config: FaceAnnotationConfig) -> Arc<Self> {
        let camera_id = spec.camera_id.clone().unwrap_or_else(|| ctx.camera_id.clone());
        Arc::new(Self {
            base: NodeBase::new(ctx.id, spec.name.clone(), Self::TYPE_NAME, camera_id),
            config,
            published: RwLock::new(None),
        })
    }

    pub fn create(spec: &NodeSpec, ctx: &NodeContext) -> Result<Arc<dyn Node>> {
        let config: FaceAnnotationConfig = spec.parse_config()?;
        Ok(Self::new(spec, ctx, config))
    }

    /// The record stamped into buffers, if the node has been started and at
    /// least one of its streams is still active.
    pub fn metadata(&self) -> Option<Arc<MetadataRecord>> {
        self.published.read().as_ref().map(|p| Arc::clone(&p.record))
    }

    /// Serialized size of the published record, 0 when stopped.
    pub fn metadata_size(&self) -> usize {
        self.published.read().as_ref().map_or(0, |p| p.bytes.len())
    }

    fn build_record(&self) -> Result<MetadataRecord> {
        let mut record = MetadataRecord::new(self.config.entry_capacity, self.config.data_capacity);
        record.add_entry(
            MetadataTag::FaceDetectSwitch,
            MetadataValue::U8(vec![FACE_DETECT_MODE_SIMPLE]),
        )?;
        record.add_entry(
            MetadataTag::FaceRectangles,
            MetadataValue::F32(FACE_RECTANGLES.iter().flatten().copied().collect()),
        )?;
        record.add_entry(MetadataTag::FaceIds, MetadataValue::I32(FACE_IDS.to_vec()))?;
        Ok(record)
    }

    /// Write the published record over the start of `buffer`.
    pub fn overlay(&self, buffer: &BufferHandle) -> Result<()> {
        let bytes = self
            .published
            .read()
            .as_ref()
            .map(|p| Arc::clone(&p.bytes))
            .ok_or(PipelineError::MetadataUnavailable(buffer.stream_id()))?;

        copy_metadata(&bytes, buffer)
    }
}

/// Zero the whole buffer, copy `bytes` to its start and mark them valid.
fn copy_metadata(bytes: &[u8], buffer: &BufferHandle) -> Result<()> {
    let capacity = buffer.size();
    if capacity < bytes.len() {
        return Err(PipelineError::BufferTooSmall {
            needed: bytes.len(),
            capacity,
        });
    }

    let mut copied = false;
    buffer.with_memory_mut(&mut |memory| {
        if memory.len() < bytes.len() {
            return;
        }
        memory.fill(0);
        memory[..bytes.len()].copy_from_slice(bytes);
        copied = true;
    })?;

    if !copied {
        return Err(PipelineError::InvalidBuffer(format!(
            "backing memory of stream {} is smaller than its reported size {}",
            buffer.stream_id(),
            capacity
        )));
    }
    buffer.set_valid_frame_size(bytes.len())
}

impl Node for FaceAnnotationNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn start(&self, stream_id: StreamId) -> Result<()> {
        self.base.run_lifecycle(LifecycleOp::Start, stream_id, || {
            let record = self.build_record()?;
            let bytes: Arc<[u8]> = record.to_bytes().into();
            tracing::info!(
                "[{}] face metadata ready: {} entries, {} bytes",
                self.base.name(),
                record.len(),
                bytes.len()
            );
            *self.published.write() = Some(Published {
                record: Arc::new(record),
                bytes,
            });
            Ok(())
        })
    }

    fn stop(&self, stream_id: StreamId) -> Result<()> {
        self.base.run_lifecycle(LifecycleOp::Stop, stream_id, || {
            // One record serves every stream routed through this node.
            if self.base.is_last_active_stream(stream_id) {
                self.published.write().take();
            } else {
                tracing::debug!(
                    "[{}] stream {} stopped, record kept for {:?}",
                    self.base.name(),
                    stream_id,
                    self.base.active_streams()
                );
            }
            Ok(())
        })
    }

    fn route_buffer(&self, buffer: BufferHandle) -> DeliveryOutcome {
        self.base.route_buffer(buffer, |b| self.overlay(b))
    }
}
