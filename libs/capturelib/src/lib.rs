// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Node-based capture pipeline.
//!
//! A [`PipelineGraph`] owns a DAG of [`Node`]s. A [`SourceNode`] bridges a
//! [`DeviceController`] into the graph, transform nodes such as
//! [`FaceAnnotationNode`] rewrite buffers in place, and sinks hand buffers
//! back to their [`BufferPool`]. Device reconfiguration travels separately,
//! as [`MetadataRecord`]s published through a [`MetadataController`].

#![allow(clippy::type_complexity)] // Callback and factory signatures read fine inline

// Re-exported for `register_node!`
pub use inventory;

pub mod core;

pub use crate::core::{
    Admission, BufferHandle, BufferPool, BufferPoolId, CameraId, ControlConfig, DeliveryOutcome,
    DeviceController, DeviceFormat, DeviceManager, FaceAnnotationConfig, FaceAnnotationNode,
    FrameBuffer, FrameCallback, FrameSpec, LifecycleOp, Link, LinkConfig, MetadataCallback,
    MetadataController, MetadataEntry, MetadataRecord, MetadataTag, MetadataType, MetadataValue,
    Node, NodeBase, NodeContext, NodeId, NodeRegistry, NodeSpec, NodeState, NodeStats,
    PipelineConfig, PipelineError, PipelineGraph, PixelFormat, PoolBuffer, Port, PortDirection,
    PortFormat, Result, SinkConfig, SinkNode, SourceConfig, SourceNode, StartRollback,
    StaticDeviceManager, StreamId, SubscriptionId, VirtualCamera, VirtualCameraConfig,
    NODE_REGISTRY,
};
