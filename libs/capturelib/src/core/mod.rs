// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod metadata;
pub mod node;
pub mod pool;
pub mod ports;
pub mod registry;
pub mod types;

pub use buffer::{BufferHandle, FrameBuffer, FrameSpec};
pub use config::{ControlConfig, LinkConfig, PipelineConfig};
pub use device::{
    DeviceController, DeviceManager, FrameCallback, StaticDeviceManager, VirtualCamera,
    VirtualCameraConfig,
};
pub use error::*;
pub use graph::{Link, PipelineGraph};
pub use metadata::*;
pub use node::*;
pub use pool::{BufferPool, BufferPoolId, PoolBuffer};
pub use ports::{Port, PortDirection};
pub use registry::{NodeConstructorFn, NodeRegistry, NODE_REGISTRY};
pub use types::*;
