// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use super::types::StreamId;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("Node '{node}' cannot {operation} while {state}")]
    InvalidTransition {
        node: String,
        operation: &'static str,
        state: String,
    },

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device operation failed: {0}")]
    Device(String),

    #[error("Metadata capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Metadata type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Buffer too small: need {needed} bytes, backing capacity is {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("No metadata published for stream {0}")]
    MetadataUnavailable(StreamId),

    #[error("Port error: {0}")]
    Port(String),

    #[error("Pipeline graph error: {0}")]
    Graph(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
