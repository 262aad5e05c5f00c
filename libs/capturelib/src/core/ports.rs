// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Stream-bound connection points on a node.
//!
//! A port knows its owner only by [`NodeId`] and its downstream peer only
//! through a weak reference; the node table in
//! [`PipelineGraph`](crate::core::graph::PipelineGraph) is the sole owner of
//! nodes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::buffer::BufferHandle;
use super::error::{PipelineError, Result};
use super::node::Node;
use super::types::{NodeId, PortFormat, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

struct PortPeer {
    node_id: NodeId,
    node: Weak<dyn Node>,
}

/// A typed, directional connection point bound to one stream.
pub struct Port {
    name: String,
    owner: NodeId,
    direction: PortDirection,
    stream_id: StreamId,
    format: RwLock<PortFormat>,
    enabled: AtomicBool,
    peer: OnceLock<PortPeer>,
}

impl Port {
    pub fn new(
        name: impl Into<String>,
        owner: NodeId,
        direction: PortDirection,
        format: PortFormat,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            direction,
            stream_id: format.stream_id,
            format: RwLock::new(format),
            enabled: AtomicBool::new(true),
            peer: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn format(&self) -> PortFormat {
        *self.format.read()
    }

    /// Renegotiate the buffer format. The stream binding cannot change.
    pub fn set_format(&self, format: PortFormat) -> Result<()> {
        if format.stream_id != self.stream_id {
            return Err(PipelineError::Port(format!(
                "port '{}' is bound to stream {}, cannot renegotiate to stream {}",
                self.name, self.stream_id, format.stream_id
            )));
        }
        *self.format.write() = format;
        Ok(())
    }

    /// Whether the port currently accepts buffers for its stream.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Does this port route buffers of `stream_id` right now?
    pub fn accepts(&self, stream_id: StreamId) -> bool {
        self.stream_id == stream_id && self.is_enabled()
    }

    /// Link an output port to the node that consumes its buffers.
    pub fn connect(&self, peer_id: NodeId, peer: Weak<dyn Node>) -> Result<()> {
        if self.direction != PortDirection::Output {
            return Err(PipelineError::Port(format!(
                "port '{}' is an input and cannot forward buffers",
                self.name
            )));
        }
        self.peer
            .set(PortPeer {
                node_id: peer_id,
                node: peer,
            })
            .map_err(|_| {
                PipelineError::Port(format!("port '{}' is already connected", self.name))
            })
    }

    pub fn peer(&self) -> Option<NodeId> {
        self.peer.get().map(|p| p.node_id)
    }

    pub fn is_connected(&self) -> bool {
        self.peer.get().is_some_and(|p| p.node.strong_count() > 0)
    }

    /// Forward `buffer` to the downstream node. Returns false if there is no
    /// live downstream; the buffer is then dropped without being released.
    pub fn deliver_buffer(&self, buffer: BufferHandle) -> bool {
        let Some(peer) = self.peer.get() else {
            tracing::warn!(
                "[port {}] stream {} has no downstream, dropping buffer",
                self.name,
                self.stream_id
            );
            return false;
        };
        let Some(node) = peer.node.upgrade() else {
            tracing::warn!(
                "[port {}] downstream {} is gone, dropping buffer",
                self.name,
                peer.node_id
            );
            return false;
        };
        node.deliver_buffer(buffer);
        true
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("direction", &self.direction)
            .field("format", &self.format())
            .field("enabled", &self.is_enabled())
            .field("peer", &self.peer())
            .finish()
    }
}
