// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! State shared by every node: identity, lifecycle, port tables and routing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::state::{Admission, LifecycleOp, NodeState};
use crate::core::buffer::BufferHandle;
use crate::core::error::{PipelineError, Result};
use crate::core::ports::{Port, PortDirection};
use crate::core::types::{CameraId, NodeId, PortFormat, StreamId};

/// What happened to a buffer handed to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Forwarded to the downstream node of the matching port.
    Forwarded,
    /// No enabled output port is bound to the buffer's stream.
    Unmatched,
    /// The buffer itself was invalid.
    Rejected,
    /// The node's transform failed; the buffer was not forwarded.
    TransformFailed,
    /// The matching port has no live downstream node.
    NoDownstream,
    /// The node consumed the buffer (sinks).
    Consumed,
}

/// Counters kept per node for every delivery outcome.
#[derive(Debug, Default)]
struct DeliveryCounters {
    forwarded: AtomicU64,
    unmatched: AtomicU64,
    rejected: AtomicU64,
    transform_failed: AtomicU64,
    no_downstream: AtomicU64,
    consumed: AtomicU64,
}

/// Snapshot of a node's delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub forwarded: u64,
    pub unmatched: u64,
    pub rejected: u64,
    pub transform_failed: u64,
    pub no_downstream: u64,
    pub consumed: u64,
    pub flushes: u64,
}

#[derive(Debug, Default)]
struct ControlState {
    initialized_streams: BTreeSet<StreamId>,
}

/// Identity, lifecycle and ports common to all node types.
///
/// Lifecycle transitions are serialized by a lock that the data plane never
/// takes. The current state is mirrored into an atomic so delivery can read
/// it without locking.
pub struct NodeBase {
    id: NodeId,
    name: String,
    node_type: String,
    camera_id: CameraId,
    state: AtomicU8,
    transition: Mutex<()>,
    control: Mutex<ControlState>,
    inputs: RwLock<Vec<Arc<Port>>>,
    outputs: RwLock<Vec<Arc<Port>>>,
    counters: DeliveryCounters,
    flushes: AtomicU64,
}

impl NodeBase {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        node_type: impl Into<String>,
        camera_id: CameraId,
    ) -> Self {
        let base = Self {
            id,
            name: name.into(),
            node_type: node_type.into(),
            camera_id,
            state: AtomicU8::new(NodeState::Uninitialized.to_u8()),
            transition: Mutex::new(()),
            control: Mutex::new(ControlState::default()),
            inputs: RwLock::new(Vec::new()),
            outputs: RwLock::new(Vec::new()),
            counters: DeliveryCounters::default(),
            flushes: AtomicU64::new(0),
        };
        tracing::debug!("[{}] created, type({})", base.name, base.node_type);
        base
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: NodeState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // Ports
    // ---------------------------------------------------------------------

    /// Add a port. Called while the graph is being built; at most one output
    /// port per node may be bound to a given stream.
    pub fn add_port(&self, direction: PortDirection, format: PortFormat) -> Result<Arc<Port>> {
        let table = match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        };
        let mut ports = table.write();

        if direction == PortDirection::Output
            && ports.iter().any(|p| p.stream_id() == format.stream_id)
        {
            return Err(PipelineError::Port(format!(
                "node '{}' already has an output port for stream {}",
                self.name, format.stream_id
            )));
        }

        let port_name = format!("{}.{}{}", self.name, direction, ports.len());
        let port = Arc::new(Port::new(port_name, self.id, direction, format));
        ports.push(Arc::clone(&port));
        Ok(port)
    }

    pub fn output_ports(&self) -> Vec<Arc<Port>> {
        self.outputs.read().clone()
    }

    pub fn input_ports(&self) -> Vec<Arc<Port>> {
        self.inputs.read().clone()
    }

    /// First output port routing `stream_id`, if any.
    pub fn output_port_for(&self, stream_id: StreamId) -> Option<Arc<Port>> {
        self.outputs
            .read()
            .iter()
            .find(|p| p.accepts(stream_id))
            .cloned()
    }

    /// Enable or disable every port (input and output) bound to `stream_id`.
    pub fn set_stream_enabled(&self, stream_id: StreamId, enabled: bool) {
        for port in self.inputs.read().iter().chain(self.outputs.read().iter()) {
            if port.stream_id() == stream_id {
                port.set_enabled(enabled);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Run `action` as lifecycle operation `op` for `stream_id`.
    ///
    /// The state only advances if `action` succeeds. Tolerated misuse (a
    /// second stop, a start while running) returns `Ok` without running
    /// `action`.
    ///
    /// The control lock is held only to check admission and to commit, never
    /// while `action` runs. Init, start, stop and flush are serialized by the
    /// transition lock; config takes neither lock across its action, so a
    /// buffer delivery that publishes device controls can never wait on a
    /// stop that is joining the delivering thread.
    ///
    /// A stop leaves the node in its current state while other streams are
    /// still initialized; the node becomes `Stopped` with its last stream.
    pub fn run_lifecycle<F>(&self, op: LifecycleOp, stream_id: StreamId, action: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let _transition = (op != LifecycleOp::Config).then(|| self.transition.lock());

        let state = {
            let mut control = self.control.lock();
            let state = self.state();

            match state.admits(op) {
                Admission::Reject => {
                    tracing::warn!(
                        "[{}] {} rejected for stream {} in state {}",
                        self.name,
                        op.as_str(),
                        stream_id,
                        state
                    );
                    return Err(PipelineError::InvalidTransition {
                        node: self.name.clone(),
                        operation: op.as_str(),
                        state: state.to_string(),
                    });
                }
                Admission::Skip => {
                    tracing::debug!(
                        "[{}] {} for stream {} ignored in state {}",
                        self.name,
                        op.as_str(),
                        stream_id,
                        state
                    );
                    // Node-level state is shared by all streams; the stream's
                    // ports and membership still follow the request.
                    match op {
                        LifecycleOp::Init | LifecycleOp::Start => {
                            control.initialized_streams.insert(stream_id);
                            if op == LifecycleOp::Start {
                                self.set_stream_enabled(stream_id, true);
                            }
                        }
                        LifecycleOp::Stop => {
                            control.initialized_streams.remove(&stream_id);
                            self.set_stream_enabled(stream_id, false);
                        }
                        _ => {}
                    }
                    return Ok(());
                }
                Admission::Proceed => {}
            }

            if op == LifecycleOp::Init
                && state == NodeState::Initialized
                && control.initialized_streams.contains(&stream_id)
            {
                tracing::debug!("[{}] stream {} already initialized", self.name, stream_id);
                return Ok(());
            }

            if op == LifecycleOp::Flush {
                self.set_state(NodeState::Flushing);
            }
            state
        };

        let result = action();
        let mut control = self.control.lock();

        match result {
            Ok(()) => {
                let next = match op {
                    LifecycleOp::Init | LifecycleOp::Start => {
                        control.initialized_streams.insert(stream_id);
                        self.set_stream_enabled(stream_id, true);
                        state.after(op)
                    }
                    LifecycleOp::Stop => {
                        control.initialized_streams.remove(&stream_id);
                        self.set_stream_enabled(stream_id, false);
                        if control.initialized_streams.is_empty() {
                            state.after(op)
                        } else {
                            state
                        }
                    }
                    LifecycleOp::Flush => {
                        self.flushes.fetch_add(1, Ordering::Relaxed);
                        state
                    }
                    // Config runs beside the transitions and never owns the state.
                    LifecycleOp::Config => return Ok(()),
                };
                self.set_state(next);
                if next != state {
                    tracing::info!(
                        "[{}] {} -> {} (stream {})",
                        self.name,
                        state,
                        next,
                        stream_id
                    );
                }
                Ok(())
            }
            Err(e) => {
                if op != LifecycleOp::Config {
                    self.set_state(state);
                }
                tracing::error!(
                    "[{}] {} failed for stream {}: {}",
                    self.name,
                    op.as_str(),
                    stream_id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Streams initialized or started and not stopped since.
    pub fn active_streams(&self) -> Vec<StreamId> {
        self.control.lock().initialized_streams.iter().copied().collect()
    }

    /// True when no stream other than `stream_id` is still active. Lifecycle
    /// actions use this to release node-wide resources with the last stream.
    pub fn is_last_active_stream(&self, stream_id: StreamId) -> bool {
        self.control
            .lock()
            .initialized_streams
            .iter()
            .all(|s| *s == stream_id)
    }

    // ---------------------------------------------------------------------
    // Data plane
    // ---------------------------------------------------------------------

    /// Route `buffer` to the output port bound to its stream, applying
    /// `transform` in place first.
    pub fn route_buffer<F>(&self, buffer: BufferHandle, transform: F) -> DeliveryOutcome
    where
        F: FnOnce(&BufferHandle) -> Result<()>,
    {
        if !buffer.is_valid() {
            tracing::error!(
                "[{}] invalid buffer (stream {}, size {}), dropping",
                self.name,
                buffer.stream_id(),
                buffer.size()
            );
            return self.record(DeliveryOutcome::Rejected);
        }

        let stream_id = buffer.stream_id();
        let Some(port) = self.output_port_for(stream_id) else {
            tracing::debug!(
                "[{}] no output port for stream {}, dropping buffer",
                self.name,
                stream_id
            );
            return self.record(DeliveryOutcome::Unmatched);
        };

        if let Err(e) = transform(&buffer) {
            tracing::error!(
                "[{}] transform failed for stream {}: {}",
                self.name,
                stream_id,
                e
            );
            return self.record(DeliveryOutcome::TransformFailed);
        }

        if port.deliver_buffer(buffer) {
            tracing::trace!("[{}] delivered buffer for stream {}", self.name, stream_id);
            self.record(DeliveryOutcome::Forwarded)
        } else {
            self.record(DeliveryOutcome::NoDownstream)
        }
    }

    /// Count `outcome` and hand it back.
    pub fn record(&self, outcome: DeliveryOutcome) -> DeliveryOutcome {
        let counter = match outcome {
            DeliveryOutcome::Forwarded => &self.counters.forwarded,
            DeliveryOutcome::Unmatched => &self.counters.unmatched,
            DeliveryOutcome::Rejected => &self.counters.rejected,
            DeliveryOutcome::TransformFailed => &self.counters.transform_failed,
            DeliveryOutcome::NoDownstream => &self.counters.no_downstream,
            DeliveryOutcome::Consumed => &self.counters.consumed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            transform_failed: self.counters.transform_failed.load(Ordering::Relaxed),
            no_downstream: self.counters.no_downstream.load(Ordering::Relaxed),
            consumed: self.counters.consumed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for NodeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("camera_id", &self.camera_id)
            .field("state", &self.state())
            .finish()
    }
}
