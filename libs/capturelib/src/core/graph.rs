// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Node table and topology (DAG).
//!
//! The graph is the only strong owner of nodes. Ports refer to their owner by
//! [`NodeId`] and to their downstream peer weakly, so dropping the graph tears
//! the whole pipeline down.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;

use super::config::PipelineConfig;
use super::device::DeviceManager;
use super::error::{PipelineError, Result};
use super::metadata::{MetadataController, MetadataRecord};
use super::node::{Node, NodeContext, NodeSpec, NodeStats};
use super::ports::PortDirection;
use super::registry::NodeRegistry;
use super::types::{CameraId, NodeId, PortFormat, StreamId};

/// Edge weight: the stream carried from one node to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
    pub format: PortFormat,
}

pub struct PipelineGraph {
    graph: DiGraph<NodeId, Link>,
    nodes: Vec<Arc<dyn Node>>,
    indices: Vec<NodeIndex>,
    by_name: HashMap<String, NodeId>,
    camera_id: CameraId,
    metadata: Arc<MetadataController>,
    devices: Arc<dyn DeviceManager>,
}

impl PipelineGraph {
    pub fn new(
        camera_id: CameraId,
        metadata: Arc<MetadataController>,
        devices: Arc<dyn DeviceManager>,
    ) -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: Vec::new(),
            indices: Vec::new(),
            by_name: HashMap::new(),
            camera_id,
            metadata,
            devices,
        }
    }

    /// Build nodes and links from a pipeline description.
    pub fn from_config(
        config: &PipelineConfig,
        registry: &NodeRegistry,
        metadata: Arc<MetadataController>,
        devices: Arc<dyn DeviceManager>,
    ) -> Result<Self> {
        let mut graph = Self::new(config.camera_id.clone(), metadata, devices);
        for spec in &config.nodes {
            graph.add_node(registry, spec.clone())?;
        }
        for link in &config.links {
            let from = graph.require(&link.from)?;
            let to = graph.require(&link.to)?;
            graph.connect(from, to, link.format())?;
        }
        graph.validate()?;
        tracing::info!(
            "[graph] '{}' built: {} nodes, {} links",
            config.name,
            graph.node_count(),
            graph.link_count()
        );
        Ok(graph)
    }

    pub fn metadata(&self) -> &Arc<MetadataController> {
        &self.metadata
    }

    pub fn devices(&self) -> &Arc<dyn DeviceManager> {
        &self.devices
    }

    fn next_context(&self) -> NodeContext {
        NodeContext::new(
            NodeId(self.nodes.len()),
            self.camera_id.clone(),
            Arc::clone(&self.metadata),
            Arc::clone(&self.devices),
        )
    }

    fn insert(&mut self, node: Arc<dyn Node>, expected: NodeId) -> Result<NodeId> {
        if node.id() != expected {
            return Err(PipelineError::Graph(format!(
                "node '{}' was built with id {} but is being inserted as {}",
                node.name(),
                node.id(),
                expected
            )));
        }
        if self.by_name.contains_key(node.name()) {
            return Err(PipelineError::Graph(format!(
                "node name '{}' is already in use",
                node.name()
            )));
        }
        let index = self.graph.add_node(expected);
        self.by_name.insert(node.name().to_string(), expected);
        self.indices.push(index);
        self.nodes.push(node);
        Ok(expected)
    }

    /// Instantiate `spec` through `registry` and add it to the table.
    pub fn add_node(&mut self, registry: &NodeRegistry, spec: NodeSpec) -> Result<NodeId> {
        if self.by_name.contains_key(&spec.name) {
            return Err(PipelineError::Graph(format!(
                "node name '{}' is already in use",
                spec.name
            )));
        }
        let ctx = self.next_context();
        let node = registry.create(&spec, &ctx)?;
        let id = self.insert(node, ctx.id)?;
        tracing::debug!("[graph] added {} '{}' as {}", spec.node_type, spec.name, id);
        Ok(id)
    }

    /// Add a node built directly by the caller, keeping its concrete type.
    pub fn add_custom_node<N, F>(&mut self, build: F) -> Result<Arc<N>>
    where
        N: Node + 'static,
        F: FnOnce(&NodeContext) -> Result<Arc<N>>,
    {
        let ctx = self.next_context();
        let node = build(&ctx)?;
        self.insert(Arc::clone(&node) as Arc<dyn Node>, ctx.id)?;
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id.index())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.by_name.get(name).and_then(|id| self.node(*id))
    }

    fn require(&self, name: &str) -> Result<NodeId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::NotFound(format!("node '{}'", name)))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<dyn Node>> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn links(&self) -> Vec<Link> {
        self.graph.edge_weights().copied().collect()
    }

    /// Distinct stream ids carried by links, ascending.
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self
            .graph
            .edge_weights()
            .map(|link| link.format.stream_id)
            .collect();
        streams.sort();
        streams.dedup();
        streams
    }

    /// Link `from` to `to` for `format.stream_id`.
    pub fn connect(&mut self, from: NodeId, to: NodeId, format: PortFormat) -> Result<()> {
        if from == to {
            return Err(PipelineError::Graph(format!("cannot link {} to itself", from)));
        }
        let (from_node, to_node) = match (self.node(from), self.node(to)) {
            (Some(a), Some(b)) => (Arc::clone(a), Arc::clone(b)),
            _ => {
                return Err(PipelineError::NotFound(format!(
                    "node {} or {}",
                    from, to
                )));
            }
        };
        let (from_index, to_index) = (self.indices[from.index()], self.indices[to.index()]);

        if has_path_connecting(&self.graph, to_index, from_index, None) {
            return Err(PipelineError::Graph(format!(
                "linking '{}' -> '{}' would create a cycle",
                from_node.name(),
                to_node.name()
            )));
        }

        let output = from_node.base().add_port(PortDirection::Output, format)?;
        to_node.base().add_port(PortDirection::Input, format)?;
        output.connect(to, Arc::downgrade(&to_node))?;

        self.graph
            .add_edge(from_index, to_index, Link { from, to, format });
        tracing::debug!(
            "[graph] linked '{}' -> '{}' on stream {}",
            from_node.name(),
            to_node.name(),
            format.stream_id
        );
        Ok(())
    }

    /// Check that every link's output and input ports agree on format.
    pub fn validate_formats(&self) -> Result<()> {
        for link in self.graph.edge_weights() {
            let stream = link.format.stream_id;
            let (Some(from), Some(to)) = (self.node(link.from), self.node(link.to)) else {
                continue;
            };
            let output = from
                .base()
                .output_ports()
                .into_iter()
                .find(|p| p.stream_id() == stream && p.peer() == Some(link.to));
            let input = to
                .base()
                .input_ports()
                .into_iter()
                .find(|p| p.stream_id() == stream);

            match (output, input) {
                (Some(output), Some(input)) if output.format() == input.format() => {}
                (Some(output), Some(input)) => {
                    return Err(PipelineError::Port(format!(
                        "stream {} disagrees between '{}' ({}x{} {}) and '{}' ({}x{} {})",
                        stream,
                        output.name(),
                        output.format().width,
                        output.format().height,
                        output.format().pixel_format,
                        input.name(),
                        input.format().width,
                        input.format().height,
                        input.format().pixel_format
                    )));
                }
                _ => {
                    return Err(PipelineError::Port(format!(
                        "link '{}' -> '{}' on stream {} lost its ports",
                        from.name(),
                        to.name(),
                        stream
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(PipelineError::Graph("Graph contains cycles".into()));
        }
        self.validate_formats()
    }

    /// Node ids, sources first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let sorted = toposort(&self.graph, None)
            .map_err(|_| PipelineError::Graph("Graph contains cycles".into()))?;
        Ok(sorted.into_iter().map(|index| self.graph[index]).collect())
    }

    pub fn find_sources(&self) -> Vec<NodeId> {
        self.find_by_degree(Direction::Incoming)
    }

    pub fn find_sinks(&self) -> Vec<NodeId> {
        self.find_by_degree(Direction::Outgoing)
    }

    fn find_by_degree(&self, direction: Direction) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&index| self.graph.neighbors_directed(index, direction).count() == 0)
            .map(|index| self.graph[index])
            .collect()
    }

    fn ordered_nodes(&self, sinks_first: bool) -> Result<Vec<Arc<dyn Node>>> {
        let mut order = self.topological_order()?;
        if sinks_first {
            order.reverse();
        }
        Ok(order
            .into_iter()
            .filter_map(|id| self.node(id).cloned())
            .collect())
    }

    // ---------------------------------------------------------------------
    // Lifecycle fan-out
    // ---------------------------------------------------------------------

    /// Initialize every node for `stream_id`. Stops at the first failure.
    pub fn init(&self, stream_id: StreamId) -> Result<()> {
        for node in self.ordered_nodes(false)? {
            node.init(stream_id)?;
        }
        Ok(())
    }

    /// Start every node for `stream_id`, consumers before producers. Stops at
    /// the first failure; nodes already started are left running.
    pub fn start(&self, stream_id: StreamId) -> Result<()> {
        self.validate_formats()?;
        for node in self.ordered_nodes(true)? {
            node.start(stream_id)?;
        }
        tracing::info!("[graph] stream {} started", stream_id);
        Ok(())
    }

    /// Stop every node for `stream_id`, producers first. Every node is
    /// stopped even if an earlier one fails; the first error is returned.
    pub fn stop(&self, stream_id: StreamId) -> Result<()> {
        self.for_each_collecting(false, |node| node.stop(stream_id))?;
        tracing::info!("[graph] stream {} stopped", stream_id);
        Ok(())
    }

    /// Flush every node for `stream_id`, producers first.
    pub fn flush(&self, stream_id: StreamId) -> Result<()> {
        self.for_each_collecting(false, |node| node.flush(stream_id))
    }

    /// Hand `metadata` to every node's `config`.
    pub fn config(&self, stream_id: StreamId, metadata: &Arc<MetadataRecord>) -> Result<()> {
        self.for_each_collecting(false, |node| node.config(stream_id, metadata))
    }

    /// Publish a metadata change to all subscribers. Returns how many were notified.
    pub fn publish_metadata(&self, metadata: MetadataRecord) -> usize {
        self.metadata.publish(Arc::new(metadata))
    }

    fn for_each_collecting<F>(&self, sinks_first: bool, mut op: F) -> Result<()>
    where
        F: FnMut(&Arc<dyn Node>) -> Result<()>,
    {
        let mut first_error = None;
        for node in self.ordered_nodes(sinks_first)? {
            if let Err(e) = op(&node) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn init_all(&self) -> Result<()> {
        for stream in self.streams() {
            self.init(stream)?;
        }
        Ok(())
    }

    pub fn start_all(&self) -> Result<()> {
        for stream in self.streams() {
            self.start(stream)?;
        }
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for stream in self.streams() {
            if let Err(e) = self.stop(stream) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop everything and shut the metadata controller down.
    pub fn shutdown(&self) -> Result<()> {
        let result = self.stop_all();
        self.metadata.shutdown();
        result
    }

    /// Per-node statistics, in node id order.
    pub fn stats(&self) -> Vec<(String, NodeStats)> {
        self.nodes
            .iter()
            .map(|node| (node.name().to_string(), node.stats()))
            .collect()
    }

    pub fn to_dot(&self) -> String {
        use petgraph::dot::Dot;
        let named = self.graph.map(
            |_, id| self.nodes[id.index()].name().to_string(),
            |_, link| link.format.stream_id.to_string(),
        );
        format!("{}", Dot::new(&named))
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("camera_id", &self.camera_id)
            .field("nodes", &self.by_name)
            .field("links", &self.links())
            .finish()
    }
}
