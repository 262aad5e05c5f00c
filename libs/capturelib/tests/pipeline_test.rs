// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Whole pipelines built from configuration and driven by the virtual camera.

use std::sync::Arc;
use std::time::{Duration, Instant};

use capturelib::{
    CameraId, FrameBuffer, MetadataController, MetadataRecord, MetadataTag, MetadataValue, Node,
    NodeBase, NodeContext, NodeRegistry, NodeSpec, NodeState, PipelineConfig, PipelineError,
    PipelineGraph, Result, SinkConfig, SinkNode, SourceNode, StaticDeviceManager, StreamId,
    VirtualCamera, VirtualCameraConfig, NODE_REGISTRY,
};
use serial_test::serial;
use tempfile::TempDir;

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn fast_camera() -> Arc<VirtualCamera> {
    Arc::new(VirtualCamera::new(VirtualCameraConfig {
        frame_interval_ms: 1,
        fill_pattern: true,
    }))
}

fn build(config: &PipelineConfig, camera: Arc<VirtualCamera>) -> Result<PipelineGraph> {
    let devices = StaticDeviceManager::new().with_device(config.camera_id.clone(), camera);
    PipelineGraph::from_config(
        config,
        &NODE_REGISTRY,
        Arc::new(MetadataController::new()),
        Arc::new(devices),
    )
}

#[test]
fn test_default_pipeline_runs_on_virtual_camera() {
    let camera = fast_camera();
    let config = PipelineConfig::default();
    let graph = build(&config, camera.clone()).unwrap();

    graph.init_all().unwrap();
    graph.start_all().unwrap();
    assert!(camera.is_running());

    let sink = graph.node_by_name("sink").unwrap().clone();
    assert!(wait_for(Duration::from_secs(5), || sink.stats().consumed >= 5));

    graph.shutdown().unwrap();
    assert!(!camera.is_running());

    let face = graph.node_by_name("face").unwrap();
    assert!(face.stats().forwarded >= 5);
    assert_eq!(face.stats().transform_failed, 0);
    assert_eq!(camera.start_requests().len(), 1);
    assert_eq!(camera.start_requests()[0].0, 4);
    for node in graph.nodes() {
        assert_eq!(node.state(), NodeState::Stopped, "{}", node.name());
    }
}

#[test]
fn test_sink_receives_annotated_frames() {
    let camera = fast_camera();
    let config = PipelineConfig::default();
    let devices = StaticDeviceManager::new().with_device(CameraId::default(), camera.clone());
    let mut graph = PipelineGraph::new(
        CameraId::default(),
        Arc::new(MetadataController::new()),
        Arc::new(devices),
    );

    // Built-in source and annotation, a sink we can subscribe to.
    let source = graph
        .add_node(&NODE_REGISTRY, config.nodes[0].clone())
        .unwrap();
    let face = graph
        .add_node(&NODE_REGISTRY, config.nodes[1].clone())
        .unwrap();
    let sink = graph
        .add_custom_node(|ctx| {
            Ok(SinkNode::new(
                &NodeSpec::new("sink", SinkNode::TYPE_NAME),
                ctx,
                SinkConfig::default(),
            ))
        })
        .unwrap();
    let frames = sink.subscribe();
    graph.connect(source, face, config.links[0].format()).unwrap();
    graph.connect(face, sink.id(), config.links[1].format()).unwrap();

    graph.init_all().unwrap();
    graph.start_all().unwrap();

    let frame = frames.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut image = Vec::new();
    frame
        .with_memory(&mut |memory| image.extend_from_slice(memory))
        .unwrap();
    let record = MetadataRecord::from_bytes(&image).unwrap();
    assert_eq!(frame.valid_frame_size(), record.serialized_size());
    assert!(record.contains(MetadataTag::FaceRectangles));
    assert_eq!(frame.stream_id(), StreamId(1));
    frame.release();

    graph.shutdown().unwrap();
    assert!(sink.buffers_received() >= 1);
}

#[test]
fn test_controls_from_file_reach_the_camera() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(PipelineConfig::FILE_NAME),
        r#"
name: controlled
nodes:
  - name: src
    type: device_source
    config:
      allocate_buffer_pools: true
  - name: out
    type: sink
links:
  - { from: src, to: out, stream_id: 3, width: 64, height: 64, buffer_count: 2 }
controls:
  - tag: exposure_time
    value: { i64: [20000] }
"#,
    )
    .unwrap();

    let config = PipelineConfig::load(dir.path()).unwrap();
    let camera = fast_camera();
    let graph = build(&config, camera.clone()).unwrap();
    assert_eq!(graph.streams(), vec![StreamId(3)]);

    graph.init_all().unwrap();
    graph.start_all().unwrap();

    let record = config
        .control_record(StreamId::DEVICE_CONTROL, 30, 2000)
        .unwrap()
        .unwrap();
    assert_eq!(graph.publish_metadata(record), 1);
    assert_eq!(camera.configure_count(), 1);
    let applied = camera.last_configuration().unwrap();
    assert_eq!(
        applied.find(MetadataTag::ExposureTime).and_then(|v| match v {
            MetadataValue::I64(values) => values.first().copied(),
            _ => None,
        }),
        Some(20000)
    );

    graph.shutdown().unwrap();
    // Shut down: later controls go nowhere.
    let late = config
        .control_record(StreamId::DEVICE_CONTROL, 30, 2000)
        .unwrap()
        .unwrap();
    assert_eq!(graph.publish_metadata(late), 0);
    assert_eq!(camera.configure_count(), 1);
}

#[test]
fn test_config_errors_surface_at_build() {
    let camera = fast_camera();

    let unknown = PipelineConfig::from_yaml(
        r#"
nodes:
  - { name: a, type: warp_drive }
"#,
    )
    .unwrap();
    assert!(matches!(
        build(&unknown, camera.clone()).unwrap_err(),
        PipelineError::NotFound(_)
    ));

    let dangling = PipelineConfig::from_yaml(
        r#"
nodes:
  - { name: a, type: sink }
links:
  - { from: a, to: b, stream_id: 1, width: 8, height: 8, buffer_count: 1 }
"#,
    )
    .unwrap();
    assert!(build(&dangling, camera.clone()).is_err());

    let cyclic = PipelineConfig::from_yaml(
        r#"
nodes:
  - { name: a, type: face_annotation }
  - { name: b, type: face_annotation }
links:
  - { from: a, to: b, stream_id: 1, width: 8, height: 8, buffer_count: 1 }
  - { from: b, to: a, stream_id: 1, width: 8, height: 8, buffer_count: 1 }
"#,
    )
    .unwrap();
    assert!(matches!(
        build(&cyclic, camera.clone()).unwrap_err(),
        PipelineError::Graph(_)
    ));

    let bad_node_config = PipelineConfig::from_yaml(
        r#"
nodes:
  - name: a
    type: device_source
    config: { start_rollback: sometimes }
"#,
    )
    .unwrap();
    assert!(build(&bad_node_config, camera).is_err());
}

#[test]
fn test_topology_and_dot_output() {
    let graph = build(&PipelineConfig::default(), fast_camera()).unwrap();

    let order: Vec<String> = graph
        .topological_order()
        .unwrap()
        .into_iter()
        .map(|id| graph.node(id).unwrap().name().to_string())
        .collect();
    assert_eq!(order, vec!["source", "face", "sink"]);

    let sources = graph.find_sources();
    let sinks = graph.find_sinks();
    assert_eq!(graph.node(sources[0]).unwrap().name(), "source");
    assert_eq!(graph.node(sinks[0]).unwrap().name(), "sink");

    let dot = graph.to_dot();
    for name in ["source", "face", "sink"] {
        assert!(dot.contains(name), "{}", dot);
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct PassthroughNode {
    base: NodeBase,
}

impl PassthroughNode {
    fn create(spec: &NodeSpec, ctx: &NodeContext) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(Self {
            base: NodeBase::new(
                ctx.id,
                spec.name.clone(),
                "passthrough",
                ctx.camera_id.clone(),
            ),
        }))
    }
}

impl Node for PassthroughNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }
}

capturelib::register_node!("passthrough", PassthroughNode::create);

#[test]
#[serial]
fn test_link_time_registration_is_global() {
    assert!(NODE_REGISTRY.contains("passthrough"));
    assert!(NODE_REGISTRY.contains(SourceNode::TYPE_NAME));
    assert!(NodeRegistry::with_registered().contains("passthrough"));
}

#[test]
#[serial]
fn test_runtime_registration_on_global_registry() {
    NODE_REGISTRY
        .register("late_passthrough", PassthroughNode::create)
        .unwrap();
    assert!(NODE_REGISTRY
        .register("late_passthrough", PassthroughNode::create)
        .is_err());

    let config = PipelineConfig::from_yaml(
        r#"
nodes:
  - { name: src, type: device_source }
  - { name: mid, type: late_passthrough }
  - { name: out, type: sink }
links:
  - { from: src, to: mid, stream_id: 1, width: 8, height: 8, buffer_count: 1 }
  - { from: mid, to: out, stream_id: 1, width: 8, height: 8, buffer_count: 1 }
"#,
    )
    .unwrap();
    let graph = build(&config, fast_camera());
    assert!(NODE_REGISTRY.unregister("late_passthrough"));

    let graph = graph.unwrap();
    assert_eq!(graph.node_count(), 3);
    assert!(!NODE_REGISTRY.contains("late_passthrough"));
}
