// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline description loaded from `pipeline.yaml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{PipelineError, Result};
use super::metadata::{MetadataRecord, MetadataTag, MetadataValue};
use super::node::{FaceAnnotationNode, NodeSpec, SinkNode, SourceNode};
use super::types::{CameraId, PixelFormat, PortFormat, StreamId};

/// One directed link; creates an output port on `from` and an input port on
/// `to`, both bound to `stream_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub from: String,
    pub to: String,
    pub stream_id: StreamId,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
}

impl LinkConfig {
    pub fn format(&self) -> PortFormat {
        PortFormat::new(self.stream_id, self.width, self.height, self.buffer_count)
            .with_pixel_format(self.pixel_format)
    }
}

/// A device control applied once the pipeline is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub tag: MetadataTag,
    /// Written as `{ u8: [90] }`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub value: MetadataValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub camera_id: CameraId,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub controls: Vec<ControlConfig>,
}

fn default_name() -> String {
    "pipeline".to_string()
}

impl Default for PipelineConfig {
    /// Source → face annotation → sink on stream 1, 640x480 NV12, 4 buffers.
    fn default() -> Self {
        let link = |from: &str, to: &str| LinkConfig {
            from: from.to_string(),
            to: to.to_string(),
            stream_id: StreamId(1),
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Nv12,
            buffer_count: 4,
        };
        Self {
            name: default_name(),
            camera_id: CameraId::default(),
            nodes: vec![
                NodeSpec::new("source", SourceNode::TYPE_NAME)
                    .with_config(serde_json::json!({ "allocate_buffer_pools": true })),
                NodeSpec::new("face", FaceAnnotationNode::TYPE_NAME),
                NodeSpec::new("sink", SinkNode::TYPE_NAME),
            ],
            links: vec![link("source", "face"), link("face", "sink")],
            controls: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Configuration file name looked up by [`load`](Self::load).
    pub const FILE_NAME: &'static str = "pipeline.yaml";

    /// Load `pipeline.yaml` from a directory. Returns error if the file is
    /// missing or cannot be parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_file(&dir.join(Self::FILE_NAME))
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content).map_err(|e| {
            PipelineError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        tracing::info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    /// Load `pipeline.yaml` from a directory, returning the default pipeline
    /// if the file is missing or unparseable.
    pub fn load_or_default(dir: &Path) -> Self {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }
        match Self::load_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Distinct stream ids carried by the links, ascending.
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.links.iter().map(|l| l.stream_id).collect();
        streams.sort();
        streams.dedup();
        streams
    }

    /// Device-control record holding every configured control, or `None`
    /// when there are none.
    pub fn control_record(
        &self,
        control_stream: StreamId,
        entry_capacity: usize,
        data_capacity: usize,
    ) -> Result<Option<MetadataRecord>> {
        if self.controls.is_empty() {
            return Ok(None);
        }
        let mut record = MetadataRecord::for_stream(control_stream, entry_capacity, data_capacity)?;
        for control in &self.controls {
            record.set_entry(control.tag, control.value.clone())?;
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_returns_error() {
        let dir = TempDir::new().unwrap();
        assert!(PipelineConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::load_or_default(dir.path());
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.streams(), vec![StreamId(1)]);
    }

    #[test]
    fn test_load_or_default_unparseable_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PipelineConfig::FILE_NAME), "nodes: [").unwrap();
        let config = PipelineConfig::load_or_default(dir.path());
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_load_links_and_controls() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(PipelineConfig::FILE_NAME),
            r#"
name: preview
camera_id: camera_second
nodes:
  - name: src
    type: device_source
    config:
      start_rollback: stop_started
  - name: out
    type: sink
links:
  - from: src
    to: out
    stream_id: 2
    width: 1280
    height: 720
    pixel_format: yuyv
    buffer_count: 6
controls:
  - tag: jpeg_quality
    value: { u8: [90] }
  - tag: exposure_time
    value: { i64: [10000] }
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(dir.path()).unwrap();
        assert_eq!(config.name, "preview");
        assert_eq!(config.camera_id.as_str(), "camera_second");

        let format = config.links[0].format();
        assert_eq!(format.stream_id, StreamId(2));
        assert_eq!(format.pixel_format, PixelFormat::Yuyv);
        assert_eq!(format.buffer_count, 6);

        let record = config
            .control_record(StreamId::DEVICE_CONTROL, 8, 64)
            .unwrap()
            .unwrap();
        assert_eq!(record.stream_id(), Some(StreamId::DEVICE_CONTROL));
        assert_eq!(
            record.find(MetadataTag::JpegQuality),
            Some(&MetadataValue::U8(vec![90]))
        );
    }

    #[test]
    fn test_control_of_wrong_type_rejected() {
        let config = PipelineConfig {
            controls: vec![ControlConfig {
                tag: MetadataTag::JpegQuality,
                value: MetadataValue::F32(vec![1.0]),
            }],
            ..PipelineConfig::default()
        };
        assert!(config.control_record(StreamId(0), 4, 64).is_err());
    }

    #[test]
    fn test_runtime_sample_graph_loads() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../capturelib-runtime/graphs/face_pipeline.yaml");
        let config = PipelineConfig::load_file(&path).unwrap();

        assert_eq!(config.name, "face_pipeline");
        assert_eq!(config.streams(), vec![StreamId(1), StreamId(2)]);
        assert_eq!(
            config.controls,
            vec![ControlConfig {
                tag: MetadataTag::JpegQuality,
                value: MetadataValue::U8(vec![90]),
            }]
        );
        assert!(config.control_record(StreamId::DEVICE_CONTROL, 30, 2000).is_ok());
    }

    #[test]
    fn test_control_value_written_as_single_key_map() {
        let control = ControlConfig {
            tag: MetadataTag::ExposureTime,
            value: MetadataValue::I64(vec![20000]),
        };
        let yaml = serde_yaml::to_string(&control).unwrap();
        assert!(yaml.contains("i64:"), "{}", yaml);
        assert!(!yaml.contains('!'), "{}", yaml);
        assert_eq!(serde_yaml::from_str::<ControlConfig>(&yaml).unwrap(), control);
    }
}
