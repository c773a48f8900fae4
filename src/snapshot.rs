use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::graph::{CHANNEL_COUNT, Graph};
use crate::node::{DEFAULT_HEIGHT, DEFAULT_WIDTH, NodeId, NodeKind, NodeLayout, ShaderNode};
use crate::renderer::shaders::{DEFAULT_CONST_SOURCE, DEFAULT_SHADER_SOURCE};

pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

fn default_zoom() -> f32 {
    1.0
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

/// Serializable graph state handed to and from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub viewport: Viewport,
    /// Id generator position. Restoring never hands out an id at or below any
    /// recorded node id, whatever this says.
    #[serde(default)]
    pub next_id: u32,
    #[serde(default)]
    pub selected: Option<NodeId>,
    pub nodes: Vec<NodeRecord>,
}

/// Editor pan/zoom, stored and returned untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default = "default_zoom")]
    pub zoom: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: NodeKind,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub inputs: Vec<Option<NodeId>>,
    /// Uploaded image of a `texture` node as a PNG data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl NodeRecord {
    pub fn from_node(node: &ShaderNode, image: Option<String>) -> Self {
        Self {
            id: node.id,
            x: node.layout.x,
            y: node.layout.y,
            name: node.name.clone(),
            kind: node.kind,
            width: node.width,
            height: node.height,
            source: node.source.clone(),
            inputs: node.inputs.clone(),
            image,
        }
    }

    /// The node record without its inputs; wiring is restored separately once
    /// every id is known. A renderable node recorded without source gets the
    /// default source for its kind.
    fn to_node(&self) -> ShaderNode {
        let mut node = ShaderNode::new(self.id, NodeLayout { x: self.x, y: self.y })
            .with_resolution(self.width, self.height);
        if !self.name.is_empty() {
            node.name = self.name.clone();
        }
        node.kind = self.kind;
        node.source = match self.kind {
            _ if !self.source.is_empty() => self.source.clone(),
            NodeKind::Shader => DEFAULT_SHADER_SOURCE.to_string(),
            NodeKind::Const => DEFAULT_CONST_SOURCE.to_string(),
            NodeKind::Texture => String::new(),
        };
        node
    }
}

impl GraphSnapshot {
    pub fn parse(json: &str) -> EngineResult<Self> {
        let snapshot: GraphSnapshot = serde_json::from_str(json)
            .map_err(|e| EngineError::snapshot(format!("invalid snapshot JSON: {e}")))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn to_json_pretty(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::snapshot(format!("failed to serialize snapshot: {e}")))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.version > SNAPSHOT_VERSION {
            return Err(EngineError::snapshot(format!(
                "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                self.version
            )));
        }
        let mut seen = HashSet::new();
        for record in &self.nodes {
            if !seen.insert(record.id) {
                return Err(EngineError::snapshot(format!(
                    "duplicate node id {}",
                    record.id
                )));
            }
            if record.width == 0 || record.height == 0 {
                return Err(EngineError::snapshot(format!(
                    "node {} has invalid resolution {}x{}",
                    record.id, record.width, record.height
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the node graph in recorded order. Slots that point at unknown
    /// ids, at the node itself, or into a node that takes no inputs are
    /// dropped with a warning; the rest are restored by id.
    pub fn build_graph(&self) -> EngineResult<Graph> {
        self.validate()?;
        let ids: HashSet<NodeId> = self.nodes.iter().map(|r| r.id).collect();
        let mut graph = Graph::new();

        for record in &self.nodes {
            let mut node = record.to_node();
            if node.kind.accepts_inputs() {
                let mut inputs: Vec<Option<NodeId>> = record
                    .inputs
                    .iter()
                    .take(CHANNEL_COUNT)
                    .map(|slot| {
                        slot.filter(|source| {
                            let keep = *source != record.id && ids.contains(source);
                            if !keep {
                                tracing::warn!(node = %record.id, source = %source, "dropping invalid input reference");
                            }
                            keep
                        })
                    })
                    .collect();
                while inputs.last() == Some(&None) {
                    inputs.pop();
                }
                if record.inputs.len() > CHANNEL_COUNT {
                    tracing::warn!(node = %record.id, slots = record.inputs.len(), "truncating input slots to channel bank");
                }
                node.inputs = inputs;
            } else if record.inputs.iter().any(Option::is_some) {
                tracing::warn!(node = %record.id, kind = %record.kind, "ignoring inputs on node without input slots");
            }
            graph.insert(node);
        }

        graph.advance_next_id(self.next_id);
        graph.select(self.selected);
        Ok(graph)
    }
}

pub fn load_snapshot_from_path(path: impl AsRef<Path>) -> Result<GraphSnapshot> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot = GraphSnapshot::parse(&text)
        .with_context(|| format!("failed to load snapshot {}", path.display()))?;
    Ok(snapshot)
}

pub fn save_snapshot_to_path(snapshot: &GraphSnapshot, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = snapshot.to_json_pretty()?;
    std::fs::write(path, text)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    Ok(())
}
