use serde::{Deserialize, Serialize};

use crate::renderer::shaders::DEFAULT_SHADER_SOURCE;

pub const DEFAULT_WIDTH: u32 = 512;
pub const DEFAULT_HEIGHT: u32 = 512;

/// Stable node identity. Ids come from a monotonically increasing counter and
/// are never handed out twice within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// User-authored fragment shader with a growable list of input slots.
    #[default]
    Shader,
    /// Solid color (or any input-less) shader.
    Const,
    /// Uploaded image, no shader.
    Texture,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Shader => "shader",
            NodeKind::Const => "const",
            NodeKind::Texture => "texture",
        }
    }

    /// Renderable nodes own a program and a render target.
    pub fn is_renderable(self) -> bool {
        !matches!(self, NodeKind::Texture)
    }

    pub fn accepts_inputs(self) -> bool {
        matches!(self, NodeKind::Shader)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shader" => Ok(NodeKind::Shader),
            "const" => Ok(NodeKind::Const),
            "texture" => Ok(NodeKind::Texture),
            other => Err(format!(
                "unknown node kind '{other}' (expected shader, const or texture)"
            )),
        }
    }
}

/// Editor placement. The engine only stores and round-trips it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeLayout {
    pub x: f32,
    pub y: f32,
}

impl NodeLayout {
    /// Cascade used for freshly created nodes: each new node is offset from
    /// the previous one so they never stack exactly.
    pub fn cascade(live_nodes: usize) -> Self {
        let offset = 50.0 + live_nodes as f32 * 30.0;
        Self {
            x: offset,
            y: offset,
        }
    }
}

/// Plain data record for one node. GPU objects live in the program cache and
/// resource manager, keyed by [`NodeId`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// Input slots, each either empty or a weak reference to another node.
    pub inputs: Vec<Option<NodeId>>,
    pub layout: NodeLayout,
}

impl ShaderNode {
    pub fn new(id: NodeId, layout: NodeLayout) -> Self {
        Self {
            id,
            name: format!("Node {id}"),
            kind: NodeKind::Shader,
            source: DEFAULT_SHADER_SOURCE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            inputs: Vec::new(),
            layout,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn input(&self, slot: usize) -> Option<NodeId> {
        self.inputs.get(slot).copied().flatten()
    }

    pub fn references(&self, other: NodeId) -> bool {
        self.inputs.iter().any(|slot| *slot == Some(other))
    }

    pub fn resolution(&self) -> [u32; 2] {
        [self.width, self.height]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_nodes_start_as_default_shader() {
        let node = ShaderNode::new(NodeId(7), NodeLayout::cascade(0));
        assert_eq!(node.name, "Node 7");
        assert_eq!(node.kind, NodeKind::Shader);
        assert_eq!(node.resolution(), [512, 512]);
        assert!(node.source.contains("mainImage"));
        assert!(node.inputs.is_empty());
        assert_eq!(node.layout, NodeLayout { x: 50.0, y: 50.0 });
    }

    #[test]
    fn cascade_offsets_by_live_count() {
        assert_eq!(NodeLayout::cascade(3), NodeLayout { x: 140.0, y: 140.0 });
    }

    #[test]
    fn kind_parses_and_serializes_lowercase() {
        assert_eq!("Texture".parse::<NodeKind>().unwrap(), NodeKind::Texture);
        assert!("mesh".parse::<NodeKind>().is_err());
        assert_eq!(serde_json::to_string(&NodeKind::Const).unwrap(), "\"const\"");
        assert!(NodeKind::Const.is_renderable());
        assert!(!NodeKind::Texture.is_renderable());
        assert!(!NodeKind::Const.accepts_inputs());
    }

    #[test]
    fn input_lookup_treats_missing_slots_as_empty() {
        let mut node = ShaderNode::new(NodeId(1), NodeLayout::default());
        node.inputs = vec![None, Some(NodeId(4))];
        assert_eq!(node.input(0), None);
        assert_eq!(node.input(1), Some(NodeId(4)));
        assert_eq!(node.input(9), None);
        assert!(node.references(NodeId(4)));
    }
}
