use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ConnectionError;
use crate::node::{NodeId, NodeLayout, ShaderNode};
use crate::renderer::backend::TextureHandle;
use crate::renderer::resources::ResourceManager;

/// Size of the sampler bank (`iChannel0..3`).
pub const CHANNEL_COUNT: usize = 4;

/// Live nodes in insertion order, the selection, and the id generator.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<ShaderNode>,
    selected: Option<NodeId>,
    next_id: u32,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            selected: None,
            next_id: 1,
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a default shader node at the cascade position and return its id.
    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let layout = NodeLayout::cascade(self.nodes.len());
        self.nodes.push(ShaderNode::new(id, layout));
        id
    }

    /// Insert a fully formed node (snapshot restore). Advances the id
    /// generator past `node.id`; an existing node with the same id is replaced.
    pub fn insert(&mut self, node: ShaderNode) {
        self.next_id = self.next_id.max(node.id.0.saturating_add(1));
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(slot) => *slot = node,
            None => self.nodes.push(node),
        }
    }

    /// Remove a node and strip it from every other node's slots.
    pub fn remove(&mut self, id: NodeId) -> Option<ShaderNode> {
        let pos = self.nodes.iter().position(|n| n.id == id)?;
        let removed = self.nodes.remove(pos);
        // Slots are emptied in place, never compacted: a consumer's
        // iChannelN keeps pointing at the same producer after a removal.
        for node in &mut self.nodes {
            for slot in node.inputs.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        if self.selected == Some(id) {
            self.selected = None;
        }
        Some(removed)
    }

    pub fn get(&self, id: NodeId) -> Option<&ShaderNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut ShaderNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn nodes(&self) -> &[ShaderNode] {
        &self.nodes
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Never rewinds: ids stay unique for the whole session.
    pub fn advance_next_id(&mut self, at_least: u32) {
        self.next_id = self.next_id.max(at_least);
    }

    /// Wire `source`'s output into `target`'s input `slot`. The graph is left
    /// untouched on error.
    pub fn connect(
        &mut self,
        source: NodeId,
        target: NodeId,
        slot: usize,
    ) -> Result<(), ConnectionError> {
        if source == target {
            return Err(ConnectionError::SelfLoop);
        }
        if !self.contains(source) {
            return Err(ConnectionError::UnknownNode(source));
        }
        if slot >= CHANNEL_COUNT {
            return Err(ConnectionError::SlotOutOfRange {
                slot,
                limit: CHANNEL_COUNT,
            });
        }
        let node = self
            .get_mut(target)
            .ok_or(ConnectionError::UnknownNode(target))?;
        if !node.kind.accepts_inputs() {
            return Err(ConnectionError::NoInputSlots(target));
        }
        if node.inputs.len() <= slot {
            node.inputs.resize(slot + 1, None);
        }
        node.inputs[slot] = Some(source);
        Ok(())
    }

    /// Clear one slot. Returns the id that was wired there.
    pub fn disconnect(&mut self, target: NodeId, slot: usize) -> Option<NodeId> {
        self.get_mut(target)?.inputs.get_mut(slot)?.take()
    }

    pub fn clear_inputs(&mut self, id: NodeId) {
        if let Some(node) = self.get_mut(id) {
            node.inputs.clear();
        }
    }

    pub fn selected(&self) -> Option<NodeId> {
        self.selected
    }

    /// Select a live node, or clear the selection with `None`. Unknown ids
    /// clear it too.
    pub fn select(&mut self, id: Option<NodeId>) {
        self.selected = id.filter(|id| self.contains(*id));
    }

    /// Nodes on a cycle or downstream of one, found with Kahn's algorithm.
    /// These may sample a previous frame's texture whatever the insertion
    /// order.
    pub fn feedback_nodes(&self) -> Vec<NodeId> {
        let live: HashSet<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        let mut indeg: HashMap<NodeId, usize> = self.nodes.iter().map(|n| (n.id, 0)).collect();
        let mut outgoing: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for node in &self.nodes {
            for source in node.inputs.iter().flatten() {
                if !live.contains(source) {
                    continue;
                }
                if let Some(d) = indeg.get_mut(&node.id) {
                    *d += 1;
                }
                outgoing.entry(*source).or_default().push(node.id);
            }
        }

        let mut queue: VecDeque<NodeId> = self
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| indeg.get(id) == Some(&0))
            .collect();
        let mut done: HashSet<NodeId> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            done.insert(id);
            for next in outgoing.get(&id).into_iter().flatten() {
                if let Some(d) = indeg.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        self.nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !done.contains(id))
            .collect()
    }
}

/// What one sampler channel resolves to at draw time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelInput<'a> {
    pub texture: Option<&'a TextureHandle>,
    pub width: u32,
    pub height: u32,
}

impl ChannelInput<'_> {
    pub fn resolution(&self) -> [f32; 3] {
        [self.width as f32, self.height as f32, 1.0]
    }
}

/// Resolve the channel bank for `node`. Empty slots, dangling ids and inputs
/// without storage all resolve to no texture with zero size.
pub fn resolve_inputs<'a>(
    node: &ShaderNode,
    graph: &Graph,
    resources: &'a ResourceManager,
) -> [ChannelInput<'a>; CHANNEL_COUNT] {
    let mut bank = [ChannelInput::default(); CHANNEL_COUNT];
    for (slot, channel) in bank.iter_mut().enumerate() {
        let Some(source) = node.input(slot) else {
            continue;
        };
        if !graph.contains(source) {
            continue;
        }
        if let Some(storage) = resources.get(source) {
            let [width, height] = storage.size();
            *channel = ChannelInput {
                texture: Some(storage.texture()),
                width,
                height,
            };
        }
    }
    bank
}
