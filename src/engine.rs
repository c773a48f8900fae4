//! The session: owns the rendering context and every component, and exposes
//! the operations the editor calls between frames.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, EngineError, EngineResult};
use crate::graph::Graph;
use crate::image_loader::{self, ImageLoader};
use crate::node::{DEFAULT_HEIGHT, DEFAULT_WIDTH, NodeId, NodeKind, ShaderNode};
use crate::renderer::backend::GpuBackend;
use crate::renderer::program_cache::ProgramCache;
use crate::renderer::resources::ResourceManager;
use crate::renderer::scheduler::{FrameReport, Scheduler, Surface};
use crate::renderer::shaders::{
    DEFAULT_CONST_SOURCE, DEFAULT_SHADER_SOURCE, const_color_source, hex_to_rgb,
    parse_const_color, rgb_to_hex,
};
use crate::renderer::source_transform::transform;
use crate::renderer::uniforms::{DEFAULT_SAMPLE_RATE, FrameClock};
use crate::snapshot::{GraphSnapshot, NodeRecord, SNAPSHOT_VERSION, Viewport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Resolution given to newly created nodes.
    pub default_width: u32,
    pub default_height: u32,
    /// Produce a presentation surface per node each frame.
    pub present: bool,
    pub sample_rate: f32,
    /// Presentation target clear color before each blit.
    pub clear_color: [f32; 4],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_width: DEFAULT_WIDTH,
            default_height: DEFAULT_HEIGHT,
            present: true,
            sample_rate: DEFAULT_SAMPLE_RATE,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

impl EngineConfig {
    pub fn with_default_resolution(mut self, width: u32, height: u32) -> Self {
        self.default_width = width;
        self.default_height = height;
        self
    }

    pub fn with_presentation(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.clear_color = rgba;
        self
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid engine config {}", path.display()))?;
        if config.default_width == 0 || config.default_height == 0 {
            anyhow::bail!(
                "invalid default resolution {}x{} in {}",
                config.default_width,
                config.default_height,
                path.display()
            );
        }
        Ok(config)
    }
}

/// A failed compile or link, handed to the editor for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub node: NodeId,
    pub error: CompileError,
}

pub struct Engine<B: GpuBackend> {
    backend: B,
    config: EngineConfig,
    graph: Graph,
    programs: ProgramCache,
    resources: ResourceManager,
    scheduler: Scheduler,
    clock: FrameClock,
    diagnostics: Vec<Diagnostic>,
    loader: Option<ImageLoader>,
    /// Last uploaded image per texture node, kept for snapshots.
    images: HashMap<NodeId, RgbaImage>,
    viewport: Viewport,
}

impl<B: GpuBackend> Engine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        Self::with_graph(backend, config, Graph::new())
    }

    fn with_graph(backend: B, config: EngineConfig, graph: Graph) -> Self {
        Self {
            backend,
            scheduler: Scheduler::new(config.present, config.clear_color),
            clock: FrameClock::new(config.sample_rate),
            config,
            graph,
            programs: ProgramCache::new(),
            resources: ResourceManager::new(),
            diagnostics: Vec::new(),
            loader: None,
            images: HashMap::new(),
            viewport: Viewport::default(),
        }
    }

    /// Rebuild a session from a snapshot: nodes in recorded order, slots by
    /// id, then every node compiled and allocated. Compile failures become
    /// diagnostics; allocation and image failures are logged and leave that
    /// node blank.
    pub fn from_snapshot(
        backend: B,
        config: EngineConfig,
        snapshot: &GraphSnapshot,
    ) -> EngineResult<Self> {
        let graph = snapshot.build_graph()?;
        let mut engine = Self::with_graph(backend, config, graph);
        engine.viewport = snapshot.viewport;

        for id in engine.graph.ids() {
            if let Err(e) = engine.allocate(id) {
                tracing::warn!(node = %id, "restore: {e}");
            }
            let _ = engine.compile_node(id);
        }
        for record in &snapshot.nodes {
            let Some(url) = record.image.as_deref() else {
                continue;
            };
            if record.kind != NodeKind::Texture {
                tracing::warn!(node = %record.id, "restore: ignoring image on {} node", record.kind);
                continue;
            }
            let restored = image_loader::decode_image_data_url(url)
                .map_err(|e| EngineError::image(format!("{e:#}")))
                .and_then(|img| engine.upload_image(record.id, &img));
            if let Err(e) = restored {
                tracing::warn!(node = %record.id, "restore: {e}");
            }
        }
        tracing::info!(nodes = engine.graph.len(), "graph restored");
        Ok(engine)
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn node(&self, id: NodeId) -> Option<&ShaderNode> {
        self.graph.get(id)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    pub fn has_program(&self, id: NodeId) -> bool {
        self.programs.has_program(id)
    }

    pub fn surface(&self, id: NodeId) -> Option<&Surface> {
        self.scheduler.surface(id)
    }

    /// Diagnostics produced since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn feedback_nodes(&self) -> Vec<NodeId> {
        self.graph.feedback_nodes()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn selected(&self) -> Option<NodeId> {
        self.graph.selected()
    }

    // ── Node operations ────────────────────────────────────────────────────

    /// Add a default shader node and select it. The node exists even when
    /// allocation fails; the error then names it.
    pub fn create_node(&mut self) -> EngineResult<NodeId> {
        let id = self.graph.add_node();
        let (w, h) = (self.config.default_width, self.config.default_height);
        if let Some(node) = self.graph.get_mut(id) {
            node.width = w;
            node.height = h;
        }
        self.graph.select(Some(id));
        tracing::info!(node = %id, width = w, height = h, "node created");

        let allocated = self.allocate(id);
        let _ = self.compile_node(id);
        allocated.map(|()| id)
    }

    pub fn remove_node(&mut self, id: NodeId) -> EngineResult<()> {
        self.graph.remove(id).ok_or(EngineError::unknown_node(id))?;
        self.programs.release(&mut self.backend, id);
        self.resources.release(&mut self.backend, id);
        self.scheduler.forget(id);
        self.images.remove(&id);
        tracing::info!(node = %id, "node removed");
        Ok(())
    }

    /// Replace a node's source. Renderable nodes recompile immediately; on
    /// failure the previous program stays active.
    pub fn set_source(&mut self, id: NodeId, source: impl Into<String>) -> EngineResult<()> {
        let node = self.node_mut(id)?;
        node.source = source.into();
        if node.kind.is_renderable() {
            self.compile_node(id)
                .map_err(|e| EngineError::compile(id, e))?;
        }
        Ok(())
    }

    pub fn recompile(&mut self, id: NodeId) -> EngineResult<()> {
        let kind = self.node_ref(id)?.kind;
        if kind.is_renderable() {
            self.compile_node(id)
                .map_err(|e| EngineError::compile(id, e))?;
        }
        Ok(())
    }

    /// Switch a node's kind. Nodes that stop taking inputs lose their slots;
    /// storage follows the new kind and renderable nodes recompile. Setting
    /// the current kind again is a no-op; use [`Engine::recompile`] instead.
    pub fn set_kind(&mut self, id: NodeId, kind: NodeKind) -> EngineResult<()> {
        let node = self.node_mut(id)?;
        if node.kind == kind {
            return Ok(());
        }
        let previous = node.kind;
        node.kind = kind;
        if kind == NodeKind::Const
            && (node.source.trim().is_empty() || node.source == DEFAULT_SHADER_SOURCE)
        {
            node.source = DEFAULT_CONST_SOURCE.to_string();
        }
        if !kind.accepts_inputs() {
            self.graph.clear_inputs(id);
        }
        if kind == NodeKind::Texture {
            self.programs.release(&mut self.backend, id);
            // The last rendered frame becomes the node's image, so snapshots keep it.
            if let Some(rendered) = self.resources.read_target(&mut self.backend, id) {
                self.images.insert(id, rendered);
            }
        } else {
            self.images.remove(&id);
        }
        tracing::info!(node = %id, from = %previous, to = %kind, "node kind changed");

        let allocated = self.allocate(id);
        let compiled = if kind.is_renderable() {
            self.compile_node(id)
        } else {
            Ok(())
        };
        allocated?;
        compiled.map_err(|e| EngineError::compile(id, e))
    }

    /// Resize a node. Renderable nodes get fresh targets at the new size;
    /// nothing else in the graph changes.
    pub fn set_resolution(&mut self, id: NodeId, width: u32, height: u32) -> EngineResult<()> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidResolution { width, height });
        }
        let node = self.node_mut(id)?;
        if node.resolution() == [width, height] {
            return Ok(());
        }
        node.width = width;
        node.height = height;
        if node.kind.is_renderable() {
            self.allocate(id)?;
        }
        Ok(())
    }

    pub fn rename_node(&mut self, id: NodeId, name: impl Into<String>) -> EngineResult<()> {
        self.node_mut(id)?.name = name.into();
        Ok(())
    }

    pub fn move_node(&mut self, id: NodeId, x: f32, y: f32) -> EngineResult<()> {
        let node = self.node_mut(id)?;
        node.layout.x = x;
        node.layout.y = y;
        Ok(())
    }

    pub fn select_node(&mut self, id: Option<NodeId>) -> EngineResult<()> {
        if let Some(id) = id {
            self.node_ref(id)?;
        }
        self.graph.select(id);
        Ok(())
    }

    pub fn connect(&mut self, source: NodeId, target: NodeId, slot: usize) -> EngineResult<()> {
        self.graph.connect(source, target, slot)?;
        tracing::debug!(%source, %target, slot, "connected");
        Ok(())
    }

    pub fn disconnect(&mut self, target: NodeId, slot: usize) -> EngineResult<Option<NodeId>> {
        self.node_ref(target)?;
        Ok(self.graph.disconnect(target, slot))
    }

    /// Point a `const` node at a solid color.
    pub fn set_const_color(&mut self, id: NodeId, rgb: [f32; 3]) -> EngineResult<()> {
        self.expect_kind(id, NodeKind::Const)?;
        self.set_source(id, const_color_source(rgb))
    }

    pub fn const_color(&self, id: NodeId) -> Option<[f32; 3]> {
        let node = self.graph.get(id)?;
        (node.kind == NodeKind::Const)
            .then(|| parse_const_color(&node.source))
            .flatten()
    }

    /// [`Engine::set_const_color`] from a `#rrggbb` picker value.
    pub fn set_const_hex(&mut self, id: NodeId, hex: &str) -> EngineResult<()> {
        let rgb = hex_to_rgb(hex).ok_or_else(|| EngineError::InvalidColor(hex.to_string()))?;
        self.set_const_color(id, rgb)
    }

    /// The const color as a `#rrggbb` picker value.
    pub fn const_hex(&self, id: NodeId) -> Option<String> {
        self.const_color(id).map(rgb_to_hex)
    }

    // ── Images ─────────────────────────────────────────────────────────────

    /// Upload a decoded image into a `texture` node; its resolution becomes
    /// the image's.
    pub fn upload_image(&mut self, id: NodeId, image: &RgbaImage) -> EngineResult<()> {
        self.expect_kind(id, NodeKind::Texture)?;
        if self.resources.image(id).is_none() {
            self.allocate(id)?;
        }
        let node = self
            .graph
            .get_mut(id)
            .ok_or(EngineError::unknown_node(id))?;
        self.resources.load_image(&mut self.backend, node, image)?;
        self.images.insert(id, image.clone());
        Ok(())
    }

    /// Hand encoded image bytes to the background decoder. The node keeps its
    /// current texture until [`Engine::poll_image_uploads`] applies the result.
    pub fn queue_image_bytes(&mut self, id: NodeId, bytes: Vec<u8>) -> EngineResult<()> {
        self.expect_kind(id, NodeKind::Texture)?;
        if self.loader.is_none() {
            let loader = ImageLoader::spawn().map_err(|e| EngineError::image(format!("{e:#}")))?;
            self.loader = Some(loader);
        }
        if let Some(loader) = self.loader.as_mut() {
            loader
                .queue(id, bytes)
                .map_err(|e| EngineError::image(format!("{e:#}")))?;
        }
        Ok(())
    }

    /// Apply every decode that has finished. Never blocks.
    pub fn poll_image_uploads(&mut self) -> Vec<(NodeId, EngineResult<()>)> {
        self.apply_decoded(None)
    }

    /// Like [`Engine::poll_image_uploads`] but waits up to `timeout` for
    /// outstanding decodes.
    pub fn wait_image_uploads(&mut self, timeout: Duration) -> Vec<(NodeId, EngineResult<()>)> {
        self.apply_decoded(Some(timeout))
    }

    pub fn pending_image_uploads(&self) -> usize {
        self.loader.as_ref().map_or(0, ImageLoader::pending)
    }

    fn apply_decoded(&mut self, wait: Option<Duration>) -> Vec<(NodeId, EngineResult<()>)> {
        let Some(loader) = self.loader.as_mut() else {
            return Vec::new();
        };
        let decoded = loader.drain(wait);
        let mut results = Vec::with_capacity(decoded.len());
        for item in decoded {
            let result = match item.result {
                Ok(image) => self.upload_image(item.node, &image),
                Err(message) => Err(EngineError::image(message)),
            };
            if let Err(e) = &result {
                tracing::warn!(node = %item.node, "image upload failed: {e}");
            }
            results.push((item.node, result));
        }
        results
    }

    // ── Frames ─────────────────────────────────────────────────────────────

    pub fn set_mouse(&mut self, mouse: [f32; 4]) {
        self.clock.set_mouse(mouse);
    }

    /// Render one frame at wall-clock session time.
    pub fn render_frame(&mut self) -> FrameReport {
        let uniforms = self.clock.tick();
        self.scheduler.render_frame(
            &mut self.backend,
            &self.graph,
            &mut self.programs,
            &self.resources,
            &uniforms,
        )
    }

    /// Render one frame with an explicit `iTime`, for reproducible output.
    pub fn render_frame_at(&mut self, time: f32) -> FrameReport {
        let uniforms = self.clock.at(time);
        self.scheduler.render_frame(
            &mut self.backend,
            &self.graph,
            &mut self.programs,
            &self.resources,
            &uniforms,
        )
    }

    // ── Persistence ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> EngineResult<GraphSnapshot> {
        let mut nodes = Vec::with_capacity(self.graph.len());
        for node in self.graph.nodes() {
            let image = match self.images.get(&node.id) {
                Some(img) => Some(
                    image_loader::encode_png_data_url(img)
                        .map_err(|e| EngineError::image(format!("{e:#}")))?,
                ),
                None => None,
            };
            nodes.push(NodeRecord::from_node(node, image));
        }
        Ok(GraphSnapshot {
            version: SNAPSHOT_VERSION,
            viewport: self.viewport,
            next_id: self.graph.next_id(),
            selected: self.graph.selected(),
            nodes,
        })
    }

    /// Free every GPU object and hand the context back.
    pub fn shutdown(mut self) -> B {
        self.programs.release_all(&mut self.backend);
        self.resources.release_all(&mut self.backend);
        self.scheduler.clear();
        self.loader.take();
        tracing::debug!("engine shut down");
        self.backend
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn node_ref(&self, id: NodeId) -> EngineResult<&ShaderNode> {
        self.graph.get(id).ok_or(EngineError::unknown_node(id))
    }

    fn node_mut(&mut self, id: NodeId) -> EngineResult<&mut ShaderNode> {
        self.graph.get_mut(id).ok_or(EngineError::unknown_node(id))
    }

    fn expect_kind(&self, id: NodeId, expected: NodeKind) -> EngineResult<()> {
        let node = self.node_ref(id)?;
        if node.kind != expected {
            return Err(EngineError::WrongKind {
                node: id,
                actual: node.kind,
                expected,
            });
        }
        Ok(())
    }

    fn allocate(&mut self, id: NodeId) -> EngineResult<()> {
        let node = self.graph.get(id).ok_or(EngineError::unknown_node(id))?;
        self.resources.allocate(&mut self.backend, node)
    }

    /// Transform, compile and install. Failures are recorded as diagnostics
    /// and leave the installed program untouched. `texture` nodes are a no-op.
    fn compile_node(&mut self, id: NodeId) -> Result<(), CompileError> {
        let Some(node) = self.graph.get(id) else {
            return Ok(());
        };
        if !node.kind.is_renderable() {
            return Ok(());
        }
        let unit = transform(&node.source, node.kind);
        match self.programs.compile(&mut self.backend, &unit.source) {
            Ok(program) => {
                self.programs.install(&mut self.backend, id, program);
                tracing::debug!(node = %id, injected = unit.report.injected_uniforms.len(), "program compiled");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(node = %id, "{error}");
                self.diagnostics.push(Diagnostic {
                    node: id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }
}
