//! One frame: draw every renderable node into its target, then present.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use image::RgbaImage;
use serde::Serialize;

use crate::graph::{CHANNEL_COUNT, Graph, resolve_inputs};
use crate::node::{NodeId, NodeKind, ShaderNode};

use super::backend::{GpuBackend, TextureHandle, UniformValue};
use super::program_cache::ProgramCache;
use super::resources::ResourceManager;
use super::shaders::BLIT_SAMPLER_UNIFORM;
use super::uniforms::{CHANNEL_UNIFORMS, FrameUniforms};

/// A node's presentation raster, rows top-down.
pub type Surface = RgbaImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Rendered,
    /// `texture` node: nothing to compute, its image was presented.
    Presented,
    SkippedNoProgram,
    SkippedNoResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: NodeId,
    pub outcome: NodeOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub frame: u32,
    pub time: f32,
    pub outcomes: Vec<NodeReport>,
}

impl FrameReport {
    pub fn outcome(&self, node: NodeId) -> Option<NodeOutcome> {
        self.outcomes
            .iter()
            .find(|r| r.node == node)
            .map(|r| r.outcome)
    }

    pub fn rendered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|r| r.outcome == NodeOutcome::Rendered)
            .count()
    }
}

#[derive(Debug)]
pub struct Scheduler {
    present: bool,
    clear_color: [f32; 4],
    surfaces: HashMap<NodeId, Surface>,
}

impl Scheduler {
    pub fn new(present: bool, clear_color: [f32; 4]) -> Self {
        Self {
            present,
            clear_color,
            surfaces: HashMap::new(),
        }
    }

    pub fn surface(&self, node: NodeId) -> Option<&Surface> {
        self.surfaces.get(&node)
    }

    pub fn forget(&mut self, node: NodeId) {
        self.surfaces.remove(&node);
    }

    pub fn clear(&mut self) {
        self.surfaces.clear();
    }

    /// Draw every live node in insertion order. Inputs are sampled as they
    /// stand when the node is drawn, so a node that reads from one later in
    /// the order sees that node's previous frame. Never fails: a node that
    /// cannot draw is reported and skipped.
    pub fn render_frame<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        graph: &Graph,
        programs: &mut ProgramCache,
        resources: &ResourceManager,
        uniforms: &FrameUniforms,
    ) -> FrameReport {
        let mut outcomes = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let outcome = if node.kind == NodeKind::Texture {
                match resources.texture(node.id) {
                    Some(texture) => {
                        self.present_node(backend, programs, node, texture);
                        NodeOutcome::Presented
                    }
                    None => NodeOutcome::SkippedNoResources,
                }
            } else {
                self.draw_node(backend, graph, programs, resources, node, uniforms)
            };
            if outcome != NodeOutcome::Rendered && outcome != NodeOutcome::Presented {
                tracing::trace!(node = %node.id, ?outcome, "node skipped");
            }
            outcomes.push(NodeReport {
                node: node.id,
                outcome,
            });
        }
        FrameReport {
            frame: uniforms.frame,
            time: uniforms.time,
            outcomes,
        }
    }

    fn draw_node<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        graph: &Graph,
        programs: &mut ProgramCache,
        resources: &ResourceManager,
        node: &ShaderNode,
        uniforms: &FrameUniforms,
    ) -> NodeOutcome {
        let Some(program) = programs.program(node.id) else {
            return NodeOutcome::SkippedNoProgram;
        };
        let Some(target) = resources.target(node.id) else {
            return NodeOutcome::SkippedNoResources;
        };

        backend.use_program(Some(program));
        backend.bind_framebuffer(Some(&target.framebuffer));
        backend.viewport(target.width, target.height);
        uniforms.apply(backend, program, [target.width, target.height]);

        let bank = resolve_inputs(node, graph, resources);
        let mut channel_resolution = [[0.0f32; 3]; CHANNEL_COUNT];
        for (unit, channel) in bank.iter().enumerate() {
            backend.bind_texture(unit as u32, channel.texture);
            backend.set_uniform(program, CHANNEL_UNIFORMS[unit], UniformValue::Int(unit as i32));
            channel_resolution[unit] = channel.resolution();
        }
        backend.set_uniform(
            program,
            "iChannelResolution",
            UniformValue::Vec3Array(&channel_resolution),
        );

        backend.draw_quad(program);
        backend.bind_framebuffer(None);

        self.present_node(backend, programs, node, &target.texture);
        NodeOutcome::Rendered
    }

    fn present_node<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        programs: &mut ProgramCache,
        node: &ShaderNode,
        texture: &TextureHandle,
    ) {
        if !self.present {
            return;
        }
        match self.blit(backend, programs, texture, node.width, node.height) {
            Ok(surface) => {
                self.surfaces.insert(node.id, surface);
            }
            Err(e) => tracing::warn!(node = %node.id, "presentation failed: {e:#}"),
        }
    }

    /// Copy `texture` into the presentation target at `width`x`height` and
    /// read it back top-down.
    fn blit<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        programs: &mut ProgramCache,
        texture: &TextureHandle,
        width: u32,
        height: u32,
    ) -> Result<Surface> {
        let blit = programs
            .blit_program(backend)
            .map_err(|e| anyhow!("blit program: {e}"))?;
        backend.bind_framebuffer(None);
        backend
            .prepare_presentation(width, height)
            .context("size presentation target")?;
        backend.viewport(width, height);
        backend.clear(self.clear_color);
        backend.use_program(Some(blit));
        backend.set_uniform(blit, BLIT_SAMPLER_UNIFORM, UniformValue::Int(0));
        backend.bind_texture(0, Some(texture));
        backend.draw_quad(blit);

        let mut pixels = backend.read_pixels(width, height);
        flip_rows(&mut pixels, width as usize * 4);
        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("read back {width}x{height} pixels with the wrong length"))
    }
}

/// Swap bottom-up GL rows into top-down image rows in place.
fn flip_rows(pixels: &mut [u8], stride: usize) {
    if stride == 0 {
        return;
    }
    let rows = pixels.len() / stride;
    for y in 0..rows / 2 {
        let (top, bottom) = pixels.split_at_mut((rows - 1 - y) * stride);
        top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
    }
}
