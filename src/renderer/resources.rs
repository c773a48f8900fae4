//! Per-node GPU storage: render targets for renderable nodes, one image
//! texture for `texture` nodes.

use std::collections::HashMap;

use anyhow::Context;
use image::RgbaImage;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::node::{NodeId, ShaderNode};

use super::backend::{FramebufferHandle, GpuBackend, TextureDesc, TextureHandle};

/// Opaque black 1x1, bound until an uploaded image arrives.
const PLACEHOLDER_PIXEL: [u8; 4] = [0, 0, 0, 255];

#[derive(Debug)]
pub struct RenderTarget {
    pub texture: TextureHandle,
    pub framebuffer: FramebufferHandle,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub struct ImageTexture {
    pub texture: TextureHandle,
    pub width: u32,
    pub height: u32,
    /// False while the placeholder is bound.
    pub loaded: bool,
}

#[derive(Debug)]
pub enum NodeResources {
    Target(RenderTarget),
    Image(ImageTexture),
}

impl NodeResources {
    pub fn texture(&self) -> &TextureHandle {
        match self {
            NodeResources::Target(t) => &t.texture,
            NodeResources::Image(i) => &i.texture,
        }
    }

    pub fn size(&self) -> [u32; 2] {
        match self {
            NodeResources::Target(t) => [t.width, t.height],
            NodeResources::Image(i) => [i.width, i.height],
        }
    }
}

/// Allocation and free counters per object type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub textures_created: u64,
    pub textures_freed: u64,
    pub framebuffers_created: u64,
    pub framebuffers_freed: u64,
    pub image_uploads: u64,
}

impl ResourceStats {
    pub fn live_textures(&self) -> u64 {
        self.textures_created - self.textures_freed
    }

    pub fn live_framebuffers(&self) -> u64 {
        self.framebuffers_created - self.framebuffers_freed
    }
}

#[derive(Debug, Default)]
pub struct ResourceManager {
    nodes: HashMap<NodeId, NodeResources>,
    stats: ResourceStats,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the node's storage in line with its kind and resolution.
    ///
    /// Renderable nodes always get a fresh target at the current size; any
    /// prior storage is freed first. `texture` nodes keep an existing texture
    /// (a rendered one becomes the image, its framebuffer is dropped) and only
    /// get a placeholder when they hold nothing. On failure the node is left
    /// with no storage at all.
    pub fn allocate<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        node: &ShaderNode,
    ) -> EngineResult<()> {
        if node.kind.is_renderable() {
            self.release(backend, node.id);
            let target = self.create_target(backend, node.width, node.height).map_err(|e| {
                tracing::warn!(node = %node.id, "render target allocation failed: {e:#}");
                EngineError::allocation(node.id, format!("{e:#}"))
            })?;
            tracing::debug!(node = %node.id, width = node.width, height = node.height, "render target allocated");
            self.nodes.insert(node.id, NodeResources::Target(target));
            return Ok(());
        }

        match self.nodes.remove(&node.id) {
            Some(NodeResources::Image(image)) => {
                self.nodes.insert(node.id, NodeResources::Image(image));
            }
            Some(NodeResources::Target(target)) => {
                backend.delete_framebuffer(target.framebuffer);
                self.stats.framebuffers_freed += 1;
                self.nodes.insert(
                    node.id,
                    NodeResources::Image(ImageTexture {
                        texture: target.texture,
                        width: target.width,
                        height: target.height,
                        loaded: true,
                    }),
                );
            }
            None => {
                let texture = backend
                    .create_texture(&TextureDesc::image(1, 1, &PLACEHOLDER_PIXEL))
                    .map_err(|e| EngineError::allocation(node.id, format!("{e:#}")))?;
                self.stats.textures_created += 1;
                self.nodes.insert(
                    node.id,
                    NodeResources::Image(ImageTexture {
                        texture,
                        width: 1,
                        height: 1,
                        loaded: false,
                    }),
                );
            }
        }
        Ok(())
    }

    fn create_target<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> anyhow::Result<RenderTarget> {
        let texture = backend
            .create_texture(&TextureDesc::render_target(width, height))
            .with_context(|| format!("create {width}x{height} color texture"))?;
        self.stats.textures_created += 1;
        let framebuffer = match backend.create_framebuffer(&texture) {
            Ok(fb) => fb,
            Err(e) => {
                backend.delete_texture(texture);
                self.stats.textures_freed += 1;
                return Err(e.context("create framebuffer"));
            }
        };
        self.stats.framebuffers_created += 1;
        Ok(RenderTarget {
            texture,
            framebuffer,
            width,
            height,
        })
    }

    /// Upload a decoded image into a `texture` node, flipping rows so the
    /// image's top lands at the top of texture space. The node's resolution
    /// becomes the image's size.
    pub fn load_image<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        node: &mut ShaderNode,
        image: &RgbaImage,
    ) -> EngineResult<()> {
        let (width, height) = image.dimensions();
        let flipped = image::imageops::flip_vertical(image);
        let desc = TextureDesc::image(width, height, flipped.as_raw());

        match self.nodes.get_mut(&node.id) {
            Some(NodeResources::Image(slot)) => {
                backend
                    .upload_texture(&slot.texture, &desc)
                    .map_err(|e| EngineError::allocation(node.id, format!("{e:#}")))?;
                slot.width = width;
                slot.height = height;
                slot.loaded = true;
            }
            Some(NodeResources::Target(_)) | None => {
                return Err(EngineError::WrongKind {
                    node: node.id,
                    actual: node.kind,
                    expected: crate::node::NodeKind::Texture,
                });
            }
        }
        self.stats.image_uploads += 1;
        node.width = width;
        node.height = height;
        tracing::info!(node = %node.id, width, height, "image uploaded");
        Ok(())
    }

    /// Read a render target's pixels back as a top-down image. Leaves the
    /// default framebuffer bound.
    pub fn read_target<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        node: NodeId,
    ) -> Option<RgbaImage> {
        let target = self.target(node)?;
        backend.bind_framebuffer(Some(&target.framebuffer));
        let pixels = backend.read_pixels(target.width, target.height);
        backend.bind_framebuffer(None);
        let mut image = RgbaImage::from_raw(target.width, target.height, pixels)?;
        image::imageops::flip_vertical_in_place(&mut image);
        Some(image)
    }

    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, node: NodeId) {
        match self.nodes.remove(&node) {
            Some(NodeResources::Target(target)) => {
                backend.delete_framebuffer(target.framebuffer);
                backend.delete_texture(target.texture);
                self.stats.framebuffers_freed += 1;
                self.stats.textures_freed += 1;
            }
            Some(NodeResources::Image(image)) => {
                backend.delete_texture(image.texture);
                self.stats.textures_freed += 1;
            }
            None => {}
        }
    }

    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.release(backend, id);
        }
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeResources> {
        self.nodes.get(&node)
    }

    pub fn texture(&self, node: NodeId) -> Option<&TextureHandle> {
        self.nodes.get(&node).map(NodeResources::texture)
    }

    pub fn target(&self, node: NodeId) -> Option<&RenderTarget> {
        match self.nodes.get(&node) {
            Some(NodeResources::Target(t)) => Some(t),
            _ => None,
        }
    }

    pub fn image(&self, node: NodeId) -> Option<&ImageTexture> {
        match self.nodes.get(&node) {
            Some(NodeResources::Image(i)) => Some(i),
            _ => None,
        }
    }

    pub fn stats(&self) -> ResourceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeLayout};
    use crate::renderer::backend::{Sampling, TextureWrap};
    use crate::renderer::headless::HeadlessBackend;

    fn node(id: u32, kind: NodeKind) -> ShaderNode {
        let mut n = ShaderNode::new(NodeId(id), NodeLayout::default()).with_resolution(8, 4);
        n.kind = kind;
        n
    }

    #[test]
    fn renderable_nodes_get_clamped_targets_at_their_size() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let n = node(1, NodeKind::Shader);
        resources.allocate(&mut backend, &n).unwrap();

        let target = resources.target(n.id).unwrap();
        assert_eq!([target.width, target.height], [8, 4]);
        assert_eq!(backend.texture_size(&target.texture), Some([8, 4]));
        assert_eq!(backend.texture_sampling(&target.texture), Some(Sampling::RENDER_TARGET));
        assert_eq!(backend.live_framebuffers(), 1);
    }

    #[test]
    fn reallocation_frees_the_previous_target() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let mut n = node(1, NodeKind::Shader);
        resources.allocate(&mut backend, &n).unwrap();
        n.width = 16;
        resources.allocate(&mut backend, &n).unwrap();

        assert_eq!(backend.live_textures(), 1);
        assert_eq!(backend.live_framebuffers(), 1);
        assert_eq!(resources.target(n.id).unwrap().width, 16);
        let stats = resources.stats();
        assert_eq!(stats.live_textures(), 1);
        assert_eq!(stats.textures_freed, 1);
    }

    #[test]
    fn texture_nodes_keep_uploaded_images_across_reallocation() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let mut n = node(2, NodeKind::Texture);
        resources.allocate(&mut backend, &n).unwrap();
        assert_eq!(resources.image(n.id).map(|i| i.loaded), Some(false));

        let img = RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        resources.load_image(&mut backend, &mut n, &img).unwrap();
        assert_eq!(n.resolution(), [3, 2]);

        resources.allocate(&mut backend, &n).unwrap();
        let texture = resources.texture(n.id).unwrap();
        assert_eq!(backend.texture_size(texture), Some([3, 2]));
        assert_eq!(
            backend.texture_sampling(texture).map(|s| s.wrap),
            Some(TextureWrap::Repeat)
        );
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn uploaded_images_are_stored_bottom_up() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let mut n = node(3, NodeKind::Texture);
        resources.allocate(&mut backend, &n).unwrap();

        let mut img = RgbaImage::new(1, 2);
        img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        img.put_pixel(0, 1, image::Rgba([0, 0, 255, 255]));
        resources.load_image(&mut backend, &mut n, &img).unwrap();

        let pixels = backend.texture_pixels(resources.texture(n.id).unwrap()).unwrap();
        // GL row 0 is the bottom of the image
        assert_eq!(&pixels[..4], &[0, 0, 255, 255]);
        assert_eq!(&pixels[4..], &[255, 0, 0, 255]);
    }

    #[test]
    fn target_to_image_keeps_the_rendered_texture() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let mut n = node(4, NodeKind::Shader);
        resources.allocate(&mut backend, &n).unwrap();
        let rendered = resources.texture(n.id).unwrap().raw();

        n.kind = NodeKind::Texture;
        resources.allocate(&mut backend, &n).unwrap();
        assert_eq!(resources.texture(n.id).unwrap().raw(), rendered);
        assert_eq!(backend.live_framebuffers(), 0);

        n.kind = NodeKind::Const;
        resources.allocate(&mut backend, &n).unwrap();
        assert_ne!(resources.texture(n.id).unwrap().raw(), rendered);
        assert_eq!(backend.live_textures(), 1);
    }

    #[test]
    fn read_target_returns_rows_top_down() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let mut n = node(7, NodeKind::Shader);
        n.width = 1;
        n.height = 2;
        resources.allocate(&mut backend, &n).unwrap();

        // GL row 0 (bottom) blue, row 1 (top) red.
        let texture = &resources.target(n.id).unwrap().texture;
        let bottom_up = [0, 0, 255, 255, 255, 0, 0, 255];
        backend
            .upload_texture(texture, &TextureDesc::image(1, 2, &bottom_up))
            .unwrap();

        let image = resources.read_target(&mut backend, n.id).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [0, 0, 255, 255]);
        assert!(resources.read_target(&mut backend, NodeId(99)).is_none());
        assert!(backend.violations().is_empty());
    }

    #[test]
    fn allocation_failure_leaves_the_node_without_storage() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let n = node(5, NodeKind::Shader);
        resources.allocate(&mut backend, &n).unwrap();

        backend.set_texture_limit(Some(0));
        let err = resources.allocate(&mut backend, &n).unwrap_err();
        assert!(matches!(err, EngineError::ResourceAllocation { node, .. } if node == n.id));
        assert!(resources.get(n.id).is_none());
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn load_image_rejects_render_targets() {
        let mut backend = HeadlessBackend::new();
        let mut resources = ResourceManager::new();
        let mut n = node(6, NodeKind::Shader);
        resources.allocate(&mut backend, &n).unwrap();
        let err = resources
            .load_image(&mut backend, &mut n, &RgbaImage::new(2, 2))
            .unwrap_err();
        assert!(matches!(err, EngineError::WrongKind { .. }));
        assert_eq!(n.resolution(), [8, 4]);
    }
}
