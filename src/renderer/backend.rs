//! The rendering-context seam.
//!
//! Everything the engine does on the GPU goes through [`GpuBackend`], a small
//! GL-shaped interface. Object handles are move-only: `delete_*` consumes the
//! handle, so a freed object cannot be used or freed again.

use anyhow::Result;

use crate::error::ShaderStage;

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Wrap a backend-assigned object name. Only backends should call this.
            pub fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            pub fn raw(&self) -> u32 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// A compiled (or failed) shader stage object.
    ShaderHandle
);
gpu_handle!(
    /// A linked (or failed) program object.
    ProgramHandle
);
gpu_handle!(TextureHandle);
gpu_handle!(
    /// A framebuffer with one texture as its color attachment.
    FramebufferHandle
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFilter {
    Linear,
    LinearMipmapLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureWrap {
    ClampToEdge,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub min_filter: TextureFilter,
    pub mag_filter: TextureFilter,
    pub wrap: TextureWrap,
    pub mipmaps: bool,
}

impl Sampling {
    /// Node render targets: linear, clamped, no mipmaps.
    pub const RENDER_TARGET: Sampling = Sampling {
        min_filter: TextureFilter::Linear,
        mag_filter: TextureFilter::Linear,
        wrap: TextureWrap::ClampToEdge,
        mipmaps: false,
    };

    /// Uploaded images: trilinear, repeating, mipmapped.
    pub const IMAGE: Sampling = Sampling {
        min_filter: TextureFilter::LinearMipmapLinear,
        mag_filter: TextureFilter::Linear,
        wrap: TextureWrap::Repeat,
        mipmaps: true,
    };
}

/// RGBA8 texture description. `pixels`, when present, is tightly packed,
/// `width * height * 4` bytes, rows bottom-up (GL order).
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub width: u32,
    pub height: u32,
    pub sampling: Sampling,
    pub pixels: Option<&'a [u8]>,
}

impl<'a> TextureDesc<'a> {
    pub fn render_target(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            sampling: Sampling::RENDER_TARGET,
            pixels: None,
        }
    }

    pub fn image(width: u32, height: u32, pixels: &'a [u8]) -> Self {
        Self {
            width,
            height,
            sampling: Sampling::IMAGE,
            pixels: Some(pixels),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue<'a> {
    Int(i32),
    Float(f32),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Vec3Array(&'a [[f32; 3]]),
}

/// A GL-like rendering context. All calls happen on the thread that owns the
/// context; implementations are not expected to be `Sync`.
pub trait GpuBackend {
    /// Create and compile a shader stage. Compile failure is not an error
    /// here; query it with [`GpuBackend::shader_compile_status`].
    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderHandle>;

    /// `Err` carries the info log.
    fn shader_compile_status(&self, shader: &ShaderHandle) -> std::result::Result<(), String>;

    fn delete_shader(&mut self, shader: ShaderHandle);

    /// Attach both stages, bind the `position` attribute to location 0 and
    /// link. Link failure is reported by [`GpuBackend::program_link_status`].
    fn create_program(
        &mut self,
        vertex: &ShaderHandle,
        fragment: &ShaderHandle,
    ) -> Result<ProgramHandle>;

    fn program_link_status(&self, program: &ProgramHandle) -> std::result::Result<(), String>;

    fn delete_program(&mut self, program: ProgramHandle);

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureHandle>;

    /// Replace a texture's storage and contents, regenerating mipmaps when the
    /// sampling asks for them.
    fn upload_texture(&mut self, texture: &TextureHandle, desc: &TextureDesc<'_>) -> Result<()>;

    fn delete_texture(&mut self, texture: TextureHandle);

    /// Create a framebuffer whose sole color attachment is `texture`. Fails when
    /// the framebuffer is incomplete.
    fn create_framebuffer(&mut self, texture: &TextureHandle) -> Result<FramebufferHandle>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn use_program(&mut self, program: Option<&ProgramHandle>);

    /// `None` binds the presentation target.
    fn bind_framebuffer(&mut self, framebuffer: Option<&FramebufferHandle>);

    /// Size the presentation target (the default framebuffer) for one blit.
    fn prepare_presentation(&mut self, width: u32, height: u32) -> Result<()>;

    fn viewport(&mut self, width: u32, height: u32);

    fn clear(&mut self, rgba: [f32; 4]);

    /// Set a uniform on the current program. Returns `false` when the program
    /// has no active uniform of that name, which callers treat as a no-op.
    fn set_uniform(&mut self, program: &ProgramHandle, name: &str, value: UniformValue<'_>)
    -> bool;

    fn bind_texture(&mut self, unit: u32, texture: Option<&TextureHandle>);

    /// Draw the full-screen quad with `program` into the bound framebuffer.
    fn draw_quad(&mut self, program: &ProgramHandle);

    /// Read back the bound framebuffer as RGBA8, rows bottom-up.
    fn read_pixels(&mut self, width: u32, height: u32) -> Vec<u8>;
}
