//! OpenGL ES 3.0 / WebGL2 backend over a caller-provided `glow` context.

use std::collections::HashMap;

use anyhow::{Result, anyhow, bail};
use glow::HasContext;

use crate::error::ShaderStage;

use super::backend::{
    FramebufferHandle, GpuBackend, ProgramHandle, Sampling, ShaderHandle, TextureDesc,
    TextureFilter, TextureHandle, TextureWrap, UniformValue,
};
use super::shaders::{POSITION_ATTRIBUTE, QUAD_VERTICES};

type GlShader = <glow::Context as HasContext>::Shader;
type GlProgram = <glow::Context as HasContext>::Program;
type GlTexture = <glow::Context as HasContext>::Texture;
type GlFramebuffer = <glow::Context as HasContext>::Framebuffer;
type GlBuffer = <glow::Context as HasContext>::Buffer;
type GlVertexArray = <glow::Context as HasContext>::VertexArray;

/// Offscreen stand-in for the default framebuffer, sized per blit so surfaces
/// can be read back at node resolution regardless of the window size.
struct Presentation {
    framebuffer: GlFramebuffer,
    texture: GlTexture,
    width: u32,
    height: u32,
}

/// Every method issues GL calls on the wrapped context, which must be current
/// on the calling thread for the backend's whole life (see [`GlowBackend::new`]).
pub struct GlowBackend {
    gl: glow::Context,
    next_name: u32,
    shaders: HashMap<u32, GlShader>,
    programs: HashMap<u32, GlProgram>,
    textures: HashMap<u32, GlTexture>,
    framebuffers: HashMap<u32, GlFramebuffer>,
    quad_buffer: GlBuffer,
    quad_vao: GlVertexArray,
    presentation: Option<Presentation>,
}

fn filter_enum(filter: TextureFilter) -> i32 {
    match filter {
        TextureFilter::Linear => glow::LINEAR as i32,
        TextureFilter::LinearMipmapLinear => glow::LINEAR_MIPMAP_LINEAR as i32,
    }
}

fn wrap_enum(wrap: TextureWrap) -> i32 {
    match wrap {
        TextureWrap::ClampToEdge => glow::CLAMP_TO_EDGE as i32,
        TextureWrap::Repeat => glow::REPEAT as i32,
    }
}

impl GlowBackend {
    /// Take ownership of `gl` and create the shared quad buffer.
    ///
    /// # Safety
    /// `gl` must be a valid OpenGL ES 3.0 (or WebGL2) context that is current on
    /// this thread now and whenever any method of the returned backend runs.
    pub unsafe fn new(gl: glow::Context) -> Result<Self> {
        let (quad_buffer, quad_vao) = unsafe {
            let buffer = gl
                .create_buffer()
                .map_err(|e| anyhow!("create quad buffer: {e}"))?;
            let vao = gl
                .create_vertex_array()
                .map_err(|e| anyhow!("create quad vertex array: {e}"))?;
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&QUAD_VERTICES),
                glow::STATIC_DRAW,
            );
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 0, 0);
            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            (buffer, vao)
        };
        Ok(Self {
            gl,
            next_name: 1,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            quad_buffer,
            quad_vao,
            presentation: None,
        })
    }

    pub fn context(&self) -> &glow::Context {
        &self.gl
    }

    /// Delete the quad buffer and presentation target and hand the context
    /// back. Node objects must already have been freed by the engine.
    pub fn into_context(self) -> glow::Context {
        unsafe {
            self.gl.delete_vertex_array(self.quad_vao);
            self.gl.delete_buffer(self.quad_buffer);
            if let Some(p) = &self.presentation {
                self.gl.delete_framebuffer(p.framebuffer);
                self.gl.delete_texture(p.texture);
            }
        }
        if !self.programs.is_empty() || !self.textures.is_empty() {
            tracing::warn!(
                programs = self.programs.len(),
                textures = self.textures.len(),
                "glow backend dropped with live objects"
            );
        }
        self.gl
    }

    fn allocate_name(&mut self) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    /// Apply sampling state and upload storage to the bound `TEXTURE_2D`.
    unsafe fn specify_texture(&self, desc: &TextureDesc<'_>) -> Result<()> {
        if let Some(pixels) = desc.pixels {
            if pixels.len() != desc.byte_len() {
                bail!(
                    "{} bytes supplied for a {}x{} RGBA8 texture",
                    pixels.len(),
                    desc.width,
                    desc.height
                );
            }
        }
        let Sampling {
            min_filter,
            mag_filter,
            wrap,
            mipmaps,
        } = desc.sampling;
        unsafe {
            let gl = &self.gl;
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                desc.width as i32,
                desc.height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                desc.pixels,
            );
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter_enum(min_filter));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter_enum(mag_filter));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, wrap_enum(wrap));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, wrap_enum(wrap));
            if mipmaps {
                gl.generate_mipmap(glow::TEXTURE_2D);
            }
        }
        Ok(())
    }
}

impl GpuBackend for GlowBackend {
    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderHandle> {
        let kind = match stage {
            ShaderStage::Vertex => glow::VERTEX_SHADER,
            ShaderStage::Fragment => glow::FRAGMENT_SHADER,
        };
        let shader = unsafe {
            let shader = self
                .gl
                .create_shader(kind)
                .map_err(|e| anyhow!("create_shader({stage}) failed: {e}"))?;
            self.gl.shader_source(shader, source);
            self.gl.compile_shader(shader);
            shader
        };
        let name = self.allocate_name();
        self.shaders.insert(name, shader);
        Ok(ShaderHandle::from_raw(name))
    }

    fn shader_compile_status(&self, shader: &ShaderHandle) -> std::result::Result<(), String> {
        let Some(&native) = self.shaders.get(&shader.raw()) else {
            return Err(format!("no shader {}", shader.raw()));
        };
        unsafe {
            if self.gl.get_shader_compile_status(native) {
                Ok(())
            } else {
                Err(self.gl.get_shader_info_log(native))
            }
        }
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        if let Some(native) = self.shaders.remove(&shader.raw()) {
            unsafe { self.gl.delete_shader(native) };
        }
    }

    fn create_program(
        &mut self,
        vertex: &ShaderHandle,
        fragment: &ShaderHandle,
    ) -> Result<ProgramHandle> {
        let vs = *self
            .shaders
            .get(&vertex.raw())
            .ok_or_else(|| anyhow!("no shader {}", vertex.raw()))?;
        let fs = *self
            .shaders
            .get(&fragment.raw())
            .ok_or_else(|| anyhow!("no shader {}", fragment.raw()))?;
        let program = unsafe {
            let gl = &self.gl;
            let program = gl
                .create_program()
                .map_err(|e| anyhow!("create_program failed: {e}"))?;
            gl.attach_shader(program, vs);
            gl.attach_shader(program, fs);
            gl.bind_attrib_location(program, 0, POSITION_ATTRIBUTE);
            gl.link_program(program);
            gl.detach_shader(program, vs);
            gl.detach_shader(program, fs);
            program
        };
        let name = self.allocate_name();
        self.programs.insert(name, program);
        Ok(ProgramHandle::from_raw(name))
    }

    fn program_link_status(&self, program: &ProgramHandle) -> std::result::Result<(), String> {
        let Some(&native) = self.programs.get(&program.raw()) else {
            return Err(format!("no program {}", program.raw()));
        };
        unsafe {
            if self.gl.get_program_link_status(native) {
                Ok(())
            } else {
                Err(self.gl.get_program_info_log(native))
            }
        }
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let Some(native) = self.programs.remove(&program.raw()) {
            unsafe { self.gl.delete_program(native) };
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureHandle> {
        let texture = unsafe {
            let texture = self
                .gl
                .create_texture()
                .map_err(|e| anyhow!("create_texture failed: {e}"))?;
            self.gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            let specified = self.specify_texture(desc);
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            if let Err(e) = specified {
                self.gl.delete_texture(texture);
                return Err(e);
            }
            let error = self.gl.get_error();
            if error != glow::NO_ERROR {
                self.gl.delete_texture(texture);
                bail!(
                    "texture {}x{} allocation failed: GL error 0x{error:x}",
                    desc.width,
                    desc.height
                );
            }
            texture
        };
        let name = self.allocate_name();
        self.textures.insert(name, texture);
        Ok(TextureHandle::from_raw(name))
    }

    fn upload_texture(&mut self, texture: &TextureHandle, desc: &TextureDesc<'_>) -> Result<()> {
        let native = *self
            .textures
            .get(&texture.raw())
            .ok_or_else(|| anyhow!("no texture {}", texture.raw()))?;
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(native));
            let specified = self.specify_texture(desc);
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            specified
        }
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(native) = self.textures.remove(&texture.raw()) {
            unsafe { self.gl.delete_texture(native) };
        }
    }

    fn create_framebuffer(&mut self, texture: &TextureHandle) -> Result<FramebufferHandle> {
        let native_texture = *self
            .textures
            .get(&texture.raw())
            .ok_or_else(|| anyhow!("no texture {}", texture.raw()))?;
        let framebuffer = unsafe {
            let gl = &self.gl;
            let fbo = gl
                .create_framebuffer()
                .map_err(|e| anyhow!("create_framebuffer failed: {e}"))?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(native_texture),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(fbo);
                bail!("framebuffer incomplete: 0x{status:x}");
            }
            fbo
        };
        let name = self.allocate_name();
        self.framebuffers.insert(name, framebuffer);
        Ok(FramebufferHandle::from_raw(name))
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(native) = self.framebuffers.remove(&framebuffer.raw()) {
            unsafe { self.gl.delete_framebuffer(native) };
        }
    }

    fn use_program(&mut self, program: Option<&ProgramHandle>) {
        let native = program.and_then(|p| self.programs.get(&p.raw()).copied());
        unsafe { self.gl.use_program(native) };
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<&FramebufferHandle>) {
        let native = match framebuffer {
            Some(fb) => self.framebuffers.get(&fb.raw()).copied(),
            None => self.presentation.as_ref().map(|p| p.framebuffer),
        };
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, native) };
    }

    fn prepare_presentation(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(p) = &self.presentation {
            if p.width == width && p.height == height {
                unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(p.framebuffer)) };
                return Ok(());
            }
        }
        if let Some(old) = self.presentation.take() {
            unsafe {
                self.gl.delete_framebuffer(old.framebuffer);
                self.gl.delete_texture(old.texture);
            }
        }
        let presentation = unsafe {
            let gl = &self.gl;
            let texture = gl
                .create_texture()
                .map_err(|e| anyhow!("create presentation texture: {e}"))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            let specified = self.specify_texture(&TextureDesc::render_target(width, height));
            gl.bind_texture(glow::TEXTURE_2D, None);
            if let Err(e) = specified {
                gl.delete_texture(texture);
                return Err(e);
            }
            let framebuffer = match gl.create_framebuffer() {
                Ok(fb) => fb,
                Err(e) => {
                    gl.delete_texture(texture);
                    bail!("create presentation framebuffer: {e}");
                }
            };
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            Presentation {
                framebuffer,
                texture,
                width,
                height,
            }
        };
        self.presentation = Some(presentation);
        Ok(())
    }

    fn viewport(&mut self, width: u32, height: u32) {
        unsafe { self.gl.viewport(0, 0, width as i32, height as i32) };
    }

    fn clear(&mut self, rgba: [f32; 4]) {
        let [r, g, b, a] = rgba;
        unsafe {
            self.gl.clear_color(r, g, b, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn set_uniform(
        &mut self,
        program: &ProgramHandle,
        name: &str,
        value: UniformValue<'_>,
    ) -> bool {
        let Some(&native) = self.programs.get(&program.raw()) else {
            return false;
        };
        unsafe {
            let Some(location) = self.gl.get_uniform_location(native, name) else {
                return false;
            };
            let loc = Some(&location);
            match value {
                UniformValue::Int(v) => self.gl.uniform_1_i32(loc, v),
                UniformValue::Float(v) => self.gl.uniform_1_f32(loc, v),
                UniformValue::Vec3([x, y, z]) => self.gl.uniform_3_f32(loc, x, y, z),
                UniformValue::Vec4([x, y, z, w]) => self.gl.uniform_4_f32(loc, x, y, z, w),
                UniformValue::Vec3Array(values) => {
                    let flat: &[f32] = bytemuck::cast_slice(values);
                    self.gl.uniform_3_f32_slice(loc, flat);
                }
            }
        }
        true
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<&TextureHandle>) {
        let native = texture.and_then(|t| self.textures.get(&t.raw()).copied());
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit);
            self.gl.bind_texture(glow::TEXTURE_2D, native);
        }
    }

    fn draw_quad(&mut self, program: &ProgramHandle) {
        if !self.programs.contains_key(&program.raw()) {
            return;
        }
        unsafe {
            self.gl.bind_vertex_array(Some(self.quad_vao));
            self.gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            self.gl.bind_vertex_array(None);
        }
    }

    fn read_pixels(&mut self, width: u32, height: u32) -> Vec<u8> {
        let mut buf = vec![0u8; width as usize * height as usize * 4];
        unsafe {
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            self.gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(&mut buf),
            );
        }
        buf
    }
}
