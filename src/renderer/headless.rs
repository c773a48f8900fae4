//! Software rendering context.
//!
//! `HeadlessBackend` behaves like a strict GL ES 3.0 context without a GPU:
//! object names are tracked and checked, shader sources get a structural
//! compile/link check with GL-style info logs, and draws are recorded. Programs
//! can be rasterized on the CPU by registering a fragment kernel keyed on a
//! marker substring of their fragment source; the blit program has a built-in
//! kernel. Misuse that a real driver would flag (drawing with a deleted
//! program, sampling the texture being rendered to, setting uniforms on a
//! program that is not current) is collected in [`HeadlessBackend::violations`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};

use crate::error::ShaderStage;

use super::backend::{
    FramebufferHandle, GpuBackend, ProgramHandle, Sampling, ShaderHandle, TextureDesc,
    TextureHandle, TextureWrap, UniformValue,
};
use super::glsl_scan::GlslScan;
use super::shaders::BLIT_SAMPLER_UNIFORM;
use super::uniforms::is_standard_uniform;

pub const DEFAULT_MAX_TEXTURE_SIZE: u32 = 4096;
const TEXTURE_UNITS: usize = 16;
const RECORDED_CHANNELS: usize = 4;

/// CPU stand-in for a fragment shader: returns the RGBA color for one pixel.
pub type FragmentKernel = Arc<dyn Fn(&FragmentInput<'_>) -> [f32; 4] + Send + Sync>;

/// Owned copy of a uniform value as last set on a program.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredUniform {
    Int(i32),
    Float(f32),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Vec3Array(Vec<[f32; 3]>),
}

impl From<UniformValue<'_>> for StoredUniform {
    fn from(value: UniformValue<'_>) -> Self {
        match value {
            UniformValue::Int(v) => StoredUniform::Int(v),
            UniformValue::Float(v) => StoredUniform::Float(v),
            UniformValue::Vec3(v) => StoredUniform::Vec3(v),
            UniformValue::Vec4(v) => StoredUniform::Vec4(v),
            UniformValue::Vec3Array(v) => StoredUniform::Vec3Array(v.to_vec()),
        }
    }
}

/// One recorded `draw_quad` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub program: u32,
    /// `None` when drawn into the presentation target.
    pub framebuffer: Option<u32>,
    pub viewport: [u32; 2],
    /// Textures bound to units 0..4 at draw time.
    pub channels: [Option<u32>; RECORDED_CHANNELS],
    pub uniforms: BTreeMap<String, StoredUniform>,
    /// Whether a kernel produced pixels for this draw.
    pub rasterized: bool,
}

#[derive(Debug)]
struct ShaderObject {
    stage: ShaderStage,
    status: std::result::Result<(), String>,
    scan: GlslScan,
    source: String,
}

struct ProgramObject {
    status: std::result::Result<(), String>,
    declared: Vec<String>,
    values: HashMap<String, StoredUniform>,
    kernel: Option<FragmentKernel>,
}

#[derive(Debug, Clone)]
struct TextureObject {
    width: u32,
    height: u32,
    sampling: Sampling,
    /// RGBA8, rows bottom-up.
    pixels: Vec<u8>,
}

impl TextureObject {
    fn blank(width: u32, height: u32, sampling: Sampling) -> Self {
        Self {
            width,
            height,
            sampling,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let p = &self.pixels[i..i + 4];
        [p[0], p[1], p[2], p[3]].map(|c| c as f32 / 255.0)
    }

    fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
        if self.width == 0 || self.height == 0 {
            return [0.0, 0.0, 0.0, 1.0];
        }
        let x = wrap_coord(uv[0], self.width, self.sampling.wrap);
        let y = wrap_coord(uv[1], self.height, self.sampling.wrap);
        self.texel(x, y)
    }
}

fn wrap_coord(t: f32, size: u32, wrap: TextureWrap) -> u32 {
    let scaled = (t * size as f32).floor();
    let max = size as i64 - 1;
    let i = if scaled.is_finite() { scaled as i64 } else { 0 };
    let i = match wrap {
        TextureWrap::ClampToEdge => i.clamp(0, max),
        TextureWrap::Repeat => i.rem_euclid(size as i64),
    };
    i as u32
}

/// Per-pixel view handed to a [`FragmentKernel`].
pub struct FragmentInput<'a> {
    /// Pixel center in window coordinates, origin bottom-left.
    pub frag_coord: [f32; 2],
    pub viewport: [u32; 2],
    uniforms: &'a HashMap<String, StoredUniform>,
    units: &'a [Option<&'a TextureObject>],
}

impl FragmentInput<'_> {
    /// `frag_coord / viewport`.
    pub fn uv(&self) -> [f32; 2] {
        [
            self.frag_coord[0] / self.viewport[0].max(1) as f32,
            self.frag_coord[1] / self.viewport[1].max(1) as f32,
        ]
    }

    pub fn uniform(&self, name: &str) -> Option<&StoredUniform> {
        self.uniforms.get(name)
    }

    /// Scalar uniform, 0.0 when unset.
    pub fn uniform_f32(&self, name: &str) -> f32 {
        match self.uniforms.get(name) {
            Some(StoredUniform::Float(v)) => *v,
            Some(StoredUniform::Int(v)) => *v as f32,
            _ => 0.0,
        }
    }

    pub fn uniform_vec3(&self, name: &str) -> [f32; 3] {
        match self.uniforms.get(name) {
            Some(StoredUniform::Vec3(v)) => *v,
            _ => [0.0; 3],
        }
    }

    /// Nearest-texel lookup on a texture unit. Unbound units read as opaque
    /// black, like an incomplete texture in GL ES.
    pub fn sample(&self, unit: usize, uv: [f32; 2]) -> [f32; 4] {
        match self.units.get(unit).copied().flatten() {
            Some(texture) => texture.sample(uv),
            None => [0.0, 0.0, 0.0, 1.0],
        }
    }
}

pub struct HeadlessBackend {
    next_name: u32,
    shaders: HashMap<u32, ShaderObject>,
    programs: HashMap<u32, ProgramObject>,
    textures: HashMap<u32, TextureObject>,
    framebuffers: HashMap<u32, u32>,
    presentation: TextureObject,

    current_program: Option<u32>,
    current_framebuffer: Option<u32>,
    viewport: Option<[u32; 2]>,
    units: [Option<u32>; TEXTURE_UNITS],

    kernels: Vec<(String, FragmentKernel)>,
    draws: Vec<DrawRecord>,
    violations: Vec<String>,

    texture_limit: Option<usize>,
    max_texture_size: u32,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        let mut backend = Self {
            next_name: 1,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            presentation: TextureObject::blank(0, 0, Sampling::RENDER_TARGET),
            current_program: None,
            current_framebuffer: None,
            viewport: None,
            units: [None; TEXTURE_UNITS],
            kernels: Vec::new(),
            draws: Vec::new(),
            violations: Vec::new(),
            texture_limit: None,
            max_texture_size: DEFAULT_MAX_TEXTURE_SIZE,
        };
        let sampler = format!("uniform sampler2D {BLIT_SAMPLER_UNIFORM};");
        backend.register_kernel(sampler, |input: &FragmentInput<'_>| {
            input.sample(0, input.uv())
        });
        backend
    }

    /// Rasterize every program whose fragment source contains `marker` with
    /// `kernel`. Later registrations take precedence. Applies to programs
    /// linked after the call.
    pub fn register_kernel(
        &mut self,
        marker: impl Into<String>,
        kernel: impl Fn(&FragmentInput<'_>) -> [f32; 4] + Send + Sync + 'static,
    ) {
        let kernel: FragmentKernel = Arc::new(kernel);
        self.kernels.push((marker.into(), kernel));
    }

    /// Cap the number of live textures; creation beyond it fails like an
    /// out-of-memory driver.
    pub fn set_texture_limit(&mut self, limit: Option<usize>) {
        self.texture_limit = limit;
    }

    pub fn set_max_texture_size(&mut self, size: u32) {
        self.max_texture_size = size;
    }

    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    pub fn take_draws(&mut self) -> Vec<DrawRecord> {
        std::mem::take(&mut self.draws)
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_objects(&self) -> usize {
        self.live_shaders() + self.live_programs() + self.live_textures() + self.live_framebuffers()
    }

    pub fn texture_size(&self, texture: &TextureHandle) -> Option<[u32; 2]> {
        self.textures
            .get(&texture.raw())
            .map(|t| [t.width, t.height])
    }

    pub fn texture_sampling(&self, texture: &TextureHandle) -> Option<Sampling> {
        self.textures.get(&texture.raw()).map(|t| t.sampling)
    }

    /// RGBA8 contents, rows bottom-up.
    pub fn texture_pixels(&self, texture: &TextureHandle) -> Option<&[u8]> {
        self.textures.get(&texture.raw()).map(|t| t.pixels.as_slice())
    }

    pub fn shader_source(&self, shader: &ShaderHandle) -> Option<&str> {
        self.shaders.get(&shader.raw()).map(|s| s.source.as_str())
    }

    fn allocate_name(&mut self) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    fn violation(&mut self, message: String) {
        tracing::warn!(target: "headless", "{message}");
        self.violations.push(message);
    }

    fn check_texture_size(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            bail!("GL_INVALID_VALUE: texture size {width}x{height}");
        }
        if width > self.max_texture_size || height > self.max_texture_size {
            bail!(
                "GL_INVALID_VALUE: texture size {width}x{height} exceeds GL_MAX_TEXTURE_SIZE {}",
                self.max_texture_size
            );
        }
        Ok(())
    }

    fn texture_from_desc(&self, desc: &TextureDesc<'_>) -> Result<TextureObject> {
        self.check_texture_size(desc.width, desc.height)?;
        let mut texture = TextureObject::blank(desc.width, desc.height, desc.sampling);
        if let Some(pixels) = desc.pixels {
            if pixels.len() != desc.byte_len() {
                bail!(
                    "GL_INVALID_OPERATION: {} bytes supplied for a {}x{} RGBA8 texture",
                    pixels.len(),
                    desc.width,
                    desc.height
                );
            }
            texture.pixels.copy_from_slice(pixels);
        }
        Ok(texture)
    }

    /// Size of the currently bound draw target.
    fn target_size(&self) -> Option<[u32; 2]> {
        match self.current_framebuffer {
            None => Some([self.presentation.width, self.presentation.height]),
            Some(fb) => {
                let texture = self.framebuffers.get(&fb)?;
                self.textures.get(texture).map(|t| [t.width, t.height])
            }
        }
    }

    fn target_mut(&mut self) -> Option<&mut TextureObject> {
        match self.current_framebuffer {
            None => Some(&mut self.presentation),
            Some(fb) => {
                let texture = *self.framebuffers.get(&fb)?;
                self.textures.get_mut(&texture)
            }
        }
    }
}

fn compile_log(stage: ShaderStage, scan: &GlslScan) -> std::result::Result<(), String> {
    if let Some(err) = scan.imbalance() {
        return Err(format!(
            "ERROR: 0:{}: '{}' : syntax error: unbalanced delimiter",
            err.line, err.delimiter
        ));
    }
    if let Some(directive) = scan.directive("error") {
        return Err(format!(
            "ERROR: 0:{}: '#error' : {}",
            directive.line,
            directive.text.trim_start_matches("#error").trim()
        ));
    }
    if let Some(version) = scan.directive("version") {
        if scan.tokens().iter().any(|t| t.start < version.start) {
            return Err(format!(
                "ERROR: 0:{}: '#version' : must occur first in shader",
                version.line
            ));
        }
    }
    if stage == ShaderStage::Fragment && scan.float_precision_end().is_none() {
        return Err("ERROR: 0:1: '' : No precision specified for (float)".to_string());
    }
    let mut errors = Vec::new();
    for token in scan.tokens() {
        if is_standard_uniform(&token.text) && !scan.declares("uniform", &token.text) {
            errors.push(format!(
                "ERROR: 0:{}: '{}' : undeclared identifier",
                token.line, token.text
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        errors.dedup();
        Err(errors.join("\n"))
    }
}

fn link_log(vertex: &ShaderObject, fragment: &ShaderObject) -> std::result::Result<(), String> {
    if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
        return Err("error: program needs one vertex and one fragment shader".to_string());
    }
    if vertex.status.is_err() || fragment.status.is_err() {
        return Err("error: an attached shader failed to compile".to_string());
    }
    for (shader, label) in [(vertex, "vertex"), (fragment, "fragment")] {
        if !shader.scan.defines_function("main") {
            return Err(format!("error: missing main() in {label} shader"));
        }
    }
    for decl in fragment.scan.declarations() {
        if decl.qualifier != "in" {
            continue;
        }
        for name in &decl.names {
            if !vertex.scan.declares("out", name) {
                return Err(format!(
                    "error: fragment input '{name}' is not written by the vertex shader"
                ));
            }
        }
    }
    Ok(())
}

impl GpuBackend for HeadlessBackend {
    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderHandle> {
        let scan = GlslScan::new(source);
        let status = compile_log(stage, &scan);
        let name = self.allocate_name();
        self.shaders.insert(
            name,
            ShaderObject {
                stage,
                status,
                scan,
                source: source.to_string(),
            },
        );
        Ok(ShaderHandle::from_raw(name))
    }

    fn shader_compile_status(&self, shader: &ShaderHandle) -> std::result::Result<(), String> {
        match self.shaders.get(&shader.raw()) {
            Some(s) => s.status.clone(),
            None => Err(format!("GL_INVALID_VALUE: no shader {}", shader.raw())),
        }
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        if self.shaders.remove(&shader.raw()).is_none() {
            self.violation(format!("delete of unknown shader {}", shader.raw()));
        }
    }

    fn create_program(
        &mut self,
        vertex: &ShaderHandle,
        fragment: &ShaderHandle,
    ) -> Result<ProgramHandle> {
        let vs = self
            .shaders
            .get(&vertex.raw())
            .ok_or_else(|| anyhow!("GL_INVALID_VALUE: no shader {}", vertex.raw()))?;
        let fs = self
            .shaders
            .get(&fragment.raw())
            .ok_or_else(|| anyhow!("GL_INVALID_VALUE: no shader {}", fragment.raw()))?;

        let status = link_log(vs, fs);
        let mut declared = Vec::new();
        for scan in [&vs.scan, &fs.scan] {
            for decl in scan.declarations().iter().filter(|d| d.qualifier == "uniform") {
                declared.extend(decl.names.iter().cloned());
            }
        }
        let kernel = self
            .kernels
            .iter()
            .rev()
            .find(|(marker, _)| fs.source.contains(marker.as_str()))
            .map(|(_, kernel)| Arc::clone(kernel));

        let name = self.allocate_name();
        self.programs.insert(
            name,
            ProgramObject {
                status,
                declared,
                values: HashMap::new(),
                kernel,
            },
        );
        Ok(ProgramHandle::from_raw(name))
    }

    fn program_link_status(&self, program: &ProgramHandle) -> std::result::Result<(), String> {
        match self.programs.get(&program.raw()) {
            Some(p) => p.status.clone(),
            None => Err(format!("GL_INVALID_VALUE: no program {}", program.raw())),
        }
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program.raw()).is_none() {
            self.violation(format!("delete of unknown program {}", program.raw()));
        }
        if self.current_program == Some(program.raw()) {
            self.current_program = None;
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc<'_>) -> Result<TextureHandle> {
        if let Some(limit) = self.texture_limit {
            if self.textures.len() >= limit {
                bail!("GL_OUT_OF_MEMORY: texture limit of {limit} reached");
            }
        }
        let texture = self.texture_from_desc(desc)?;
        let name = self.allocate_name();
        self.textures.insert(name, texture);
        Ok(TextureHandle::from_raw(name))
    }

    fn upload_texture(&mut self, texture: &TextureHandle, desc: &TextureDesc<'_>) -> Result<()> {
        if !self.textures.contains_key(&texture.raw()) {
            bail!("GL_INVALID_OPERATION: no texture {}", texture.raw());
        }
        let object = self.texture_from_desc(desc)?;
        self.textures.insert(texture.raw(), object);
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture.raw()).is_none() {
            self.violation(format!("delete of unknown texture {}", texture.raw()));
        }
        for unit in self.units.iter_mut() {
            if *unit == Some(texture.raw()) {
                *unit = None;
            }
        }
    }

    fn create_framebuffer(&mut self, texture: &TextureHandle) -> Result<FramebufferHandle> {
        if !self.textures.contains_key(&texture.raw()) {
            bail!("GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT: no texture {}", texture.raw());
        }
        let name = self.allocate_name();
        self.framebuffers.insert(name, texture.raw());
        Ok(FramebufferHandle::from_raw(name))
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer.raw()).is_none() {
            self.violation(format!("delete of unknown framebuffer {}", framebuffer.raw()));
        }
        if self.current_framebuffer == Some(framebuffer.raw()) {
            self.current_framebuffer = None;
        }
    }

    fn use_program(&mut self, program: Option<&ProgramHandle>) {
        let Some(program) = program else {
            self.current_program = None;
            return;
        };
        match self.programs.get(&program.raw()) {
            Some(p) if p.status.is_ok() => self.current_program = Some(program.raw()),
            Some(_) => self.violation(format!("use of unlinked program {}", program.raw())),
            None => self.violation(format!("use of unknown program {}", program.raw())),
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<&FramebufferHandle>) {
        match framebuffer {
            None => self.current_framebuffer = None,
            Some(fb) if self.framebuffers.contains_key(&fb.raw()) => {
                self.current_framebuffer = Some(fb.raw());
            }
            Some(fb) => self.violation(format!("bind of unknown framebuffer {}", fb.raw())),
        }
    }

    fn prepare_presentation(&mut self, width: u32, height: u32) -> Result<()> {
        self.check_texture_size(width, height)?;
        if self.presentation.width != width || self.presentation.height != height {
            self.presentation = TextureObject::blank(width, height, Sampling::RENDER_TARGET);
        }
        Ok(())
    }

    fn viewport(&mut self, width: u32, height: u32) {
        self.viewport = Some([width, height]);
    }

    fn clear(&mut self, rgba: [f32; 4]) {
        let color = rgba.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        match self.target_mut() {
            Some(target) => {
                for px in target.pixels.chunks_exact_mut(4) {
                    px.copy_from_slice(&color);
                }
            }
            None => self.violation("clear with an incomplete framebuffer bound".to_string()),
        }
    }

    fn set_uniform(
        &mut self,
        program: &ProgramHandle,
        name: &str,
        value: UniformValue<'_>,
    ) -> bool {
        if self.current_program != Some(program.raw()) {
            self.violation(format!(
                "uniform '{name}' set on program {} which is not current",
                program.raw()
            ));
            return false;
        }
        let Some(object) = self.programs.get_mut(&program.raw()) else {
            return false;
        };
        if !object.declared.iter().any(|d| d == name) {
            return false;
        }
        object.values.insert(name.to_string(), value.into());
        true
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<&TextureHandle>) {
        let Some(slot) = self.units.get_mut(unit as usize) else {
            self.violation(format!("texture unit {unit} out of range"));
            return;
        };
        match texture {
            None => *slot = None,
            Some(t) if self.textures.contains_key(&t.raw()) => *slot = Some(t.raw()),
            Some(t) => {
                *slot = None;
                self.violation(format!("bind of unknown texture {}", t.raw()));
            }
        }
    }

    fn draw_quad(&mut self, program: &ProgramHandle) {
        if self.current_program != Some(program.raw()) {
            self.violation(format!("draw with program {} not current", program.raw()));
            return;
        }
        let Some(viewport) = self.viewport else {
            self.violation("draw without a viewport".to_string());
            return;
        };
        let Some(target_size) = self.target_size() else {
            self.violation("draw into an incomplete framebuffer".to_string());
            return;
        };
        let target_texture = self
            .current_framebuffer
            .and_then(|fb| self.framebuffers.get(&fb).copied());
        if target_texture.is_some() && self.units.contains(&target_texture) {
            self.violation(format!(
                "feedback loop: texture {} is both sampled and rendered to",
                target_texture.unwrap_or_default()
            ));
            return;
        }
        let Some(object) = self.programs.get(&program.raw()) else {
            self.violation(format!("draw with unknown program {}", program.raw()));
            return;
        };

        let mut channels = [None; RECORDED_CHANNELS];
        channels.copy_from_slice(&self.units[..RECORDED_CHANNELS]);
        let mut record = DrawRecord {
            program: program.raw(),
            framebuffer: self.current_framebuffer,
            viewport,
            channels,
            uniforms: object
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            rasterized: false,
        };

        let width = viewport[0].min(target_size[0]);
        let height = viewport[1].min(target_size[1]);
        let mut shaded = Vec::new();
        if let Some(kernel) = &object.kernel {
            let units: Vec<Option<&TextureObject>> = self
                .units
                .iter()
                .map(|u| u.and_then(|name| self.textures.get(&name)))
                .collect();
            shaded.reserve(width as usize * height as usize);
            for y in 0..height {
                for x in 0..width {
                    let input = FragmentInput {
                        frag_coord: [x as f32 + 0.5, y as f32 + 0.5],
                        viewport,
                        uniforms: &object.values,
                        units: &units,
                    };
                    let color = kernel(&input).map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
                    shaded.push(color);
                }
            }
            record.rasterized = true;
        }

        if record.rasterized {
            if let Some(target) = self.target_mut() {
                let stride = target.width as usize;
                for y in 0..height as usize {
                    for x in 0..width as usize {
                        let i = (y * stride + x) * 4;
                        target.pixels[i..i + 4].copy_from_slice(&shaded[y * width as usize + x]);
                    }
                }
            }
        }
        self.draws.push(record);
    }

    fn read_pixels(&mut self, width: u32, height: u32) -> Vec<u8> {
        let mut out = vec![0u8; width as usize * height as usize * 4];
        let Some(target) = self.target_mut() else {
            return out;
        };
        let copy_w = width.min(target.width) as usize;
        let copy_h = height.min(target.height) as usize;
        for y in 0..copy_h {
            let src = y * target.width as usize * 4;
            let dst = y * width as usize * 4;
            out[dst..dst + copy_w * 4].copy_from_slice(&target.pixels[src..src + copy_w * 4]);
        }
        out
    }
}
