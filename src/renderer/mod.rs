//! GPU-facing half of the engine.
//!
//! - `backend`: the [`GpuBackend`](backend::GpuBackend) seam and typed handles
//! - `headless`: software reference backend
//! - `glow_backend`: OpenGL ES 3.0 / WebGL2 backend (feature `glow`)
//! - `shaders`: fixed vertex/blit stages and default node sources
//! - `glsl_scan`: comment-aware GLSL token scanning shared by the transform and
//!   the headless compiler
//! - `source_transform`: user source -> compilable fragment unit
//! - `uniforms`: the standard uniform interface and per-frame values
//! - `program_cache`: compile/link with last-good-program recovery
//! - `resources`: per-node render targets and image textures
//! - `scheduler`: one frame of draws and presentation

pub mod backend;
pub(crate) mod glsl_scan;
#[cfg(feature = "glow")]
pub mod glow_backend;
pub mod headless;
pub mod program_cache;
pub mod resources;
pub mod scheduler;
pub mod shaders;
pub mod source_transform;
pub mod uniforms;

pub use backend::{
    FramebufferHandle, GpuBackend, ProgramHandle, Sampling, ShaderHandle, TextureDesc,
    TextureHandle, UniformValue,
};
pub use program_cache::ProgramCache;
pub use resources::{ResourceManager, ResourceStats};
pub use source_transform::{TransformOutput, TransformReport, transform};
