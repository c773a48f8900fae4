//! Evaluation engine for a ShaderToy-style node graph.
//!
//! Every node owns a fragment shader (or an uploaded image) and renders into
//! its own offscreen texture; downstream nodes sample those textures through
//! `iChannel0..3`. The [`Engine`] is the session that wires the pieces:
//!
//! - [`renderer::source_transform`] turns user GLSL into a compilable unit,
//! - [`renderer::program_cache`] compiles and links it, keeping the last good
//!   program on failure,
//! - [`renderer::resources`] owns each node's render target or image texture,
//! - [`graph`] holds the wiring and resolves input textures per frame,
//! - [`renderer::scheduler`] drives one frame of draws and presentation.
//!
//! GPU access goes through the [`GpuBackend`] trait. [`HeadlessBackend`] is a
//! software context used by tests and the CLI; `GlowBackend` (feature `glow`)
//! talks to a real OpenGL ES 3.0 / WebGL2 context.

pub mod engine;
pub mod error;
pub mod graph;
pub mod image_loader;
pub mod node;
pub mod renderer;
pub mod snapshot;

pub use engine::{Diagnostic, Engine, EngineConfig};
pub use error::{CompileError, ConnectionError, EngineError, EngineResult, ShaderStage};
pub use graph::{CHANNEL_COUNT, ChannelInput, Graph, resolve_inputs};
pub use node::{NodeId, NodeKind, NodeLayout, ShaderNode};
pub use renderer::backend::GpuBackend;
pub use renderer::headless::{FragmentInput, HeadlessBackend};
pub use renderer::scheduler::{FrameReport, NodeOutcome, Surface};
pub use snapshot::GraphSnapshot;

#[cfg(feature = "glow")]
pub use renderer::glow_backend::GlowBackend;
