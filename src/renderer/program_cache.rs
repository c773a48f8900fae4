//! Compiled programs per node, plus the shared blit program.

use std::collections::HashMap;

use crate::error::{CompileError, ShaderStage};
use crate::node::NodeId;

use super::backend::{GpuBackend, ProgramHandle, ShaderHandle};
use super::shaders::{BLIT_FRAGMENT_SOURCE, BLIT_VERTEX_SOURCE, NODE_VERTEX_SOURCE};

#[derive(Debug, Default)]
pub struct ProgramCache {
    /// Pass-through vertex stage, compiled once and attached to every link.
    vertex: Option<ShaderHandle>,
    programs: HashMap<NodeId, ProgramHandle>,
    blit: Option<ProgramHandle>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `fragment_source` against the node vertex stage and link.
    /// Every object created for a failed attempt is freed before returning.
    pub fn compile<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        fragment_source: &str,
    ) -> Result<ProgramHandle, CompileError> {
        if self.vertex.is_none() {
            self.vertex = Some(compile_stage(backend, ShaderStage::Vertex, NODE_VERTEX_SOURCE)?);
        }
        let Some(vertex) = self.vertex.as_ref() else {
            return Err(CompileError::Stage {
                stage: ShaderStage::Vertex,
                log: "vertex stage unavailable".to_string(),
            });
        };
        let fragment = compile_stage(backend, ShaderStage::Fragment, fragment_source)?;
        let linked = link(backend, vertex, &fragment);
        backend.delete_shader(fragment);
        linked
    }

    /// Make `program` the node's active program, freeing the previous one
    /// afterwards.
    pub fn install<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        node: NodeId,
        program: ProgramHandle,
    ) {
        if let Some(old) = self.programs.insert(node, program) {
            backend.delete_program(old);
        }
    }

    pub fn program(&self, node: NodeId) -> Option<&ProgramHandle> {
        self.programs.get(&node)
    }

    pub fn has_program(&self, node: NodeId) -> bool {
        self.programs.contains_key(&node)
    }

    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, node: NodeId) {
        if let Some(program) = self.programs.remove(&node) {
            backend.delete_program(program);
        }
    }

    /// The shared display program, linked on first use.
    pub fn blit_program<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<&ProgramHandle, CompileError> {
        if self.blit.is_none() {
            let vertex = compile_stage(backend, ShaderStage::Vertex, BLIT_VERTEX_SOURCE)?;
            let fragment = match compile_stage(backend, ShaderStage::Fragment, BLIT_FRAGMENT_SOURCE)
            {
                Ok(fragment) => fragment,
                Err(err) => {
                    backend.delete_shader(vertex);
                    return Err(err);
                }
            };
            let linked = link(backend, &vertex, &fragment);
            backend.delete_shader(vertex);
            backend.delete_shader(fragment);
            self.blit = Some(linked?);
            tracing::debug!("blit program linked");
        }
        self.blit.as_ref().ok_or_else(|| CompileError::Link {
            log: "blit program unavailable".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, program) in self.programs.drain() {
            backend.delete_program(program);
        }
        if let Some(blit) = self.blit.take() {
            backend.delete_program(blit);
        }
        if let Some(vertex) = self.vertex.take() {
            backend.delete_shader(vertex);
        }
    }
}

fn compile_stage<B: GpuBackend + ?Sized>(
    backend: &mut B,
    stage: ShaderStage,
    source: &str,
) -> Result<ShaderHandle, CompileError> {
    let shader = backend
        .create_shader(stage, source)
        .map_err(|e| CompileError::Stage {
            stage,
            log: format!("{e:#}"),
        })?;
    match backend.shader_compile_status(&shader) {
        Ok(()) => Ok(shader),
        Err(log) => {
            backend.delete_shader(shader);
            Err(CompileError::Stage { stage, log })
        }
    }
}

fn link<B: GpuBackend + ?Sized>(
    backend: &mut B,
    vertex: &ShaderHandle,
    fragment: &ShaderHandle,
) -> Result<ProgramHandle, CompileError> {
    let program = backend
        .create_program(vertex, fragment)
        .map_err(|e| CompileError::Link {
            log: format!("{e:#}"),
        })?;
    match backend.program_link_status(&program) {
        Ok(()) => Ok(program),
        Err(log) => {
            backend.delete_program(program);
            Err(CompileError::Link { log })
        }
    }
}
