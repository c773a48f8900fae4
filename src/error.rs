use serde::Serialize;

use crate::node::{NodeId, NodeKind};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

/// Failure to turn transformed source into a usable program.
///
/// Both variants are non-fatal: the node keeps whatever program it had before.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompileError {
    #[error("{stage} shader failed to compile: {log}")]
    Stage { stage: ShaderStage, log: String },

    #[error("program failed to link: {log}")]
    Link { log: String },
}

impl CompileError {
    pub fn stage(&self) -> Option<ShaderStage> {
        match self {
            CompileError::Stage { stage, .. } => Some(*stage),
            CompileError::Link { .. } => None,
        }
    }

    pub fn log(&self) -> &str {
        match self {
            CompileError::Stage { log, .. } | CompileError::Link { log } => log,
        }
    }
}

/// Why a connection attempt was refused. The graph is left untouched.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("a node cannot feed one of its own inputs")]
    SelfLoop,

    #[error("node {0} does not exist")]
    UnknownNode(NodeId),

    #[error("node {0} has no input slots")]
    NoInputSlots(NodeId),

    #[error("slot {slot} is outside the {limit}-channel bank")]
    SlotOutOfRange { slot: usize, limit: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("invalid connection: {reason}")]
    InvalidConnection { reason: ConnectionError },

    #[error("node {node}: {source}")]
    Compile { node: NodeId, source: CompileError },

    #[error("node {node}: resource allocation failed: {message}")]
    ResourceAllocation { node: NodeId, message: String },

    #[error("invalid resolution {width}x{height}: both sides must be positive")]
    InvalidResolution { width: u32, height: u32 },

    #[error("node {node} is a {actual} node, expected {expected}")]
    WrongKind {
        node: NodeId,
        actual: NodeKind,
        expected: NodeKind,
    },

    #[error("invalid color '{0}': expected #rrggbb")]
    InvalidColor(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl EngineError {
    pub fn unknown_node(node: NodeId) -> Self {
        Self::UnknownNode(node)
    }

    pub fn compile(node: NodeId, source: CompileError) -> Self {
        Self::Compile { node, source }
    }

    pub fn allocation(node: NodeId, err: impl std::fmt::Display) -> Self {
        Self::ResourceAllocation {
            node,
            message: err.to_string(),
        }
    }

    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }
}

impl From<ConnectionError> for EngineError {
    fn from(reason: ConnectionError) -> Self {
        Self::InvalidConnection { reason }
    }
}
