//! Atrium SDK
//!
//! Shared library providing the error taxonomy, conversation types and the
//! sandbox MCP manifest format. Used by the engine and by anything that talks
//! to it (connectors, sandboxed agents, search backends).

/// Error types and handling
pub mod errors;

/// Conversation types
pub mod types;

/// Sandbox MCP manifest
pub mod manifest;

// Re-export commonly used types
pub use errors::{EngineErrorExt, EngineError};
pub use manifest::{McpManifest, McpServerEntry};
pub use types::{
    ChunkKind, CompletionResponse, Content, ContentPart, ImageUrl, Message, Role, Skip,
    StreamChunk, Uses,
};
