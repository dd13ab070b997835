//! Atrium Engine Library
//!
//! Assistant runtime: a bounded cache of live assistants, the loader that
//! builds them from packages and records, the stream pipeline with its
//! automatic search and sandbox stages, and the bridge that lets scripts
//! call other assistants. Used by the `atrium` binary and integration tests.

/// Assistant definitions, loading and the stream pipeline
pub mod assistant;

/// Bounded LRU cache of live assistants
pub mod cache;

/// Configuration management module
pub mod config;

/// Model endpoint abstraction
pub mod connector;

/// Per-call context
pub mod context;

/// Database persistence module
pub mod db;

/// MCP client registry
pub mod mcp;

/// Client-visible output and status messages
pub mod output;

/// Shared services of the engine
pub mod runtime;

/// Sandboxed execution through container-backed agents
pub mod sandbox;

/// Hook scripts and the assistant-call bridge
pub mod script;

/// Automatic search orchestration
pub mod search;

/// Assistant and search persistence interface
pub mod store;

/// Telemetry and Observability
pub mod telemetry;

/// Execution trace nodes
pub mod trace;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
