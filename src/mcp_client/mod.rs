//! MCP client: JSON-RPC over stdio to tool servers.
//!
//! This module handles:
//! - Spawning server subprocesses and owning their stdio (`transport`)
//! - The capability handshake and typed RPCs with per-call timeouts (`client`)
//! - Connect-with-retry supervision of every configured server (`lifecycle`)
//! - Merging connected catalogs into one tool namespace (`registry`)

pub mod client;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::{ClientTimeouts, ProtocolClient};
pub use errors::McpError;
pub use lifecycle::{ConnectionSupervisor, Connector, InitReport, RetryPolicy, StdioConnector};
pub use registry::ToolAggregator;
pub use transport::TransportSession;
pub use types::{
    ConnectionState, ResourceContents, ResourceDescriptor, ServerSpec, ToolCallOutcome,
    ToolDescriptor,
};
