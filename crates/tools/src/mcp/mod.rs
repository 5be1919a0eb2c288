//! Line-delimited JSON-RPC (MCP) backends.
//!
//! - `client`: one child process, one request in flight at a time
//! - `registry`: named set of clients with first-registered-wins tool routing
//! - `outcome`: tagged call results shared by both

pub mod client;
pub mod outcome;
pub mod registry;

pub use client::{ConnectionState, McpClient, ToolDescriptor};
pub use outcome::{CallError, CallOutcome, ToolPayload};
pub use registry::{BackendRegistry, BackendStatus, SharedRegistry};
