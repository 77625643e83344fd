// Botgate Engine — MCP (Model Context Protocol) Tool-Server Clients
//
// Each bot profile lists tool servers; an active session owns one
// ToolClientPool that spawns the enabled servers as subprocesses and
// aggregates their tools for the LLM adapter.
//
// Architecture:
//   types.rs     — MCP protocol types (JSON-RPC framing, tools/list shapes)
//   transport.rs — stdio subprocess transport, newline-delimited JSON
//   client.rs    — initialize / tools-list / tools-call for one server
//   pool.rs      — per-profile pool: open, aggregate catalog, invoke, close

pub mod client;
pub mod pool;
pub mod transport;
pub mod types;

pub use pool::{ToolClientPool, ToolSet};
