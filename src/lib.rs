// Botgate — multi-tenant chatbot gateway library.
// The binary entry point (main.rs) wires configuration, the store, and the
// session managers; everything else lives behind the GatewayFacade.

// ── Botgate Atoms (pure types, error enum) ─────────────────────────────────
pub mod atoms;

// ── Botgate Engine (sessions, pipeline, tool pool, ledger) ─────────────────
pub mod engine;

pub use atoms::error::{GatewayError, GatewayResult};
