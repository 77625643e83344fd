// ── Botgate Atoms Layer ────────────────────────────────────────────────────
// Pure data types and the canonical error enum — zero side effects, no I/O.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/ or main.rs.

pub mod error;
pub mod types;
