//! `pdl-backend`: the semantic core shared by PDL (Packet Description
//! Language) code generators. The crate loads the parsed IR from JSON,
//! normalizes it, answers static layout questions, plans language-agnostic
//! parse/serialize programs, and generates reference test vectors.
//!
//! A codegen run is a pure function: the embedding driver feeds a
//! [`ir::File`] in and renders the [`plan`] output into its target
//! language; the [`vectors`] output exercises every rendered backend
//! against a single corpus.
//==================================================================================
/// IR model, JSON import, and the normalization pass.
pub mod ir;
/// Errors per failure domain (IR, normalization, planning, vectors).
pub mod error;
/// Static layout queries over the canonical IR.
pub mod layout;
/// Parse and serialize planners and their action vocabulary.
pub mod plan;
/// Reference test-vector generation.
pub mod vectors;
//==================================================================================
