//! Core domain types for typelift.
//!
//! Pure data shared by the LSP plumbing and the enrichment pipeline: text
//! positions, signatures, symbols, chunk targets, operator checks and
//! diagnostics. No IO, no async.

#![allow(clippy::missing_errors_doc)]

mod check;
mod diagnostic;
mod position;
mod signature;
mod symbol;
mod target;

pub use check::{Check, CheckStatus};
pub use diagnostic::{DiagnosticSeverity, LspDiagnostic};
pub use position::{ByteRange, Position, Range};
pub use signature::{DEFAULT_PARAM_CONFIDENCE, PARAM_SOURCE_TOOLING, ParamType, SignatureInfo};
pub use symbol::{Symbol, SymbolKind};
pub use target::{ChunkRef, Document, SymbolHint, Target};
