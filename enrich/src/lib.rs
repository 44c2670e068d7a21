//! Type enrichment over language server sessions.
//!
//! [`Enricher::run`] leases a session from a [`typelift_lsp::SessionPool`],
//! opens each document that has chunk targets, collects its symbols and walks
//! the fallback chain (hover, signatureHelp, definition, typeDefinition,
//! references, then the chunk's own source text) until each symbol's
//! signature is complete. Results are keyed by `chunkUid`.

pub mod checks;
pub mod diagnostics;
pub mod document;
pub mod error;
pub mod hover_cache;
pub mod line_index;
pub mod materialize;
pub mod merge;
pub mod metrics;
pub mod options;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod signature;
pub mod stages;
pub mod symbols;
pub mod target;

pub use error::EnrichError;
pub use hover_cache::HoverCache;
pub use materialize::{DocumentMaterializer, PathMaterializer, language_id_for_path};
pub use metrics::HoverMetricsSummary;
pub use options::{PipelineOptions, Stage, StageOptions, StageSet};
pub use output::{ChunkEnrichment, EnrichmentResult, Provenance, RuntimeSummary, TypePayload};
pub use parser::SignatureParser;
pub use pipeline::{Enricher, PipelineInput};
