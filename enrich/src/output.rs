//! Run output.

use std::collections::BTreeMap;

use serde::Serialize;
use typelift_lsp::{CapabilityMask, GuardSnapshot, LifecycleSnapshot, MethodSnapshot, PoolingSnapshot};
use typelift_types::{ChunkRef, Check, LspDiagnostic, ParamType, SignatureInfo};

use crate::metrics::HoverMetricsSummary;
use crate::signature::{emit_param_types, emit_return_type, normalize_type_text};

pub const PROVENANCE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_types: Option<BTreeMap<String, Vec<ParamType>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl TypePayload {
    #[must_use]
    pub fn from_info(info: &SignatureInfo) -> Self {
        Self {
            return_type: emit_return_type(info),
            param_types: emit_param_types(info),
            signature: info.signature.as_deref().and_then(normalize_type_text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub provider: String,
    pub version: String,
    pub collected_at: String,
}

impl Provenance {
    #[must_use]
    pub fn now(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            version: PROVENANCE_VERSION.to_string(),
            collected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEnrichment {
    pub chunk: ChunkRef,
    pub payload: TypePayload,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSummary {
    pub capabilities: Option<CapabilityMask>,
    pub lifecycle: LifecycleSnapshot,
    pub guard: GuardSnapshot,
    pub pooling: PoolingSnapshot,
    pub requests: BTreeMap<String, MethodSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResult {
    pub by_chunk_uid: BTreeMap<String, ChunkEnrichment>,
    pub diagnostics_by_chunk_uid: BTreeMap<String, Vec<LspDiagnostic>>,
    pub enriched: usize,
    pub diagnostics_count: usize,
    pub checks: Vec<Check>,
    pub hover_metrics: HoverMetricsSummary,
    /// Absent when no session was leased.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeSummary>,
}

impl EnrichmentResult {
    #[must_use]
    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|check| check.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_emit_normalisation() {
        let info = SignatureInfo::new("func load(url: URL)  -> Data")
            .with_return("Void")
            .with_param("url", Some("URL"));
        let payload = TypePayload::from_info(&info);
        assert_eq!(payload.return_type.as_deref(), Some("Data"));
        assert_eq!(payload.signature.as_deref(), Some("func load(url: URL) -> Data"));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["returnType"], "Data");
        assert_eq!(json["paramTypes"]["url"][0]["type"], "URL");
        assert_eq!(json["paramTypes"]["url"][0]["source"], "tooling");
    }

    #[test]
    fn empty_result_serializes_without_runtime() {
        let json = serde_json::to_value(EnrichmentResult::default()).unwrap();
        assert_eq!(json["enriched"], 0);
        assert!(json.get("runtime").is_none());
        assert!(json["byChunkUid"].as_object().unwrap().is_empty());
    }

    #[test]
    fn provenance_is_stamped() {
        let provenance = Provenance::now("clangd");
        assert_eq!(provenance.version, PROVENANCE_VERSION);
        assert!(chrono::DateTime::parse_from_rfc3339(&provenance.collected_at).is_ok());
    }
}
