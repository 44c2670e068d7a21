use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Confidence attached to parameter types learned from a language server.
pub const DEFAULT_PARAM_CONFIDENCE: f64 = 0.7;

/// Provenance tag attached to parameter types learned from a language server.
pub const PARAM_SOURCE_TOOLING: &str = "tooling";

/// One candidate type for a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamType {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_confidence() -> f64 {
    DEFAULT_PARAM_CONFIDENCE
}

fn default_source() -> String {
    PARAM_SOURCE_TOOLING.to_string()
}

impl ParamType {
    #[must_use]
    pub fn tooling(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            confidence: DEFAULT_PARAM_CONFIDENCE,
            source: PARAM_SOURCE_TOOLING.to_string(),
        }
    }

    #[must_use]
    pub fn is_typed(&self) -> bool {
        !self.type_name.trim().is_empty()
    }
}

/// The unit of type knowledge produced by every enrichment stage.
///
/// `param_types` is keyed by parameter name; a name may carry several
/// candidate types, ordered best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub return_type: Option<String>,
    #[serde(default)]
    pub param_names: Vec<String>,
    #[serde(default)]
    pub param_types: BTreeMap<String, Vec<ParamType>>,
}

impl SignatureInfo {
    #[must_use]
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: Some(signature.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_return(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = Some(return_type.into());
        self
    }

    /// Declare a parameter, optionally with a type.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, type_name: Option<&str>) -> Self {
        let name = name.into();
        if let Some(type_name) = type_name {
            self.param_types
                .entry(name.clone())
                .or_default()
                .push(ParamType::tooling(type_name));
        }
        if !self.param_names.contains(&name) {
            self.param_names.push(name);
        }
        self
    }

    /// True when nothing at all was learned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signature.as_deref().is_none_or(|s| s.trim().is_empty())
            && self
                .return_type
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
            && self.param_names.is_empty()
            && self.param_types.is_empty()
    }

    #[must_use]
    pub fn signature_len(&self) -> usize {
        self.signature.as_deref().map_or(0, |s| s.trim().len())
    }

    /// First typed entry for `name`, if any.
    #[must_use]
    pub fn typed_entry(&self, name: &str) -> Option<&ParamType> {
        self.param_types
            .get(name)
            .and_then(|entries| entries.iter().find(|entry| entry.is_typed()))
    }

    #[must_use]
    pub fn has_typed_params(&self) -> bool {
        self.param_types
            .values()
            .any(|entries| entries.iter().any(ParamType::is_typed))
    }

    /// Names whose types matter: the declared list, or the typed keys when
    /// the parser did not report names.
    #[must_use]
    pub fn declared_params(&self) -> Vec<&str> {
        if self.param_names.is_empty() {
            self.param_types.keys().map(String::as_str).collect()
        } else {
            self.param_names.iter().map(String::as_str).collect()
        }
    }

    /// Fraction of declared parameters that have a typed entry.
    ///
    /// A signature with no parameters is fully covered.
    #[must_use]
    pub fn param_coverage(&self) -> f64 {
        let declared = self.declared_params();
        if declared.is_empty() {
            return 1.0;
        }
        let typed = declared
            .iter()
            .filter(|name| self.typed_entry(name).is_some())
            .count();
        typed as f64 / declared.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_counts_declared_names_only() {
        let info = SignatureInfo::new("f(a: i32, b)")
            .with_param("a", Some("i32"))
            .with_param("b", None);
        assert!((info.param_coverage() - 0.5).abs() < f64::EPSILON);
        assert!(info.has_typed_params());
    }

    #[test]
    fn coverage_of_nullary_signature_is_full() {
        let info = SignatureInfo::new("f()").with_return("i32");
        assert!((info.param_coverage() - 1.0).abs() < f64::EPSILON);
        assert!(!info.has_typed_params());
    }

    #[test]
    fn blank_types_do_not_count() {
        let mut info = SignatureInfo::new("f(a)").with_param("a", None);
        info.param_types
            .insert("a".to_string(), vec![ParamType::tooling("  ")]);
        assert!(info.typed_entry("a").is_none());
        assert!(info.param_coverage() < 1.0);
    }

    #[test]
    fn serializes_camel_case_with_type_key() {
        let info = SignatureInfo::new("f(a: u8) -> u8")
            .with_return("u8")
            .with_param("a", Some("u8"));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["returnType"], "u8");
        assert_eq!(json["paramNames"][0], "a");
        assert_eq!(json["paramTypes"]["a"][0]["type"], "u8");
        assert_eq!(json["paramTypes"]["a"][0]["source"], "tooling");
    }

    #[test]
    fn empty_detection() {
        assert!(SignatureInfo::default().is_empty());
        assert!(SignatureInfo::new("   ").is_empty());
        assert!(!SignatureInfo::default().with_return("int").is_empty());
    }
}
