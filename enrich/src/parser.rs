//! Caller-supplied signature parsing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use typelift_types::SignatureInfo;

use crate::signature::normalize_type_text;

/// Turns declaration text into a [`SignatureInfo`]. Language-specific and
/// supplied by the caller; the pipeline stays language-agnostic.
pub trait SignatureParser: Send + Sync {
    fn parse(&self, text: &str, language_id: &str, symbol_name: &str) -> Option<SignatureInfo>;
}

impl<F> SignatureParser for F
where
    F: Fn(&str, &str, &str) -> Option<SignatureInfo> + Send + Sync,
{
    fn parse(&self, text: &str, language_id: &str, symbol_name: &str) -> Option<SignatureInfo> {
        self(text, language_id, symbol_name)
    }
}

/// Run-scoped memo over a parser, keyed by language, whitespace-collapsed
/// text and symbol name.
pub struct ParseCache<'a> {
    parser: &'a dyn SignatureParser,
    entries: Mutex<HashMap<(String, String, String), Option<SignatureInfo>>>,
}

impl<'a> ParseCache<'a> {
    #[must_use]
    pub fn new(parser: &'a dyn SignatureParser) -> Self {
        Self {
            parser,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn parse(&self, text: &str, language_id: &str, symbol_name: &str) -> Option<SignatureInfo> {
        let normalized = normalize_type_text(text)?;
        let key = (language_id.to_string(), normalized, symbol_name.to_string());
        if let Some(hit) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return hit.clone();
        }
        let parsed = self
            .parser
            .parse(&key.1, language_id, symbol_name)
            .filter(|info| !info.is_empty());
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, parsed.clone());
        parsed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn memoizes_on_collapsed_text() {
        let calls = AtomicUsize::new(0);
        let parser = |text: &str, _lang: &str, _name: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(SignatureInfo::new(text))
        };
        let cache = ParseCache::new(&parser);
        let a = cache.parse("int  add(int a,\n int b)", "c", "add");
        let b = cache.parse("int add(int a, int b)", "c", "add");
        assert_eq!(a, b);
        assert_eq!(a.unwrap().signature.as_deref(), Some("int add(int a, int b)"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = cache.parse("int add(int a, int b)", "cpp", "add");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn blank_text_and_empty_results_are_none() {
        let parser = |_: &str, _: &str, _: &str| Some(SignatureInfo::default());
        let cache = ParseCache::new(&parser);
        assert!(cache.parse("   ", "c", "x").is_none());
        assert!(cache.parse("x", "c", "x").is_none());
    }
}
