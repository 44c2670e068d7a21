//! Resolving documents to URIs a language server can read.

use std::io;
use std::path::{Component, Path, PathBuf};

use typelift_lsp::protocol::path_to_file_uri;
use typelift_types::Document;
use typelift_utils::{AtomicWriteOptions, FileSyncPolicy, atomic_write_with_options};

/// Guarantees a document's bytes are readable by the server before
/// `didOpen`, and returns the URI to open it under.
pub trait DocumentMaterializer: Send + Sync {
    fn materialize(&self, root: &Path, document: &Document) -> io::Result<String>;
}

/// Writes each document to `<root>/<virtual_path>` when the bytes on disk
/// differ, and opens it by `file://` URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathMaterializer;

fn resolve_under(root: &Path, virtual_path: &str) -> io::Result<PathBuf> {
    let relative = Path::new(virtual_path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || virtual_path.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("virtual path escapes the root: {virtual_path}"),
        ));
    }
    Ok(root.join(relative))
}

impl DocumentMaterializer for PathMaterializer {
    fn materialize(&self, root: &Path, document: &Document) -> io::Result<String> {
        let path = resolve_under(root, &document.virtual_path)?;
        let current = std::fs::read(&path).ok();
        if current.as_deref() != Some(document.text.as_bytes()) {
            let options = AtomicWriteOptions {
                file_sync: FileSyncPolicy::SkipSync,
                create_parent: true,
            };
            atomic_write_with_options(&path, document.text.as_bytes(), options)?;
        }
        let uri = path_to_file_uri(&path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(uri.to_string())
    }
}

/// LSP `languageId` for a path's extension; `plaintext` when unknown.
#[must_use]
pub fn language_id_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" => "javascript",
        "jsx" => "javascriptreact",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "mm" => "objective-cpp",
        "m" => "objective-c",
        "swift" => "swift",
        "py" | "pyi" => "python",
        "rs" => "rust",
        "go" => "go",
        _ => "plaintext",
    }
}
