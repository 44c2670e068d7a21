//! LSP message shapes and JSON-RPC helpers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use typelift_types::{LspDiagnostic, Position};

use crate::error::{LspError, LspErrorKind};

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub(crate) enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

pub(crate) fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Split a response body into its result or a protocol error.
pub(crate) fn response_result(body: serde_json::Value) -> Result<serde_json::Value, LspError> {
    let serde_json::Value::Object(mut map) = body else {
        return Err(LspError::new(
            LspErrorKind::MalformedResponse,
            "response is not an object",
        ));
    };
    if let Some(error) = map.remove("error")
        && !error.is_null()
    {
        let code = error.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error");
        return Err(LspError::protocol(code, message));
    }
    Ok(map.remove("result").unwrap_or(serde_json::Value::Null))
}

/// Reply to a server-initiated request.
///
/// Servers block on some of these, so every request gets an answer.
pub(crate) fn server_request_reply(
    id: &serde_json::Value,
    method: &str,
    params: Option<&serde_json::Value>,
) -> serde_json::Value {
    match method {
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(serde_json::Value::as_array)
                .map_or(0, Vec::len);
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": vec![serde_json::Value::Null; items],
            })
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": null,
        }),
        _ => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Method not found: {method}")
            }
        }),
    }
}

/// Client capabilities advertised on `initialize`.
pub(crate) fn client_capabilities() -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "synchronization": {
                "dynamicRegistration": false,
                "willSave": false,
                "willSaveWaitUntil": false,
                "didSave": false
            },
            "documentSymbol": {
                "hierarchicalDocumentSymbolSupport": true
            },
            "hover": {
                "contentFormat": ["markdown", "plaintext"]
            },
            "signatureHelp": {
                "signatureInformation": {
                    "parameterInformation": { "labelOffsetSupport": true }
                }
            },
            "definition": { "linkSupport": true },
            "typeDefinition": { "linkSupport": true },
            "references": {},
            "publishDiagnostics": {
                "relatedInformation": false
            }
        },
        "workspace": {
            "configuration": true
        }
    })
}

pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": client_capabilities(),
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

#[must_use]
pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

#[must_use]
pub fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

#[must_use]
pub fn text_document_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

#[must_use]
pub fn text_document_position_params(uri: &str, position: Position) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": position.line, "character": position.character }
    })
}

#[must_use]
pub fn reference_params(uri: &str, position: Position) -> serde_json::Value {
    let mut params = text_document_position_params(uri, position);
    params["context"] = serde_json::json!({ "includeDeclaration": true });
    params
}

pub(crate) fn cancel_params(id: u64) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

#[derive(Debug, Deserialize)]
pub struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub diagnostics: Vec<LspDiagnostic>,
}

/// Optional features a server advertised in its `initialize` result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMask {
    pub document_symbol: bool,
    pub hover: bool,
    pub signature_help: bool,
    pub definition: bool,
    pub type_definition: bool,
    pub references: bool,
}

impl CapabilityMask {
    /// Everything enabled; used when a server's answer cannot be read.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            document_symbol: true,
            hover: true,
            signature_help: true,
            definition: true,
            type_definition: true,
            references: true,
        }
    }

    /// Derive the mask from an `initialize` result.
    ///
    /// Providers may be `true`, an options object, or absent/`false`.
    #[must_use]
    pub fn from_initialize_result(result: &serde_json::Value) -> Self {
        let Some(caps) = result.get("capabilities") else {
            return Self::default();
        };
        let enabled = |key: &str| match caps.get(key) {
            None | Some(serde_json::Value::Null | serde_json::Value::Bool(false)) => false,
            Some(_) => true,
        };
        Self {
            document_symbol: enabled("documentSymbolProvider"),
            hover: enabled("hoverProvider"),
            signature_help: enabled("signatureHelpProvider"),
            definition: enabled("definitionProvider"),
            type_definition: enabled("typeDefinitionProvider"),
            references: enabled("referencesProvider"),
        }
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_params_has_required_fields() {
        let options = serde_json::json!({ "fallbackFlags": ["-std=c11"] });
        let params = initialize_params("file:///workspace", Some(&options));
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(
            params["capabilities"]["textDocument"]["documentSymbol"]
                ["hierarchicalDocumentSymbolSupport"],
            true
        );
        assert_eq!(params["initializationOptions"]["fallbackFlags"][0], "-std=c11");
    }

    #[test]
    fn initialize_params_omits_absent_options() {
        let params = initialize_params("file:///workspace", None);
        assert!(params.get("initializationOptions").is_none());
    }

    #[test]
    fn did_open_params_shape() {
        let params = did_open_params("file:///test.c", "c", 1, "int main(void) {}");
        assert_eq!(params["textDocument"]["uri"], "file:///test.c");
        assert_eq!(params["textDocument"]["languageId"], "c");
        assert_eq!(params["textDocument"]["version"], 1);
    }

    #[test]
    fn position_params_shape() {
        let params = reference_params("file:///a.py", Position::new(3, 4));
        assert_eq!(params["position"]["line"], 3);
        assert_eq!(params["position"]["character"], 4);
        assert_eq!(params["context"]["includeDeclaration"], true);
    }

    #[test]
    fn parse_incoming_classifies_frames() {
        let response = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null});
        assert!(matches!(
            parse_incoming(&response),
            Some(IncomingFrame::Response { id: 1, .. })
        ));

        let request = serde_json::json!({"jsonrpc": "2.0", "id": "a", "method": "workspace/configuration"});
        assert!(matches!(
            parse_incoming(&request),
            Some(IncomingFrame::ServerRequest { .. })
        ));

        let note = serde_json::json!({"jsonrpc": "2.0", "method": "window/logMessage"});
        assert!(matches!(
            parse_incoming(&note),
            Some(IncomingFrame::Notification { .. })
        ));

        assert!(parse_incoming(&serde_json::json!({"jsonrpc": "2.0"})).is_none());
    }

    #[test]
    fn response_result_extracts_protocol_errors() {
        let ok = response_result(serde_json::json!({"id": 1, "result": {"x": 1}})).unwrap();
        assert_eq!(ok["x"], 1);

        let missing = response_result(serde_json::json!({"id": 1, "result": null})).unwrap();
        assert!(missing.is_null());

        let err = response_result(serde_json::json!({
            "id": 1,
            "error": {"code": -32600, "message": "invalid request"}
        }))
        .unwrap_err();
        assert!(err.is(LspErrorKind::Protocol));
        assert_eq!(err.code(), Some(-32600));
        assert_eq!(err.message(), "invalid request");
    }

    #[test]
    fn configuration_request_gets_one_null_per_item() {
        let params = serde_json::json!({"items": [{"section": "a"}, {"section": "b"}]});
        let reply = server_request_reply(
            &serde_json::json!(4),
            "workspace/configuration",
            Some(&params),
        );
        assert_eq!(reply["result"], serde_json::json!([null, null]));
    }

    #[test]
    fn unknown_server_request_gets_method_not_found() {
        let reply = server_request_reply(&serde_json::json!(5), "workspace/applyEdit", None);
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("workspace/applyEdit")
        );
    }

    #[test]
    fn capability_mask_reads_bool_and_object_providers() {
        let result = serde_json::json!({
            "capabilities": {
                "documentSymbolProvider": true,
                "hoverProvider": { "workDoneProgress": false },
                "signatureHelpProvider": { "triggerCharacters": ["("] },
                "definitionProvider": false,
                "referencesProvider": null
            }
        });
        let mask = CapabilityMask::from_initialize_result(&result);
        assert!(mask.document_symbol);
        assert!(mask.hover);
        assert!(mask.signature_help);
        assert!(!mask.definition);
        assert!(!mask.type_definition);
        assert!(!mask.references);
    }

    #[test]
    fn publish_diagnostics_deserialization() {
        let json = serde_json::json!({
            "uri": "file:///test.c",
            "diagnostics": [{
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 5 } },
                "severity": 1,
                "source": "clang",
                "message": "use of undeclared identifier 'x'"
            }]
        });

        let params: PublishDiagnosticsParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.uri, "file:///test.c");
        assert_eq!(params.diagnostics.len(), 1);
        assert!(params.diagnostics[0].severity().is_error());
    }

    #[cfg(not(windows))]
    #[test]
    fn file_uri_round_trip() {
        let uri = path_to_file_uri(Path::new("/tmp/a b.c")).unwrap();
        assert_eq!(uri.as_str(), "file:///tmp/a%20b.c");
        assert_eq!(file_uri_to_path(uri.as_str()), Some(PathBuf::from("/tmp/a b.c")));
    }
}
