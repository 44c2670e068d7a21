//! In-process stub language server behind the [`Launcher`] seam.
//!
//! Each spawn wires duplex pipes to a task that speaks just enough LSP for
//! tests: scripted replies per method, optional stalls and crashes, stderr
//! lines, and diagnostics published on `didOpen`. Spawns, requests and
//! notifications are recorded for assertions.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

use crate::codec::{FrameEvent, FrameParser, FrameWriter};
use crate::supervisor::{Launcher, SpawnedChild};
use crate::types::CommandSpec;

const PIPE_BYTES: usize = 256 * 1024;

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the stub answers one request method.
#[derive(Clone)]
pub enum StubReply {
    Result(Value),
    Error { code: i64, message: String },
    /// Never answer.
    Stall,
    /// Compute the result from the request params.
    With(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

#[derive(Clone)]
pub struct StubScript {
    pub capabilities: Value,
    pub replies: HashMap<String, StubReply>,
    pub stderr: Vec<String>,
    /// Published for the opened URI after every `didOpen`.
    pub diagnostics_on_open: Vec<Value>,
    /// Exit abruptly, without replying, when this method arrives.
    pub crash_on: Option<String>,
    /// Stop reading client input, but stay alive, when this method arrives.
    pub close_input_on: Option<String>,
    pub fail_spawn: bool,
    /// Sent to the client right after answering `initialize`.
    pub server_requests: Vec<(String, Value)>,
}

impl Default for StubScript {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "documentSymbolProvider": true,
                "hoverProvider": true,
                "signatureHelpProvider": { "triggerCharacters": ["("] },
                "definitionProvider": true,
                "typeDefinitionProvider": true,
                "referencesProvider": true
            }),
            replies: HashMap::new(),
            stderr: Vec::new(),
            diagnostics_on_open: Vec::new(),
            crash_on: None,
            close_input_on: None,
            fail_spawn: false,
            server_requests: Vec::new(),
        }
    }
}

impl StubScript {
    #[must_use]
    pub fn reply(mut self, method: &str, reply: StubReply) -> Self {
        self.replies.insert(method.to_string(), reply);
        self
    }

    #[must_use]
    pub fn result(self, method: &str, result: Value) -> Self {
        self.reply(method, StubReply::Result(result))
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn stderr(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    #[must_use]
    pub fn diagnostic_on_open(mut self, diagnostic: Value) -> Self {
        self.diagnostics_on_open.push(diagnostic);
        self
    }

    #[must_use]
    pub fn crash_on(mut self, method: &str) -> Self {
        self.crash_on = Some(method.to_string());
        self
    }

    #[must_use]
    pub fn close_input_on(mut self, method: &str) -> Self {
        self.close_input_on = Some(method.to_string());
        self
    }

    #[must_use]
    pub fn fail_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    #[must_use]
    pub fn server_request(mut self, method: &str, params: Value) -> Self {
        self.server_requests.push((method.to_string(), params));
        self
    }
}

#[derive(Default)]
struct Recorded {
    requests: Vec<(String, Value)>,
    notifications: Vec<(String, Value)>,
    client_replies: Vec<Value>,
}

pub struct StubLauncher {
    script: Mutex<StubScript>,
    spawns: AtomicU64,
    recorded: Arc<Mutex<Recorded>>,
}

impl StubLauncher {
    #[must_use]
    pub fn new(script: StubScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            spawns: AtomicU64::new(0),
            recorded: Arc::new(Mutex::new(Recorded::default())),
        })
    }

    /// Change the script; takes effect for the next spawn.
    pub fn update(&self, f: impl FnOnce(&mut StubScript)) {
        f(&mut self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
    }

    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn request_count(&self, method: &str) -> usize {
        self.recorded()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Params of every request for `method`, in arrival order.
    #[must_use]
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.recorded()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    #[must_use]
    pub fn notification_count(&self, method: &str) -> usize {
        self.recorded()
            .notifications
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Poll until `count` notifications for `method` have arrived or a
    /// second has passed; returns the count seen last.
    pub async fn wait_for_notifications(&self, method: &str, count: usize) -> usize {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            let seen = self.notification_count(method);
            if seen >= count || tokio::time::Instant::now() >= deadline {
                return seen;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[must_use]
    pub fn client_replies(&self) -> Vec<Value> {
        self.recorded().client_replies.clone()
    }
}

impl Launcher for StubLauncher {
    fn spawn(&self, _command: &CommandSpec) -> io::Result<SpawnedChild> {
        let script = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if script.fail_spawn {
            return Err(io::Error::new(io::ErrorKind::NotFound, "stub spawn failure"));
        }
        let spawn_no = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;

        let (client_stdin, server_in) = tokio::io::duplex(PIPE_BYTES);
        let (server_out, client_stdout) = tokio::io::duplex(PIPE_BYTES);
        let (mut stderr_writer, client_stderr) = tokio::io::duplex(PIPE_BYTES);
        let (exited_tx, exited_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let stderr_lines = script.stderr.clone();
        tokio::spawn(async move {
            for line in stderr_lines {
                if stderr_writer
                    .write_all(format!("{line}\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let server = StubServer {
            script,
            recorded: Arc::clone(&self.recorded),
        };
        tokio::spawn(async move {
            let code = tokio::select! {
                code = server.run(server_in, server_out) => code,
                _ = kill_rx => None,
            };
            let _ = exited_tx.send(code);
        });

        Ok(SpawnedChild {
            pid: u32::try_from(40_000 + spawn_no).ok(),
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            stderr: Some(Box::new(client_stderr)),
            exited: exited_rx,
            kill: kill_tx,
        })
    }
}

struct StubServer {
    script: StubScript,
    recorded: Arc<Mutex<Recorded>>,
}

impl StubServer {
    fn record(&self, f: impl FnOnce(&mut Recorded)) {
        f(&mut self
            .recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner));
    }

    fn reply_for(&self, method: &str) -> StubReply {
        match method {
            "initialize" => StubReply::Result(json!({ "capabilities": self.script.capabilities })),
            "shutdown" => StubReply::Result(Value::Null),
            _ => self
                .script
                .replies
                .get(method)
                .cloned()
                .unwrap_or(StubReply::Result(Value::Null)),
        }
    }

    /// Drop the input pipe so client writes fail, keeping the process and
    /// its output alive until killed.
    async fn linger(input: DuplexStream, writer: FrameWriter<DuplexStream>) -> Option<i32> {
        drop(input);
        let _writer = writer;
        std::future::pending::<()>().await;
        None
    }

    /// Returns the exit code; `None` for an abrupt crash.
    async fn run(self, mut input: DuplexStream, output: DuplexStream) -> Option<i32> {
        let mut parser = FrameParser::default();
        let mut writer = FrameWriter::new(output);
        let mut buf = vec![0u8; 16 * 1024];
        let mut next_server_id = 1_000_000u64;
        loop {
            let n = match input.read(&mut buf).await {
                Ok(0) | Err(_) => return Some(0),
                Ok(n) => n,
            };
            for event in parser.push(&buf[..n]) {
                let FrameEvent::Message(msg) = event else {
                    return Some(1);
                };
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let method = msg.get("method").and_then(Value::as_str).map(String::from);
                let Some(method) = method else {
                    self.record(|r| r.client_replies.push(msg.clone()));
                    continue;
                };
                let Some(id) = msg.get("id").cloned() else {
                    self.record(|r| r.notifications.push((method.clone(), params.clone())));
                    match method.as_str() {
                        "exit" => return Some(0),
                        "textDocument/didOpen" => {
                            let uri = params["textDocument"]["uri"].clone();
                            if !self.script.diagnostics_on_open.is_empty() {
                                let note = json!({
                                    "jsonrpc": "2.0",
                                    "method": "textDocument/publishDiagnostics",
                                    "params": { "uri": uri, "diagnostics": self.script.diagnostics_on_open }
                                });
                                if writer.write_frame(&note).await.is_err() {
                                    return Some(0);
                                }
                            }
                        }
                        _ => {}
                    }
                    continue;
                };

                self.record(|r| r.requests.push((method.clone(), params.clone())));
                if self.script.crash_on.as_deref() == Some(method.as_str()) {
                    return None;
                }
                if self.script.close_input_on.as_deref() == Some(method.as_str()) {
                    return Self::linger(input, writer).await;
                }
                let response = match self.reply_for(&method) {
                    StubReply::Stall => continue,
                    StubReply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    StubReply::With(f) => json!({"jsonrpc": "2.0", "id": id, "result": (*f)(&params)}),
                    StubReply::Error { code, message } => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": code, "message": message }
                    }),
                };
                if writer.write_frame(&response).await.is_err() {
                    return Some(0);
                }
                if method == "initialize" {
                    for (server_method, server_params) in &self.script.server_requests {
                        next_server_id += 1;
                        let request = json!({
                            "jsonrpc": "2.0",
                            "id": next_server_id,
                            "method": server_method,
                            "params": server_params
                        });
                        if writer.write_frame(&request).await.is_err() {
                            return Some(0);
                        }
                    }
                }
            }
        }
    }
}
