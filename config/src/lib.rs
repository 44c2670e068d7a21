//! Configuration loading for typelift.
//!
//! The file lives at `~/.typelift/config.toml`. Every section and key is
//! optional; a missing file yields the documented defaults. Values are
//! clamped when converted into [`PipelineOptions`] and [`SessionOptions`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use typelift_enrich::options::{DEFAULT_DOCUMENT_SYMBOL_CONCURRENCY, DEFAULT_STAGE_CONCURRENCY};
use typelift_enrich::{PipelineOptions, Stage, StageOptions};
use typelift_lsp::types::{
    DEFAULT_BREAKER_THRESHOLD, DEFAULT_FD_PRESSURE_BACKOFF, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_INITIALIZE_TIMEOUT, DEFAULT_MAX_LIFETIME, DEFAULT_MAX_RESTARTS_PER_WINDOW, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RESTART_WINDOW, DEFAULT_RETRIES,
};
use typelift_lsp::{CommandSpec, SessionOptions};

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn as_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// `~/.typelift/config.toml`, when a home directory is known.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".typelift").join("config.toml"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TypeliftConfig {
    pub pipeline: PipelineConfig,
    pub stages: StagesConfig,
    pub session: SessionConfig,
    pub diagnostics: DiagnosticsConfig,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub strict: bool,
    pub capture_diagnostics: bool,
    pub documentsymbol_concurrency: usize,
    pub documentsymbol_timeout_ms: Option<u64>,
    /// Shared default for stage timeouts.
    pub timeout_ms: Option<u64>,
    pub global_disable_after_timeouts: Option<u32>,
    pub cache_root: Option<PathBuf>,
    pub hover_cache_max_entries: usize,
    pub surface_cache_errors: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strict: true,
            capture_diagnostics: false,
            documentsymbol_concurrency: DEFAULT_DOCUMENT_SYMBOL_CONCURRENCY,
            documentsymbol_timeout_ms: None,
            timeout_ms: None,
            global_disable_after_timeouts: None,
            cache_root: None,
            hover_cache_max_entries: typelift_enrich::options::DEFAULT_HOVER_CACHE_MAX_ENTRIES,
            surface_cache_errors: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub enabled: bool,
    pub timeout_ms: Option<u64>,
    pub concurrency: usize,
    /// `0` means unlimited, same as absent.
    pub max_per_file: Option<usize>,
    pub disable_after_timeouts: Option<u32>,
    pub symbol_kinds: Option<Vec<u32>>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: None,
            concurrency: DEFAULT_STAGE_CONCURRENCY,
            max_per_file: None,
            disable_after_timeouts: None,
            symbol_kinds: None,
        }
    }
}

impl StageConfig {
    fn to_options(&self, shared_timeout: Option<u64>) -> StageOptions {
        StageOptions {
            enabled: self.enabled,
            timeout: self.timeout_ms.or(shared_timeout).map(ms),
            concurrency: self.concurrency,
            max_per_file: self.max_per_file.filter(|&budget| budget > 0),
            disable_after_timeouts: self.disable_after_timeouts,
            symbol_kinds: self
                .symbol_kinds
                .as_ref()
                .map(|kinds| kinds.iter().copied().collect()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub hover: StageConfig,
    pub signature_help: StageConfig,
    pub definition: StageConfig,
    pub type_definition: StageConfig,
    pub references: StageConfig,
}

impl StagesConfig {
    #[must_use]
    pub fn get(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Hover => &self.hover,
            Stage::SignatureHelp => &self.signature_help,
            Stage::Definition => &self.definition,
            Stage::TypeDefinition => &self.type_definition,
            Stage::References => &self.references,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub pooling: bool,
    pub idle_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub timeout_ms: u64,
    pub initialize_timeout_ms: u64,
    pub retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub restart_window_ms: u64,
    pub max_restarts_per_window: u32,
    pub fd_pressure_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pooling: true,
            idle_timeout_ms: as_ms(DEFAULT_IDLE_TIMEOUT),
            max_lifetime_ms: as_ms(DEFAULT_MAX_LIFETIME),
            timeout_ms: as_ms(DEFAULT_REQUEST_TIMEOUT),
            initialize_timeout_ms: as_ms(DEFAULT_INITIALIZE_TIMEOUT),
            retries: DEFAULT_RETRIES,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            breaker_cooldown_ms: as_ms(DEFAULT_REQUEST_TIMEOUT),
            restart_window_ms: as_ms(DEFAULT_RESTART_WINDOW),
            max_restarts_per_window: DEFAULT_MAX_RESTARTS_PER_WINDOW,
            fd_pressure_backoff_ms: as_ms(DEFAULT_FD_PRESSURE_BACKOFF),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub max_uris: usize,
    pub max_per_uri: usize,
    pub max_per_chunk: usize,
    pub drain_window_ms: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_uris: typelift_lsp::diagnostics::DEFAULT_MAX_URIS,
            max_per_uri: typelift_lsp::diagnostics::DEFAULT_MAX_PER_URI,
            max_per_chunk: typelift_enrich::options::DEFAULT_MAX_DIAGNOSTICS_PER_CHUNK,
            drain_window_ms: as_ms(typelift_enrich::options::DEFAULT_DRAIN_WINDOW),
        }
    }
}

/// The language server to launch.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub workspace_key: Option<String>,
    pub initialization_options: Option<toml::Value>,
}

impl ServerConfig {
    #[must_use]
    pub fn command_spec(&self) -> CommandSpec {
        CommandSpec {
            cmd: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            shell: false,
        }
    }
}

impl TypeliftConfig {
    /// Load from [`config_path`]; defaults when there is no home directory
    /// or no file.
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Pipeline knobs, clamped.
    #[must_use]
    pub fn pipeline_options(&self) -> PipelineOptions {
        let pipeline = &self.pipeline;
        let mut options = PipelineOptions {
            strict: pipeline.strict,
            capture_diagnostics: pipeline.capture_diagnostics,
            document_symbol_concurrency: pipeline.documentsymbol_concurrency,
            document_symbol_timeout: pipeline.documentsymbol_timeout_ms.or(pipeline.timeout_ms).map(ms),
            global_disable_after_timeouts: pipeline.global_disable_after_timeouts,
            cache_root: pipeline.cache_root.clone(),
            hover_cache_max_entries: pipeline.hover_cache_max_entries,
            surface_cache_errors: pipeline.surface_cache_errors,
            max_diagnostic_uris: self.diagnostics.max_uris,
            max_diagnostics_per_uri: self.diagnostics.max_per_uri,
            max_diagnostics_per_chunk: self.diagnostics.max_per_chunk,
            diagnostics_drain_window: ms(self.diagnostics.drain_window_ms),
            ..PipelineOptions::default()
        };
        for stage in Stage::ALL {
            *options.stages.get_mut(stage) = self.stages.get(stage).to_options(pipeline.timeout_ms);
        }
        options.normalized()
    }

    /// Session knobs for `command` rooted at `repo_root`, clamped.
    #[must_use]
    pub fn session_options_for(&self, repo_root: impl Into<PathBuf>, command: CommandSpec) -> SessionOptions {
        let session = &self.session;
        let mut options = SessionOptions::new(repo_root, command);
        options.pooling = session.pooling;
        options.idle_timeout = ms(session.idle_timeout_ms);
        options.max_lifetime = ms(session.max_lifetime_ms);
        options.supervisor.request_timeout = ms(session.timeout_ms);
        options.supervisor.initialize_timeout = ms(session.initialize_timeout_ms.max(1));
        options.guard.timeout = ms(session.timeout_ms);
        options.guard.retries = session.retries;
        options.guard.breaker_threshold = session.breaker_threshold;
        options.guard.cooldown = ms(session.breaker_cooldown_ms);
        options.lifecycle.restart_window = ms(session.restart_window_ms);
        options.lifecycle.max_restarts_per_window = session.max_restarts_per_window;
        options.lifecycle.fd_pressure_backoff = ms(session.fd_pressure_backoff_ms);
        options.normalized()
    }

    /// Session knobs for the configured `[server]`.
    pub fn session_options(&self, repo_root: impl Into<PathBuf>) -> Result<SessionOptions> {
        let Some(server) = &self.server else {
            bail!("no [server] command configured");
        };
        if server.command.trim().is_empty() {
            bail!("[server] command is empty");
        }
        let mut options = self.session_options_for(repo_root, server.command_spec());
        options.workspace_key.clone_from(&server.workspace_key);
        options.initialization_options = server
            .initialization_options
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("invalid [server] initialization_options")?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use typelift_enrich::options::{MAX_CONCURRENCY, MIN_HOVER_CACHE_MAX_ENTRIES, MIN_STAGE_TIMEOUT};
    use typelift_lsp::types::{MIN_FD_PRESSURE_BACKOFF, MIN_SESSION_TIMER};

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TypeliftConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert!(config.server.is_none());
        assert_eq!(config.pipeline_options(), PipelineOptions::default().normalized());

        let session = config.session_options_for("/repo", CommandSpec::new("clangd"));
        assert_eq!(session.guard.cooldown, Duration::from_secs(15));
        assert_eq!(session.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(session.pooling);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline\nstrict = true").unwrap();
        let err = TypeliftConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains(&path.display().to_string()));
    }

    #[test]
    fn stage_timeouts_fall_back_to_the_shared_default() {
        let config = TypeliftConfig::parse(
            r"
            [pipeline]
            timeout_ms = 4000

            [stages.hover]
            timeout_ms = 2000
            disable_after_timeouts = 1
            symbol_kinds = [6, 12]

            [stages.references]
            enabled = false
            max_per_file = 0
            ",
        )
        .unwrap();
        let options = config.pipeline_options();
        assert_eq!(options.stages.hover.timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.stages.hover.disable_after_timeouts, Some(1));
        assert_eq!(options.stages.hover.symbol_kinds, Some(BTreeSet::from([6, 12])));
        assert_eq!(options.stages.definition.timeout, Some(Duration::from_secs(4)));
        assert_eq!(options.document_symbol_timeout, Some(Duration::from_secs(4)));
        assert!(!options.stages.references.enabled);
        assert_eq!(options.stages.references.max_per_file, None);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = TypeliftConfig::parse(
            r"
            [pipeline]
            documentsymbol_concurrency = 0
            hover_cache_max_entries = 10

            [stages.hover]
            timeout_ms = 5
            concurrency = 1000
            symbol_kinds = []

            [session]
            idle_timeout_ms = 1
            fd_pressure_backoff_ms = 1
            max_restarts_per_window = 0
            ",
        )
        .unwrap();
        let options = config.pipeline_options();
        assert_eq!(options.document_symbol_concurrency, 1);
        assert_eq!(options.hover_cache_max_entries, MIN_HOVER_CACHE_MAX_ENTRIES);
        assert_eq!(options.stages.hover.timeout, Some(MIN_STAGE_TIMEOUT));
        assert_eq!(options.stages.hover.concurrency, MAX_CONCURRENCY);
        assert_eq!(options.stages.hover.symbol_kinds, None);

        let session = config.session_options_for("/repo", CommandSpec::new("clangd"));
        assert_eq!(session.idle_timeout, MIN_SESSION_TIMER);
        assert_eq!(session.lifecycle.fd_pressure_backoff, MIN_FD_PRESSURE_BACKOFF);
        assert_eq!(session.lifecycle.max_restarts_per_window, 2);
    }

    #[test]
    fn server_section_builds_session_options() {
        let config = TypeliftConfig::parse(
            r#"
            [session]
            pooling = false
            retries = 0
            breaker_cooldown_ms = 30000

            [server]
            command = "clangd"
            args = ["--background-index=false"]
            env = { CLANGD_FLAGS = "-j=2" }
            workspace_key = "main"
            initialization_options = { fallbackFlags = ["-std=c11"] }
            "#,
        )
        .unwrap();
        let session = config.session_options("/repo").unwrap();
        assert_eq!(session.command.cmd, "clangd");
        assert_eq!(session.command.args, vec!["--background-index=false"]);
        assert_eq!(session.command.env, vec![("CLANGD_FLAGS".to_string(), "-j=2".to_string())]);
        assert_eq!(session.provider_id, "clangd");
        assert_eq!(session.workspace_key.as_deref(), Some("main"));
        assert_eq!(
            session.initialization_options,
            Some(serde_json::json!({ "fallbackFlags": ["-std=c11"] }))
        );
        assert!(!session.pooling);
        assert_eq!(session.guard.retries, 0);
        assert_eq!(session.guard.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn session_options_require_a_server() {
        let err = TypeliftConfig::default().session_options("/repo").unwrap_err();
        assert!(err.to_string().contains("[server]"));
    }
}
