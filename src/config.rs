//! Layered configuration: built-in defaults, overridden by an optional TOML
//! file, overridden by `COLLAB_*` environment variables, overridden by CLI
//! flags. Each layer only overrides the fields it actually sets.

use std::fs::read_to_string;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::EngineError;

/// Command-line flags. Every flag is optional so that lower layers (file,
/// env, built-in defaults) can supply the value instead.
#[derive(Parser, Debug, Default)]
#[command(version, author, about = "Collaborative text-editing server")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    documents_dir: Option<String>,

    #[arg(long)]
    users_file: Option<String>,

    #[arg(long)]
    max_file_size: Option<u64>,

    #[arg(long)]
    max_frame_size: Option<usize>,

    #[arg(long)]
    max_insert_len: Option<usize>,

    #[arg(long)]
    history_depth: Option<usize>,

    #[arg(long)]
    transform_window: Option<usize>,

    #[arg(long)]
    auto_save_interval_ms: Option<u64>,

    #[arg(long)]
    socket_read_timeout_ms: Option<u64>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    restrict_delete_to_creator: Option<bool>,
}

/// A config file layer; every field is optional since the file need not set
/// all of them.
#[derive(Deserialize, Default)]
struct FileConfig {
    port: Option<u16>,
    max_connections: Option<usize>,
    documents_dir: Option<String>,
    users_file: Option<String>,
    max_file_size: Option<u64>,
    max_frame_size: Option<usize>,
    max_insert_len: Option<usize>,
    history_depth: Option<usize>,
    transform_window: Option<usize>,
    auto_save_interval_ms: Option<u64>,
    socket_read_timeout_ms: Option<u64>,
    log_level: Option<String>,
    restrict_delete_to_creator: Option<bool>,
}

/// Fully resolved server configuration, matching the recognized options in
/// the external interface description.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_connections: usize,
    pub documents_dir: PathBuf,
    pub users_file: PathBuf,
    pub max_file_size: u64,
    pub max_frame_size: usize,
    pub max_insert_len: usize,
    pub history_depth: usize,
    /// Window used for DELETE transforms; INSERT uses `min(transform_window, 3)`.
    pub transform_window: usize,
    pub auto_save_interval_ms: u64,
    pub socket_read_timeout_ms: u64,
    pub log_level: String,
    /// Whether FILE_DELETE is additionally gated on the requester being the
    /// document's creator. Off by default: the specification requires only
    /// the "at most one participant" rule.
    pub restrict_delete_to_creator: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            max_connections: 100,
            documents_dir: PathBuf::from("documents/"),
            users_file: PathBuf::from("users.txt"),
            max_file_size: 10 * 1024 * 1024,
            max_frame_size: 4 * 1024 * 1024,
            max_insert_len: 10_000,
            history_depth: 100,
            transform_window: 20,
            auto_save_interval_ms: 30_000,
            socket_read_timeout_ms: 5_000,
            log_level: "info".to_string(),
            restrict_delete_to_creator: false,
        }
    }
}

impl Config {
    /// INSERT transforms against a narrower window than DELETE (see the
    /// history-depth design note): capped at 3 regardless of the configured
    /// `transform_window`.
    pub fn insert_window(&self) -> usize {
        self.transform_window.min(3)
    }

    pub fn delete_window(&self) -> usize {
        self.transform_window
    }

    fn merge_file(mut self, file: FileConfig) -> Self {
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = file.documents_dir {
            self.documents_dir = PathBuf::from(v);
        }
        if let Some(v) = file.users_file {
            self.users_file = PathBuf::from(v);
        }
        if let Some(v) = file.max_file_size {
            self.max_file_size = v;
        }
        if let Some(v) = file.max_frame_size {
            self.max_frame_size = v;
        }
        if let Some(v) = file.max_insert_len {
            self.max_insert_len = v;
        }
        if let Some(v) = file.history_depth {
            self.history_depth = v;
        }
        if let Some(v) = file.transform_window {
            self.transform_window = v;
        }
        if let Some(v) = file.auto_save_interval_ms {
            self.auto_save_interval_ms = v;
        }
        if let Some(v) = file.socket_read_timeout_ms {
            self.socket_read_timeout_ms = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.restrict_delete_to_creator {
            self.restrict_delete_to_creator = v;
        }
        self
    }

    fn merge_env(mut self) -> Self {
        macro_rules! env_override {
            ($field:ident, $var:literal) => {
                if let Ok(raw) = std::env::var(concat!("COLLAB_", $var)) {
                    if let Ok(parsed) = raw.parse() {
                        self.$field = parsed;
                    }
                }
            };
        }
        if let Ok(raw) = std::env::var("COLLAB_DOCUMENTS_DIR") {
            self.documents_dir = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("COLLAB_USERS_FILE") {
            self.users_file = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("COLLAB_LOG_LEVEL") {
            self.log_level = raw;
        }
        env_override!(port, "PORT");
        env_override!(max_connections, "MAX_CONNECTIONS");
        env_override!(max_file_size, "MAX_FILE_SIZE");
        env_override!(max_frame_size, "MAX_FRAME_SIZE");
        env_override!(max_insert_len, "MAX_INSERT_LEN");
        env_override!(history_depth, "HISTORY_DEPTH");
        env_override!(transform_window, "TRANSFORM_WINDOW");
        env_override!(auto_save_interval_ms, "AUTO_SAVE_INTERVAL_MS");
        env_override!(socket_read_timeout_ms, "SOCKET_READ_TIMEOUT_MS");
        env_override!(restrict_delete_to_creator, "RESTRICT_DELETE_TO_CREATOR");
        self
    }

    fn merge_cli(mut self, cli: &Cli) -> Self {
        if let Some(v) = cli.port {
            self.port = v;
        }
        if let Some(v) = cli.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = &cli.documents_dir {
            self.documents_dir = PathBuf::from(v);
        }
        if let Some(v) = &cli.users_file {
            self.users_file = PathBuf::from(v);
        }
        if let Some(v) = cli.max_file_size {
            self.max_file_size = v;
        }
        if let Some(v) = cli.max_frame_size {
            self.max_frame_size = v;
        }
        if let Some(v) = cli.max_insert_len {
            self.max_insert_len = v;
        }
        if let Some(v) = cli.history_depth {
            self.history_depth = v;
        }
        if let Some(v) = cli.transform_window {
            self.transform_window = v;
        }
        if let Some(v) = cli.auto_save_interval_ms {
            self.auto_save_interval_ms = v;
        }
        if let Some(v) = cli.socket_read_timeout_ms {
            self.socket_read_timeout_ms = v;
        }
        if let Some(v) = &cli.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = cli.restrict_delete_to_creator {
            self.restrict_delete_to_creator = v;
        }
        self
    }

    /// Loads defaults, then the config file (if one is named by `--config`
    /// or present at `config.toml`), then environment, then CLI flags.
    pub fn load() -> Result<Self, EngineError> {
        let cli = Cli::parse();
        Self::load_from(&cli)
    }

    fn load_from(cli: &Cli) -> Result<Self, EngineError> {
        let mut config = Config::default();

        let file_path = cli.config.clone().unwrap_or_else(|| "config.toml".to_string());
        if let Ok(contents) = read_to_string(&file_path) {
            let file: FileConfig = toml::from_str(&contents).map_err(|e| EngineError::InvalidArguments {
                field: format!("config file {file_path:?}: {e}"),
            })?;
            config = config.merge_file(file);
        }

        config = config.merge_env();
        config = config.merge_cli(cli);

        Ok(config)
    }
}
