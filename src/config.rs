use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_EXPORT_BASE_URL: &str = "https://docs.google.com/spreadsheets/d";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "leadsync", "leadsync")
}

fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("LEADSYNC_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".leadsync")
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("LEADSYNC_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".leadsync-config.toml")
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub sync: SyncConfig,
    pub sheets: SheetsConfig,
    pub logging: LoggingConfig,
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
    pub debounce_ms: u64,
    pub persist_delay_ms: u64,
    pub confirm_after_secs: u64,
    pub max_resend_attempts: u32,
    pub actor: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            request_timeout_secs: 15,
            debounce_ms: 100,
            persist_delay_ms: 250,
            confirm_after_secs: 600,
            max_resend_attempts: 3,
            actor: crate::models::SYSTEM_ACTOR.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn persist_delay(&self) -> Duration {
        Duration::from_millis(self.persist_delay_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SheetsConfig {
    pub export_base_url: String,
    pub leads_gid: u64,
    pub history_gid: u64,
    /// Fallback append endpoint for clients without their own.
    pub history_webapp_url: String,
    /// Published sheet holding the client registry.
    pub clients_sheet_id: String,
    /// Web app that rewrites the client registry sheet.
    pub clients_webapp_url: String,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            export_base_url: DEFAULT_EXPORT_BASE_URL.to_string(),
            leads_gid: 0,
            history_gid: 0,
            history_webapp_url: String::new(),
            clients_sheet_id: String::new(),
            clients_webapp_url: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// A tenant: owns a lead sheet and, optionally, a remote label-history store.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub id: String,
    pub name: String,
    pub sheet_id: String,
    pub history_sheet_id: String,
    pub history_webapp_url: String,
    pub conversion_labels: Vec<String>,
    pub updated_at: String,
}

impl ClientConfig {
    pub fn has_history_sink(&self) -> bool {
        !self.history_webapp_url.trim().is_empty()
    }

    pub fn has_history_sheet(&self) -> bool {
        !self.history_sheet_id.trim().is_empty()
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut config = if let Ok(content) = fs::read_to_string(config_path) {
            match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = ?config_path, error = %e, "failed to parse config, using defaults");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        let mut changed = config.normalize_paths();
        changed |= config.normalize_clients();

        if changed || !config_path.exists() {
            if let Err(e) = config.save_to_path(config_path) {
                warn!(path = ?config_path, error = %e, "failed to write config");
            }
        }

        config
    }

    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    pub fn client(&self, id_or_name: &str) -> Option<&ClientConfig> {
        let key = id_or_name.trim();
        self.clients
            .iter()
            .find(|c| c.id == key)
            .or_else(|| self.clients.iter().find(|c| c.name.eq_ignore_ascii_case(key)))
    }

    /// Client with the global sheet defaults filled in.
    pub fn resolved_client(&self, id_or_name: &str) -> Option<ClientConfig> {
        let mut client = self.client(id_or_name)?.clone();
        if client.history_webapp_url.trim().is_empty() {
            client.history_webapp_url = self.sheets.history_webapp_url.clone();
        }
        Some(client)
    }

    /// Endpoint used to write the client registry back to its sheet.
    pub fn clients_endpoint(&self) -> &str {
        if self.sheets.clients_webapp_url.trim().is_empty() {
            self.sheets.history_webapp_url.trim()
        } else {
            self.sheets.clients_webapp_url.trim()
        }
    }

    pub fn upsert_clients(&mut self, clients: Vec<ClientConfig>) {
        self.clients = crate::clients::merge_clients(&self.clients, &clients);
    }

    fn normalize_paths(&mut self) -> bool {
        let mut changed = false;

        if self.data.dir.as_os_str().is_empty() {
            self.data.dir = default_data_dir();
            changed = true;
        }

        if self.data.dir.is_relative() {
            self.data.dir = default_data_dir().join(&self.data.dir);
            changed = true;
        }

        changed
    }

    fn normalize_clients(&mut self) -> bool {
        let mut changed = false;
        for client in &mut self.clients {
            let trimmed: Vec<String> = client
                .conversion_labels
                .iter()
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect();
            if trimmed != client.conversion_labels {
                client.conversion_labels = trimmed;
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path);

        assert!(path.exists());
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.sync.actor, "System");
        assert!(config.data.dir.is_absolute());
    }

    #[test]
    fn load_falls_back_to_defaults_on_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sync\ninterval_secs = ").expect("write");

        let config = Config::load_from(&path);
        assert_eq!(config.sync.debounce_ms, 100);
    }

    #[test]
    fn client_lookup_by_id_or_name_and_sink_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[sheets]
history_webapp_url = "https://example.test/exec"

[[clients]]
id = "client_1"
name = "Clinica Sol"
sheet_id = "abc"
conversion_labels = [" FECHADO ", ""]
"#,
        )
        .expect("write");

        let config = Config::load_from(&path);
        assert_eq!(config.client("clinica sol").map(|c| c.id.as_str()), Some("client_1"));
        assert_eq!(config.clients[0].conversion_labels, vec!["FECHADO".to_string()]);

        let resolved = config.resolved_client("client_1").expect("client");
        assert!(resolved.has_history_sink());
        assert!(!resolved.has_history_sheet());
    }

    #[test]
    fn registry_endpoint_falls_back_to_history_endpoint() {
        let mut config = Config::default();
        assert_eq!(config.clients_endpoint(), "");

        config.sheets.history_webapp_url = "https://example.test/history".to_string();
        assert_eq!(config.clients_endpoint(), "https://example.test/history");

        config.sheets.clients_webapp_url = " https://example.test/clients ".to_string();
        assert_eq!(config.clients_endpoint(), "https://example.test/clients");
    }
}
