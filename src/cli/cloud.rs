//! Cloud output configuration and credentials.
//!
//! The effective configuration is layered, later sources winning: built-in
//! defaults, then a JSON config file, then the script's `ext.cloud` override
//! map (of which only `projectID`, `name` and `token` are consumed), then
//! `STAMPEDE_CLOUD_*` environment variables, then the CLI token argument.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::config::Options;
use crate::exec::ExecError;

const CONFIG_DIR: &str = ".stampede";
const AUTH_FILE: &str = "cloud.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub token: Option<String>,
    #[serde(rename = "projectID")]
    pub project_id: Option<i64>,
    pub name: Option<String>,
    pub host: Option<String>,
    #[serde(rename = "webAppURL")]
    pub web_app_url: Option<String>,
    pub push_ref_id: Option<String>,
    pub metric_push_interval: Option<String>,
    pub metric_push_concurrency: Option<i64>,
    pub max_metric_samples_per_package: Option<i64>,
    pub timeout: Option<String>,
    pub stop_on_error: Option<bool>,
    pub no_compress: Option<bool>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            token: None,
            project_id: None,
            name: None,
            host: Some("https://ingest.stampede.dev".to_string()),
            web_app_url: Some("https://app.stampede.dev".to_string()),
            push_ref_id: None,
            metric_push_interval: Some("1s".to_string()),
            metric_push_concurrency: Some(1),
            max_metric_samples_per_package: Some(100_000),
            timeout: Some("1m".to_string()),
            stop_on_error: None,
            no_compress: None,
        }
    }
}

fn non_empty(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(|v| !v.is_empty())
}

impl CloudConfig {
    /// Saves the non-empty values of `other` over the receiver.
    pub fn apply(mut self, other: CloudConfig) -> CloudConfig {
        if non_empty(&other.token) {
            self.token = other.token;
        }
        if other.project_id.is_some_and(|id| id > 0) {
            self.project_id = other.project_id;
        }
        if non_empty(&other.name) {
            self.name = other.name;
        }
        if non_empty(&other.host) {
            self.host = other.host;
        }
        if non_empty(&other.web_app_url) {
            self.web_app_url = other.web_app_url;
        }
        if non_empty(&other.push_ref_id) {
            self.push_ref_id = other.push_ref_id;
        }
        if other.metric_push_interval.is_some() {
            self.metric_push_interval = other.metric_push_interval;
        }
        if other.metric_push_concurrency.is_some() {
            self.metric_push_concurrency = other.metric_push_concurrency;
        }
        if other.max_metric_samples_per_package.is_some() {
            self.max_metric_samples_per_package = other.max_metric_samples_per_package;
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.stop_on_error.is_some() {
            self.stop_on_error = other.stop_on_error;
        }
        if other.no_compress.is_some() {
            self.no_compress = other.no_compress;
        }
        self
    }

    /// Merges the script's `ext.cloud` override map. Only `projectID`,
    /// `name` and `token` are consumed at this stage; every other key is for
    /// the cloud service itself and ignored here.
    pub fn apply_ext(mut self, ext: &serde_json::Value) -> Self {
        if let Some(id) = ext.get("projectID").and_then(|v| v.as_i64()) {
            if id > 0 {
                self.project_id = Some(id);
            }
        }
        if let Some(name) = ext.get("name").and_then(|v| v.as_str()) {
            if !name.is_empty() {
                self.name = Some(name.to_string());
            }
        }
        if let Some(token) = ext.get("token").and_then(|v| v.as_str()) {
            if !token.is_empty() {
                self.token = Some(token.to_string());
            }
        }
        self
    }

    /// Merges `STAMPEDE_CLOUD_*` variables from the given environment.
    pub fn apply_env_from(mut self, vars: impl Iterator<Item = (String, String)>) -> Self {
        for (key, value) in vars {
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "STAMPEDE_CLOUD_TOKEN" => self.token = Some(value),
                "STAMPEDE_CLOUD_PROJECT_ID" => {
                    if let Ok(id) = value.parse() {
                        self.project_id = Some(id);
                    }
                }
                "STAMPEDE_CLOUD_NAME" => self.name = Some(value),
                "STAMPEDE_CLOUD_HOST" => self.host = Some(value),
                "STAMPEDE_CLOUD_PUSH_REF_ID" => self.push_ref_id = Some(value),
                _ => {}
            }
        }
        self
    }

    /// The full precedence chain for one run.
    pub fn consolidate(
        options: &Options,
        config_file: Option<&Path>,
        cli_token: Option<&str>,
    ) -> Result<Self, ExecError> {
        let mut config = CloudConfig::default();

        if let Some(path) = config_file {
            let raw = fs::read_to_string(path).map_err(|err| {
                ExecError::Config(format!("could not read {}: {err}", path.display()))
            })?;
            let from_file: CloudConfig = serde_json::from_str(&raw).map_err(|err| {
                ExecError::Config(format!("invalid cloud config {}: {err}", path.display()))
            })?;
            config = config.apply(from_file);
        }

        if let Some(ext) = options.ext.as_ref().and_then(|ext| ext.get("cloud")) {
            config = config.apply_ext(ext);
        }

        config = config.apply_env_from(std::env::vars());

        if let Some(token) = cli_token {
            if !token.is_empty() {
                config.token = Some(token.to_string());
            }
        }
        Ok(config)
    }
}

/// Saved login credentials.
#[derive(Debug, Serialize, Deserialize)]
pub struct CloudAuth {
    pub token: String,
    pub api_url: Option<String>,
}

fn auth_file_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(CONFIG_DIR).join(AUTH_FILE)
}

/// Persists the API token under the user's home directory.
pub fn save_token(token: &str, api_url: Option<&str>) -> Result<(), std::io::Error> {
    let auth = CloudAuth {
        token: token.to_string(),
        api_url: api_url.map(|s| s.to_string()),
    };

    let config_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR);
    fs::create_dir_all(&config_dir)?;

    let json = serde_json::to_string_pretty(&auth).map_err(std::io::Error::other)?;
    fs::write(auth_file_path(), json)?;

    // Credentials; keep them owner-readable only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(auth_file_path(), fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn load_token() -> Option<CloudAuth> {
    let path = auth_file_path();
    if !path.exists() {
        return None;
    }
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

pub fn clear_token() -> Result<(), std::io::Error> {
    let path = auth_file_path();
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CloudConfig::default();
        assert_eq!(config.host.as_deref(), Some("https://ingest.stampede.dev"));
        assert_eq!(config.metric_push_interval.as_deref(), Some("1s"));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_apply_skips_empty_values() {
        let base = CloudConfig::default();
        let merged = base.clone().apply(CloudConfig {
            token: Some(String::new()),
            name: Some("run-42".to_string()),
            project_id: Some(0),
            host: None,
            ..CloudConfig::default()
        });
        assert!(merged.token.is_none());
        assert_eq!(merged.name.as_deref(), Some("run-42"));
        assert!(merged.project_id.is_none());
        assert_eq!(merged.host, base.host);
    }

    #[test]
    fn test_ext_override_consumes_three_keys_only() {
        let ext = serde_json::json!({
            "projectID": 123,
            "name": "nightly",
            "token": "tok-abc",
            "host": "https://evil.example",
            "timeout": "5s"
        });
        let config = CloudConfig::default().apply_ext(&ext);
        assert_eq!(config.project_id, Some(123));
        assert_eq!(config.name.as_deref(), Some("nightly"));
        assert_eq!(config.token.as_deref(), Some("tok-abc"));
        // Everything else is ignored at this stage.
        assert_eq!(config.host.as_deref(), Some("https://ingest.stampede.dev"));
        assert_eq!(config.timeout.as_deref(), Some("1m"));
    }

    #[test]
    fn test_env_wins_over_ext() {
        let ext = serde_json::json!({"token": "from-ext", "projectID": 1});
        let env = vec![
            ("STAMPEDE_CLOUD_TOKEN".to_string(), "from-env".to_string()),
            ("STAMPEDE_CLOUD_PROJECT_ID".to_string(), "7".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let config = CloudConfig::default()
            .apply_ext(&ext)
            .apply_env_from(env.into_iter());
        assert_eq!(config.token.as_deref(), Some("from-env"));
        assert_eq!(config.project_id, Some(7));
    }

    #[test]
    fn test_config_file_parsing() {
        let raw = r#"{"token": "tok", "projectID": 99, "metricPushInterval": "5s"}"#;
        let parsed: CloudConfig = serde_json::from_str(raw).unwrap();
        let config = CloudConfig::default().apply(parsed);
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.project_id, Some(99));
        assert_eq!(config.metric_push_interval.as_deref(), Some("5s"));
    }
}
