use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transfer::HttpTransferConfig;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 64451;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub selection: SelectionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSettings {
    pub endpoint_path: String,
    pub form_field: String,
    pub content_type: String,
    pub timeout_secs: u64,
    /// Unset means every admitted upload starts at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_uploads: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSettings {
    #[serde(default)]
    pub video_only: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            endpoint_path: "/api/upload/video".to_string(),
            form_field: "file".to_string(),
            content_type: "video/mp4".to_string(),
            timeout_secs: 300,
            max_concurrent_uploads: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            server: ServerSettings::default(),
            upload: UploadSettings::default(),
            selection: SelectionSettings::default(),
        }
    }
}

impl Settings {
    pub fn upload_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.server.scheme, self.server.host, self.server.port, self.upload.endpoint_path
        )
    }

    pub fn http_transfer_config(&self) -> HttpTransferConfig {
        HttpTransferConfig {
            upload_url: self.upload_url(),
            form_field: self.upload.form_field.clone(),
            content_type: self.upload.content_type.clone(),
            timeout: Duration::from_secs(self.upload.timeout_secs),
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;
    let settings = parse_settings(&text)?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> Result<Settings> {
    toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let invalid = |message: String| Err(Error::InvalidConfig { message });

    if settings.version != SETTINGS_SCHEMA_VERSION {
        return invalid(format!(
            "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
            settings.version
        ));
    }
    if !matches!(settings.server.scheme.as_str(), "http" | "https") {
        return invalid("server.scheme must be \"http\" or \"https\"".to_string());
    }
    if settings.server.host.trim().is_empty() {
        return invalid("server.host must not be empty".to_string());
    }
    if settings.server.port == 0 {
        return invalid("server.port must be > 0".to_string());
    }
    if !settings.upload.endpoint_path.starts_with('/') {
        return invalid("upload.endpoint_path must start with '/'".to_string());
    }
    if settings.upload.form_field.trim().is_empty() {
        return invalid("upload.form_field must not be empty".to_string());
    }
    if settings.upload.content_type.trim().is_empty() {
        return invalid("upload.content_type must not be empty".to_string());
    }
    if settings.upload.timeout_secs == 0 {
        return invalid("upload.timeout_secs must be > 0".to_string());
    }
    if settings.upload.max_concurrent_uploads == Some(0) {
        return invalid("upload.max_concurrent_uploads must be >= 1 when set".to_string());
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
