use crate::error::{Result, SandfixError};
use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const VAULT_FILE: &str = "config.enc";
const REGISTRY_FILE: &str = "projects.json";

/// Application settings. Secrets never live here, they go in the vault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the vault and the project registry
    #[serde(default)]
    pub home: Option<PathBuf>,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub service: ServiceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_max_output_tokens() -> u32 {
    1200
}

fn default_timeout() -> u64 {
    120
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.runner.max_attempts == 0 {
            return Err(SandfixError::Configuration(
                "runner.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.service.model.trim().is_empty() {
            return Err(SandfixError::Configuration(
                "service.model must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn home_dir(&self) -> Result<PathBuf> {
        if let Some(home) = &self.home {
            return Ok(expand_home(&home.to_string_lossy()));
        }

        let project_dirs = ProjectDirs::from("com", "sandfix", "sandfix").ok_or_else(|| {
            SandfixError::Configuration("Could not determine data directory".to_string())
        })?;
        Ok(project_dirs.data_dir().to_path_buf())
    }

    pub fn vault_path(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join(VAULT_FILE))
    }

    pub fn registry_path(&self) -> Result<PathBuf> {
        Ok(self.home_dir()?.join(REGISTRY_FILE))
    }
}

pub struct SettingsManager {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsManager {
    pub fn new() -> Result<Self> {
        let settings_path = Self::get_settings_path_internal()?;
        let settings = Self::load_from(&settings_path)?;

        Ok(Self {
            settings,
            settings_path,
        })
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Write the default settings as a template. Returns false if a file already exists.
    pub fn write_template(&self) -> Result<bool> {
        if self.settings_path.exists() {
            return Ok(false);
        }

        let toml = toml::to_string_pretty(&Settings::default()).map_err(|e| {
            SandfixError::Configuration(format!("Failed to serialize settings: {}", e))
        })?;

        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.settings_path, toml)
            .map_err(|e| SandfixError::Configuration(format!("Failed to write settings: {}", e)))?;

        Ok(true)
    }

    fn get_settings_path_internal() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "sandfix", "sandfix").ok_or_else(|| {
            SandfixError::Configuration("Could not determine config directory".to_string())
        })?;

        Ok(project_dirs.config_dir().join("settings.toml"))
    }

    /// Layer the settings file (if any) and `SANDFIX_*` environment variables over defaults.
    pub fn load_from(path: &Path) -> Result<Settings> {
        let s = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix("SANDFIX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SandfixError::Configuration(format!("Failed to build settings: {}", e)))?;

        let settings: Settings = s.try_deserialize().map_err(|e| {
            SandfixError::Configuration(format!("Failed to deserialize settings: {}", e))
        })?;
        settings.validate()?;

        Ok(settings)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}
