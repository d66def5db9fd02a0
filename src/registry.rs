//! Registry of sandbox projects, persisted as a flat JSON map keyed by project name.

use crate::error::{Result, SandfixError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Accept RFC 3339 timestamps as well as offset-less ones, which are taken as UTC.
fn deserialize_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Project names become directory names under the sandbox. Returns the trimmed name.
pub fn validate_project_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SandfixError::Validation(
            "Project name cannot be empty".to_string(),
        ));
    }
    if trimmed == "." || trimmed == ".." || trimmed.contains(['/', '\\']) {
        return Err(SandfixError::Validation(format!(
            "Project name '{}' must be a single directory name",
            name
        )));
    }
    Ok(trimmed.to_string())
}

pub struct ProjectRegistry {
    path: PathBuf,
}

impl ProjectRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<BTreeMap<String, ProjectEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, projects: &BTreeMap<String, ProjectEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(projects)?)?;
        Ok(())
    }

    pub fn register(
        &self,
        name: &str,
        repo_url: &str,
        commands: Vec<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<ProjectEntry> {
        let name = validate_project_name(name)?;

        let commands: Vec<String> = commands
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if commands.is_empty() {
            return Err(SandfixError::Validation(
                "At least one start command is required".to_string(),
            ));
        }

        let mut projects = self.load()?;
        if projects.contains_key(&name) {
            return Err(SandfixError::Validation(format!(
                "Project '{}' already exists in the registry",
                name
            )));
        }

        let entry = ProjectEntry {
            name: name.clone(),
            repo_url: repo_url.to_string(),
            commands,
            created_at: Utc::now(),
            metadata: metadata.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        };
        projects.insert(name.clone(), entry.clone());
        self.save(&projects)?;

        info!(project = %name, "Registered project");
        Ok(entry)
    }

    pub fn get(&self, name: &str) -> Result<ProjectEntry> {
        self.load()?.remove(name).ok_or_else(|| {
            SandfixError::NotFound(format!(
                "No project named '{}' is registered. Use `sandfix create-project`.",
                name
            ))
        })
    }

    pub fn list(&self) -> Result<Vec<ProjectEntry>> {
        Ok(self.load()?.into_values().collect())
    }
}
