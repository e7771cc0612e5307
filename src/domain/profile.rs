//! Named setting bundles

use super::setting::{FanRequest, SettingRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a profile name
pub const MAX_NAME_LEN: usize = 64;

/// A persisted setting bundle
///
/// A custom fan curve, if any, travels inside `settings.fan`. Profiles are
/// only ever replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub settings: SettingRequest,
}

impl Profile {
    pub fn new(name: impl Into<String>, settings: SettingRequest) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            settings,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// File stem used on disk: lower-case, spaces as underscores
    pub fn file_stem(name: &str) -> String {
        name.trim().replace(' ', "_").to_lowercase()
    }

    /// Check that a name is usable as a profile name
    pub fn validate_name(name: &str) -> Result<(), String> {
        let name = name.trim();
        if name.is_empty() {
            return Err("Profile name cannot be empty".to_string());
        }
        if name.len() > MAX_NAME_LEN {
            return Err(format!(
                "Profile name too long (max {} characters)",
                MAX_NAME_LEN
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == ' ' || c == '-' || c == '_')
        {
            return Err(
                "Profile name can only contain letters, numbers, spaces, hyphens, and underscores"
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Profiles that exist without being saved
    pub fn presets() -> Vec<Profile> {
        vec![
            Profile::new(
                "Stock",
                SettingRequest::new()
                    .with_core_offset(0)
                    .with_mem_offset(0)
                    .with_fan(FanRequest::Auto),
            )
            .with_description("Zero offsets, automatic fan control"),
            Profile::new(
                "Quiet",
                SettingRequest::new()
                    .with_core_offset(100)
                    .with_mem_offset(0)
                    .with_fan(FanRequest::Auto),
            )
            .with_description("Small core offset, automatic fan control"),
            Profile::new(
                "Performance",
                SettingRequest::new()
                    .with_core_offset(200)
                    .with_mem_offset(500)
                    .with_fan(FanRequest::Auto),
            )
            .with_description("+200 MHz core, +500 MHz memory"),
        ]
    }

    /// Look up a built-in preset by name (case-insensitive)
    pub fn preset(name: &str) -> Option<Profile> {
        Self::presets()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
    }
}
