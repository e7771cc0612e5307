//! Profile store
//!
//! One TOML file per profile plus a `default_profile` pointer file, all in
//! one directory. Every write goes to a temporary file in the same
//! directory that is then renamed over the target, so a crash mid-save
//! leaves either the old file or the new one.
//!
//! Profiles can be exported to and imported from files outside the store.
//! An export wraps the profile with a format version; import accepts that
//! or a bare profile file.

use crate::domain::Profile;
use crate::error::ProfileError;
use crate::services::validator;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const PROFILE_EXTENSION: &str = "toml";
const DEFAULT_POINTER: &str = "default_profile";
const EXPORT_FORMAT_VERSION: u32 = 1;

/// File written by [`ProfileStore::export`]
#[derive(Debug, Serialize)]
struct ExportedProfile {
    format_version: u32,
    exported_at: DateTime<Utc>,
    profile: Profile,
}

/// Replace `path` with `contents` in one rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Directory-backed profile storage
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Open (and create if needed) a profile directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ProfileError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// `~/.config/nvoc/profiles` for the current user
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nvoc").join("profiles"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Profile::file_stem(name), PROFILE_EXTENSION))
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.join(DEFAULT_POINTER)
    }

    fn check(profile: &Profile) -> Result<(), ProfileError> {
        Profile::validate_name(&profile.name).map_err(ProfileError::InvalidName)?;
        validator::check_request_shape(&profile.settings).map_err(|source| {
            ProfileError::Invalid {
                name: profile.name.clone(),
                source,
            }
        })
    }

    /// Validate and store a profile, replacing any profile of the same name
    ///
    /// The creation time of a replaced profile is kept. Returns the profile
    /// as stored.
    pub fn save(&self, profile: &Profile) -> Result<Profile, ProfileError> {
        Self::check(profile)?;

        let mut stored = profile.clone();
        stored.name = profile.name.trim().to_string();
        stored.updated_at = Utc::now();
        if let Ok(existing) = self.read(&stored.name) {
            // Names differing only in spaces vs underscores share a file
            if existing.name.trim().to_lowercase() != stored.name.to_lowercase() {
                return Err(ProfileError::NameConflict {
                    name: stored.name,
                    existing: existing.name,
                });
            }
            stored.created_at = existing.created_at;
        }

        let text = toml::to_string_pretty(&stored)?;
        write_atomic(&self.path_for(&stored.name), text.as_bytes())?;
        log::info!("Saved profile '{}'", stored.name);
        Ok(stored)
    }

    fn read(&self, name: &str) -> Result<Profile, ProfileError> {
        let path = self.path_for(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text).map_err(|e| ProfileError::Parse {
            name: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Load a stored profile, falling back to the built-in presets
    ///
    /// A stored profile that no longer passes validation (for example a
    /// hand-edited curve) is reported as invalid rather than returned.
    pub fn load(&self, name: &str) -> Result<Profile, ProfileError> {
        Profile::validate_name(name).map_err(ProfileError::InvalidName)?;
        let profile = match self.read(name) {
            Err(ProfileError::NotFound(_)) => {
                return Profile::preset(name).ok_or_else(|| ProfileError::NotFound(name.to_string()))
            }
            other => other?,
        };
        Self::check(&profile)?;
        Ok(profile)
    }

    /// Delete a stored profile; clears the default pointer if it named it
    pub fn delete(&self, name: &str) -> Result<(), ProfileError> {
        Profile::validate_name(name).map_err(ProfileError::InvalidName)?;
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        log::info!("Deleted profile '{}'", name);

        if let Some(default) = self.default_name()? {
            if Profile::file_stem(&default) == Profile::file_stem(name) {
                self.clear_default()?;
            }
        }
        Ok(())
    }

    /// Write a profile (stored or preset) to `path`
    pub fn export(&self, name: &str, path: &Path) -> Result<Profile, ProfileError> {
        let exported = ExportedProfile {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            profile: self.load(name)?,
        };
        let text = toml::to_string_pretty(&exported)?;
        write_atomic(path, text.as_bytes())?;
        log::info!("Exported profile '{}' to {}", exported.profile.name, path.display());
        Ok(exported.profile)
    }

    /// Validate and store a profile read from `path`
    ///
    /// A stored profile of the same name is only replaced with `overwrite`.
    pub fn import(&self, path: &Path, overwrite: bool) -> Result<Profile, ProfileError> {
        let parse_error = |e: toml::de::Error| ProfileError::Parse {
            name: path.display().to_string(),
            message: e.to_string(),
        };

        let text = fs::read_to_string(path)?;
        let mut table: toml::Table = toml::from_str(&text).map_err(parse_error)?;
        let value = table.remove("profile").unwrap_or(toml::Value::Table(table));
        let profile: Profile = value.try_into().map_err(parse_error)?;

        Self::check(&profile)?;
        if !overwrite && self.path_for(&profile.name).exists() {
            return Err(ProfileError::AlreadyExists(profile.name.trim().to_string()));
        }
        let stored = self.save(&profile)?;
        log::info!("Imported profile '{}' from {}", stored.name, path.display());
        Ok(stored)
    }

    /// Names of every stored profile, sorted
    ///
    /// Files that do not parse are skipped with a warning.
    pub fn list_names(&self) -> Result<Vec<String>, ProfileError> {
        Ok(self.list()?.into_iter().map(|p| p.name).collect())
    }

    /// Every stored profile, sorted by name
    pub fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        let mut profiles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PROFILE_EXTENSION) {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| toml::from_str::<Profile>(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(profile) => profiles.push(profile),
                Err(e) => log::warn!("Skipping unreadable profile {}: {}", path.display(), e),
            }
        }
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(profiles)
    }

    /// Mark a profile (stored or preset) as the boot-time default
    pub fn set_default(&self, name: &str) -> Result<(), ProfileError> {
        let profile = self.load(name)?;
        write_atomic(&self.pointer_path(), format!("{}\n", profile.name).as_bytes())?;
        log::info!("Default profile set to '{}'", profile.name);
        Ok(())
    }

    pub fn clear_default(&self) -> Result<(), ProfileError> {
        match fs::remove_file(self.pointer_path()) {
            Ok(()) => {
                log::info!("Default profile cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Name the default pointer holds, if any
    pub fn default_name(&self) -> Result<Option<String>, ProfileError> {
        match fs::read_to_string(self.pointer_path()) {
            Ok(text) => {
                let name = text.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The default profile, loaded
    pub fn default_profile(&self) -> Result<Option<Profile>, ProfileError> {
        match self.default_name()? {
            Some(name) => self.load(&name).map(Some),
            None => Ok(None),
        }
    }
}
