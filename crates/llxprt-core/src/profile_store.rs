// ProfileStore (spec §6): load/save the on-disk JSON profile format at
// `<home>/.llxprt/profiles/<name>.json`. Grounded on the teacher's
// filesystem-config conventions (the `dirs`-based home resolution used
// throughout `everruns-core` for local dev config) with the error
// messages matching spec §6 bit-for-bit since callers surface them
// directly to a user.

use std::path::PathBuf;

use llxprt_contracts::{Profile, ProfileError, PROFILE_VERSION};
use tokio::io::AsyncWriteExt;

const PROFILES_DIR: &str = ".llxprt/profiles";

pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    /// Resolve against the user's home directory via `dirs::home_dir`.
    pub fn from_home() -> Result<Self, ProfileError> {
        let home = dirs::home_dir().ok_or_else(|| ProfileError::Corrupted("<unknown>".into()))?;
        Ok(Self {
            root: home.join(PROFILES_DIR),
        })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    pub async fn load(&self, name: &str) -> Result<Profile, ProfileError> {
        let path = self.path_for(name);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| ProfileError::NotFound(name.to_string()))?;

        let profile: Profile = serde_json::from_str(&raw)
            .map_err(|_| ProfileError::Corrupted(name.to_string()))?;

        if profile.version != PROFILE_VERSION {
            return Err(ProfileError::UnsupportedVersion);
        }
        if profile.provider.trim().is_empty() || profile.model.trim().is_empty() {
            if !profile.is_loadbalancer() {
                return Err(ProfileError::MissingFields(name.to_string()));
            }
        }
        if profile.is_loadbalancer() && profile.profiles.as_ref().map_or(true, |p| p.is_empty()) {
            return Err(ProfileError::MissingFields(name.to_string()));
        }

        Ok(profile)
    }

    pub async fn save(&self, name: &str, profile: &Profile) -> Result<(), ProfileError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|_| ProfileError::Corrupted(name.to_string()))?;

        let serialized = serde_json::to_string_pretty(profile)
            .map_err(|_| ProfileError::Corrupted(name.to_string()))?;

        let path = self.path_for(name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|_| ProfileError::Corrupted(name.to_string()))?;
        file.write_all(serialized.as_bytes())
            .await
            .map_err(|_| ProfileError::Corrupted(name.to_string()))?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), ProfileError> {
        let path = self.path_for(name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| ProfileError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<String> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return Vec::new();
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names
    }
}
