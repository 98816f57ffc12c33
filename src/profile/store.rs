//! Profile persistence
//!
//! The engine only needs read access ([`ProfileStore`]). The bundled stores
//! also support edits and enforce that no two profiles share a hotkey.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::{DisplayProfile, ProfileId};
use crate::hotkey::KeyCombination;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("profile store I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("profile file {path:?} is invalid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("profiles could not be serialized for {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("hotkey {combination} is bound to both profile {first} and profile {second}")]
    DuplicateHotKey {
        combination: KeyCombination,
        first: ProfileId,
        second: ProfileId,
    },
    #[error("profile {0} appears more than once")]
    DuplicateId(ProfileId),
    #[error("profile store unavailable: {0}")]
    Unavailable(String),
}

pub trait ProfileStore: Send + Sync {
    fn find_by_hotkey(
        &self,
        combination: &KeyCombination,
    ) -> Result<Option<DisplayProfile>, StoreError>;

    fn find_by_id(&self, id: ProfileId) -> Result<Option<DisplayProfile>, StoreError>;

    fn list_all(&self) -> Result<Vec<DisplayProfile>, StoreError>;
}

/// Check the store invariants: unique ids, at most one profile per hotkey.
pub fn validate(profiles: &[DisplayProfile]) -> Result<(), StoreError> {
    for (i, profile) in profiles.iter().enumerate() {
        for earlier in &profiles[..i] {
            if earlier.id == profile.id {
                return Err(StoreError::DuplicateId(profile.id));
            }
            if let (Some(a), Some(b)) = (&earlier.hotkey, &profile.hotkey) {
                if a == b {
                    return Err(StoreError::DuplicateHotKey {
                        combination: *a,
                        first: earlier.id,
                        second: profile.id,
                    });
                }
            }
        }
    }
    Ok(())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Insert or replace `profile` in `profiles`, keeping the invariants.
fn upsert_into(
    profiles: &mut Vec<DisplayProfile>,
    profile: DisplayProfile,
) -> Result<(), StoreError> {
    let mut next = profiles.clone();
    match next.iter_mut().find(|p| p.id == profile.id) {
        Some(existing) => *existing = profile,
        None => next.push(profile),
    }
    validate(&next)?;
    *profiles = next;
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<Vec<DisplayProfile>>,
    unavailable: RwLock<Option<String>>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<DisplayProfile>) -> Result<Self, StoreError> {
        validate(&profiles)?;
        Ok(Self {
            profiles: RwLock::new(profiles),
            unavailable: RwLock::new(None),
        })
    }

    pub fn upsert(&self, profile: DisplayProfile) -> Result<(), StoreError> {
        upsert_into(&mut write_lock(&self.profiles), profile)
    }

    pub fn remove(&self, id: ProfileId) -> bool {
        let mut profiles = write_lock(&self.profiles);
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        profiles.len() != before
    }

    /// Make every read fail with `reason` (or succeed again with `None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *write_lock(&self.unavailable) = reason.map(str::to_string);
    }

    fn check(&self) -> Result<(), StoreError> {
        match read_lock(&self.unavailable).as_ref() {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl ProfileStore for MemoryProfileStore {
    fn find_by_hotkey(
        &self,
        combination: &KeyCombination,
    ) -> Result<Option<DisplayProfile>, StoreError> {
        self.check()?;
        Ok(read_lock(&self.profiles)
            .iter()
            .find(|p| p.hotkey.as_ref() == Some(combination))
            .cloned())
    }

    fn find_by_id(&self, id: ProfileId) -> Result<Option<DisplayProfile>, StoreError> {
        self.check()?;
        Ok(read_lock(&self.profiles).iter().find(|p| p.id == id).cloned())
    }

    fn list_all(&self) -> Result<Vec<DisplayProfile>, StoreError> {
        self.check()?;
        Ok(read_lock(&self.profiles).clone())
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Profiles kept in a JSON array on disk.
pub struct JsonProfileStore {
    path: PathBuf,
    profiles: RwLock<Vec<DisplayProfile>>,
}

impl JsonProfileStore {
    /// Open `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let profiles = load_profiles(&path)?;
        log::info!("Loaded {} profile(s) from {:?}", profiles.len(), path);
        Ok(Self {
            path,
            profiles: RwLock::new(profiles),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing the in-memory copy only if it is valid.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let profiles = load_profiles(&self.path)?;
        let count = profiles.len();
        *write_lock(&self.profiles) = profiles;
        Ok(count)
    }

    pub fn upsert(&self, profile: DisplayProfile) -> Result<(), StoreError> {
        let mut profiles = write_lock(&self.profiles);
        let mut next = profiles.clone();
        upsert_into(&mut next, profile)?;
        save_profiles(&self.path, &next)?;
        *profiles = next;
        Ok(())
    }

    pub fn remove(&self, id: ProfileId) -> Result<bool, StoreError> {
        let mut profiles = write_lock(&self.profiles);
        let next: Vec<DisplayProfile> = profiles.iter().filter(|p| p.id != id).cloned().collect();
        if next.len() == profiles.len() {
            return Ok(false);
        }
        save_profiles(&self.path, &next)?;
        *profiles = next;
        Ok(true)
    }
}

impl ProfileStore for JsonProfileStore {
    fn find_by_hotkey(
        &self,
        combination: &KeyCombination,
    ) -> Result<Option<DisplayProfile>, StoreError> {
        Ok(read_lock(&self.profiles)
            .iter()
            .find(|p| p.hotkey.as_ref() == Some(combination))
            .cloned())
    }

    fn find_by_id(&self, id: ProfileId) -> Result<Option<DisplayProfile>, StoreError> {
        Ok(read_lock(&self.profiles).iter().find(|p| p.id == id).cloned())
    }

    fn list_all(&self) -> Result<Vec<DisplayProfile>, StoreError> {
        Ok(read_lock(&self.profiles).clone())
    }
}

fn load_profiles(path: &Path) -> Result<Vec<DisplayProfile>, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No profile file at {:?}, starting empty", path);
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let profiles: Vec<DisplayProfile> =
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    validate(&profiles)?;
    Ok(profiles)
}

fn save_profiles(path: &Path, profiles: &[DisplayProfile]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let contents =
        serde_json::to_string_pretty(profiles).map_err(|source| StoreError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;

    // Write to a sibling temp file and rename so a crash never leaves a torn file.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(io_err)?;

    // On Windows, rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DisplaySettings;

    fn hotkey(key: u8) -> KeyCombination {
        KeyCombination::new(key as u16).ctrl().alt()
    }

    #[test]
    fn duplicate_hotkeys_are_rejected() {
        let result = MemoryProfileStore::new(vec![
            DisplayProfile::new(1, "a").with_hotkey(hotkey(b'1')),
            DisplayProfile::new(2, "b").with_hotkey(hotkey(b'1')),
        ]);
        assert!(matches!(result, Err(StoreError::DuplicateHotKey { .. })));
    }

    #[test]
    fn upsert_that_steals_a_hotkey_fails_and_keeps_state() {
        let store = MemoryProfileStore::new(vec![
            DisplayProfile::new(1, "a").with_hotkey(hotkey(b'1')),
            DisplayProfile::new(2, "b"),
        ])
        .unwrap();
        let err = store
            .upsert(DisplayProfile::new(2, "b").with_hotkey(hotkey(b'1')))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateHotKey { .. }));
        assert_eq!(store.find_by_id(ProfileId(2)).unwrap().unwrap().hotkey, None);
    }

    #[test]
    fn find_by_hotkey_matches_structurally() {
        let store = MemoryProfileStore::new(vec![
            DisplayProfile::new(1, "a").with_hotkey(hotkey(b'1')),
        ])
        .unwrap();
        assert_eq!(
            store.find_by_hotkey(&hotkey(b'1')).unwrap().map(|p| p.id),
            Some(ProfileId(1))
        );
        assert!(store.find_by_hotkey(&hotkey(b'1').shift()).unwrap().is_none());
    }

    #[test]
    fn unavailable_store_fails_reads() {
        let store = MemoryProfileStore::new(Vec::new()).unwrap();
        store.set_unavailable(Some("disk offline"));
        assert!(matches!(store.list_all(), Err(StoreError::Unavailable(_))));
        store.set_unavailable(None);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::open(dir.path().join("profiles.json")).unwrap();
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn json_store_persists_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("profiles.json");
        let store = JsonProfileStore::open(&path).unwrap();
        store
            .upsert(
                DisplayProfile::new(1, "Desk")
                    .with_hotkey(hotkey(b'1'))
                    .with_display(DisplaySettings::new("D1").primary(true)),
            )
            .unwrap();
        store.upsert(DisplayProfile::new(2, "Couch")).unwrap();
        assert!(store.remove(ProfileId(2)).unwrap());
        assert!(!store.remove(ProfileId(2)).unwrap());

        let reopened = JsonProfileStore::open(&path).unwrap();
        let profiles = reopened.list_all().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "Desk");
        assert_eq!(profiles[0].hotkey, Some(hotkey(b'1')));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn json_store_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonProfileStore::open(&path),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn json_store_reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let store = JsonProfileStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());

        let edited = vec![
            DisplayProfile::new(1, "Desk").with_hotkey(hotkey(b'1')),
            DisplayProfile::new(2, "Couch"),
        ];
        std::fs::write(&path, serde_json::to_string(&edited).unwrap()).unwrap();
        assert_eq!(store.reload().unwrap(), 2);
        assert_eq!(
            store.find_by_hotkey(&hotkey(b'1')).unwrap().map(|p| p.id),
            Some(ProfileId(1))
        );

        // A broken edit is rejected and the last good copy stays in place.
        std::fs::write(&path, "[").unwrap();
        assert!(matches!(store.reload(), Err(StoreError::Parse { .. })));
        assert_eq!(store.list_all().unwrap(), edited);
    }

    #[test]
    fn serialize_failure_is_not_reported_as_invalid_file() {
        let source = serde_json::from_str::<u8>("x").unwrap_err();
        let err = StoreError::Serialize {
            path: PathBuf::from("profiles.json"),
            source,
        };
        let message = err.to_string();
        assert!(message.contains("could not be serialized"));
        assert!(!message.contains("invalid"));
    }
}
