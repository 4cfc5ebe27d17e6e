//! Durable rotation state.
//!
//! Records which backend is currently active and when the last switch
//! happened, so a restarted process can detect a stale selection and
//! fall back to the default backend. Losing this state only affects
//! staleness detection, so every failure path degrades silently: saves
//! report `false`, loads report `None`, and nothing here ever
//! interrupts rotation or the repair loop.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default state filename under the project state directory.
pub const ROTATION_STATE_FILENAME: &str = "rotation_state.json";

/// Persisted record of the active backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    /// Name of the backend active at the last switch.
    pub current_backend: String,
    /// Unix timestamp (seconds) of the last switch.
    pub last_switch_timestamp: f64,
}

/// File-backed store for [`RotationState`].
///
/// Writes are atomic (temp file + rename) with owner-only permissions;
/// an in-process mutex excludes concurrent readers and writers. Two
/// independent processes sharing a state file can still race on who
/// switches, but neither will ever observe a partially-written file.
#[derive(Debug)]
pub struct RotationStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RotationStateStore {
    /// Create a store backed by the given file path.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the active backend and switch time.
    ///
    /// Returns `false` on any I/O, permission, or serialization
    /// failure instead of raising; the caller treats a lost write as a
    /// degraded staleness check, nothing more.
    pub fn save(&self, backend_name: &str, timestamp: f64) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let state = RotationState {
            current_backend: backend_name.to_string(),
            last_switch_timestamp: timestamp,
        };

        match self.write_atomic(&state) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to persist rotation state: {e}");
                false
            }
        }
    }

    /// Load the persisted state.
    ///
    /// Returns `None` when the file is absent, unreadable, not valid
    /// JSON, not an object, or missing a required key. Never raises.
    #[must_use]
    pub fn load(&self) -> Option<RotationState> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to read rotation state file: {e}");
                return None;
            }
        };

        match serde_json::from_str::<RotationState>(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("rotation state file is corrupted, ignoring: {e}");
                None
            }
        }
    }

    /// Delete the persisted state, if any. Returns `false` on failure.
    pub fn clear(&self) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if !self.path.exists() {
            return true;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to clear rotation state: {e}");
                false
            }
        }
    }

    fn write_atomic(&self, state: &RotationState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&temp_path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(temp: &TempDir) -> RotationStateStore {
        RotationStateStore::new(temp.path().join(".mend").join(ROTATION_STATE_FILENAME))
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        assert!(store.save("claude", 1_700_000_000.0));
        let state = store.load().expect("state");
        assert_eq!(state.current_backend, "claude");
        assert!((state.last_switch_timestamp - 1_700_000_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        assert!(!temp.path().join(".mend").exists());
        assert!(store.save("gemini", 1.0));
        assert!(temp.path().join(".mend").exists());
    }

    #[test]
    fn test_load_missing_file_returns_none() {
        let temp = TempDir::new().unwrap();
        assert!(store_in(&temp).load().is_none());
    }

    #[test]
    fn test_load_invalid_json_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "not json at all {{{").unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn test_load_non_object_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "[1, 2, 3]").unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn test_load_missing_required_key_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), r#"{"current_backend": "claude"}"#).unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn test_save_overwrites_previous_state() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        assert!(store.save("claude", 1.0));
        assert!(store.save("gemini", 2.0));

        let state = store.load().expect("state");
        assert_eq!(state.current_backend, "gemini");
    }

    #[test]
    fn test_save_leaves_no_temp_file_behind() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        assert!(store.save("claude", 1.0));

        let entries: Vec<_> = std::fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![ROTATION_STATE_FILENAME.to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        assert!(store.save("claude", 1.0));

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_clear_removes_state() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        assert!(store.clear(), "clearing absent state succeeds");
        assert!(store.save("claude", 1.0));
        assert!(store.clear());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_save_to_unwritable_path_returns_false() {
        let store = RotationStateStore::new("/proc/definitely/not/writable/state.json");
        assert!(!store.save("claude", 1.0));
    }
}
