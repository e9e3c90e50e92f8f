// Location resolver for the store document and per-run artifacts
//
// Resolution order for the store document:
// 1) Explicit path (CLI flag or StoreConfig)
// 2) Environment variable override (DETECTION_SUMMARY_STATE_PATH)
// 3) ~/.detection-summary/store.json
// 4) ./.detection-summary/store.json when no home directory is known

use std::env;
use std::path::{Path, PathBuf};

use crate::constants::{CAPTURED_SUBDIR, STATE_FILENAME, STATE_FOLDER, STATE_PATH_ENV};

/// Resolve the store document path.
pub fn resolve_state_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    if let Ok(v) = env::var(STATE_PATH_ENV) {
        if !v.trim().is_empty() {
            return PathBuf::from(v);
        }
    }

    match directories::BaseDirs::new() {
        Some(base) => base.home_dir().join(STATE_FOLDER).join(STATE_FILENAME),
        None => PathBuf::from(STATE_FOLDER).join(STATE_FILENAME),
    }
}

/// Sibling temp file used for atomic replace.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| STATE_FILENAME.into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Frame filename for a capture index: frame_007.jpg
pub fn frame_filename(index: usize) -> String {
    format!("frame_{:03}.jpg", index)
}

/// Per-run directory reference: <base>/<session_id>
pub fn run_ref(base: &str, session_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), session_id)
}

/// Reference handed to the capture collaborator for one frame.
pub fn frame_ref(run: &str, index: usize) -> String {
    format!("{}/{}/{}", run, CAPTURED_SUBDIR, frame_filename(index))
}
