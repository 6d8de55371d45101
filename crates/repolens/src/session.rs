//! Session persistence: the full conversation plus its project binding.
//!
//! A [`SessionState`] is a plain serde value. [`JsonSessionStore`] writes
//! it as pretty JSON through a temp file and a rename so a crash never
//! leaves a half-written session behind.

use crate::context::ContextMode;
use crate::conversation::history::Turn;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Format version written into every session file.
pub const SESSION_VERSION: u32 = 1;

/// Which repository a session is about.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RepoBinding {
    /// GitHub URL or local folder path.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// User-facing settings saved with a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub model: String,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub context_mode: ContextMode,
}

/// Everything needed to resume a conversation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub repository: Option<RepoBinding>,
    #[serde(default)]
    pub file_tree: Option<String>,
    #[serde(default)]
    pub summaries: BTreeMap<String, String>,
    /// Files covered by the last analysis, in processing order.
    #[serde(default)]
    pub analyzed_paths: Vec<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    pub settings: SessionSettings,
}

/// Loads and saves session state.
pub trait SessionStore: Send + Sync {
    fn load(&self, path: &Path) -> Result<SessionState>;
    fn save(&self, path: &Path, state: &SessionState) -> Result<()>;
}

/// Session files as pretty-printed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSessionStore;

impl SessionStore for JsonSessionStore {
    fn load(&self, path: &Path) -> Result<SessionState> {
        let json = std::fs::read_to_string(path)?;
        let state: SessionState = serde_json::from_str(&json)?;
        if state.version > SESSION_VERSION {
            return Err(Error::InvalidInput(format!(
                "session file {} has version {}, newest supported is {SESSION_VERSION}",
                path.display(),
                state.version
            )));
        }
        info!(
            "Loaded session {} ({} turn(s), {} summary(ies))",
            path.display(),
            state.turns.len(),
            state.summaries.len()
        );
        Ok(state)
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    fn save(&self, path: &Path, state: &SessionState) -> Result<()> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("not a file path: {}", path.display())))?;
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        debug!("Saved session to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState {
            version: SESSION_VERSION,
            saved_at: Utc::now(),
            repository: Some(RepoBinding {
                source: "https://github.com/octo/demo".into(),
                branch: Some("main".into()),
            }),
            file_tree: Some("demo/\n└── a.py\n".into()),
            summaries: BTreeMap::from([("a.py".into(), "Defines a.".into())]),
            analyzed_paths: vec!["a.py".into()],
            turns: vec![Turn::user("What is a?"), Turn::model("A function.")],
            settings: SessionSettings {
                model: crate::DEFAULT_MODEL.into(),
                max_output_tokens: 8192,
                extensions: vec![".py".into()],
                instructions: "Be brief.".into(),
                context_mode: ContextMode::WholeFile,
            },
        }
    }

    #[test]
    fn round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions").join("demo.json");
        let store = JsonSessionStore;
        let original = state();

        store.save(&path, &original).unwrap();
        let loaded = store.load(&path).unwrap();

        assert_eq!(loaded, original);
        assert!(!dir.path().join("sessions").join(".demo.json.tmp").exists());
    }

    #[test]
    fn save_overwrites_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = JsonSessionStore;
        let mut s = state();
        store.save(&path, &s).unwrap();
        s.turns.clear();
        store.save(&path, &s).unwrap();
        assert!(store.load(&path).unwrap().turns.is_empty());
    }

    #[test]
    fn newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let mut s = state();
        s.version = SESSION_VERSION + 1;
        JsonSessionStore.save(&path, &s).unwrap();
        assert!(matches!(
            JsonSessionStore.load(&path),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JsonSessionStore.load(&dir.path().join("nope.json")),
            Err(Error::Io(_))
        ));
    }
}
