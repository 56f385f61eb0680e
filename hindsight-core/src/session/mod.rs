//! Session lifecycle and on-disk persistence.
//!
//! A session groups the recordings of one engine run under a temp
//! directory:
//!
//! ```text
//! <temp_root>/<session_id>/
//!     recordings/NNN.wav
//!     transcriptions/NNN.md
//!     session.json
//! ```
//!
//! `session.json` is rewritten after every mutation so a crash never loses
//! more than the in-flight change. Saving copies the tree to a permanent
//! location; saving again into the same destination merges recordings by
//! ordinal instead of clobbering (incremental save). Old temp sessions are
//! swept at engine start.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HindsightError, Result};
use crate::transcribe::merge::dedup_overlap;

/// Terminal outcome of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Completed,
    /// The writer hit an I/O error mid-recording; the partial file may be
    /// retained depending on policy.
    Failed,
}

/// Metadata for one recording in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMeta {
    /// Ordinal within the session, assigned at start, never reused.
    pub ordinal: u32,
    pub filename: String,
    /// Wall-clock start of the recording (pre-roll included).
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub channels: u16,
    pub sample_rate: u32,
    /// Peak absolute sample value over the whole file.
    pub peak: f32,
    /// Average RMS over the whole file, dBFS.
    pub average_rms_db: f32,
    pub status: RecordingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionManifest {
    session_id: String,
    created_at: DateTime<Utc>,
    recordings: Vec<RecordingMeta>,
    transcripts: Vec<String>,
    saved: bool,
    save_location: Option<PathBuf>,
}

/// A recording session rooted in a temp directory.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub recordings: Vec<RecordingMeta>,
    /// Deduplicated transcript log, in arrival order.
    pub transcripts: Vec<String>,
    pub saved: bool,
    pub save_location: Option<PathBuf>,
}

impl Session {
    fn create(id: String, dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(dir.join("recordings"))?;
        fs::create_dir_all(dir.join("transcriptions"))?;
        let session = Self {
            id,
            dir,
            created_at: Utc::now(),
            recordings: Vec::new(),
            transcripts: Vec::new(),
            saved: false,
            save_location: None,
        };
        session.persist()?;
        Ok(session)
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.dir.join("recordings")
    }

    pub fn transcriptions_dir(&self) -> PathBuf {
        self.dir.join("transcriptions")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("session.json")
    }

    /// Audio path for a given ordinal.
    pub fn recording_path(&self, ordinal: u32) -> PathBuf {
        self.recordings_dir().join(format!("{ordinal:03}.wav"))
    }

    /// Transcript path for a given ordinal (same basename, text extension).
    pub fn transcript_path(&self, ordinal: u32) -> PathBuf {
        self.transcriptions_dir().join(format!("{ordinal:03}.md"))
    }

    /// Append a finished recording and persist the manifest.
    pub fn register_recording(&mut self, meta: RecordingMeta) -> Result<()> {
        self.recordings.push(meta);
        self.persist()?;
        self.sync_to_save_location();
        Ok(())
    }

    /// Append a transcript, removing any suffix-prefix overlap with the
    /// previous transcript. Returns the deduplicated text actually stored
    /// (empty when the new transcript was wholly contained in the old one).
    pub fn add_transcript(&mut self, text: &str) -> Result<String> {
        let unique = match self.transcripts.last() {
            Some(previous) => dedup_overlap(previous, text),
            None => text.to_string(),
        };
        if !unique.is_empty() {
            self.transcripts.push(unique.clone());
            self.persist()?;
            self.sync_to_save_location();
        }
        Ok(unique)
    }

    /// Write the manifest to `session.json`.
    pub fn persist(&self) -> Result<()> {
        let manifest = SessionManifest {
            session_id: self.id.clone(),
            created_at: self.created_at,
            recordings: self.recordings.clone(),
            transcripts: self.transcripts.clone(),
            saved: self.saved,
            save_location: self.save_location.clone(),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| HindsightError::Session(e.to_string()))?;
        fs::write(self.manifest_path(), json)?;
        Ok(())
    }

    fn load(dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(dir.join("session.json"))?;
        let manifest: SessionManifest =
            serde_json::from_str(&raw).map_err(|e| HindsightError::Session(e.to_string()))?;
        Ok(Self {
            id: manifest.session_id,
            dir: dir.to_path_buf(),
            created_at: manifest.created_at,
            recordings: manifest.recordings,
            transcripts: manifest.transcripts,
            saved: manifest.saved,
            save_location: manifest.save_location,
        })
    }

    /// Once a session is saved, mirror new recordings and transcripts into
    /// the save location as they arrive. Best-effort: failures are logged,
    /// the temp copy stays authoritative.
    fn sync_to_save_location(&self) {
        let Some(dest) = self.save_location.as_ref().filter(|_| self.saved) else {
            return;
        };
        debug!(session = %self.id, dest = %dest.display(), "syncing session to save location");
        if let Err(e) = self.copy_tree_into(dest) {
            warn!(session = %self.id, "failed to sync session to save location: {e}");
        }
    }

    /// Copy manifest plus any recordings/transcriptions missing at `dest`.
    fn copy_tree_into(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        fs::copy(self.manifest_path(), dest.join("session.json"))?;
        for sub in ["recordings", "transcriptions"] {
            let src_dir = self.dir.join(sub);
            let dst_dir = dest.join(sub);
            fs::create_dir_all(&dst_dir)?;
            for entry in fs::read_dir(&src_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let target = dst_dir.join(entry.file_name());
                if !target.exists() {
                    fs::copy(entry.path(), target)?;
                }
            }
        }
        Ok(())
    }
}

/// Creates, saves, discards, and sweeps sessions under a temp root.
#[derive(Debug)]
pub struct SessionStore {
    temp_root: PathBuf,
    current: Option<Session>,
}

impl SessionStore {
    pub fn new(temp_root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&temp_root)?;
        Ok(Self {
            temp_root,
            current: None,
        })
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    /// Create a fresh session with a sortable unique id.
    pub fn create_session(&mut self) -> Result<&mut Session> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let id = format!("session_{stamp}_{suffix}");
        let dir = self.temp_root.join(&id);
        let session = Session::create(id.clone(), dir)?;
        info!(session = %id, "created session");
        Ok(self.current.insert(session))
    }

    /// Save the current session under `destination/<session_id>`.
    ///
    /// If that directory already holds a manifest for this session id
    /// (from an earlier save), recordings and transcripts are merged by
    /// ordinal / content rather than overwritten.
    pub fn save_session(&mut self, destination: &Path) -> Result<PathBuf> {
        let session = self
            .current
            .as_mut()
            .ok_or_else(|| HindsightError::Session("no active session".into()))?;
        if !destination.is_dir() {
            return Err(HindsightError::Session(format!(
                "invalid destination directory: {}",
                destination.display()
            )));
        }

        let dest = destination.join(&session.id);

        // Incremental path: union a previously saved manifest into ours so
        // nothing already at the destination is lost.
        if dest.join("session.json").exists() {
            let existing = Session::load(&dest)?;
            if existing.id == session.id {
                for meta in existing.recordings {
                    if !session.recordings.iter().any(|r| r.ordinal == meta.ordinal) {
                        session.recordings.push(meta);
                    }
                }
                session.recordings.sort_by_key(|r| r.ordinal);
                for transcript in existing.transcripts {
                    if !session.transcripts.contains(&transcript) {
                        session.transcripts.push(transcript);
                    }
                }
            }
        }

        session.saved = true;
        session.save_location = Some(dest.clone());
        session.persist()?;
        session.copy_tree_into(&dest)?;

        info!(session = %session.id, dest = %dest.display(), "session saved");
        Ok(dest)
    }

    /// Delete the current session's temp directory unless it was saved.
    pub fn discard_session(&mut self) -> Result<()> {
        let Some(session) = self.current.take() else {
            return Ok(());
        };
        if !session.saved && session.dir.exists() {
            fs::remove_dir_all(&session.dir)?;
            info!(session = %session.id, "discarded session");
        }
        Ok(())
    }

    /// Remove temp sessions whose `session.json` is older than `days`.
    ///
    /// Only direct children of the temp root carrying a manifest are
    /// candidates; the current session is always skipped. Returns the
    /// number of sessions removed.
    pub fn cleanup_older_than(&self, days: u64) -> Result<usize> {
        if !self.temp_root.exists() {
            return Ok(0);
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut cleaned = 0;
        for entry in fs::read_dir(&self.temp_root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(current) = &self.current {
                if path == current.dir {
                    continue;
                }
            }
            let manifest = path.join("session.json");
            let Ok(meta) = fs::metadata(&manifest) else {
                // Not a session directory we recognise; leave it alone.
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            if mtime >= cutoff {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    cleaned += 1;
                    info!(dir = %path.display(), "cleaned up old session");
                }
                Err(e) => warn!(dir = %path.display(), "failed to clean up session: {e}"),
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(ordinal: u32) -> RecordingMeta {
        RecordingMeta {
            ordinal,
            filename: format!("{ordinal:03}.wav"),
            timestamp: Utc::now(),
            duration_seconds: 2.5,
            channels: 2,
            sample_rate: 48_000,
            peak: 0.8,
            average_rms_db: -22.0,
            status: RecordingStatus::Completed,
        }
    }

    fn store() -> (TempDir, SessionStore) {
        let tmp = TempDir::new().expect("temp dir");
        let store = SessionStore::new(tmp.path().join("sessions")).expect("store");
        (tmp, store)
    }

    #[test]
    fn create_session_builds_directory_layout() {
        let (_tmp, mut store) = store();
        let session = store.create_session().expect("create");
        assert!(session.recordings_dir().is_dir());
        assert!(session.transcriptions_dir().is_dir());
        assert!(session.manifest_path().is_file());
        assert!(session.id.starts_with("session_"));
    }

    #[test]
    fn manifest_round_trips() {
        let (_tmp, mut store) = store();
        let session = store.create_session().expect("create");
        session.register_recording(meta(1)).expect("register");
        session.register_recording(meta(2)).expect("register");

        let loaded = Session::load(&session.dir).expect("load");
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.recordings.len(), 2);
        assert_eq!(loaded.recordings[1].ordinal, 2);
        assert!(!loaded.saved);
    }

    #[test]
    fn manifest_uses_camel_case_keys() {
        let (_tmp, mut store) = store();
        let session = store.create_session().expect("create");
        session.register_recording(meta(1)).expect("register");

        let raw = fs::read_to_string(session.manifest_path()).expect("read");
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"createdAt\""));
        assert!(raw.contains("\"durationSeconds\""));
        assert!(raw.contains("\"averageRmsDb\""));
    }

    #[test]
    fn transcripts_are_deduplicated_against_previous() {
        let (_tmp, mut store) = store();
        let session = store.create_session().expect("create");

        assert_eq!(
            session.add_transcript("Hello world").expect("add"),
            "Hello world"
        );
        assert_eq!(
            session.add_transcript("world and then some").expect("add"),
            " and then some"
        );
        // Fully contained in the previous transcript → nothing stored.
        assert_eq!(session.add_transcript(" and then some").expect("add"), "");
        assert_eq!(session.transcripts.len(), 2);
    }

    #[test]
    fn save_copies_tree_and_marks_saved() {
        let (tmp, mut store) = store();
        let dest_root = tmp.path().join("saved");
        fs::create_dir_all(&dest_root).expect("mkdir");

        let session = store.create_session().expect("create");
        let wav = session.recording_path(1);
        fs::write(&wav, b"RIFF").expect("write wav");
        session.register_recording(meta(1)).expect("register");
        let id = session.id.clone();

        let dest = store.save_session(&dest_root).expect("save");
        assert_eq!(dest, dest_root.join(&id));
        assert!(dest.join("recordings/001.wav").is_file());

        let saved = Session::load(&dest).expect("load saved");
        assert!(saved.saved);
        assert_eq!(saved.save_location.as_deref(), Some(dest.as_path()));

        // Temp copy reflects the save too.
        let temp = store.current().expect("current");
        assert!(temp.saved);
    }

    #[test]
    fn incremental_save_merges_by_ordinal() {
        let (tmp, mut store) = store();
        let dest_root = tmp.path().join("saved");
        fs::create_dir_all(&dest_root).expect("mkdir");

        let session = store.create_session().expect("create");
        fs::write(session.recording_path(1), b"one").expect("write");
        session.register_recording(meta(1)).expect("register");
        store.save_session(&dest_root).expect("first save");

        // Simulate the destination knowing about an ordinal we lost
        // locally (e.g. a recording made before a crash).
        {
            let session = store.current_mut().expect("current");
            session.recordings.retain(|r| r.ordinal != 1);
            fs::write(session.recording_path(2), b"two").expect("write");
            session.register_recording(meta(2)).expect("register");
        }
        let dest = store.save_session(&dest_root).expect("second save");

        let saved = Session::load(&dest).expect("load");
        let ordinals: Vec<u32> = saved.recordings.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert!(dest.join("recordings/001.wav").is_file());
        assert!(dest.join("recordings/002.wav").is_file());
    }

    #[test]
    fn post_save_registrations_sync_to_save_location() {
        let (tmp, mut store) = store();
        let dest_root = tmp.path().join("saved");
        fs::create_dir_all(&dest_root).expect("mkdir");

        store.create_session().expect("create");
        let dest = store.save_session(&dest_root).expect("save");

        let session = store.current_mut().expect("current");
        fs::write(session.recording_path(1), b"late").expect("write");
        session.register_recording(meta(1)).expect("register");

        assert!(dest.join("recordings/001.wav").is_file());
        let saved = Session::load(&dest).expect("load");
        assert_eq!(saved.recordings.len(), 1);
    }

    #[test]
    fn discard_removes_unsaved_session_only() {
        let (tmp, mut store) = store();
        let dir = store.create_session().expect("create").dir.clone();
        store.discard_session().expect("discard");
        assert!(!dir.exists());

        // A saved session survives discard.
        let dest_root = tmp.path().join("saved");
        fs::create_dir_all(&dest_root).expect("mkdir");
        let dir = store.create_session().expect("create").dir.clone();
        store.save_session(&dest_root).expect("save");
        store.discard_session().expect("discard");
        assert!(dir.exists());
    }

    #[test]
    fn cleanup_skips_fresh_current_and_unrecognised_dirs() {
        let (_tmp, mut store) = store();
        let root = store.temp_root().to_path_buf();

        // A stale session: manifest mtime in the distant past.
        let stale = root.join("session_00000000_000000_dead0000");
        fs::create_dir_all(&stale).expect("mkdir");
        fs::write(stale.join("session.json"), "{}").expect("write");
        let old = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
        let file = fs::File::options()
            .write(true)
            .open(stale.join("session.json"))
            .expect("open");
        file.set_modified(old).expect("set mtime");
        drop(file);

        // A directory that is not a session.
        let foreign = root.join("not_a_session");
        fs::create_dir_all(&foreign).expect("mkdir");

        // The live session.
        store.create_session().expect("create");
        let current_dir = store.current().expect("current").dir.clone();

        let cleaned = store.cleanup_older_than(7).expect("cleanup");
        assert_eq!(cleaned, 1);
        assert!(!stale.exists());
        assert!(foreign.exists());
        assert!(current_dir.exists());
    }
}
