//! One-shot import of the legacy JSON layout into the relational store.
//!
//! Order matters: the legacy files are copied to a timestamped backup first,
//! then parsed (malformed entries are logged and skipped), then written in a
//! single transaction together with the completion marker. Rollback resets
//! the legacy layout to exactly what a backup holds and leaves the store
//! untouched.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use quarry_events::Bus;
use quarry_kernel::{
    ConversationRow, DownloadRecord, LegacyImport, MessageRow, PersonaRow, Store, TableCounts,
};
use quarry_topics::{
    TOPIC_MIGRATION_BACKUP, TOPIC_MIGRATION_COMPLETED, TOPIC_MIGRATION_FAILED,
    TOPIC_MIGRATION_ROLLED_BACK,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::EffectivePaths;
use crate::error::{MigrationError, SkippedEntry};
use crate::util::now_rfc3339;

const BACKUP_PREFIX: &str = "backup_";
const HISTORY_SUBDIR: &str = "history";
const DEFAULT_ICON: &str = "🤖";

/// Where the legacy files live.
#[derive(Debug, Clone)]
pub struct LegacyLayout {
    pub history_dir: PathBuf,
    pub records_file: PathBuf,
    pub personas_file: PathBuf,
}

impl LegacyLayout {
    pub fn from_paths(paths: &EffectivePaths) -> Self {
        Self {
            history_dir: paths.legacy_history_dir.clone(),
            records_file: paths.legacy_records_file.clone(),
            personas_file: paths.legacy_personas_file.clone(),
        }
    }

    /// Every `*.json` under the history tree, the same set a backup copies.
    fn conversation_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.history_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|x| x == "json"))
            .map(walkdir::DirEntry::into_path)
            .collect();
        files.sort();
        files
    }

    pub fn is_present(&self) -> bool {
        !self.conversation_files().is_empty()
            || self.records_file.is_file()
            || self.personas_file.is_file()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    /// `YYYYmmdd_HHMMSS`, possibly with a `_N` suffix.
    pub timestamp: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub conversations: u64,
    pub messages: u64,
    pub download_records: u64,
    pub personas: u64,
    pub skipped: Vec<SkippedEntry>,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub legacy_present: bool,
    pub completed_at: Option<String>,
    pub counts: TableCounts,
    pub needs_migration: bool,
    pub backups: Vec<BackupInfo>,
}

// ---------------- Legacy record shapes ----------------

#[derive(Debug, Deserialize)]
struct LegacyConversation {
    id: Option<String>,
    title: Option<String>,
    persona: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    timestamp: Option<String>,
    model: Option<String>,
    sessions: Option<Vec<Value>>,
    messages: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct LegacySession {
    model: Option<String>,
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    #[default]
    User,
    Assistant,
    System,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    #[serde(default)]
    role: Role,
    content: String,
    timestamp: Option<String>,
    completed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    record_key: Option<String>,
    model_name: String,
    gguf_path: String,
    ollama_name: Option<String>,
    quantization: Option<String>,
    model_id: Option<String>,
    download_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyPersona {
    name: Option<String>,
    icon: Option<String>,
    icon_path: Option<String>,
    description: Option<String>,
    system_prompt: Option<String>,
}

fn nonempty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn default_persona() -> PersonaRow {
    PersonaRow {
        key: "default".into(),
        name: "Default Assistant".into(),
        icon: DEFAULT_ICON.into(),
        icon_path: None,
        description: "General-purpose AI assistant".into(),
        system_prompt: String::new(),
    }
}

#[derive(Default)]
struct Parsed {
    batch: LegacyImport,
    skipped: Vec<SkippedEntry>,
}

impl Parsed {
    fn skip(&mut self, source: impl Into<String>, reason: impl Into<String>) {
        let entry = SkippedEntry {
            source: source.into(),
            reason: reason.into(),
        };
        warn!(source = %entry.source, reason = %entry.reason, "skipping malformed legacy entry");
        self.skipped.push(entry);
    }

    fn message(
        &mut self,
        source: String,
        raw: Value,
        conversation_id: &str,
        model: &str,
        fallback_ts: &str,
    ) {
        match serde_json::from_value::<LegacyMessage>(raw) {
            Ok(msg) => self.batch.messages.push(MessageRow {
                conversation_id: conversation_id.to_string(),
                model: model.to_string(),
                role: msg.role.as_str().to_string(),
                content: msg.content,
                timestamp: msg.timestamp.unwrap_or_else(|| fallback_ts.to_string()),
                completed_at: nonempty(msg.completed_at),
            }),
            Err(err) => self.skip(source, err.to_string()),
        }
    }

    fn conversation_file(&mut self, history_dir: &Path, path: &Path) {
        let rel = path.strip_prefix(history_dir).unwrap_or(path);
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let source = format!("{HISTORY_SUBDIR}/{name}");
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) => return self.skip(source, err.to_string()),
        };
        let conv: LegacyConversation = match serde_json::from_slice(&raw) {
            Ok(c) => c,
            Err(err) => return self.skip(source, err.to_string()),
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = nonempty(conv.id).unwrap_or(stem);
        let created_at = nonempty(conv.created_at)
            .or_else(|| nonempty(conv.timestamp.clone()))
            .unwrap_or_else(now_rfc3339);
        let updated_at = nonempty(conv.updated_at).unwrap_or_else(|| created_at.clone());

        if let Some(sessions) = conv.sessions {
            for (si, raw_session) in sessions.into_iter().enumerate() {
                let session: LegacySession = match serde_json::from_value(raw_session) {
                    Ok(s) => s,
                    Err(err) => {
                        self.skip(format!("{source}#sessions[{si}]"), err.to_string());
                        continue;
                    }
                };
                let model = nonempty(session.model).unwrap_or_else(|| "unknown".into());
                for (mi, raw_msg) in session.messages.into_iter().enumerate() {
                    let src = format!("{source}#sessions[{si}].messages[{mi}]");
                    self.message(src, raw_msg, &id, &model, "");
                }
            }
        } else if let Some(messages) = conv.messages {
            let model = nonempty(conv.model).unwrap_or_else(|| "unknown".into());
            let fallback_ts = conv.timestamp.unwrap_or_default();
            for (mi, raw_msg) in messages.into_iter().enumerate() {
                let src = format!("{source}#messages[{mi}]");
                self.message(src, raw_msg, &id, &model, &fallback_ts);
            }
        }

        self.batch.conversations.push(ConversationRow {
            id,
            title: nonempty(conv.title).unwrap_or_else(|| "Untitled".into()),
            persona: nonempty(conv.persona).unwrap_or_else(|| "default".into()),
            created_at,
            updated_at,
        });
    }

    fn object_file(&mut self, path: &Path, label: &str) -> Option<BTreeMap<String, Value>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) => {
                self.skip(label, err.to_string());
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(map) => Some(map),
            Err(err) => {
                self.skip(label, err.to_string());
                None
            }
        }
    }

    fn records_file(&mut self, path: &Path) {
        let Some(map) = self.object_file(path, "download_records.json") else {
            return;
        };
        for (map_key, raw) in map {
            let source = format!("download_records.json#{map_key}");
            let rec: LegacyRecord = match serde_json::from_value(raw) {
                Ok(r) => r,
                Err(err) => {
                    self.skip(source, err.to_string());
                    continue;
                }
            };
            if rec.model_name.trim().is_empty() || rec.gguf_path.trim().is_empty() {
                self.skip(source, "empty model_name or gguf_path");
                continue;
            }
            let artifact_path = PathBuf::from(rec.gguf_path.trim());
            self.batch.records.push(DownloadRecord {
                key: nonempty(rec.record_key).unwrap_or(map_key),
                model_name: rec.model_name,
                service_name: rec.ollama_name.unwrap_or_default(),
                file_exists: artifact_path.is_file(),
                artifact_path,
                quantization: rec.quantization.unwrap_or_default(),
                model_id: nonempty(rec.model_id),
                sha256: None,
                bytes: None,
                downloaded_at: nonempty(rec.download_time).unwrap_or_else(now_rfc3339),
            });
        }
    }

    fn personas_file(&mut self, path: &Path) {
        let Some(map) = self.object_file(path, "personas.json") else {
            return;
        };
        for (key, raw) in map {
            match serde_json::from_value::<LegacyPersona>(raw) {
                Ok(p) => self.batch.personas.push(PersonaRow {
                    key,
                    name: nonempty(p.name).unwrap_or_else(|| "Unnamed".into()),
                    icon: nonempty(p.icon).unwrap_or_else(|| DEFAULT_ICON.into()),
                    icon_path: nonempty(p.icon_path),
                    description: p.description.unwrap_or_default(),
                    system_prompt: p.system_prompt.unwrap_or_default(),
                }),
                Err(err) => self.skip(format!("personas.json#{key}"), err.to_string()),
            }
        }
    }
}

// ---------------- Engine ----------------

pub struct MigrationEngine {
    store: Store,
    layout: LegacyLayout,
    backup_dir: PathBuf,
    bus: Bus,
}

impl MigrationEngine {
    pub fn new(store: Store, paths: &EffectivePaths, bus: Bus) -> Self {
        Self::with_layout(store, LegacyLayout::from_paths(paths), paths.backup_dir.clone(), bus)
    }

    pub fn with_layout(store: Store, layout: LegacyLayout, backup_dir: PathBuf, bus: Bus) -> Self {
        Self {
            store,
            layout,
            backup_dir,
            bus,
        }
    }

    pub fn layout(&self) -> &LegacyLayout {
        &self.layout
    }

    /// Legacy files exist, no completion marker, and the target tables are empty.
    pub fn needs_migration(&self) -> Result<bool, MigrationError> {
        if !self.layout.is_present() {
            return Ok(false);
        }
        if self.store.migration_completed_at()?.is_some() {
            return Ok(false);
        }
        Ok(self.store.counts()?.is_empty())
    }

    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        Ok(MigrationStatus {
            legacy_present: self.layout.is_present(),
            completed_at: self.store.migration_completed_at()?,
            counts: self.store.counts()?,
            needs_migration: self.needs_migration()?,
            backups: self.list_backups()?,
        })
    }

    /// Migrate if needed; `Ok(None)` when there is nothing to do.
    pub fn run(&self) -> Result<Option<MigrationReport>, MigrationError> {
        if !self.needs_migration()? {
            info!("no legacy migration needed");
            return Ok(None);
        }
        self.migrate().map(Some)
    }

    /// Backup, parse and import unconditionally.
    pub fn migrate(&self) -> Result<MigrationReport, MigrationError> {
        let backup = self.create_backup().inspect_err(|err| {
            self.bus.publish(
                TOPIC_MIGRATION_FAILED,
                &json!({"stage": "backup", "error": err.to_string()}),
            );
        })?;
        self.bus.publish(TOPIC_MIGRATION_BACKUP, &backup);

        let parsed = self.parse();
        let counts = self.store.import_legacy(&parsed.batch).inspect_err(|err| {
            warn!(%err, "legacy import failed; nothing was written");
            self.bus.publish(
                TOPIC_MIGRATION_FAILED,
                &json!({"stage": "import", "error": err.to_string()}),
            );
        })?;
        let report = MigrationReport {
            conversations: counts.conversations,
            messages: counts.messages,
            download_records: counts.download_records,
            personas: counts.personas,
            skipped: parsed.skipped,
            backup: Some(backup.path),
        };
        info!(
            conversations = report.conversations,
            messages = report.messages,
            download_records = report.download_records,
            personas = report.personas,
            skipped = report.skipped.len(),
            "legacy migration completed"
        );
        self.bus.publish(TOPIC_MIGRATION_COMPLETED, &report);
        Ok(report)
    }

    fn parse(&self) -> Parsed {
        let mut parsed = Parsed::default();
        for path in self.layout.conversation_files() {
            parsed.conversation_file(&self.layout.history_dir, &path);
        }
        if self.layout.records_file.is_file() {
            parsed.records_file(&self.layout.records_file);
        }
        if self.layout.personas_file.is_file() {
            parsed.personas_file(&self.layout.personas_file);
        } else {
            parsed.batch.personas.push(default_persona());
        }
        parsed
    }

    fn create_backup(&self) -> Result<BackupInfo, MigrationError> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let backup = (0u32..)
            .map(|n| match n {
                0 => stamp.clone(),
                n => format!("{stamp}_{n}"),
            })
            .map(|timestamp| BackupInfo {
                path: self.backup_dir.join(format!("{BACKUP_PREFIX}{timestamp}")),
                timestamp,
            })
            .find(|b| !b.path.exists())
            .ok_or_else(|| MigrationError::Backup("no free backup name".into()))?;

        let result = self.copy_legacy_into(&backup.path);
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&backup.path);
            return Err(MigrationError::Backup(format!(
                "{}: {err}",
                backup.path.display()
            )));
        }
        info!(path = %backup.path.display(), "legacy files backed up");
        Ok(backup)
    }

    fn copy_legacy_into(&self, dest: &Path) -> io::Result<()> {
        fs::create_dir_all(dest)?;
        if self.layout.history_dir.is_dir() {
            copy_tree(&self.layout.history_dir, &dest.join(HISTORY_SUBDIR))?;
        }
        copy_if_file(&self.layout.records_file, &dest.join("download_records.json"))?;
        copy_if_file(&self.layout.personas_file, &dest.join("personas.json"))?;
        Ok(())
    }

    /// Backups sorted oldest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, MigrationError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut backups: Vec<BackupInfo> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix(BACKUP_PREFIX).map(|ts| BackupInfo {
                    timestamp: ts.to_string(),
                    path: e.path(),
                })
            })
            .collect();
        backups.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(backups)
    }

    pub fn latest_backup(&self) -> Result<Option<BackupInfo>, MigrationError> {
        Ok(self.list_backups()?.pop())
    }

    /// Restore the legacy layout from the named (or latest) backup.
    pub fn rollback(&self, timestamp: Option<&str>) -> Result<BackupInfo, MigrationError> {
        let backup = match timestamp {
            Some(ts) => {
                let ts = ts.trim().trim_start_matches(BACKUP_PREFIX);
                let path = self.backup_dir.join(format!("{BACKUP_PREFIX}{ts}"));
                if !path.is_dir() {
                    return Err(MigrationError::BackupNotFound(path));
                }
                BackupInfo {
                    timestamp: ts.to_string(),
                    path,
                }
            }
            None => self.latest_backup()?.ok_or(MigrationError::NoBackup)?,
        };
        self.restore_from(&backup.path)
            .map_err(|e| MigrationError::Restore(format!("{}: {e}", backup.path.display())))?;
        info!(path = %backup.path.display(), "legacy layout restored from backup");
        self.bus.publish(TOPIC_MIGRATION_ROLLED_BACK, &backup);
        Ok(backup)
    }

    /// Make the legacy layout match the backup exactly: anything the backup
    /// does not hold is removed.
    fn restore_from(&self, backup: &Path) -> io::Result<()> {
        if self.layout.history_dir.exists() {
            fs::remove_dir_all(&self.layout.history_dir)?;
        }
        let history = backup.join(HISTORY_SUBDIR);
        if history.is_dir() {
            copy_tree(&history, &self.layout.history_dir)?;
        }
        restore_file(&backup.join("download_records.json"), &self.layout.records_file)?;
        restore_file(&backup.join("personas.json"), &self.layout.personas_file)?;
        Ok(())
    }
}

fn copy_if_file(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.is_file() {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).map(|_| ())
}

fn restore_file(backed_up: &Path, target: &Path) -> io::Result<()> {
    if backed_up.is_file() {
        return copy_if_file(backed_up, target);
    }
    match fs::remove_file(target) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        base: PathBuf,
        engine: MigrationEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let store = Store::open(&base.join("db")).unwrap();
        let layout = LegacyLayout {
            history_dir: base.join("history"),
            records_file: base.join("download_records.json"),
            personas_file: base.join("personas.json"),
        };
        let engine = MigrationEngine::with_layout(store, layout, base.join("backup_json"), Bus::new(32));
        Fixture {
            _dir: dir,
            base,
            engine,
        }
    }

    fn write(path: &Path, value: Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    }

    #[test]
    fn nothing_to_do_without_legacy_files() {
        let f = fixture();
        assert!(!f.engine.needs_migration().unwrap());
        assert!(f.engine.run().unwrap().is_none());
        assert!(f.engine.list_backups().unwrap().is_empty());
    }

    #[test]
    fn parses_both_conversation_shapes() {
        let f = fixture();
        write(
            &f.base.join("history/multi.json"),
            json!({
                "id": "c-multi", "title": "Two models", "persona": "coder",
                "created_at": "2024-05-01T10:00:00", "updated_at": "2024-05-01T11:00:00",
                "sessions": [
                    {"model": "qwen3:8b", "messages": [
                        {"role": "user", "content": "hi", "timestamp": "t1"},
                        {"role": "assistant", "content": "hello", "timestamp": "t2", "completed_at": "t3"}
                    ]},
                    {"model": "llama3.1:8b", "messages": [{"role": "user", "content": "yo"}]}
                ]
            }),
        );
        write(
            &f.base.join("history/legacy-single.json"),
            json!({"model": "qwen2:7b", "timestamp": "2023-12-31T00:00:00",
                   "messages": [{"role": "user", "content": "old"}]}),
        );
        let report = f.engine.run().unwrap().unwrap();
        assert_eq!(report.conversations, 2);
        assert_eq!(report.messages, 4);
        // seeded when no personas file exists
        assert_eq!(report.personas, 1);
        assert!(report.skipped.is_empty());

        let store = &f.engine.store;
        let convs = store.list_conversations().unwrap();
        let single = convs.iter().find(|c| c.id == "legacy-single").unwrap();
        assert_eq!(single.title, "Untitled");
        assert_eq!(single.persona, "default");
        assert_eq!(single.updated_at, "2023-12-31T00:00:00");
        let msgs = store.messages_for("legacy-single").unwrap();
        assert_eq!(msgs[0].timestamp, "2023-12-31T00:00:00");
        assert_eq!(msgs[0].model, "qwen2:7b");
        let multi = store.messages_for("c-multi").unwrap();
        assert_eq!(multi.len(), 3);
        assert!(multi.iter().any(|m| m.completed_at.as_deref() == Some("t3")));
        assert_eq!(store.list_personas().unwrap()[0].icon, DEFAULT_ICON);
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let f = fixture();
        write(
            &f.base.join("history/c1.json"),
            json!({"id": "c1", "messages": [
                {"role": "user", "content": "valid"},
                {"role": "wizard", "content": 5},
                "not an object"
            ]}),
        );
        fs::write(f.base.join("history/broken.json"), b"{ not json").unwrap();
        write(
            &f.base.join("download_records.json"),
            json!({
                "modela-q4_k_m": {"model_name": "ModelA", "gguf_path": "/x/a.gguf", "ollama_name": "ModelA-Q4_K_M:latest", "quantization": "Q4_K_M", "download_time": "2024-01-01"},
                "broken": {"ollama_name": "orphan"}
            }),
        );
        write(
            &f.base.join("personas.json"),
            json!({"coder": {"name": "Coder", "system_prompt": "be terse"}, "bad": 3}),
        );
        let report = f.engine.run().unwrap().unwrap();
        assert_eq!(report.conversations, 1);
        assert_eq!(report.messages, 1);
        assert_eq!(report.download_records, 1);
        assert_eq!(report.personas, 1);
        let sources: Vec<&str> = report.skipped.iter().map(|s| s.source.as_str()).collect();
        assert_eq!(
            sources,
            vec![
                "history/broken.json",
                "history/c1.json#messages[1]",
                "history/c1.json#messages[2]",
                "download_records.json#broken",
                "personas.json#bad",
            ]
        );
        let rec = f.engine.store.find("modela-q4_k_m").unwrap().unwrap();
        assert!(!rec.file_exists);
        assert_eq!(rec.service_name, "ModelA-Q4_K_M:latest");
        assert_eq!(f.engine.store.list_personas().unwrap()[0].icon, DEFAULT_ICON);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let f = fixture();
        write(&f.base.join("history/c.json"), json!({"id": "c", "messages": []}));
        assert!(f.engine.needs_migration().unwrap());
        assert!(f.engine.run().unwrap().is_some());
        assert!(!f.engine.needs_migration().unwrap());
        assert!(f.engine.run().unwrap().is_none());
        assert_eq!(f.engine.list_backups().unwrap().len(), 1);
        let status = f.engine.status().unwrap();
        assert!(status.completed_at.is_some());
        assert!(status.legacy_present);
    }

    #[test]
    fn failed_backup_aborts_before_any_write() {
        let f = fixture();
        write(&f.base.join("history/c.json"), json!({"id": "c", "messages": []}));
        // a regular file where the backup directory should go
        fs::write(f.base.join("backup_json"), b"").unwrap();
        let err = f.engine.run().unwrap_err();
        assert!(matches!(err, MigrationError::Backup(_)), "{err}");
        assert!(f.engine.store.counts().unwrap().is_empty());
        assert!(f.engine.needs_migration().unwrap());
    }

    #[test]
    fn rollback_restores_byte_identical_layout() {
        let f = fixture();
        let conv = f.base.join("history/nested/c.json");
        write(&conv, json!({"id": "c", "messages": [{"role": "user", "content": "héllo"}]}));
        write(&f.base.join("personas.json"), json!({"default": {"name": "D"}}));
        let original_conv = fs::read(&conv).unwrap();
        let original_personas = fs::read(f.base.join("personas.json")).unwrap();

        let report = f.engine.run().unwrap().unwrap();
        let backup = report.backup.unwrap();

        fs::remove_dir_all(f.base.join("history")).unwrap();
        fs::write(f.base.join("personas.json"), b"{}").unwrap();

        let restored = f.engine.rollback(None).unwrap();
        assert_eq!(restored.path, backup);
        assert_eq!(fs::read(&conv).unwrap(), original_conv);
        assert_eq!(fs::read(f.base.join("personas.json")).unwrap(), original_personas);
        // relational data stays in place
        assert_eq!(f.engine.store.counts().unwrap().conversations, 1);

        let named = f.engine.rollback(Some(&restored.timestamp)).unwrap();
        assert_eq!(named.path, backup);
        assert!(matches!(
            f.engine.rollback(Some("19990101_000000")),
            Err(MigrationError::BackupNotFound(_))
        ));
    }

    #[test]
    fn rollback_removes_files_created_after_the_backup() {
        let f = fixture();
        write(&f.base.join("history/c.json"), json!({"id": "c", "messages": []}));
        f.engine.run().unwrap().unwrap();

        write(&f.base.join("history/later.json"), json!({"id": "later"}));
        write(&f.base.join("download_records.json"), json!({}));
        write(&f.base.join("personas.json"), json!({}));

        f.engine.rollback(None).unwrap();
        assert!(f.base.join("history/c.json").is_file());
        assert!(!f.base.join("history/later.json").exists());
        assert!(!f.base.join("download_records.json").exists());
        assert!(!f.base.join("personas.json").exists());
    }

    #[test]
    fn nested_history_files_are_imported_with_relative_sources() {
        let f = fixture();
        write(
            &f.base.join("history/2024/05/a.json"),
            json!({"id": "a", "messages": [{"role": "user", "content": "hi"}]}),
        );
        fs::write(f.base.join("history/2024/bad.json"), b"[").unwrap();
        fs::write(f.base.join("history/notes.txt"), b"ignored").unwrap();
        let report = f.engine.run().unwrap().unwrap();
        assert_eq!(report.conversations, 1);
        assert_eq!(report.messages, 1);
        let sources: Vec<&str> = report.skipped.iter().map(|s| s.source.as_str()).collect();
        assert_eq!(sources, vec!["history/2024/bad.json"]);
    }

    #[test]
    fn rollback_without_backup_is_refused() {
        let f = fixture();
        assert!(matches!(f.engine.rollback(None), Err(MigrationError::NoBackup)));
    }
}
