//! Durable storage for conversation logs
//!
//! Logs are stored as JSONL: a metadata record followed by one record per
//! event. Every record carries a format version.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ConversationConfig;
use crate::error::{Error, Result};
use crate::event::{ConversationId, Event};
use crate::log::check_integrity;

/// Current on-disk record format version
pub const RECORD_VERSION: u32 = 1;

/// Record types for the JSONL format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    /// Conversation metadata, always the first record
    Metadata {
        version: u32,
        conversation_id: ConversationId,
        created_at: DateTime<Utc>,
        #[serde(default)]
        config: ConversationConfig,
    },
    /// An appended event
    Event { version: u32, event: Event },
}

impl Record {
    fn version(&self) -> u32 {
        match self {
            Record::Metadata { version, .. } | Record::Event { version, .. } => *version,
        }
    }
}

/// What a conversation was created with
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMeta {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub config: ConversationConfig,
}

impl ConversationMeta {
    pub fn new(id: ConversationId, config: ConversationConfig) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            config,
        }
    }
}

/// A conversation as read back from storage
#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub meta: ConversationMeta,
    pub events: Vec<Event>,
}

/// Backend for conversation logs
pub trait LogStore: Send + Sync {
    /// Start a new log. Fails if one already exists for this id.
    fn create(&self, meta: &ConversationMeta) -> Result<()>;

    /// Durably append one event
    fn append(&self, event: &Event) -> Result<()>;

    /// Read a log back in append order
    fn load(&self, id: ConversationId) -> Result<StoredConversation>;

    fn list(&self) -> Result<Vec<ConversationId>>;

    /// Remove a log permanently
    fn delete(&self, id: ConversationId) -> Result<()>;
}

/// One JSONL file per conversation
pub struct JsonlStore {
    dir: PathBuf,
    writers: Mutex<HashMap<ConversationId, BufWriter<File>>>,
}

impl JsonlStore {
    /// Default log directory
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weft")
            .join("conversations")
    }

    /// Open a store rooted at `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for a conversation
    pub fn path_for(&self, id: ConversationId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", id))
    }

    fn write_record(&self, id: ConversationId, record: &Record) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writers = self.writers.lock();
        let writer = match writers.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(self.path_for(id))
                    .map_err(|e| match e.kind() {
                        IoErrorKind::NotFound => Error::ConversationNotFound(id),
                        _ => Error::Io(e),
                    })?;
                entry.insert(BufWriter::new(file))
            }
        };
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    /// Parse raw file contents, returning the records and, when the last line
    /// was torn, the length of the valid prefix.
    fn parse(id: ConversationId, bytes: &[u8]) -> Result<(Vec<Record>, Option<usize>)> {
        let mut records = Vec::new();
        let mut offset = 0;
        let mut line_no = 0;

        while offset < bytes.len() {
            line_no += 1;
            let rest = &bytes[offset..];
            let (line, consumed, complete) = match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => (&rest[..pos], pos + 1, true),
                None => (rest, rest.len(), false),
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                offset += consumed;
                continue;
            }

            match serde_json::from_slice::<Record>(line) {
                Ok(record) if complete => records.push(record),
                Ok(record) => {
                    // Whole record, only the newline is missing
                    records.push(record);
                    return Ok((records, Some(bytes.len())));
                }
                Err(_) if !complete => {
                    tracing::warn!(
                        "Discarding partial trailing record in conversation {} ({} bytes)",
                        id,
                        line.len()
                    );
                    return Ok((records, Some(offset)));
                }
                Err(e) => {
                    return Err(Error::LogIntegrity {
                        conversation_id: id,
                        detail: format!("corrupt record on line {}: {}", line_no, e),
                    });
                }
            }
            offset += consumed;
        }

        Ok((records, None))
    }

    /// Read a log without touching the file.
    ///
    /// A torn trailing record is left on disk and omitted here, and event
    /// numbering is checked. Safe while an engine is still appending.
    pub fn snapshot(&self, id: ConversationId) -> Result<StoredConversation> {
        let stored = self.read_log(id, false)?;
        check_integrity(id, &stored.events)?;
        Ok(stored)
    }

    fn read_log(&self, id: ConversationId, repair: bool) -> Result<StoredConversation> {
        let bytes = fs::read(self.path_for(id)).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => Error::ConversationNotFound(id),
            _ => Error::Io(e),
        })?;

        let (records, repair_at) = Self::parse(id, &bytes)?;
        if let (true, Some(valid_len)) = (repair, repair_at) {
            self.repair(id, valid_len)?;
        }

        let integrity = |detail: String| Error::LogIntegrity {
            conversation_id: id,
            detail,
        };

        let mut records = records.into_iter();
        let meta = match records.next() {
            Some(Record::Metadata {
                version,
                conversation_id,
                created_at,
                config,
            }) => {
                if version > RECORD_VERSION {
                    return Err(integrity(format!("unsupported record version {}", version)));
                }
                if conversation_id != id {
                    return Err(integrity(format!(
                        "metadata names conversation {}",
                        conversation_id
                    )));
                }
                ConversationMeta {
                    id,
                    created_at,
                    config,
                }
            }
            _ => return Err(integrity("missing metadata record".to_string())),
        };

        let mut events = Vec::new();
        for record in records {
            if record.version() > RECORD_VERSION {
                return Err(integrity(format!(
                    "unsupported record version {}",
                    record.version()
                )));
            }
            match record {
                Record::Event { event, .. } => events.push(event),
                Record::Metadata { .. } => {
                    return Err(integrity("duplicate metadata record".to_string()));
                }
            }
        }

        Ok(StoredConversation { meta, events })
    }

    /// Cut a torn tail off the file so later appends start on a fresh line
    fn repair(&self, id: ConversationId, valid_len: usize) -> Result<()> {
        self.writers.lock().remove(&id);
        let path = self.path_for(id);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(valid_len as u64)?;
        drop(file);

        let bytes = fs::read(&path)?;
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl LogStore for JsonlStore {
    fn create(&self, meta: &ConversationMeta) -> Result<()> {
        let path = self.path_for(meta.id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                IoErrorKind::AlreadyExists => Error::ConversationExists(meta.id),
                _ => Error::Io(e),
            })?;
        self.writers.lock().insert(meta.id, BufWriter::new(file));

        self.write_record(
            meta.id,
            &Record::Metadata {
                version: RECORD_VERSION,
                conversation_id: meta.id,
                created_at: meta.created_at,
                config: meta.config.clone(),
            },
        )
    }

    fn append(&self, event: &Event) -> Result<()> {
        self.write_record(
            event.conversation_id,
            &Record::Event {
                version: RECORD_VERSION,
                event: event.clone(),
            },
        )?;
        if event.is_terminal() {
            // Nothing follows a terminal event in normal operation
            self.writers.lock().remove(&event.conversation_id);
        }
        Ok(())
    }

    fn load(&self, id: ConversationId) -> Result<StoredConversation> {
        self.read_log(id, true)
    }

    fn list(&self) -> Result<Vec<ConversationId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<ConversationId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: ConversationId) -> Result<()> {
        self.writers.lock().remove(&id);
        fs::remove_file(self.path_for(id)).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => Error::ConversationNotFound(id),
            _ => Error::Io(e),
        })
    }
}

/// Logs kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<ConversationId, StoredConversation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn create(&self, meta: &ConversationMeta) -> Result<()> {
        let mut logs = self.logs.lock();
        if logs.contains_key(&meta.id) {
            return Err(Error::ConversationExists(meta.id));
        }
        logs.insert(
            meta.id,
            StoredConversation {
                meta: meta.clone(),
                events: Vec::new(),
            },
        );
        Ok(())
    }

    fn append(&self, event: &Event) -> Result<()> {
        self.logs
            .lock()
            .get_mut(&event.conversation_id)
            .ok_or(Error::ConversationNotFound(event.conversation_id))?
            .events
            .push(event.clone());
        Ok(())
    }

    fn load(&self, id: ConversationId) -> Result<StoredConversation> {
        self.logs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::ConversationNotFound(id))
    }

    fn list(&self) -> Result<Vec<ConversationId>> {
        let mut ids: Vec<_> = self.logs.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: ConversationId) -> Result<()> {
        self.logs
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::ConversationNotFound(id))
    }
}
