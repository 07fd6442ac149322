//! Durable uuid → client id table.
//!
//! Stored as a JSON array:
//!
//! ```json
//! [{"ClientId": 100, "uuid": "9a17008d6bf1445a90116d21bd985b6c"}]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client_id::{is_assignable, ClientId};
use crate::error::{HostError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct MappingRecord {
    #[serde(rename = "ClientId")]
    client_id: ClientId,
    uuid: String,
}

/// In-memory copy of the mapping file. Every insert is written through.
#[derive(Debug)]
pub struct ClientIdMapping {
    path: PathBuf,
    by_uuid: BTreeMap<Uuid, ClientId>,
}

impl ClientIdMapping {
    /// Read the mapping at `path`.
    ///
    /// A missing file is an empty mapping. An unreadable or corrupt file is
    /// also treated as empty: ids will be reassigned, so this is logged as an
    /// error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let by_uuid = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => match serde_json::from_str::<Vec<MappingRecord>>(&text) {
                Ok(records) => collect_records(records),
                Err(err) => {
                    error!(path = %path.display(), %err, "client mapping is corrupt; client ids will be reassigned");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no client mapping yet");
                BTreeMap::new()
            }
            Err(err) => {
                error!(path = %path.display(), %err, "client mapping unreadable; client ids will be reassigned");
                BTreeMap::new()
            }
        };
        info!(path = %path.display(), clients = by_uuid.len(), "client mapping loaded");
        Self { path, by_uuid }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, uuid: &Uuid) -> Option<ClientId> {
        self.by_uuid.get(uuid).copied()
    }

    pub fn contains_id(&self, client_id: ClientId) -> bool {
        self.by_uuid.values().any(|&id| id == client_id)
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    /// All pairs, ordered by uuid.
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, ClientId)> + '_ {
        self.by_uuid.iter().map(|(&uuid, &id)| (uuid, id))
    }

    /// Add a pair and rewrite the file. On failure the pair is not kept.
    pub fn insert(&mut self, uuid: Uuid, client_id: ClientId) -> Result<()> {
        if let Some(existing) = self.get(&uuid) {
            return Err(HostError::UuidConflict {
                uuid,
                client_id: existing,
            });
        }
        self.by_uuid.insert(uuid, client_id);
        if let Err(err) = self.store() {
            self.by_uuid.remove(&uuid);
            return Err(err);
        }
        debug!(%uuid, client_id, "client mapping updated");
        Ok(())
    }

    /// Atomically replace the file with the current table.
    pub fn store(&self) -> Result<()> {
        let records: Vec<MappingRecord> = self
            .by_uuid
            .iter()
            .map(|(uuid, &client_id)| MappingRecord {
                client_id,
                uuid: uuid.simple().to_string(),
            })
            .collect();
        let mut content = serde_json::to_string_pretty(&records)?;
        content.push('\n');
        write_atomic(&self.path, &content).map_err(|source| HostError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}

fn collect_records(records: Vec<MappingRecord>) -> BTreeMap<Uuid, ClientId> {
    let mut by_uuid = BTreeMap::new();
    for record in records {
        let Ok(uuid) = Uuid::try_parse(&record.uuid) else {
            warn!(uuid = %record.uuid, "skipping mapping entry with malformed uuid");
            continue;
        };
        if !is_assignable(record.client_id) {
            warn!(%uuid, client_id = record.client_id, "skipping mapping entry with reserved client id");
            continue;
        }
        if by_uuid.values().any(|&id| id == record.client_id) {
            warn!(%uuid, client_id = record.client_id, "skipping mapping entry with duplicate client id");
            continue;
        }
        by_uuid.entry(uuid).or_insert(record.client_id);
    }
    by_uuid
}

fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
