use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nimbus_types::error::Result;
use nimbus_types::ObjectId;

use super::ObjectRecord;

const LOG_FILE: &str = "objects.log";
const SNAPSHOT_FILE: &str = "objects.snap";

/// One mutation of the object table, appended to the on-disk log so the
/// table survives unclean shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecord {
    Insert {
        id: ObjectId,
        stored_size: u64,
        created_at: u64,
    },
    Retain {
        id: ObjectId,
    },
    Release {
        id: ObjectId,
    },
    Remove {
        id: ObjectId,
    },
}

/// Durable backing for the object table: a msgpack append log plus a
/// periodic full snapshot. Recovery loads the snapshot and replays the log;
/// a torn trailing record (crash mid-append) ends the replay.
pub struct TableLog {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl TableLog {
    /// Open the log in `dir`, recovering the table state from the snapshot
    /// and any log records appended since.
    pub fn open(dir: &Path) -> Result<(HashMap<ObjectId, ObjectRecord>, TableLog)> {
        std::fs::create_dir_all(dir)?;

        let mut table: HashMap<ObjectId, ObjectRecord> =
            match File::open(dir.join(SNAPSHOT_FILE)) {
                Ok(f) => rmp_serde::from_read(BufReader::new(f))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(e) => return Err(e.into()),
            };

        let log_path = dir.join(LOG_FILE);
        match File::open(&log_path) {
            Ok(f) => {
                let mut reader = BufReader::new(f);
                let mut replayed = 0u64;
                loop {
                    match rmp_serde::from_read::<_, LogRecord>(&mut reader) {
                        Ok(record) => {
                            apply(&mut table, record);
                            replayed += 1;
                        }
                        // EOF, or a partial record from a crash mid-append.
                        Err(_) => break,
                    }
                }
                if replayed > 0 {
                    debug!(replayed, "replayed object-table log");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?,
        );
        Ok((table, TableLog { dir: dir.to_path_buf(), writer }))
    }

    /// Append one record. Not durable until `commit`.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        rmp_serde::encode::write(&mut self.writer, record)?;
        Ok(())
    }

    /// Flush and fsync everything appended so far.
    pub fn commit(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Write a full snapshot of `table` and truncate the log. The snapshot
    /// replaces its predecessor atomically, so a crash at any point leaves
    /// a recoverable pair.
    pub fn snapshot(&mut self, table: &HashMap<ObjectId, ObjectRecord>) -> Result<()> {
        self.commit()?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        rmp_serde::encode::write(&mut tmp, table)?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| e.error)?;

        // Log contents are now folded into the snapshot; start fresh.
        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(LOG_FILE))?;
        log.sync_data()?;
        self.writer = BufWriter::new(log);
        debug!(records = table.len(), "object-table snapshot written");
        Ok(())
    }
}

fn apply(table: &mut HashMap<ObjectId, ObjectRecord>, record: LogRecord) {
    match record {
        LogRecord::Insert {
            id,
            stored_size,
            created_at,
        } => {
            table.insert(
                id,
                ObjectRecord {
                    refcount: 1,
                    stored_size,
                    created_at,
                },
            );
        }
        LogRecord::Retain { id } => match table.get_mut(&id) {
            Some(rec) => rec.refcount += 1,
            None => warn!(object = %id, "log replay: retain of unknown object"),
        },
        LogRecord::Release { id } => match table.get_mut(&id) {
            Some(rec) if rec.refcount > 0 => rec.refcount -= 1,
            _ => warn!(object = %id, "log replay: release of unreferenced object"),
        },
        LogRecord::Remove { id } => {
            table.remove(&id);
        }
    }
}
