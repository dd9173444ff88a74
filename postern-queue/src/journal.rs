//! Append-only write-ahead journal, one per channel.
//!
//! Layout: the magic `PQJ1`, then frames of `[u32 LE length][bincode record]`.
//! Replay applies records in order; a torn or corrupt tail is cut back to the
//! last complete frame.

use std::path::{Path, PathBuf};

use postern_common::internal;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{
    error::PersistError,
    message::{DeadLetterReason, Message},
    types::MessageId,
};

pub const MAGIC: &[u8; 4] = b"PQJ1";
const FRAME_HEADER: usize = 4;

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Put(Message),
    Claim {
        id: MessageId,
        attempts: u32,
        deadline: u64,
    },
    Release {
        id: MessageId,
        visible_at: u64,
        retry_started_at: Option<u64>,
    },
    Ack {
        id: MessageId,
    },
    DeadLetter {
        id: MessageId,
        reason: DeadLetterReason,
    },
}

impl Record {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Put(_) => "PUT",
            Self::Claim { .. } => "CLAIM",
            Self::Release { .. } => "RELEASE",
            Self::Ack { .. } => "ACK",
            Self::DeadLetter { .. } => "DEAD",
        }
    }
}

fn encode_frame(record: &Record, out: &mut Vec<u8>) -> Result<(), PersistError> {
    let body = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let len = u32::try_from(body.len()).map_err(|_| PersistError::Corrupt {
        path: PathBuf::new(),
        reason: format!("record of {} bytes does not fit a frame", body.len()),
    })?;

    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Decode every complete frame after the magic.
///
/// Returns the records and the byte length of the valid prefix.
fn decode_frames(bytes: &[u8]) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut offset = MAGIC.len();

    while let Some(header) = bytes.get(offset..offset + FRAME_HEADER) {
        let mut len = [0u8; FRAME_HEADER];
        len.copy_from_slice(header);
        let len = u32::from_le_bytes(len) as usize;

        let start = offset + FRAME_HEADER;
        let Some(body) = bytes.get(start..start + len) else {
            break;
        };

        match bincode::serde::decode_from_slice::<Record, _>(body, bincode::config::standard()) {
            Ok((record, read)) if read == len => records.push(record),
            _ => break,
        }

        offset = start + len;
    }

    (records, offset)
}

#[derive(Debug, Clone, Copy)]
pub struct Mark {
    bytes: usize,
    puts: usize,
    records: usize,
}

pub struct Journal {
    path: PathBuf,
    file: File,
    /// Bytes known to be on disk.
    len: u64,
    /// Encoded records not yet written.
    pending: Vec<u8>,
    pending_puts: usize,
    /// Records in the file plus pending ones.
    records: usize,
    trace: bool,
}

impl Journal {
    pub fn path_for(root: &Path, channel: &str) -> PathBuf {
        root.join(format!("{channel}.journal"))
    }

    /// Open or create the journal at `path`, returning the records to replay.
    ///
    /// # Errors
    /// I/O failures, or a file that is not a journal at all
    pub async fn open(path: PathBuf, trace: bool) -> Result<(Self, Vec<Record>), PersistError> {
        let exists = fs::try_exists(&path)
            .await
            .map_err(PersistError::io(&path))?;

        if !exists {
            write_synced(&path, MAGIC).await?;
        }

        let bytes = fs::read(&path).await.map_err(PersistError::io(&path))?;
        if !bytes.starts_with(MAGIC) {
            return Err(PersistError::Corrupt {
                path,
                reason: "missing journal header".to_string(),
            });
        }

        let (records, valid) = decode_frames(&bytes);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(PersistError::io(&path))?;

        if valid < bytes.len() {
            internal!(
                level = WARN,
                "Journal {} has {} trailing bytes that do not form a record, truncating",
                path.display(),
                bytes.len() - valid
            );
            file.set_len(valid as u64)
                .await
                .map_err(PersistError::io(&path))?;
            file.sync_all().await.map_err(PersistError::io(&path))?;
        }

        let journal = Self {
            path,
            file,
            len: valid as u64,
            pending: Vec::new(),
            pending_puts: 0,
            records: records.len(),
            trace,
        };

        Ok((journal, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position to roll back to with [`Journal::discard_from`].
    pub const fn mark(&self) -> Mark {
        Mark {
            bytes: self.pending.len(),
            puts: self.pending_puts,
            records: self.records,
        }
    }

    /// Buffer a record.
    ///
    /// # Errors
    /// If the record cannot be encoded
    pub fn append(&mut self, record: &Record) -> Result<(), PersistError> {
        encode_frame(record, &mut self.pending)?;
        self.records += 1;
        if matches!(record, Record::Put(_)) {
            self.pending_puts += 1;
        }

        if self.trace {
            tracing::debug!(journal = %self.path.display(), "{} {record:?}", record.kind());
        }

        Ok(())
    }

    /// Drop records buffered after `mark`.
    pub fn discard_from(&mut self, mark: Mark) {
        if self.pending.len() > mark.bytes {
            self.pending.truncate(mark.bytes);
            self.pending_puts = mark.puts;
            self.records = mark.records;
        }
    }

    pub const fn pending_puts(&self) -> usize {
        self.pending_puts
    }

    pub const fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub const fn records(&self) -> usize {
        self.records
    }

    /// Write and sync everything buffered.
    ///
    /// On failure the file is cut back to its last synced length and the
    /// buffer is kept for the next attempt.
    ///
    /// # Errors
    /// If the write or sync fails
    pub async fn commit(&mut self) -> Result<(), PersistError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let written = async {
            self.file.write_all(&self.pending).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;

        if let Err(source) = written {
            if let Err(err) = self.file.set_len(self.len).await {
                internal!(
                    level = ERROR,
                    "Failed to roll back journal {}: {err}",
                    self.path.display()
                );
            }

            return Err(PersistError::Io {
                path: self.path.clone(),
                source,
            });
        }

        self.len += self.pending.len() as u64;
        self.pending.clear();
        self.pending_puts = 0;
        Ok(())
    }

    /// Replace the journal with one `Put` per retained message.
    ///
    /// # Errors
    /// If the new journal cannot be written; the old one stays in place
    pub async fn rewrite<'a>(
        &mut self,
        messages: impl Iterator<Item = &'a Message>,
    ) -> Result<(), PersistError> {
        let mut bytes = MAGIC.to_vec();
        let mut count = 0;
        for message in messages {
            encode_frame(&Record::Put(message.clone()), &mut bytes)?;
            count += 1;
        }

        let temp = self.path.with_extension("journal.tmp");
        write_synced(&temp, &bytes).await?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(PersistError::io(&self.path))?;
        sync_parent(&self.path).await?;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(PersistError::io(&self.path))?;
        self.len = bytes.len() as u64;
        self.pending.clear();
        self.pending_puts = 0;
        self.records = count;

        internal!(
            level = DEBUG,
            "Compacted journal {} to {count} records",
            self.path.display()
        );
        Ok(())
    }
}

/// Create or replace `path` with `bytes` and sync it.
pub async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let mut file = File::create(path).await.map_err(PersistError::io(path))?;
    file.write_all(bytes).await.map_err(PersistError::io(path))?;
    file.flush().await.map_err(PersistError::io(path))?;
    file.sync_all().await.map_err(PersistError::io(path))
}

/// Write `bytes` next to `path` and rename it into place.
pub async fn replace_atomically(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let temp = path.with_extension("tmp");
    write_synced(&temp, bytes).await?;
    fs::rename(&temp, path)
        .await
        .map_err(PersistError::io(path))?;
    sync_parent(path).await
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<(), PersistError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    let dir = File::open(parent).await.map_err(PersistError::io(parent))?;
    dir.sync_all().await.map_err(PersistError::io(parent))
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn sync_parent(_path: &Path) -> Result<(), PersistError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use postern_common::envelope::Envelope;
    use pretty_assertions::assert_eq;

    use super::*;

    fn message(n: u8) -> Message {
        Message::new(
            MessageId::generate(),
            "delivery".to_string(),
            Envelope::new("a@example.org".into(), vec!["b@example.net".into()]),
            Arc::from(vec![n; 16]),
            1_000,
        )
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = Journal::path_for(dir.path(), "delivery");

        let m = message(1);
        let claim = Record::Claim {
            id: m.id,
            attempts: 1,
            deadline: 5_000,
        };

        {
            let (mut journal, replay) = Journal::open(path.clone(), false).await.unwrap();
            assert!(replay.is_empty());

            journal.append(&Record::Put(m.clone())).unwrap();
            journal.append(&claim).unwrap();
            assert_eq!(journal.pending_puts(), 1);
            journal.commit().await.unwrap();
            assert!(!journal.has_pending());
        }

        let (journal, replay) = Journal::open(path, false).await.unwrap();
        assert_eq!(replay, vec![Record::Put(m), claim]);
        assert_eq!(journal.records(), 2);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = Journal::path_for(dir.path(), "delivery");

        let m = message(2);
        {
            let (mut journal, _) = Journal::open(path.clone(), false).await.unwrap();
            journal.append(&Record::Put(m.clone())).unwrap();
            journal.commit().await.unwrap();
        }

        let good_len = fs::metadata(&path).await.unwrap().len();
        let mut bytes = fs::read(&path).await.unwrap();
        bytes.extend_from_slice(&[200, 0, 0, 0, 1, 2, 3]);
        fs::write(&path, &bytes).await.unwrap();

        let (_, replay) = Journal::open(path.clone(), false).await.unwrap();
        assert_eq!(replay, vec![Record::Put(m)]);
        assert_eq!(fs::metadata(&path).await.unwrap().len(), good_len);
    }

    #[tokio::test]
    async fn rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Journal::path_for(dir.path(), "delivery");
        fs::write(&path, b"hello world").await.unwrap();

        let err = Journal::open(path, false).await.err().unwrap();
        assert!(matches!(err, PersistError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn discarded_records_are_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = Journal::path_for(dir.path(), "delivery");

        let kept = message(3);
        {
            let (mut journal, _) = Journal::open(path.clone(), false).await.unwrap();
            journal.append(&Record::Put(kept.clone())).unwrap();

            let mark = journal.mark();
            journal.append(&Record::Put(message(4))).unwrap();
            journal.discard_from(mark);
            assert_eq!(journal.pending_puts(), 1);

            journal.commit().await.unwrap();
        }

        let (_, replay) = Journal::open(path, false).await.unwrap();
        assert_eq!(replay, vec![Record::Put(kept)]);
    }

    #[tokio::test]
    async fn rewrite_keeps_only_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = Journal::path_for(dir.path(), "delivery");

        let first = message(5);
        let second = message(6);
        {
            let (mut journal, _) = Journal::open(path.clone(), false).await.unwrap();
            journal.append(&Record::Put(first.clone())).unwrap();
            journal.append(&Record::Put(second.clone())).unwrap();
            journal.append(&Record::Ack { id: first.id }).unwrap();
            journal.commit().await.unwrap();

            journal.rewrite([&second].into_iter()).await.unwrap();
            assert_eq!(journal.records(), 1);

            journal.append(&Record::Ack { id: second.id }).unwrap();
            journal.commit().await.unwrap();
        }

        let (_, replay) = Journal::open(path, false).await.unwrap();
        assert_eq!(
            replay,
            vec![Record::Put(second.clone()), Record::Ack { id: second.id }]
        );
    }
}
