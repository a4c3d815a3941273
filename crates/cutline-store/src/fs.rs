//! Directory-per-snapshot implementation of the SnapshotSink trait.
//!
//! Layout under the sink root:
//!
//! ```text
//! <root>/
//!   <seq>_<snapshot id hex>/
//!     meta.cbor                     id, initiator, senders in index order
//!     state.cbor                    captured state (absent if none)
//!     links.cbor                    peers linked when the record was created
//!     sender_<k>_message_<n>.cbor   n-th in-transit message from sender k
//! ```
//!
//! `seq` increases with every persisted snapshot and gives the completion
//! order. A snapshot directory is written under a `.tmp` name and renamed
//! into place, so a listing never observes a half-written snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cutline_core::{codec, Endpoint, SnapshotId, SnapshotRecord};

use crate::error::{Result, StoreError};
use crate::traits::SnapshotSink;

const META_FILE: &str = "meta.cbor";
const STATE_FILE: &str = "state.cbor";
const LINKS_FILE: &str = "links.cbor";
const SENDER_PREFIX: &str = "sender_";
const MESSAGE_MARKER: &str = "_message_";
const EXTENSION: &str = ".cbor";
const TMP_SUFFIX: &str = ".tmp";

/// Per-snapshot metadata file.
#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    id: SnapshotId,
    initiator: Endpoint,
    /// Senders with logged messages; the position is the `k` in the
    /// message file names.
    senders: Vec<Endpoint>,
}

/// Filesystem sink.
///
/// Each operation runs on the blocking pool. Writers are serialized so
/// sequence numbers stay unique.
pub struct FileSink {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileSink {
    /// Create a sink rooted at `root`. The directory is created on first
    /// persist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The sink root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Parse a snapshot directory name `<seq>_<hex>`.
fn parse_dir_name(name: &str) -> Option<(u64, SnapshotId)> {
    if name.ends_with(TMP_SUFFIX) {
        return None;
    }
    let (seq, hex) = name.split_once('_')?;
    Some((seq.parse().ok()?, SnapshotId::from_hex(hex).ok()?))
}

/// All snapshot directories under `root`, ordered by sequence number.
fn scan(root: &Path) -> Result<Vec<(u64, SnapshotId, PathBuf)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some((seq, id)) = name.to_str().and_then(parse_dir_name) {
            found.push((seq, id, entry.path()));
        }
    }
    found.sort_by_key(|(seq, _, _)| *seq);
    Ok(found)
}

fn message_file_name(sender: usize, n: usize) -> String {
    format!("{SENDER_PREFIX}{sender}{MESSAGE_MARKER}{n}{EXTENSION}")
}

/// Parse `sender_<k>_message_<n>.cbor` into `(k, n)`.
fn parse_message_file_name(name: &str) -> Option<(usize, usize)> {
    let rest = name.strip_prefix(SENDER_PREFIX)?.strip_suffix(EXTENSION)?;
    let (k, n) = rest.split_once(MESSAGE_MARKER)?;
    Some((k.parse().ok()?, n.parse().ok()?))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)?;
    Ok(())
}

fn write_record(root: &Path, record: &SnapshotRecord) -> Result<PathBuf> {
    fs::create_dir_all(root)?;

    let existing = scan(root)?;
    if existing.iter().any(|(_, id, _)| *id == record.id) {
        return Err(StoreError::AlreadyExists(record.id));
    }
    let seq = existing.last().map(|(seq, _, _)| seq + 1).unwrap_or(1);

    let final_dir = root.join(format!("{}_{}", seq, record.id.to_hex()));
    let tmp_dir = root.join(format!("{}_{}{}", seq, record.id.to_hex(), TMP_SUFFIX));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir(&tmp_dir)?;

    let mut senders = Vec::with_capacity(record.messages.len());
    for (k, (sender, payloads)) in record.messages.iter().enumerate() {
        senders.push(sender.clone());
        for (i, payload) in payloads.iter().enumerate() {
            write_file(&tmp_dir.join(message_file_name(k, i + 1)), payload)?;
        }
    }

    let meta = Meta {
        id: record.id,
        initiator: record.initiator.clone(),
        senders,
    };
    write_file(&tmp_dir.join(META_FILE), &codec::encode(&meta)?)?;
    write_file(&tmp_dir.join(LINKS_FILE), &codec::encode(&record.links)?)?;
    if let Some(state) = &record.state {
        write_file(&tmp_dir.join(STATE_FILE), state)?;
    }

    fs::rename(&tmp_dir, &final_dir)?;
    Ok(final_dir)
}

fn read_record(dir: &Path) -> Result<SnapshotRecord> {
    let meta: Meta = codec::decode(&fs::read(dir.join(META_FILE))?)?;
    let links: Vec<Endpoint> = codec::decode(&fs::read(dir.join(LINKS_FILE))?)?;

    let state_path = dir.join(STATE_FILE);
    let state = if state_path.exists() {
        Some(Bytes::from(fs::read(state_path)?))
    } else {
        None
    };

    let mut indexed: BTreeMap<Endpoint, Vec<(usize, Bytes)>> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(SENDER_PREFIX) {
            continue;
        }
        let (k, index) = parse_message_file_name(name)
            .ok_or_else(|| StoreError::InvalidData(format!("bad message file name {name}")))?;
        let sender = meta
            .senders
            .get(k)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown sender index {k}")))?;
        let payload = Bytes::from(fs::read(entry.path())?);
        indexed.entry(sender.clone()).or_default().push((index, payload));
    }

    let mut record = SnapshotRecord::new(meta.id, meta.initiator, state, links);
    for (sender, mut payloads) in indexed {
        payloads.sort_by_key(|(index, _)| *index);
        for (_, payload) in payloads {
            record.log_message(&sender, payload);
        }
    }
    Ok(record)
}

#[async_trait]
impl SnapshotSink for FileSink {
    async fn persist(&self, record: &SnapshotRecord) -> Result<()> {
        let root = self.root.clone();
        let record = record.clone();
        let lock = Arc::clone(&self.write_lock);

        let dir = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            write_record(&root, &record)
        })
        .await??;

        tracing::debug!(dir = %dir.display(), "snapshot written");
        Ok(())
    }

    async fn load(&self, id: SnapshotId) -> Result<Option<SnapshotRecord>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<SnapshotRecord>> {
            match scan(&root)?.into_iter().find(|(_, found, _)| *found == id) {
                Some((_, _, dir)) => read_record(&dir).map(Some),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn list(&self) -> Result<Vec<SnapshotId>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<SnapshotId>> {
            Ok(scan(&root)?.into_iter().map(|(_, id, _)| id).collect())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutline_core::encode;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("localhost", port)
    }

    fn record(counter: u64) -> SnapshotRecord {
        let mut r = SnapshotRecord::new(
            SnapshotId::derive(&ep(1), counter),
            ep(1),
            Some(encode(&format!("state-{counter}")).unwrap()),
            vec![ep(2), ep(3)],
        );
        for i in 0..12u32 {
            r.log_message(&ep(2), encode(&i).unwrap());
        }
        r.log_message(&ep(3), encode("from three").unwrap());
        r
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("node"));
        let r = record(0);

        sink.persist(&r).await.unwrap();
        let loaded = sink.load(r.id).await.unwrap().unwrap();

        // 12 messages from one sender: file order "10" < "2" must not leak
        // into message order.
        assert_eq!(loaded, r);
    }

    #[tokio::test]
    async fn test_layout_one_file_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        let r = record(0);
        sink.persist(&r).await.unwrap();

        let snap_dir = dir.path().join(format!("1_{}", r.id.to_hex()));
        assert!(snap_dir.join(META_FILE).exists());
        assert!(snap_dir.join(STATE_FILE).exists());
        assert!(snap_dir.join(LINKS_FILE).exists());
        assert!(snap_dir.join("sender_0_message_1.cbor").exists());
        assert!(snap_dir.join("sender_0_message_12.cbor").exists());
        assert!(snap_dir.join("sender_1_message_1.cbor").exists());
    }

    #[tokio::test]
    async fn test_hosts_differing_in_punctuation_keep_their_messages() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        let underscore = Endpoint::new("node_a", 9000);
        let dash = Endpoint::new("node-a", 9000);

        let mut r = SnapshotRecord::new(
            SnapshotId(7),
            ep(1),
            None,
            vec![underscore.clone(), dash.clone()],
        );
        r.log_message(&underscore, encode("underscore").unwrap());
        r.log_message(&dash, encode("dash").unwrap());
        r.log_message(&dash, encode("dash again").unwrap());

        sink.persist(&r).await.unwrap();
        let loaded = sink.load(r.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages_from(&underscore).len(), 1);
        assert_eq!(loaded.messages_from(&dash).len(), 2);
        assert_eq!(loaded, r);
    }

    #[tokio::test]
    async fn test_record_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        let r = SnapshotRecord::new(SnapshotId(9), ep(1), None, vec![]);

        sink.persist(&r).await.unwrap();
        assert_eq!(sink.load(r.id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn test_list_in_persist_order_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        assert!(sink.list().await.unwrap().is_empty());

        let ids: Vec<_> = (0..3).map(|c| record(c).id).collect();
        for c in [0, 1, 2] {
            sink.persist(&record(c)).await.unwrap();
        }

        assert_eq!(sink.list().await.unwrap(), ids);
        assert_eq!(sink.latest().await.unwrap().unwrap().id, ids[2]);
    }

    #[tokio::test]
    async fn test_persist_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        sink.persist(&record(0)).await.unwrap();

        let err = sink.persist(&record(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_leftover_tmp_dir_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("1_00000000000000aa.tmp")).unwrap();

        let sink = FileSink::new(dir.path());
        assert!(sink.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_dir_name() {
        assert_eq!(
            parse_dir_name("3_00000000000000ff"),
            Some((3, SnapshotId(0xff)))
        );
        assert_eq!(parse_dir_name("3_00000000000000ff.tmp"), None);
        assert_eq!(parse_dir_name("junk"), None);
    }

    #[test]
    fn test_parse_message_file_name() {
        assert_eq!(
            parse_message_file_name(&message_file_name(3, 12)),
            Some((3, 12))
        );
        assert_eq!(parse_message_file_name("sender_x_message_1.cbor"), None);
        assert_eq!(parse_message_file_name("sender_1_message_1.tmp"), None);
    }
}
