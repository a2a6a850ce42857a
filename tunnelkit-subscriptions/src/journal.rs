//! Append-only, checksummed JSON-lines journal.
//!
//! Each line is `{"seq":N,"entry":{...},"sha256":"..."}` where the checksum
//! covers the serialized entry. Appends take an exclusive `fs2` lock, write
//! the whole line and `fsync` before returning, so a caller may update its
//! in-memory view only after `append` succeeds.
//!
//! On open the journal is replayed:
//! - a torn or checksum-failing final line is truncated away with a warning
//! - a bad line followed by valid lines is a hard [`SubscriptionError::CorruptJournal`]
//!
//! Compaction rewrites the live state to a temp file, fsyncs it and renames
//! it over the journal.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{Result, SubscriptionError};

#[derive(Serialize)]
struct LineOut<'a, E> {
    seq: u64,
    entry: &'a E,
    sha256: String,
}

#[derive(Deserialize)]
struct LineIn<E> {
    seq: u64,
    entry: E,
    sha256: String,
}

fn checksum<E: Serialize>(entry: &E) -> Result<String> {
    let bytes = serde_json::to_vec(entry)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn encode_line<E: Serialize>(seq: u64, entry: &E) -> Result<Vec<u8>> {
    let line = LineOut {
        seq,
        entry,
        sha256: checksum(entry)?,
    };
    let mut bytes = serde_json::to_vec(&line)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Append-only journal of `E` records.
pub struct Journal<E> {
    path: PathBuf,
    file: File,
    next_seq: u64,
    records: usize,
    _entry: PhantomData<fn() -> E>,
}

struct Replay<E> {
    entries: Vec<E>,
    last_seq: u64,
    /// Byte length of the valid prefix.
    valid_len: u64,
    /// Valid prefix ends without a newline.
    missing_newline: bool,
    torn: Option<(usize, String)>,
}

impl<E> Journal<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Open (or create) a journal and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<E>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        file.lock_exclusive()?;
        let replayed = Self::replay(&path).and_then(|replay| {
            Self::repair_tail(&path, &mut file, &replay)?;
            Ok(replay)
        });
        file.unlock()?;
        let replay = replayed?;

        debug!(
            path = %path.display(),
            records = replay.entries.len(),
            "journal replayed"
        );

        let records = replay.entries.len();
        let journal = Self {
            path,
            file,
            next_seq: replay.last_seq + 1,
            records,
            _entry: PhantomData,
        };
        Ok((journal, replay.entries))
    }

    fn replay(path: &Path) -> Result<Replay<E>> {
        let bytes = fs::read(path)?;
        let mut replay = Replay {
            entries: Vec::new(),
            last_seq: 0,
            valid_len: 0,
            missing_newline: false,
            torn: None,
        };

        let mut start = 0usize;
        let mut line_no = 0usize;
        while start < bytes.len() {
            let (end, next) = match bytes[start..].iter().position(|b| *b == b'\n') {
                Some(offset) => (start + offset, start + offset + 1),
                None => (bytes.len(), bytes.len()),
            };
            line_no += 1;
            let segment = &bytes[start..end];

            if segment.iter().all(u8::is_ascii_whitespace) {
                if replay.torn.is_none() {
                    replay.valid_len = next as u64;
                }
                start = next;
                continue;
            }

            if let Some((bad_line, reason)) = &replay.torn {
                return Err(SubscriptionError::CorruptJournal {
                    path: path.display().to_string(),
                    line: *bad_line,
                    reason: reason.clone(),
                }
                .into());
            }

            match Self::decode_line(segment, replay.last_seq) {
                Ok((seq, entry)) => {
                    replay.entries.push(entry);
                    replay.last_seq = seq;
                    replay.valid_len = next as u64;
                    replay.missing_newline = end == bytes.len();
                }
                Err(reason) => {
                    replay.torn = Some((line_no, reason));
                }
            }
            start = next;
        }

        Ok(replay)
    }

    fn decode_line(segment: &[u8], last_seq: u64) -> std::result::Result<(u64, E), String> {
        let line: LineIn<E> =
            serde_json::from_slice(segment).map_err(|e| format!("unparseable line: {}", e))?;
        let expected = checksum(&line.entry).map_err(|e| e.to_string())?;
        if expected != line.sha256 {
            return Err("checksum mismatch".to_string());
        }
        if line.seq <= last_seq {
            return Err(format!(
                "sequence went backwards ({} after {})",
                line.seq, last_seq
            ));
        }
        Ok((line.seq, line.entry))
    }

    fn repair_tail(path: &Path, file: &mut File, replay: &Replay<E>) -> Result<()> {
        if let Some((line, reason)) = &replay.torn {
            warn!(
                path = %path.display(),
                line,
                reason = %reason,
                "truncating torn journal tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        if replay.missing_newline {
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Durably append one record. Returns its sequence number.
    pub fn append(&mut self, entry: &E) -> Result<u64> {
        let seq = self.next_seq;
        let bytes = encode_line(seq, entry)?;

        self.file.lock_exclusive()?;
        let written = self.write_locked(&bytes);
        self.file.unlock()?;
        written?;

        self.next_seq += 1;
        self.records += 1;
        Ok(seq)
    }

    fn write_locked(&mut self, bytes: &[u8]) -> Result<()> {
        let len_before = self.file.metadata()?.len();
        if let Err(e) = self
            .file
            .write_all(bytes)
            .and_then(|_| self.file.sync_data())
        {
            // Do not leave a partial line for the next append to follow.
            if let Err(trunc) = self.file.set_len(len_before) {
                warn!(path = %self.path.display(), error = %trunc, "failed to roll back partial append");
            }
            return Err(SubscriptionError::Storage(format!(
                "append to {} failed: {}",
                self.path.display(),
                e
            ))
            .into());
        }
        Ok(())
    }

    /// Replace the journal contents with `live`.
    pub fn compact(&mut self, live: &[E]) -> Result<()> {
        let tmp = self.path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            for (i, entry) in live.iter().enumerate() {
                out.write_all(&encode_line(i as u64 + 1, entry)?)?;
            }
            out.sync_all()?;
        }

        self.file.lock_exclusive()?;
        let renamed = fs::rename(&tmp, &self.path);
        self.file.unlock()?;
        renamed?;

        if let Some(parent) = self.path.parent() {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!(error = %e, "directory fsync after compaction failed");
            }
        }

        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        let before = self.records;
        self.next_seq = live.len() as u64 + 1;
        self.records = live.len();

        info!(
            path = %self.path.display(),
            before,
            after = self.records,
            "journal compacted"
        );
        Ok(())
    }

    /// Records currently in the file.
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Keyed journal record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapEntry<K, V> {
    Put { key: K, value: V },
    Delete { key: K },
}

type Keep<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

/// A `HashMap` whose every mutation is journaled first.
///
/// Not synchronized; owners wrap it in a mutex so journal order matches
/// memory order.
pub struct JournaledMap<K, V> {
    journal: Journal<MapEntry<K, V>>,
    map: HashMap<K, V>,
    compact_threshold: usize,
    keep: Option<Keep<V>>,
}

impl<K, V> JournaledMap<K, V>
where
    K: Eq + Hash + Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Open and replay the map stored at `path`.
    pub fn open(path: impl Into<PathBuf>, compact_threshold: usize) -> Result<Self> {
        let (journal, entries) = Journal::open(path)?;
        let mut map = HashMap::new();
        for entry in entries {
            match entry {
                MapEntry::Put { key, value } => {
                    map.insert(key, value);
                }
                MapEntry::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(Self {
            journal,
            map,
            compact_threshold,
            keep: None,
        })
    }

    /// Drop values failing `keep` whenever the map is compacted.
    pub fn with_retention(mut self, keep: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        self.keep = Some(Box::new(keep));
        self
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Journal then store `value` under `key`.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.journal.append(&MapEntry::Put {
            key: key.clone(),
            value: value.clone(),
        })?;
        self.map.insert(key, value);
        self.maybe_compact()
    }

    /// Journal then remove `key`. Absent keys are not journaled.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        if !self.map.contains_key(key) {
            return Ok(None);
        }
        self.journal.append(&MapEntry::Delete { key: key.clone() })?;
        let removed = self.map.remove(key);
        self.maybe_compact()?;
        Ok(removed)
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.journal.records() > self.map.len() + self.compact_threshold {
            self.compact()?;
        }
        Ok(())
    }

    /// Apply retention and rewrite the journal as one `Put` per live key.
    pub fn compact(&mut self) -> Result<()> {
        if let Some(keep) = &self.keep {
            self.map.retain(|_, value| keep(value));
        }
        let mut keys: Vec<&K> = self.map.keys().collect();
        keys.sort();
        let live: Vec<MapEntry<K, V>> = keys
            .into_iter()
            .filter_map(|key| {
                self.map.get(key).map(|value| MapEntry::Put {
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        self.journal.compact(&live)
    }

    /// Records currently in the journal file.
    pub fn journal_records(&self) -> usize {
        self.journal.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    fn note(id: u32, text: &str) -> Note {
        Note {
            id,
            text: text.to_string(),
        }
    }

    fn read(path: &Path) -> String {
        let mut contents = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        contents
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.jsonl");

        {
            let (mut journal, entries) = Journal::<Note>::open(&path).unwrap();
            assert!(entries.is_empty());
            assert_eq!(journal.append(&note(1, "a")).unwrap(), 1);
            assert_eq!(journal.append(&note(2, "b")).unwrap(), 2);
        }

        let (mut journal, entries) = Journal::<Note>::open(&path).unwrap();
        assert_eq!(entries, vec![note(1, "a"), note(2, "b")]);
        assert_eq!(journal.append(&note(3, "c")).unwrap(), 3);
        assert_eq!(read(&path).lines().count(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.jsonl");
        {
            let (mut journal, _) = Journal::<Note>::open(&path).unwrap();
            journal.append(&note(1, "a")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"seq":2,"entry":{"id":2,"te"#).unwrap();
        drop(file);

        let (mut journal, entries) = Journal::<Note>::open(&path).unwrap();
        assert_eq!(entries, vec![note(1, "a")]);
        journal.append(&note(2, "b")).unwrap();
        drop(journal);

        let (_, entries) = Journal::<Note>::open(&path).unwrap();
        assert_eq!(entries, vec![note(1, "a"), note(2, "b")]);
    }

    #[test]
    fn test_checksum_mismatch_in_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.jsonl");
        {
            let (mut journal, _) = Journal::<Note>::open(&path).unwrap();
            journal.append(&note(1, "a")).unwrap();
            journal.append(&note(2, "b")).unwrap();
        }
        let tampered = read(&path).replace(r#""text":"b""#, r#""text":"x""#);
        fs::write(&path, tampered).unwrap();

        let (_, entries) = Journal::<Note>::open(&path).unwrap();
        assert_eq!(entries, vec![note(1, "a")]);
    }

    #[test]
    fn test_corruption_before_valid_lines_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.jsonl");
        {
            let (mut journal, _) = Journal::<Note>::open(&path).unwrap();
            journal.append(&note(1, "a")).unwrap();
            journal.append(&note(2, "b")).unwrap();
        }
        let tampered = read(&path).replace(r#""text":"a""#, r#""text":"z""#);
        fs::write(&path, tampered).unwrap();

        let err = Journal::<Note>::open(&path).err().unwrap();
        match err.downcast_ref::<SubscriptionError>() {
            Some(SubscriptionError::CorruptJournal { line, .. }) => assert_eq!(*line, 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_valid_line_without_newline_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.jsonl");
        {
            let (mut journal, _) = Journal::<Note>::open(&path).unwrap();
            journal.append(&note(1, "a")).unwrap();
        }
        let trimmed = read(&path).trim_end().to_string();
        fs::write(&path, trimmed).unwrap();

        let (mut journal, entries) = Journal::<Note>::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        journal.append(&note(2, "b")).unwrap();
        drop(journal);
        let (_, entries) = Journal::<Note>::open(&path).unwrap();
        assert_eq!(entries, vec![note(1, "a"), note(2, "b")]);
    }

    #[test]
    fn test_map_replays_puts_and_deletes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.jsonl");
        {
            let mut map = JournaledMap::<String, u32>::open(&path, 100).unwrap();
            map.insert("a".into(), 1).unwrap();
            map.insert("b".into(), 2).unwrap();
            map.insert("a".into(), 3).unwrap();
            assert_eq!(map.remove(&"b".to_string()).unwrap(), Some(2));
            assert_eq!(map.remove(&"missing".to_string()).unwrap(), None);
        }
        let map = JournaledMap::<String, u32>::open(&path, 100).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"a".to_string()), Some(&3));
        assert_eq!(map.journal_records(), 4);
    }

    #[test]
    fn test_map_compacts_past_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.jsonl");
        let mut map = JournaledMap::<u32, u32>::open(&path, 5).unwrap();
        for round in 0..10u32 {
            map.insert(1, round).unwrap();
        }
        assert!(map.journal_records() <= 6);
        drop(map);

        let map = JournaledMap::<u32, u32>::open(&path, 5).unwrap();
        assert_eq!(map.get(&1), Some(&9));
    }

    #[test]
    fn test_retention_applies_on_compaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.jsonl");
        let mut map = JournaledMap::<u32, u32>::open(&path, 1000)
            .unwrap()
            .with_retention(|value| *value % 2 == 0);
        for i in 0..6u32 {
            map.insert(i, i).unwrap();
        }
        map.compact().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.journal_records(), 3);
        drop(map);

        let map = JournaledMap::<u32, u32>::open(&path, 1000).unwrap();
        let mut values: Vec<u32> = map.values().copied().collect();
        values.sort();
        assert_eq!(values, vec![0, 2, 4]);
    }
}
