//! On-disk corpus and crash stores.
//!
//! Each retained input is stored as `id_<n>_<hash>` holding the input JSON,
//! next to a hidden `.id_<n>_<hash>.metadata` file. Crashes are stored as
//! `id_<n>_<hash>` holding a [CrashRecord]. Files are written to a temporary
//! file first and renamed into place.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use libafl::prelude::Input;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{coverage_map::EdgeDelta, error::CorpusIoError, intent_input::IntentInput};

/// How an entry was found.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CorpusMetadata {
    /// Number of executions of the session when the entry was found.
    pub generation: u64,
    /// Name of the corpus entry (or seed) it was mutated from.
    pub parent: Option<String>,
    /// Mutators applied to the parent, in order.
    pub mutations: Vec<String>,
    /// Coverage the entry added when it was found.
    pub coverage_delta: Vec<EdgeDelta>,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CorpusEntry {
    pub name: String,
    pub input: IntentInput,
    pub metadata: CorpusMetadata,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrashKind {
    /// The target process died.
    Crash,
    /// The target did not go idle in time.
    Hang,
}

/// An input that crashed or hung the target, with the evidence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CrashRecord {
    pub input: IntentInput,
    pub kind: CrashKind,
    /// `java`, `native`, `native-agent`, `process-death` or `hang`.
    pub classification: String,
    pub log_excerpt: Option<String>,
    pub parent: Option<String>,
    pub mutations: Vec<String>,
    /// Shell command reproducing the delivery.
    pub replay_command: String,
    pub timestamp: u64,
}

impl CrashRecord {
    pub fn new(
        input: IntentInput,
        kind: CrashKind,
        classification: &str,
        log_excerpt: Option<String>,
        parent: Option<String>,
        mutations: Vec<String>,
    ) -> Self {
        Self {
            replay_command: input.shell_command(),
            input,
            kind,
            classification: classification.to_owned(),
            log_excerpt,
            parent,
            mutations,
            timestamp: unix_timestamp(),
        }
    }
}

/// The retained inputs of a session, in discovery order.
#[derive(Debug)]
pub struct CorpusStore {
    dir: PathBuf,
    entries: Vec<CorpusEntry>,
}

impl CorpusStore {
    /// Opens (and creates) the corpus directory, loading every stored entry.
    pub fn open(dir: &Path) -> Result<Self, CorpusIoError> {
        fs::create_dir_all(dir).map_err(|e| CorpusIoError::io(dir, e))?;

        let mut entries = Vec::new();
        for (name, path) in stored_entries(dir)? {
            let input = IntentInput::from_json(&read(&path)?)
                .map_err(|e| CorpusIoError::serde(&path, e))?;

            let metadata_path = metadata_path(dir, &name);
            let metadata = if metadata_path.exists() {
                serde_json::from_slice(&read(&metadata_path)?)
                    .map_err(|e| CorpusIoError::serde(&metadata_path, e))?
            } else {
                warn!(
                    "Corpus entry {} has no metadata, its coverage is not restored",
                    name
                );
                CorpusMetadata {
                    generation: 0,
                    parent: None,
                    mutations: Vec::new(),
                    coverage_delta: Vec::new(),
                    timestamp: 0,
                }
            };

            entries.push(CorpusEntry {
                name,
                input,
                metadata,
            });
        }

        if !entries.is_empty() {
            info!("Loaded {} corpus entries from {}", entries.len(), dir.display());
        }

        Ok(Self {
            dir: dir.to_owned(),
            entries,
        })
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&CorpusEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists a new entry. The entry is on disk before this returns.
    pub fn add(
        &mut self,
        input: IntentInput,
        metadata: CorpusMetadata,
    ) -> Result<&CorpusEntry, CorpusIoError> {
        let name = input.generate_name(next_index(&self.dir, self.entries.len())?);

        let input_json = input
            .to_json()
            .map_err(|e| CorpusIoError::serde(self.dir.join(&name), e))?;
        let metadata_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| CorpusIoError::serde(metadata_path(&self.dir, &name), e))?;

        // Metadata first, so a visible entry always has it.
        write_atomically(&self.dir, &metadata_path(&self.dir, &name), &metadata_json)?;
        write_atomically(&self.dir, &self.dir.join(&name), &input_json)?;
        debug!("Stored corpus entry {}", name);

        self.entries.push(CorpusEntry {
            name,
            input,
            metadata,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }
}

/// The crash records of a session.
#[derive(Debug)]
pub struct CrashStore {
    dir: PathBuf,
    records: Vec<(String, CrashRecord)>,
}

impl CrashStore {
    pub fn open(dir: &Path) -> Result<Self, CorpusIoError> {
        fs::create_dir_all(dir).map_err(|e| CorpusIoError::io(dir, e))?;

        let mut records = Vec::new();
        for (name, path) in stored_entries(dir)? {
            let record: CrashRecord =
                serde_json::from_slice(&read(&path)?).map_err(|e| CorpusIoError::serde(&path, e))?;
            records.push((name, record));
        }

        if !records.is_empty() {
            info!("Loaded {} crash records from {}", records.len(), dir.display());
        }

        Ok(Self {
            dir: dir.to_owned(),
            records,
        })
    }

    pub fn records(&self) -> &[(String, CrashRecord)] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of stored records of the given kind.
    pub fn count(&self, kind: CrashKind) -> usize {
        self.records.iter().filter(|(_, r)| r.kind == kind).count()
    }

    /// Persists a record and returns its path.
    pub fn add(&mut self, record: CrashRecord) -> Result<PathBuf, CorpusIoError> {
        let name = record
            .input
            .generate_name(next_index(&self.dir, self.records.len())?);
        let path = self.dir.join(&name);

        let json = serde_json::to_vec_pretty(&record).map_err(|e| CorpusIoError::serde(&path, e))?;
        write_atomically(&self.dir, &path, &json)?;

        self.records.push((name, record));
        Ok(path)
    }
}

/// Loads the inputs to replay from a corpus or crashes directory, in stored
/// order. Both plain inputs and crash records are accepted; other files are
/// skipped.
pub fn load_replay_inputs(dir: &Path) -> Result<Vec<(String, IntentInput)>, CorpusIoError> {
    let mut inputs = Vec::new();

    for (name, path) in stored_entries(dir)? {
        let bytes = read(&path)?;
        if let Ok(input) = IntentInput::from_json(&bytes) {
            inputs.push((name, input));
        } else if let Ok(record) = serde_json::from_slice::<CrashRecord>(&bytes) {
            inputs.push((name, record.input));
        } else {
            warn!("Skipping {}: neither an intent nor a crash record", path.display());
        }
    }

    Ok(inputs)
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Visible files of `dir` ordered by their `id_<n>` index, then name.
fn stored_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>, CorpusIoError> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(dir).map_err(|e| CorpusIoError::io(dir, e))? {
        let entry = entry.map_err(|e| CorpusIoError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if name.starts_with('.') || !path.is_file() {
            continue;
        }
        entries.push((name, path));
    }

    entries.sort_by(|(a, _), (b, _)| (entry_index(a), a).cmp(&(entry_index(b), b)));
    Ok(entries)
}

/// The `n` of `id_<n>_<hash>`. Names without one sort last.
fn entry_index(name: &str) -> usize {
    name.strip_prefix("id_")
        .and_then(|rest| rest.split('_').next())
        .and_then(|index| index.parse().ok())
        .unwrap_or(usize::MAX)
}

/// First free index, past every stored entry even if the directory holds
/// entries this session did not load.
fn next_index(dir: &Path, loaded: usize) -> Result<usize, CorpusIoError> {
    let highest = stored_entries(dir)?
        .iter()
        .map(|(name, _)| entry_index(name))
        .filter(|&index| index != usize::MAX)
        .max();

    Ok(highest.map_or(loaded, |highest| loaded.max(highest + 1)))
}

fn metadata_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{}.metadata", name))
}

fn read(path: &Path) -> Result<Vec<u8>, CorpusIoError> {
    fs::read(path).map_err(|e| CorpusIoError::io(path, e))
}

fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> Result<(), CorpusIoError> {
    let mut file = NamedTempFile::new_in(dir).map_err(|e| CorpusIoError::io(dir, e))?;
    file.write_all(contents)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| CorpusIoError::io(file.path(), e))?;
    file.persist(path)
        .map_err(|e| CorpusIoError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent_input::{ExtraInput, ExtraValue, PrimitiveKind, ReceiverType, DirectInput};

    fn input(action: &str) -> IntentInput {
        IntentInput {
            receiver_type: ReceiverType::BroadcastReceiver,
            component_package: "com.example".to_owned(),
            component_class: ".Receiver".to_owned(),
            action: Some(action.to_owned()),
            categories: vec![],
            data: None,
            mime_type: None,
            flags: 0x10,
            extras: vec![ExtraInput {
                key: "ratio".to_owned(),
                value: ExtraValue::Primitive(PrimitiveKind::Float, DirectInput::new(f32::NAN.to_le_bytes().to_vec())),
            }],
        }
    }

    fn metadata(generation: u64) -> CorpusMetadata {
        CorpusMetadata {
            generation,
            parent: Some("seed_0".to_owned()),
            mutations: vec!["IntentRandomFlagMutator".to_owned()],
            coverage_delta: vec![EdgeDelta { edge: 12, bits: 1 }],
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn corpus_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = CorpusStore::open(dir.path()).unwrap();
        for i in 0..12 {
            store.add(input(&format!("a{}", i)), metadata(i)).unwrap();
        }
        let names: Vec<String> = store.entries().iter().map(|e| e.name.clone()).collect();

        let reopened = CorpusStore::open(dir.path()).unwrap();
        assert_eq!(reopened.entries(), store.entries());
        // id_10 sorts after id_9
        assert_eq!(reopened.entries().iter().map(|e| e.name.clone()).collect::<Vec<_>>(), names);
        assert!(names[10].starts_with("id_10_"));
    }

    #[test]
    fn no_temporary_files_are_left() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CorpusStore::open(dir.path()).unwrap();
        store.add(input("a"), metadata(1)).unwrap();

        let files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.starts_with(".id_0_") && f.ends_with(".metadata")));
    }

    #[test]
    fn indices_continue_after_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id_7_abc"), input("x").to_json().unwrap()).unwrap();

        let mut store = CorpusStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        let name = store.add(input("y"), metadata(2)).unwrap().name.clone();
        assert!(name.starts_with("id_8_"), "{}", name);
    }

    #[test]
    fn crash_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let record = CrashRecord::new(
            input("boom"),
            CrashKind::Hang,
            "hang",
            Some("I ActivityManager: ANR".to_owned()),
            Some("id_0_abc".to_owned()),
            vec!["IntentRandomExtraContentMutator".to_owned()],
        );

        let mut store = CrashStore::open(dir.path()).unwrap();
        let path = store.add(record.clone()).unwrap();
        assert!(path.exists());
        assert!(record.replay_command.starts_with("am broadcast"));

        let reopened = CrashStore::open(dir.path()).unwrap();
        assert_eq!(reopened.records()[0].1, record);
        assert_eq!(reopened.count(CrashKind::Hang), 1);
        assert_eq!(reopened.count(CrashKind::Crash), 0);
    }

    #[test]
    fn replay_accepts_inputs_and_crash_records() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id_0_a"), input("plain").to_json().unwrap()).unwrap();
        let record = CrashRecord::new(input("crashed"), CrashKind::Crash, "java", None, None, vec![]);
        fs::write(dir.path().join("id_1_b"), serde_json::to_vec(&record).unwrap()).unwrap();
        fs::write(dir.path().join("README"), b"not an intent").unwrap();
        fs::write(dir.path().join(".id_0_a.metadata"), b"{}").unwrap();

        let inputs = load_replay_inputs(dir.path()).unwrap();
        let actions: Vec<_> = inputs
            .iter()
            .map(|(_, i)| i.action.clone().unwrap())
            .collect();
        assert_eq!(actions, vec!["plain", "crashed"]);
    }

    #[test]
    fn entry_without_metadata_is_loaded_without_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CorpusStore::open(dir.path()).unwrap();
        let name = store.add(input("kept"), metadata(1)).unwrap().name.clone();
        fs::remove_file(metadata_path(dir.path(), &name)).unwrap();

        let reopened = CorpusStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.entries()[0].input, input("kept"));
        assert!(reopened.entries()[0].metadata.coverage_delta.is_empty());
    }

    #[test]
    fn corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id_0_a"), b"{ not json").unwrap();

        assert!(matches!(CorpusStore::open(dir.path()), Err(CorpusIoError::Serde { .. })));
    }
}
