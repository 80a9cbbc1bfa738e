//! Session-wide edge coverage and the overall coverage log.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Once,
    time::Instant,
};

use libafl::prelude::{
    AsMutSlice, AsSlice, BytesInput, ExitKind, HitcountsMapObserver, Observer, StdMapObserver,
    UsesInput,
};
use serde::{Deserialize, Serialize};

use crate::error::CorpusIoError;

/// Bucket bits an execution added for one edge.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeDelta {
    pub edge: usize,
    pub bits: u8,
}

/// libafl fills its hitcount lookup table on the first observer it builds,
/// without synchronisation.
static HITCOUNTS_TABLE: Once = Once::new();

/// The observer hooks want a state naming the input type.
struct SnapshotState;

impl UsesInput for SnapshotState {
    type Input = BytesInput;
}

#[derive(Clone, Debug)]
pub struct CoverageMap {
    /// Buckets raw hit counters the way AFL does: 1, 2, 3, 4-7, 8-15, 16-31,
    /// 32-127, 128+ each get their own bit.
    hitcounts: HitcountsMapObserver<StdMapObserver<'static, u8, false>>,
    /// Union of every bucket bit seen per edge. Never loses bits.
    cumulative: Vec<u8>,
    last_run: Vec<EdgeDelta>,
}

impl CoverageMap {
    pub fn new(size: usize) -> Self {
        HITCOUNTS_TABLE.call_once(|| {
            drop(HitcountsMapObserver::new(StdMapObserver::owned("edges", Vec::<u8>::new())));
        });

        Self {
            hitcounts: HitcountsMapObserver::new(StdMapObserver::owned("edges", vec![0; size])),
            cumulative: vec![0; size],
            last_run: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.cumulative.len()
    }

    pub fn cumulative(&self) -> &[u8] {
        &self.cumulative
    }

    /// The delta of the most recent [CoverageMap::merge].
    pub fn last_run(&self) -> &[EdgeDelta] {
        &self.last_run
    }

    /// Buckets a snapshot and folds it into `cumulative`. The returned delta
    /// is empty iff the snapshot expanded nothing. Counters past the map size
    /// are ignored.
    pub fn merge(&mut self, snapshot: &[u8]) -> Result<Vec<EdgeDelta>, libafl::Error> {
        let mut state = SnapshotState;
        let input = BytesInput::new(Vec::new());

        // Clears the previous snapshot.
        self.hitcounts.pre_exec(&mut state, &input)?;
        let map = self.hitcounts.as_mut_slice();
        let len = map.len().min(snapshot.len());
        map[..len].copy_from_slice(&snapshot[..len]);
        self.hitcounts.post_exec(&mut state, &input, &ExitKind::Ok)?;

        let mut delta = Vec::new();
        let classified = self.hitcounts.as_slice();
        for (edge, (seen, &bucket)) in self.cumulative.iter_mut().zip(classified).enumerate() {
            let bits = bucket & !*seen;
            if bits != 0 {
                *seen |= bits;
                delta.push(EdgeDelta { edge, bits });
            }
        }

        self.last_run = delta.clone();
        Ok(delta)
    }

    /// Replays a stored delta, used to rebuild `cumulative` when resuming.
    pub fn merge_delta(&mut self, delta: &[EdgeDelta]) {
        for entry in delta {
            if let Some(seen) = self.cumulative.get_mut(entry.edge) {
                *seen |= entry.bits;
            }
        }
    }

    /// Number of edges hit at least once.
    pub fn edge_count(&self) -> usize {
        self.cumulative.iter().filter(|&&b| b != 0).count()
    }
}

/// Appends `<elapsed_secs>: <edge_count>` lines whenever the count grows.
/// Existing contents are kept so a resumed session extends the history.
#[derive(Debug)]
pub struct OverallCoverageLog {
    path: PathBuf,
    start_time: Instant,
    last_overall_coverage: usize,
}

impl OverallCoverageLog {
    pub fn open(path: &Path) -> Result<Self, CorpusIoError> {
        // Create the directory if it doesn't exist
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| CorpusIoError::io(dir, e))?;
        }

        let mut log = Self {
            path: path.to_owned(),
            start_time: Instant::now(),
            last_overall_coverage: 0,
        };

        if !path.exists() {
            log.write_line(0, 0)?;
        }

        Ok(log)
    }

    /// Records the edge count if it grew since the last record.
    pub fn record(&mut self, edge_count: usize) -> Result<bool, CorpusIoError> {
        // Do nothing if the overall coverage hasn't changed.
        if edge_count <= self.last_overall_coverage {
            return Ok(false);
        }

        self.write_line(self.start_time.elapsed().as_secs(), edge_count)?;
        self.last_overall_coverage = edge_count;
        Ok(true)
    }

    fn write_line(&self, secs: u64, edge_count: usize) -> Result<(), CorpusIoError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CorpusIoError::io(&self.path, e))?;
        file.write_all(format!("{}: {}\n", secs, edge_count).as_bytes())
            .map_err(|e| CorpusIoError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use libafl::prelude::{Rand, StdRand};

    use super::*;

    #[test]
    fn buckets_match_afl() {
        let counts: [u8; 14] = [0, 1, 2, 3, 4, 7, 8, 15, 16, 31, 32, 127, 128, 255];
        let bits: [u8; 14] = [0, 1, 2, 4, 8, 8, 16, 16, 32, 32, 64, 64, 128, 128];

        let mut map = CoverageMap::new(counts.len());
        map.merge(&counts).unwrap();
        assert_eq!(map.cumulative(), &bits[..]);
    }

    #[test]
    fn stale_counters_do_not_leak_into_the_next_snapshot() {
        let mut map = CoverageMap::new(4);
        map.merge(&[0, 0, 0, 9]).unwrap();
        // A short snapshot leaves the tail untouched by the agent.
        assert!(map.merge(&[0, 1]).unwrap() == vec![EdgeDelta { edge: 1, bits: 1 }]);
        assert_eq!(map.cumulative(), &[0u8, 1, 0, 16][..]);
    }

    #[test]
    fn only_new_bits_are_interesting() {
        let mut map = CoverageMap::new(8);

        assert_eq!(map.merge(&[0, 1, 0, 0, 0, 0, 0, 0]).unwrap(), vec![EdgeDelta { edge: 1, bits: 1 }]);
        assert!(map.merge(&[0, 1, 0, 0, 0, 0, 0, 0]).unwrap().is_empty());
        assert!(map.last_run().is_empty());

        // Same edge, new bucket
        assert_eq!(map.merge(&[0, 5, 0, 0, 0, 0, 0, 0]).unwrap(), vec![EdgeDelta { edge: 1, bits: 8 }]);
        assert_eq!(map.edge_count(), 1);
    }

    #[test]
    fn cumulative_never_shrinks() {
        let mut rand = StdRand::with_seed(42);
        let mut map = CoverageMap::new(128);
        let mut previous = map.cumulative().to_vec();

        for _ in 0..500 {
            let snapshot: Vec<u8> = (0..128)
                .map(|_| if rand.below(10) == 0 { rand.below(256) as u8 } else { 0 })
                .collect();
            let delta = map.merge(&snapshot).unwrap();

            for (before, after) in previous.iter().zip(map.cumulative()) {
                assert_eq!(before & after, *before);
            }
            assert_eq!(delta.is_empty(), previous == map.cumulative());
            previous = map.cumulative().to_vec();
        }
    }

    #[test]
    fn stored_deltas_rebuild_the_map() {
        let mut live = CoverageMap::new(16);
        let mut deltas = Vec::new();
        for snapshot in [[1u8; 16], [3; 16], [200; 16]] {
            deltas.push(live.merge(&snapshot).unwrap());
        }

        let mut resumed = CoverageMap::new(16);
        for delta in &deltas {
            resumed.merge_delta(delta);
        }
        assert_eq!(resumed.cumulative(), live.cumulative());
    }

    #[test]
    fn short_snapshots_are_tolerated() {
        let mut map = CoverageMap::new(4);
        assert_eq!(map.merge(&[1]).unwrap().len(), 1);
        assert_eq!(map.merge(&[0, 0, 0, 0, 9, 9]).unwrap().len(), 0);
    }

    #[test]
    fn overall_log_appends_growth_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats").join("overall_coverage.txt");

        let mut log = OverallCoverageLog::open(&path).unwrap();
        assert!(log.record(3).unwrap());
        assert!(!log.record(3).unwrap());
        assert!(log.record(5).unwrap());

        // A resumed session keeps the history.
        let mut resumed = OverallCoverageLog::open(&path).unwrap();
        resumed.record(6).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let counts: Vec<&str> = contents
            .lines()
            .map(|line| line.split(": ").nth(1).unwrap())
            .collect();
        assert_eq!(counts, vec!["0", "3", "5", "6"]);
    }
}
