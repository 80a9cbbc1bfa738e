//! The greybox fuzzing loop.
//!
//! One iteration selects an input from the live population (seeds, then the
//! corpus, round robin), mutates a copy, delivers it, samples coverage if the
//! target completed, and classifies the result. Everything happens in order
//! on one thread, so the cumulative coverage and corpus membership depend
//! only on the sequence of outcomes.

use std::{
    fs,
    path::PathBuf,
    time::{Duration, Instant},
};

use libafl::{
    bolts::{current_time, ClientId},
    monitors::{Monitor, SimpleMonitor, UserStats},
    prelude::Generator,
};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    adb_device::Device,
    adb_executor::{ExecutionOutcome, IntentExecutor, OutcomeKind},
    corpus::{unix_timestamp, CorpusMetadata, CorpusStore, CrashKind, CrashRecord, CrashStore},
    coverage_map::{CoverageMap, EdgeDelta, OverallCoverageLog},
    error::{CorpusIoError, CoverageLinkError, FuzzerError},
    intent_generator::IntentGenerator,
    intent_input::IntentInput,
    intent_mutator::{MutationEngine, MutationState},
    intent_template::TemplateStore,
    socket_coverage_collector::CoverageSource,
};

#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    pub corpus_dir: PathBuf,
    pub crashes_dir: PathBuf,
    pub overall_coverage_file: Option<PathBuf>,
    pub stats_file: Option<PathBuf>,
    /// Continue without coverage when the agent link is lost for good.
    pub coverage_optional: bool,
    /// Consecutive delivery failures that end the session.
    pub max_consecutive_delivery_failures: u32,
    pub seed: u64,
    /// Number of fuzzing iterations, unbounded if `None`.
    pub iterations: Option<u64>,
    /// Name a native trace file per replayed input.
    pub trace_native: bool,
    pub stats_interval: Duration,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("corpus"),
            crashes_dir: PathBuf::from("crashes"),
            overall_coverage_file: None,
            stats_file: None,
            coverage_optional: false,
            max_consecutive_delivery_failures: 10,
            seed: 0,
            iterations: None,
            trace_native: false,
            stats_interval: Duration::from_secs(15),
        }
    }
}

/// Counters of one session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub executions: u64,
    pub corpus: usize,
    pub crashes: usize,
    pub hangs: usize,
    pub delivery_failures: u64,
    pub edges: usize,
    pub elapsed_secs: u64,
    #[serde(skip)]
    start_time: Instant,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            executions: 0,
            corpus: 0,
            crashes: 0,
            hangs: 0,
            delivery_failures: 0,
            edges: 0,
            elapsed_secs: 0,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Layout of the stats file.
#[derive(Serialize)]
struct StatsFile<'a> {
    stats: &'a SessionStats,
}

fn print_stats(line: String) {
    info!("{}", line);
}

/// Outcomes of a replay, in replay order.
#[derive(Clone, Debug, Default)]
pub struct ReplaySummary {
    pub outcomes: Vec<(String, OutcomeKind)>,
}

impl ReplaySummary {
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == kind).count()
    }
}

pub struct Fuzzer<D, C> {
    config: FuzzerConfig,
    state: MutationState,
    engine: MutationEngine<MutationState>,
    executor: IntentExecutor<D>,
    coverage: Option<C>,
    coverage_map: Option<CoverageMap>,
    overall_log: Option<OverallCoverageLog>,
    corpus: CorpusStore,
    crashes: CrashStore,
    seeds: Vec<IntentInput>,
    queue_position: usize,
    consecutive_failures: u32,
    stats: SessionStats,
    monitor: SimpleMonitor<fn(String)>,
    last_report: Instant,
}

impl<D, C> Fuzzer<D, C>
where
    D: Device,
    C: CoverageSource,
{
    /// Sets up a session, resuming the corpus and crash stores. Without a
    /// coverage source the session runs coverage-free and never talks to an
    /// agent.
    pub fn new(
        config: FuzzerConfig,
        templates: TemplateStore,
        executor: IntentExecutor<D>,
        coverage: Option<C>,
    ) -> Result<Self, FuzzerError> {
        let corpus = CorpusStore::open(&config.corpus_dir)?;
        let crashes = CrashStore::open(&config.crashes_dir)?;

        let mut generator = IntentGenerator::new(&templates);
        let seeds = (0..generator.number_of_intents())
            .map(|_| generator.generate(&mut ()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| FuzzerError::Mutation(err.to_string()))?;

        let overall_log = config
            .overall_coverage_file
            .as_deref()
            .map(OverallCoverageLog::open)
            .transpose()?;

        let mut stats = SessionStats::new();
        stats.corpus = corpus.len();
        stats.crashes = crashes.count(CrashKind::Crash);
        stats.hangs = crashes.count(CrashKind::Hang);

        let mut fuzzer = Self {
            state: MutationState::new(templates, config.seed),
            engine: MutationEngine::new(),
            config,
            executor,
            coverage,
            coverage_map: None,
            overall_log,
            corpus,
            crashes,
            seeds,
            queue_position: 0,
            consecutive_failures: 0,
            stats,
            monitor: SimpleMonitor::with_user_monitor(print_stats as fn(String), true),
            last_report: Instant::now(),
        };

        fuzzer.connect_coverage()?;
        Ok(fuzzer)
    }

    pub fn executor(&self) -> &IntentExecutor<D> {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut IntentExecutor<D> {
        &mut self.executor
    }

    pub fn coverage(&self) -> Option<&C> {
        self.coverage.as_ref()
    }

    pub fn coverage_map(&self) -> Option<&CoverageMap> {
        self.coverage_map.as_ref()
    }

    pub fn corpus(&self) -> &CorpusStore {
        &self.corpus
    }

    pub fn crashes(&self) -> &CrashStore {
        &self.crashes
    }

    pub fn seeds(&self) -> &[IntentInput] {
        &self.seeds
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Connects to the agent and sizes the coverage map, rebuilding it from
    /// the stored corpus.
    fn connect_coverage(&mut self) -> Result<(), FuzzerError> {
        let result = match self.coverage.as_mut() {
            Some(coverage) => coverage.connect().map(|_| coverage.map_size()),
            None => {
                info!("Running without coverage feedback");
                return Ok(());
            }
        };

        match result {
            Ok(map_size) => {
                let mut coverage_map = CoverageMap::new(map_size);
                for entry in self.corpus.entries() {
                    coverage_map.merge_delta(&entry.metadata.coverage_delta);
                }
                self.stats.edges = coverage_map.edge_count();
                if self.stats.edges > 0 {
                    info!("Resumed coverage: {} edges", self.stats.edges);
                }
                self.coverage_map = Some(coverage_map);
                Ok(())
            }
            Err(err) => self.link_lost(err),
        }
    }

    /// Drops to coverage-free mode if that is allowed, ends the session
    /// otherwise.
    fn link_lost(&mut self, err: CoverageLinkError) -> Result<(), FuzzerError> {
        if !self.config.coverage_optional {
            return Err(err.into());
        }

        warn!("Coverage link lost ({}), continuing without coverage", err);
        if let Some(mut coverage) = self.coverage.take() {
            coverage.disconnect();
        }
        Ok(())
    }

    /// Runs the seeds unmutated when starting without a corpus, then fuzzes
    /// until the iteration bound, if any.
    pub fn run(&mut self) -> Result<(), FuzzerError> {
        if self.corpus.is_empty() {
            info!("Running {} seed inputs", self.seeds.len());
            for seed in self.seeds.clone() {
                self.evaluate(seed, None, Vec::new())?;
            }
        }

        let mut iteration = 0;
        while self.config.iterations.map_or(true, |max| iteration < max) {
            self.fuzz_one()?;
            iteration += 1;
        }

        self.report_stats(true)
    }

    /// One iteration: select, mutate, deliver, collect, classify, update.
    pub fn fuzz_one(&mut self) -> Result<ExecutionOutcome, FuzzerError> {
        let (parent, parent_name) = self.select()?;

        let mutated = self
            .engine
            .mutate(&mut self.state, &parent)
            .map_err(|err| FuzzerError::Mutation(err.to_string()))?;
        debug!("Mutated {} with {:?}", parent_name, mutated.mutations);

        self.evaluate(mutated.input, Some(parent_name), mutated.mutations)
    }

    /// Executes stored inputs verbatim, in order, measuring their coverage
    /// from scratch. Nothing is added to the corpus or crash stores.
    pub fn replay(
        &mut self,
        inputs: &[(String, IntentInput)],
    ) -> Result<ReplaySummary, FuzzerError> {
        let mut summary = ReplaySummary::default();

        if let Some(coverage_map) = self.coverage_map.as_mut() {
            *coverage_map = CoverageMap::new(coverage_map.size());
            self.stats.edges = 0;
        }

        for (name, input) in inputs {
            let trace_name = self
                .config
                .trace_native
                .then(|| format!("trace_{}.txt", input.hash()));

            let outcome = self.execute(input, trace_name.as_deref())?;
            info!("Replayed {}: {}", name, outcome.name());

            match &outcome {
                ExecutionOutcome::Completed => {
                    self.consecutive_failures = 0;
                    if let Some(delta) = self.collect()? {
                        if !delta.is_empty() {
                            self.record_overall_coverage()?;
                        }
                    }
                }
                ExecutionOutcome::TimedOut { .. } | ExecutionOutcome::CrashDetected { .. } => {
                    self.consecutive_failures = 0;
                    self.restart_target()?;
                }
                ExecutionOutcome::DeliveryFailed { command, reason } => {
                    self.delivery_failed(command, reason)?;
                }
            }

            self.stats.executions += 1;
            summary.outcomes.push((name.clone(), outcome.kind()));
        }

        self.report_stats(true)?;
        Ok(summary)
    }

    /// Round robin over the seeds followed by the corpus entries.
    fn select(&mut self) -> Result<(IntentInput, String), FuzzerError> {
        let population = self.seeds.len() + self.corpus.len();
        if population == 0 {
            return Err(FuzzerError::NoLiveEntries);
        }

        let index = self.queue_position % population;
        self.queue_position = self.queue_position.wrapping_add(1);

        if index < self.seeds.len() {
            return Ok((self.seeds[index].clone(), format!("seed_{}", index)));
        }

        let entry = self
            .corpus
            .get(index - self.seeds.len())
            .ok_or(FuzzerError::NoLiveEntries)?;
        Ok((entry.input.clone(), entry.name.clone()))
    }

    fn execute(
        &mut self,
        input: &IntentInput,
        trace_name: Option<&str>,
    ) -> Result<ExecutionOutcome, FuzzerError> {
        let reset = match self.coverage.as_mut() {
            Some(coverage) => coverage.begin_execution(trace_name),
            None => Ok(()),
        };
        if let Err(err) = reset {
            self.link_lost(err)?;
        }

        Ok(self.executor.deliver(input))
    }

    /// Samples the execution's coverage and merges it. `None` without
    /// coverage.
    fn collect(&mut self) -> Result<Option<Vec<EdgeDelta>>, FuzzerError> {
        let sample = match self.coverage.as_mut() {
            Some(coverage) => coverage.sample(),
            None => return Ok(None),
        };

        let snapshot = match sample {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!("Coverage of this execution was lost, the link is back");
                return Ok(None);
            }
            Err(err) => {
                self.link_lost(err)?;
                return Ok(None);
            }
        };

        let Some(coverage_map) = self.coverage_map.as_mut() else {
            return Ok(None);
        };
        let delta = coverage_map
            .merge(&snapshot)
            .map_err(|err| FuzzerError::Coverage(err.to_string()))?;
        self.stats.edges = coverage_map.edge_count();
        Ok(Some(delta))
    }

    fn evaluate(
        &mut self,
        input: IntentInput,
        parent: Option<String>,
        mutations: Vec<String>,
    ) -> Result<ExecutionOutcome, FuzzerError> {
        let outcome = self.execute(&input, None)?;
        self.stats.executions += 1;

        match &outcome {
            ExecutionOutcome::Completed => {
                self.consecutive_failures = 0;

                if let Some(delta) = self.collect()? {
                    if !delta.is_empty() {
                        let entry = self.corpus.add(
                            input,
                            CorpusMetadata {
                                generation: self.stats.executions,
                                parent,
                                mutations,
                                coverage_delta: delta,
                                timestamp: unix_timestamp(),
                            },
                        )?;
                        info!(
                            "New corpus entry {} (+{} edges)",
                            entry.name,
                            entry.metadata.coverage_delta.len()
                        );
                        self.stats.corpus = self.corpus.len();
                        self.record_overall_coverage()?;
                    }
                }
            }
            ExecutionOutcome::TimedOut { evidence } => {
                self.consecutive_failures = 0;
                let record = CrashRecord::new(
                    input,
                    CrashKind::Hang,
                    "hang",
                    Some(evidence.clone()),
                    parent,
                    mutations,
                );
                let path = self.crashes.add(record)?;
                warn!("Hang recorded at {}", path.display());
                self.stats.hangs += 1;
                self.restart_target()?;
            }
            ExecutionOutcome::CrashDetected {
                classification,
                evidence,
            } => {
                self.consecutive_failures = 0;
                let record = CrashRecord::new(
                    input,
                    CrashKind::Crash,
                    classification,
                    Some(evidence.clone()).filter(|e| !e.is_empty()),
                    parent,
                    mutations,
                );
                let path = self.crashes.add(record)?;
                warn!("Crash ({}) recorded at {}", classification, path.display());
                self.stats.crashes += 1;
                self.restart_target()?;
            }
            ExecutionOutcome::DeliveryFailed { command, reason } => {
                self.delivery_failed(command, reason)?;
            }
        }

        self.report_stats(false)?;
        Ok(outcome)
    }

    fn delivery_failed(&mut self, command: &str, reason: &str) -> Result<(), FuzzerError> {
        self.consecutive_failures += 1;
        self.stats.delivery_failures += 1;
        warn!(
            "Delivery failed ({}/{}): {}",
            self.consecutive_failures, self.config.max_consecutive_delivery_failures, reason
        );

        if self.consecutive_failures >= self.config.max_consecutive_delivery_failures {
            return Err(FuzzerError::EnvironmentFault {
                command: command.to_owned(),
                failures: self.consecutive_failures,
            });
        }
        Ok(())
    }

    /// Relaunches the target, and with it the coverage agent.
    fn restart_target(&mut self) -> Result<(), FuzzerError> {
        self.executor.restart_target()?;

        let reconnect = match self.coverage.as_mut() {
            Some(coverage) => coverage.reconnect(),
            None => Ok(()),
        };
        if let Err(err) = reconnect {
            self.link_lost(err)?;
        }
        Ok(())
    }

    fn record_overall_coverage(&mut self) -> Result<(), CorpusIoError> {
        if let Some(log) = self.overall_log.as_mut() {
            log.record(self.stats.edges)?;
        }
        Ok(())
    }

    fn report_stats(&mut self, force: bool) -> Result<(), FuzzerError> {
        if !force && self.last_report.elapsed() < self.config.stats_interval {
            return Ok(());
        }
        self.last_report = Instant::now();
        self.stats.elapsed_secs = self.stats.elapsed().as_secs();

        let client = self.monitor.client_stats_mut_for(ClientId(0));
        client.update_corpus_size(self.stats.corpus as u64);
        client.update_objective_size((self.stats.crashes + self.stats.hangs) as u64);
        client.update_executions(self.stats.executions, current_time());
        client.update_user_stats("edges".to_owned(), UserStats::Number(self.stats.edges as u64));
        client.update_user_stats("hangs".to_owned(), UserStats::Number(self.stats.hangs as u64));
        client.update_user_stats(
            "delivery failures".to_owned(),
            UserStats::Number(self.stats.delivery_failures),
        );
        self.monitor.display("Stats".to_owned(), ClientId(0));

        if let Some(path) = &self.config.stats_file {
            let contents = toml::to_string(&StatsFile { stats: &self.stats })?;
            fs::write(path, contents).map_err(|e| CorpusIoError::io(path, e))?;
        }
        Ok(())
    }
}
