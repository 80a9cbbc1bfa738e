use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{builder::BoolishValueParser, ArgAction, Parser};
use log::{info, warn};

use intent_fuzzer::{
    adb_device::{AdbDevice, Device},
    adb_executor::{ExecutorConfig, IntentExecutor, OutcomeKind},
    corpus::load_replay_inputs,
    fuzzer::{Fuzzer, FuzzerConfig},
    intent_template::TemplateStore,
    socket_coverage_collector::{CollectorConfig, SocketCoverageCollector, DEFAULT_MAP_SIZE},
};

/// Executes through adb on a device or emulator receiving coverage feedback
/// through a socket.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CommandLineArgs {
    /// The address of the coverage agent socket
    #[arg(short, long, default_value = "localhost:6249")]
    coverage_socket_address: String,

    /// The adb command used to send intents and control the device
    #[arg(short, long, env = "ADB_COMMAND", default_value = "adb")]
    adb_command: String,

    /// Serial of the target device, if more than one is attached
    #[arg(long, env = "ANDROID_SERIAL")]
    device_serial: Option<String>,

    /// The config file or directory from where to read the intent information
    #[arg(short, long, default_value = "intent_template.json")]
    intent_config: PathBuf,

    /// Re-run corpus instead of fuzzing
    #[arg(
        short,
        long,
        env = "RUN_CORPUS",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    run_corpus: bool,

    /// Trace JNI calls while re-running the corpus
    #[arg(
        short,
        long,
        env = "TRACE_NATIVE",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    trace_native: bool,

    /// Switch to disable usage of coverage feedback
    #[arg(
        long,
        env = "NO_COVERAGE",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    no_coverage: bool,

    /// Keep fuzzing without coverage if the agent cannot be reached
    #[arg(long)]
    coverage_optional: bool,

    /// Size of the agent's edge map in bytes
    #[arg(long, default_value_t = DEFAULT_MAP_SIZE)]
    map_size: usize,

    /// The directory to store the corpus in
    #[arg(long, default_value = "corpus")]
    corpus_dir: PathBuf,

    /// The directory to re-run, defaults to the corpus directory
    #[arg(long)]
    replay_dir: Option<PathBuf>,

    /// The directory to store the crashes in
    #[arg(long, default_value = "crashes")]
    crashes_dir: PathBuf,

    /// The directory to store the traces in
    #[arg(long, default_value = "traces")]
    traces_dir: PathBuf,

    /// The file to store the fuzzer stats in
    #[arg(long, default_value = "fuzzer_stats.toml")]
    stats_file: PathBuf,

    /// The file to store the overall edge count in
    #[arg(long, default_value = "overall_coverage.txt")]
    overall_coverage_file: PathBuf,

    /// How long an activity may take to go idle
    #[arg(long, default_value_t = 5000)]
    activity_timeout_ms: u64,

    /// How long a broadcast may take to be handled
    #[arg(long, default_value_t = 20000)]
    receiver_timeout_ms: u64,

    /// Wait after each broadcast, which reports no idle signal
    #[arg(long, default_value_t = 1000)]
    settle_delay_ms: u64,

    /// Consecutive failed deliveries before giving up
    #[arg(long, default_value_t = 10)]
    max_consecutive_delivery_failures: u32,

    /// Connection attempts to the coverage agent
    #[arg(long, default_value_t = 5)]
    link_retries: u32,

    /// Seed of the mutation randomness
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Stop after this many fuzzing iterations
    #[arg(long)]
    iterations: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandLineArgs::parse();

    // Fuzzing with native hooking is not supported.
    if args.trace_native && !args.run_corpus {
        bail!("Native hooking is not supported for fuzzing. Please use the --run-corpus option.");
    }

    let templates = TemplateStore::load(&args.intent_config)
        .with_context(|| format!("Failed to load {}", args.intent_config.display()))?;
    let app_name = templates.package_name().to_owned();
    let enable_synchronization = templates.enable_synchronization();
    info!(
        "Loaded {} intent templates for {} (synchronization: {})",
        templates.templates().len(),
        app_name,
        enable_synchronization
    );

    // Adb device to send intents to.
    let mut adb_device = AdbDevice::new(&args.adb_command, args.device_serial.as_deref());

    adb_device
        .grant_uri_permissions(&app_name)
        .context("Failed to grant uri permissions")?;
    adb_device
        .set_debug_app(&app_name)
        .context("Failed to set debug app")?;

    // Create the ".hook_native" file to enable JNI tracing.
    if args.trace_native {
        adb_device.enable_native_hooking(&app_name)?;
    } else {
        adb_device.disable_native_hooking(&app_name)?;
    }
    adb_device
        .restart_app(&app_name)
        .with_context(|| format!("Failed to start {}", app_name))?;

    let executor = IntentExecutor::new(
        adb_device,
        ExecutorConfig {
            activity_timeout: Duration::from_millis(args.activity_timeout_ms),
            receiver_timeout: Duration::from_millis(args.receiver_timeout_ms),
            settle_delay: Duration::from_millis(args.settle_delay_ms),
            synchronization: enable_synchronization,
        },
        &app_name,
    );

    // Collector to get coverage feedback from the device.
    let coverage = (!args.no_coverage).then(|| {
        SocketCoverageCollector::new(CollectorConfig {
            address: args.coverage_socket_address.clone(),
            map_size: args.map_size,
            synchronization: enable_synchronization,
            retries: args.link_retries,
            ..CollectorConfig::default()
        })
    });

    let config = FuzzerConfig {
        corpus_dir: args.corpus_dir.clone(),
        crashes_dir: args.crashes_dir.clone(),
        overall_coverage_file: Some(args.overall_coverage_file.clone()),
        stats_file: Some(args.stats_file.clone()),
        coverage_optional: args.coverage_optional,
        max_consecutive_delivery_failures: args.max_consecutive_delivery_failures,
        seed: args.seed,
        iterations: args.iterations,
        trace_native: args.trace_native,
        ..FuzzerConfig::default()
    };

    let mut fuzzer = Fuzzer::new(config, templates, executor, coverage)?;

    if args.run_corpus {
        let replay_dir = args.replay_dir.as_ref().unwrap_or(&args.corpus_dir);
        let inputs = load_replay_inputs(replay_dir)
            .with_context(|| format!("Failed to load {}", replay_dir.display()))?;
        info!("Re-running {} inputs from {}", inputs.len(), replay_dir.display());

        let summary = fuzzer.replay(&inputs)?;
        info!(
            "Replay done: {} completed, {} timed out, {} crashed, {} failed to deliver",
            summary.count(OutcomeKind::Completed),
            summary.count(OutcomeKind::TimedOut),
            summary.count(OutcomeKind::CrashDetected),
            summary.count(OutcomeKind::DeliveryFailed)
        );

        // Stop app to disable JNI tracing.
        let adb_device = fuzzer.executor().device();
        if let Err(err) = adb_device.stop_app(&app_name) {
            warn!("{}", err);
        }

        if args.trace_native {
            let pulled = adb_device
                .pull_native_trace_files(&app_name, &args.traces_dir)
                .context("Failed to pull trace files")?;
            info!("Pulled {} trace files into {}", pulled, args.traces_dir.display());
        }
    } else {
        fuzzer.run()?;
    }

    Ok(())
}
