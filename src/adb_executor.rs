//! Executor for running a single intent through adb on device/emulator.
//!
//! [IntentExecutor] stages the URI payloads of an input, delivers it, waits
//! for the target to go idle and checks whether the target process survived.

use std::{
    thread,
    time::{Duration, SystemTime},
};

use libafl::inputs::HasBytesVec;
use log::{debug, info, warn};
use strum_macros::{EnumIter, IntoStaticStr};

use crate::{
    adb_device::{Device, IdleWait},
    error::DeviceError,
    intent_input::{IntentInput, ReceiverType, URIScheme},
};

/// Lines of the main log kept as evidence for a hang.
const HANG_LOG_LINES: usize = 200;

/// What happened to one delivered intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The target processed the intent and is idle again.
    Completed,
    /// The target did not go idle in time.
    TimedOut { evidence: String },
    /// The device did not accept the intent. Nothing ran.
    DeliveryFailed { command: String, reason: String },
    /// The target process died while handling the intent.
    CrashDetected {
        classification: String,
        evidence: String,
    },
}

/// The variant of an [ExecutionOutcome], without its evidence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum OutcomeKind {
    Completed,
    TimedOut,
    DeliveryFailed,
    CrashDetected,
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::Completed => OutcomeKind::Completed,
            ExecutionOutcome::TimedOut { .. } => OutcomeKind::TimedOut,
            ExecutionOutcome::DeliveryFailed { .. } => OutcomeKind::DeliveryFailed,
            ExecutionOutcome::CrashDetected { .. } => OutcomeKind::CrashDetected,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().into()
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Bound on `am start` and on the idle wait of activities.
    pub activity_timeout: Duration,
    /// Bound on `am broadcast`, which returns once the receiver finished.
    pub receiver_timeout: Duration,
    /// Fixed wait after delivery when the idle signal is not used.
    pub settle_delay: Duration,
    /// Wait for the idle signal after delivering to an activity. Broadcasts
    /// never report idle and always use the settle delay.
    pub synchronization: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(5),
            receiver_timeout: Duration::from_secs(20),
            settle_delay: Duration::from_secs(1),
            synchronization: true,
        }
    }
}

pub struct IntentExecutor<D> {
    device: D,
    config: ExecutorConfig,
    package: String,
}

impl<D> IntentExecutor<D>
where
    D: Device,
{
    pub fn new(device: D, config: ExecutorConfig, package: &str) -> Self {
        Self {
            device,
            config,
            package: package.to_owned(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Delivers the input and blocks until the target is idle, hung or dead.
    pub fn deliver(&mut self, input: &IntentInput) -> ExecutionOutcome {
        let command = input.shell_command();

        let failed = |reason: DeviceError| ExecutionOutcome::DeliveryFailed {
            command: command.clone(),
            reason: reason.to_string(),
        };

        let pid_before = match self.device.pid_of(&self.package) {
            Ok(pid) => pid,
            Err(err) => return failed(err),
        };

        if let Err(err) = self.stage_uri_payloads(input) {
            return failed(err);
        }

        let timeout = match input.receiver_type {
            ReceiverType::Activity => self.config.activity_timeout,
            ReceiverType::BroadcastReceiver => self.config.receiver_timeout,
        };
        let synchronized =
            self.config.synchronization && input.receiver_type == ReceiverType::Activity;

        // Crash logs carry the device's time, which may be skewed from ours.
        let started = self.device.clock().unwrap_or_else(|err| {
            warn!("Failed to read the device clock, using host time: {}", err);
            SystemTime::now()
        });

        if synchronized {
            if let Err(err) = self.device.arm_idle() {
                return failed(err);
            }
        }

        let mut hung = false;
        // Device errors after delivery: the intent ran, its effect is unknown.
        let mut lost_track = None;
        match self.device.deliver(&command, timeout) {
            Ok(()) => {}
            Err(DeviceError::TimedOut(_)) => hung = true,
            Err(err @ DeviceError::OutOfResources(_)) => {
                // Nothing was delivered, but the next intent will not be either.
                if let Err(restart_err) = self.restart_target() {
                    warn!("Failed to restart {}: {}", self.package, restart_err);
                }
                return failed(err);
            }
            Err(err) => return failed(err),
        }

        if !hung {
            if synchronized {
                match self.device.wait_idle(timeout) {
                    Ok(IdleWait::Released) => {}
                    Ok(IdleWait::TimedOut) => hung = true,
                    Err(err) => {
                        warn!("Failed to wait for idle: {}", err);
                        hung = true;
                        lost_track = Some(err);
                    }
                }
            } else {
                thread::sleep(self.config.settle_delay);
            }
        }

        let pid_after = match self.device.pid_of(&self.package) {
            Ok(pid) => pid,
            Err(err) => {
                warn!("Failed to check {} after delivery: {}", self.package, err);
                hung = true;
                lost_track = Some(err);
                pid_before.clone()
            }
        };

        let died = match (&pid_before, &pid_after) {
            (_, None) => true,
            (Some(before), Some(after)) => before != after,
            (None, Some(_)) => false,
        };

        if died {
            debug!(
                "Process of {} died (pid {:?} -> {:?})",
                self.package, pid_before, pid_after
            );
            let evidence = self
                .device
                .crash_log_since(started)
                .unwrap_or_else(|err| format!("<crash log unavailable: {}>", err));
            return ExecutionOutcome::CrashDetected {
                classification: classify_crash(&evidence, &self.package).to_owned(),
                evidence,
            };
        }

        if hung {
            let mut evidence = self
                .device
                .log_tail(HANG_LOG_LINES)
                .unwrap_or_else(|err| format!("<log unavailable: {}>", err));
            if let Some(err) = lost_track {
                evidence = format!("<device error after delivery: {}>\n{}", err, evidence);
            }
            return ExecutionOutcome::TimedOut { evidence };
        }

        ExecutionOutcome::Completed
    }

    /// Force-stops and relaunches the target app.
    pub fn restart_target(&mut self) -> Result<(), DeviceError> {
        info!("Restarting target {}", self.package);
        self.device.restart_app(&self.package)
    }

    /// Creates required files and content on the device for all URIs of the
    /// input.
    fn stage_uri_payloads(&mut self, input: &IntentInput) -> Result<(), DeviceError> {
        for (id, uri) in input.uri_payloads() {
            let content = uri.content.bytes();

            match uri.scheme {
                URIScheme::Content => self.device.register_content(&uri.identifier(id), content)?,
                URIScheme::File => self.device.create_file(&uri.device_path(id), content)?,
                URIScheme::Other => {}
            }
        }
        Ok(())
    }
}

/// Names the kind of crash found in the crash log.
pub fn classify_crash(log: &str, package: &str) -> &'static str {
    let process = format!("({})", package);
    let mut native = false;
    let mut in_agent = false;

    for line in log.lines() {
        if line.contains("FATAL EXCEPTION") {
            return "java";
        }
        if line.contains("Fatal signal") && line.contains(&process) {
            native = true;
        }
        if native && line.contains("libcoverage_instrumenting_agent.so") {
            in_agent = true;
        }
    }

    match (native, in_agent) {
        (true, true) => "native-agent",
        (true, false) => "native",
        _ => "process-death",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intent_input::{ExtraInput, ExtraValue, URIInput, URISuffix},
        testing::{FakeDevice, Step},
    };

    fn input(receiver_type: ReceiverType) -> IntentInput {
        IntentInput {
            receiver_type,
            component_package: "com.example".to_owned(),
            component_class: ".Main".to_owned(),
            action: Some("com.example.OPEN".to_owned()),
            categories: vec![],
            data: None,
            mime_type: None,
            flags: 0,
            extras: vec![],
        }
    }

    fn executor(device: FakeDevice, synchronization: bool) -> IntentExecutor<FakeDevice> {
        IntentExecutor::new(
            device,
            ExecutorConfig {
                settle_delay: Duration::ZERO,
                synchronization,
                ..ExecutorConfig::default()
            },
            "com.example",
        )
    }

    #[test]
    fn outcome_names_follow_their_kind() {
        let outcome = ExecutionOutcome::TimedOut {
            evidence: String::new(),
        };
        assert_eq!(outcome.kind(), OutcomeKind::TimedOut);
        assert_eq!(outcome.name(), "TimedOut");
    }

    #[test]
    fn idle_release_completes() {
        let mut executor = executor(FakeDevice::new(), true);
        let outcome = executor.deliver(&input(ReceiverType::Activity));

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(executor.device().delivered.len(), 1);
        assert_eq!(executor.device().armed, 1);
    }

    #[test]
    fn idle_timeout_is_a_hang() {
        let mut device = FakeDevice::new();
        device.script(Step::Hang);
        let mut executor = executor(device, true);

        let outcome = executor.deliver(&input(ReceiverType::Activity));
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
        // Restarting is the loop's decision.
        assert_eq!(executor.device().restarts, 0);
    }

    #[test]
    fn broadcast_timeout_is_a_hang() {
        let mut device = FakeDevice::new();
        device.script(Step::CommandTimeout);
        let mut executor = executor(device, false);

        let outcome = executor.deliver(&input(ReceiverType::BroadcastReceiver));
        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
    }

    #[test]
    fn dead_process_wins_over_timeout() {
        let mut device = FakeDevice::new();
        device.script(Step::HangAndCrash("FATAL EXCEPTION: main".to_owned()));
        let mut executor = executor(device, true);

        match executor.deliver(&input(ReceiverType::Activity)) {
            ExecutionOutcome::CrashDetected { classification, .. } => {
                assert_eq!(classification, "java")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn rejected_command_is_a_delivery_failure() {
        let mut device = FakeDevice::new();
        device.script(Step::Reject);
        let mut executor = executor(device, true);

        let outcome = executor.deliver(&input(ReceiverType::Activity));
        match outcome {
            ExecutionOutcome::DeliveryFailed { command, .. } => {
                assert!(command.starts_with("am start -n 'com.example/.Main'"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // No waiting after a failed delivery.
        assert_eq!(executor.device().waits, 0);
    }

    #[test]
    fn broadcasts_never_wait_for_idle() {
        // A session mixing activities and receivers runs synchronised.
        let mut executor = executor(FakeDevice::new(), true);

        let outcome = executor.deliver(&input(ReceiverType::BroadcastReceiver));
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(executor.device().armed, 0);
        assert_eq!(executor.device().waits, 0);

        let outcome = executor.deliver(&input(ReceiverType::Activity));
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(executor.device().armed, 1);
        assert_eq!(executor.device().waits, 1);
    }

    #[test]
    fn device_errors_after_delivery_are_not_delivery_failures() {
        let mut device = FakeDevice::new();
        device.fail_pid_checks_after(1);
        let mut executor = executor(device, true);

        match executor.deliver(&input(ReceiverType::Activity)) {
            ExecutionOutcome::TimedOut { evidence } => {
                assert!(evidence.starts_with("<device error after delivery:"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(executor.device().delivered.len(), 1);
    }

    #[test]
    fn crash_log_is_read_from_the_device_clock() {
        let mut device = FakeDevice::new();
        device.script(Step::Crash("FATAL EXCEPTION: main".to_owned()));
        let clock = device.clock().unwrap();
        let mut executor = executor(device, true);

        executor.deliver(&input(ReceiverType::Activity));
        assert_eq!(executor.device().log_reads, vec![clock]);
    }

    #[test]
    fn settle_delay_replaces_idle_wait() {
        let mut executor = executor(FakeDevice::new(), false);
        let outcome = executor.deliver(&input(ReceiverType::BroadcastReceiver));

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(executor.device().armed, 0);
        assert_eq!(executor.device().waits, 0);
    }

    #[test]
    fn uri_payloads_are_staged_before_delivery() {
        let mut intent = input(ReceiverType::Activity);
        let mut file = URIInput::new(URIScheme::File, URISuffix::PDF);
        file.content = libafl::prelude::BytesInput::new(b"%PDF".to_vec());
        intent.extras.push(ExtraInput {
            key: "android.intent.extra.STREAM".to_owned(),
            value: ExtraValue::URI(file),
        });
        intent.data = Some(URIInput::new(URIScheme::Content, URISuffix::TXT));

        let mut executor = executor(FakeDevice::new(), true);
        executor.deliver(&intent);

        let device = executor.device();
        assert_eq!(device.files, vec![("/data/local/tmp/extra_input_1.pdf".to_owned(), b"%PDF".to_vec())]);
        assert_eq!(device.contents.len(), 1);
        assert!(String::from_utf8_lossy(&device.contents[0].0).ends_with("/extra_input_0.txt"));
    }

    #[test]
    fn crash_classification() {
        assert_eq!(classify_crash("E AndroidRuntime: FATAL EXCEPTION: main", "com.example"), "java");
        assert_eq!(
            classify_crash("F libc: Fatal signal 11 (SIGSEGV), pid 123 (com.example)", "com.example"),
            "native"
        );
        assert_eq!(
            classify_crash(
                "F libc: Fatal signal 6 (SIGABRT), pid 1 (com.example)\n#00 pc 0001 /data/libcoverage_instrumenting_agent.so",
                "com.example"
            ),
            "native-agent"
        );
        assert_eq!(
            classify_crash("F libc: Fatal signal 11 (SIGSEGV), pid 77 (com.other)", "com.example"),
            "process-death"
        );
        assert_eq!(classify_crash("", "com.example"), "process-death");
    }
}
