//! Scripted stand-ins for the device and the coverage agent.

use std::{
    collections::VecDeque,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    adb_device::{Device, IdleWait},
    error::{CoverageLinkError, DeviceError},
    socket_coverage_collector::CoverageSource,
};

/// What the fake device does with one delivered intent.
#[derive(Clone, Debug)]
pub enum Step {
    Complete,
    /// The idle signal never comes.
    Hang,
    /// `am` itself does not return.
    CommandTimeout,
    /// The process dies, leaving the given crash log.
    Crash(String),
    /// The idle signal never comes because the process died.
    HangAndCrash(String),
    Reject,
    OutOfResources,
}

#[derive(Debug)]
pub struct FakeDevice {
    steps: VecDeque<Step>,
    current: Step,
    pid: u32,
    alive: bool,
    crash_log: String,
    /// Pid checks that succeed before every further one fails.
    pid_checks_left: Option<usize>,

    pub delivered: Vec<String>,
    pub files: Vec<(String, Vec<u8>)>,
    pub contents: Vec<(Vec<u8>, Vec<u8>)>,
    pub armed: usize,
    pub waits: usize,
    pub restarts: usize,
    /// The `since` of every crash log read.
    pub log_reads: Vec<SystemTime>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            current: Step::Complete,
            pid: 1000,
            alive: true,
            crash_log: String::new(),
            pid_checks_left: None,
            delivered: Vec::new(),
            files: Vec::new(),
            contents: Vec::new(),
            armed: 0,
            waits: 0,
            restarts: 0,
            log_reads: Vec::new(),
        }
    }

    /// Queues the behaviour of the next delivery. Deliveries past the script
    /// complete.
    pub fn script(&mut self, step: Step) {
        self.steps.push_back(step);
    }

    /// Lets `checks` more pid checks succeed, then fails every further one.
    pub fn fail_pid_checks_after(&mut self, checks: usize) {
        self.pid_checks_left = Some(checks);
    }
}

impl Device for FakeDevice {
    fn deliver(&mut self, command: &str, _timeout: Duration) -> Result<(), DeviceError> {
        self.current = self.steps.pop_front().unwrap_or(Step::Complete);

        match &self.current {
            Step::Reject => {
                return Err(DeviceError::Rejected {
                    command: command.to_owned(),
                    stdout: String::new(),
                    stderr: "Error: bad component".to_owned(),
                })
            }
            Step::OutOfResources => return Err(DeviceError::OutOfResources(command.to_owned())),
            _ => {}
        }

        self.delivered.push(command.to_owned());

        match self.current.clone() {
            Step::CommandTimeout => Err(DeviceError::TimedOut(command.to_owned())),
            Step::Crash(log) | Step::HangAndCrash(log) => {
                self.alive = false;
                self.crash_log = log;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn create_file(&mut self, path: &str, content: &[u8]) -> Result<(), DeviceError> {
        self.files.push((path.to_owned(), content.to_vec()));
        Ok(())
    }

    fn register_content(&mut self, uri: &[u8], content: &[u8]) -> Result<(), DeviceError> {
        self.contents.push((uri.to_vec(), content.to_vec()));
        Ok(())
    }

    fn arm_idle(&mut self) -> Result<(), DeviceError> {
        self.armed += 1;
        Ok(())
    }

    fn wait_idle(&mut self, _timeout: Duration) -> Result<IdleWait, DeviceError> {
        self.waits += 1;
        Ok(match self.current {
            Step::Hang | Step::HangAndCrash(_) => IdleWait::TimedOut,
            _ => IdleWait::Released,
        })
    }

    fn clock(&mut self) -> Result<SystemTime, DeviceError> {
        // Far behind the host.
        Ok(UNIX_EPOCH + Duration::from_secs(1_000))
    }

    fn pid_of(&mut self, _package: &str) -> Result<Option<String>, DeviceError> {
        match &mut self.pid_checks_left {
            Some(0) => {
                return Err(DeviceError::Rejected {
                    command: "pidof".to_owned(),
                    stdout: String::new(),
                    stderr: "error: device offline".to_owned(),
                })
            }
            Some(left) => *left -= 1,
            None => {}
        }
        Ok(Some(self.pid.to_string()).filter(|_| self.alive))
    }

    fn restart_app(&mut self, _package: &str) -> Result<(), DeviceError> {
        self.restarts += 1;
        self.pid += 1;
        self.alive = true;
        Ok(())
    }

    fn crash_log_since(&mut self, since: SystemTime) -> Result<String, DeviceError> {
        self.log_reads.push(since);
        Ok(self.crash_log.clone())
    }

    fn log_tail(&mut self, _lines: usize) -> Result<String, DeviceError> {
        Ok("I ActivityManager: still waiting".to_owned())
    }
}

/// A coverage agent replaying scripted snapshots.
#[derive(Debug)]
pub struct FakeCoverage {
    map_size: usize,
    snapshots: VecDeque<Vec<u8>>,
    /// Link operations left before the link breaks for good.
    healthy_operations: Option<usize>,
    /// Dumps to lose before sampling works again.
    lost_dumps: usize,
    connected: bool,

    pub connects: usize,
    pub begins: usize,
    pub samples: usize,
    pub trace_names: Vec<String>,
}

impl FakeCoverage {
    pub fn new(map_size: usize) -> Self {
        Self {
            map_size,
            snapshots: VecDeque::new(),
            healthy_operations: None,
            lost_dumps: 0,
            connected: false,
            connects: 0,
            begins: 0,
            samples: 0,
            trace_names: Vec::new(),
        }
    }

    /// Queues the snapshot of the next sample. Samples past the script are
    /// all zero.
    pub fn script(&mut self, hits: &[usize]) {
        let mut snapshot = vec![0u8; self.map_size];
        for &edge in hits {
            snapshot[edge] = snapshot[edge].saturating_add(1);
        }
        self.snapshots.push_back(snapshot);
    }

    /// Breaks the link after `operations` more successful operations.
    pub fn break_after(&mut self, operations: usize) {
        self.healthy_operations = Some(operations);
    }

    /// Loses the next `dumps` samples; the link comes back after each.
    pub fn lose_dumps(&mut self, dumps: usize) {
        self.lost_dumps = dumps;
    }

    fn operate(&mut self) -> Result<(), CoverageLinkError> {
        if !self.connected {
            return Err(CoverageLinkError::NotConnected);
        }
        match &mut self.healthy_operations {
            Some(0) => {
                self.connected = false;
                Err(CoverageLinkError::Exhausted(1))
            }
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl CoverageSource for FakeCoverage {
    fn map_size(&self) -> usize {
        self.map_size
    }

    fn connect(&mut self) -> Result<(), CoverageLinkError> {
        self.connects += 1;
        if self.healthy_operations == Some(0) {
            return Err(CoverageLinkError::Exhausted(1));
        }
        self.connected = true;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), CoverageLinkError> {
        self.connected = false;
        self.connect()
    }

    fn begin_execution(&mut self, trace_name: Option<&str>) -> Result<(), CoverageLinkError> {
        self.operate()?;
        self.begins += 1;
        if let Some(name) = trace_name {
            self.trace_names.push(name.to_owned());
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>, CoverageLinkError> {
        self.operate()?;
        self.samples += 1;
        if self.lost_dumps > 0 {
            self.lost_dumps -= 1;
            self.reconnect()?;
            return Ok(None);
        }
        Ok(Some(
            self.snapshots
                .pop_front()
                .unwrap_or_else(|| vec![0; self.map_size]),
        ))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}
