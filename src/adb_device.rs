//! ADB device representing an Android device or emulator.
//!
//! [Device] is everything the executor needs from the device: delivering an
//! intent, staging URI payloads, the idle barrier, process liveness and crash
//! evidence. [AdbDevice] implements it on top of `adb shell`.

use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    path::Path,
    process::{Command, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};
use tempfile::tempdir;

use crate::{error::DeviceError, util::encode_hex};

/// Logged by the instrumented runtime once an activity's main thread drained
/// its startup work.
pub const IDLE_MARKER: &str = "ActivityThread: Reporting idle of ActivityRecord";

/// Shared object the coverage agent is attached from when the app starts.
const COVERAGE_AGENT: &str = "libcoverage_instrumenting_agent.so";

/// How long `start_app` waits for the launcher activity to go idle.
const APP_START_TIMEOUT: Duration = Duration::from_secs(20);

/// Result of waiting on the idle barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleWait {
    Released,
    TimedOut,
}

/// The device-side operations of one fuzzing session.
pub trait Device {
    /// Issues an `am start`/`am broadcast` command. `Ok` means the runtime
    /// accepted the intent, [DeviceError::TimedOut] that `am` itself did not
    /// return (broadcasts block until the receiver finished).
    fn deliver(&mut self, command: &str, timeout: Duration) -> Result<(), DeviceError>;

    /// Writes `content` to a file on the device.
    fn create_file(&mut self, path: &str, content: &[u8]) -> Result<(), DeviceError>;

    /// Registers `content` with the helper content provider under `uri`.
    fn register_content(&mut self, uri: &[u8], content: &[u8]) -> Result<(), DeviceError>;

    /// The device's wall clock. Log timestamps are in device time.
    fn clock(&mut self) -> Result<SystemTime, DeviceError>;

    /// Starts listening for the idle signal. Called right before delivery so
    /// a release caused by an earlier intent is not picked up.
    fn arm_idle(&mut self) -> Result<(), DeviceError>;

    /// Blocks until the idle signal armed by [Device::arm_idle] is released,
    /// or `timeout` passes.
    fn wait_idle(&mut self, timeout: Duration) -> Result<IdleWait, DeviceError>;

    /// Pid of the app's main process, `None` if it is not running.
    fn pid_of(&mut self, package: &str) -> Result<Option<String>, DeviceError>;

    /// Force-stops the app and launches it again.
    fn restart_app(&mut self, package: &str) -> Result<(), DeviceError>;

    /// Contents of the crash log written since `since`, in device time.
    fn crash_log_since(&mut self, since: SystemTime) -> Result<String, DeviceError>;

    /// The last `lines` lines of the main log.
    fn log_tail(&mut self, lines: usize) -> Result<String, DeviceError>;
}

#[derive(Clone, Debug)]
pub struct AdbDevice {
    adb_command: String,
    serial: Option<String>,
    idle_armed_at: Option<SystemTime>,
}

impl AdbDevice {
    pub fn new(adb_command: &str, serial: Option<&str>) -> Self {
        Self {
            adb_command: adb_command.to_owned(),
            serial: serial.map(str::to_owned),
            idle_armed_at: None,
        }
    }

    /// `adb` with the device selected.
    fn adb(&self) -> Command {
        let mut command = Command::new(&self.adb_command);
        if let Some(serial) = &self.serial {
            command.arg("-s").arg(serial);
        }
        command
    }

    fn adb_argv(&self, shell_command: &str) -> Vec<String> {
        let mut argv = vec![self.adb_command.clone()];
        if let Some(serial) = &self.serial {
            argv.push("-s".to_owned());
            argv.push(serial.clone());
        }
        argv.push("shell".to_owned());
        argv.push(shell_command.to_owned());
        argv
    }

    /// Runs a command on the device and returns the stdout.
    fn run_command(&self, command: &str) -> Result<String, DeviceError> {
        let mut adb_command = self.adb();
        adb_command.arg("shell").arg(command);
        debug!("Running command: {:?}", adb_command);

        let output = adb_command.output().map_err(|source| DeviceError::Spawn {
            command: command.to_owned(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        // Check the exit code
        if !output.status.success() {
            return Err(DeviceError::Rejected {
                command: command.to_owned(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(stdout)
    }

    /// Spawns a command on the device with piped stdio.
    fn spawn_command(&self, command: &str) -> Result<std::process::Child, DeviceError> {
        let mut adb_command = self.adb();
        adb_command.arg("shell").arg(command);
        debug!("Spawning command: {:?}", adb_command);

        adb_command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                command: command.to_owned(),
                source,
            })
    }

    fn start_app_explicit(&self, app_name: &str) -> Result<(), DeviceError> {
        // Get the main activity of the app
        let output = self.run_command(&format!(
            "cmd package resolve-activity --brief {} | tail -n 1",
            app_name
        ))?;

        let main_activity = output.trim();

        // Bail out if there is any space character in the main activity
        if main_activity.is_empty() || main_activity.contains(' ') {
            return Err(DeviceError::AppStart {
                app: app_name.to_owned(),
                reason: format!("invalid main activity `{}`", main_activity),
            });
        }

        // Start the app
        let command = format!(
            "am start-activity --attach-agent /data/user/0/{}/code_cache/startup_agents/{} {}",
            app_name, COVERAGE_AGENT, main_activity
        );

        self.run_command(&command)
            .map(|_| ())
            .map_err(|err| DeviceError::AppStart {
                app: app_name.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Tries to start the app with the given name.
    pub fn start_app(&mut self, app_name: &str) -> Result<(), DeviceError> {
        info!("Starting app: {}", app_name);

        self.arm_idle()?;
        self.start_app_explicit(app_name)?;

        if self.wait_idle(APP_START_TIMEOUT)? == IdleWait::TimedOut {
            return Err(DeviceError::AppStart {
                app: app_name.to_owned(),
                reason: "could not find idle message in logcat".to_owned(),
            });
        }

        let pid = self.pid_of(app_name)?;
        info!("App started (pid {})", pid.as_deref().unwrap_or("?"));

        Ok(())
    }

    /// Stops the app with the given name.
    pub fn stop_app(&self, app_name: &str) -> Result<(), DeviceError> {
        info!("Stopping app: {}", app_name);
        for _ in 0..5 {
            if self.run_command(&format!("pm disable {}", app_name)).is_ok()
                && self.run_command(&format!("pm enable {}", app_name)).is_ok()
            {
                return Ok(());
            }

            thread::sleep(Duration::from_secs(1));
        }

        Err(DeviceError::AppStop(app_name.to_owned()))
    }

    /// Restart the entire device via adb.
    pub fn restart_device(&self) -> Result<(), DeviceError> {
        warn!("Restarting device");
        self.run_command("stop")?;
        thread::sleep(Duration::from_secs(1));
        self.run_command("start")?;
        thread::sleep(Duration::from_secs(3));
        Ok(())
    }

    /// Enables native hooking for an application and restarts it, if it was not already enabled.
    pub fn enable_native_hooking(&mut self, app_name: &str) -> Result<(), DeviceError> {
        info!("Enabling native hooking for app: {}", app_name);
        let was_enabled = self.is_native_hooking_enabled(app_name);

        self.run_command(&format!("touch {}", native_hook_marker(app_name)))?;

        if !was_enabled {
            self.restart_app(app_name)?;
        }
        Ok(())
    }

    /// Disables native hooking for an application and restarts it, if it was enabled.
    pub fn disable_native_hooking(&mut self, app_name: &str) -> Result<(), DeviceError> {
        info!("Disabling native hooking for app: {}", app_name);
        let was_enabled = self.is_native_hooking_enabled(app_name);

        self.run_command(&format!("rm -f {}", native_hook_marker(app_name)))?;

        if was_enabled {
            self.restart_app(app_name)?;
        }
        Ok(())
    }

    /// Check if native hooking is enabled for the given app.
    pub fn is_native_hooking_enabled(&self, app_name: &str) -> bool {
        let filename = native_hook_marker(app_name);

        match self.run_command(&format!("ls {}", filename)) {
            Ok(output) => output.trim() == filename,
            Err(_) => false,
        }
    }

    /// Pulls trace files from the device into `trace_dir_host` and removes
    /// them from the device.
    pub fn pull_native_trace_files(
        &self,
        app_name: &str,
        trace_dir_host: &Path,
    ) -> Result<usize, DeviceError> {
        info!("Pulling trace files for app: {}", app_name);

        // The trace files are located in the app's data directory
        let trace_dir = format!("/data/user/0/{}/native_traces", app_name);

        // Pull the files to a temporary directory
        let temp_dir = tempdir()?;
        let temp_dir_path = temp_dir.path().to_owned();

        let output = self
            .adb()
            .arg("pull")
            .arg(&trace_dir)
            .arg(&temp_dir_path)
            .output()?;
        debug!("adb pull: {}", String::from_utf8_lossy(&output.stdout).trim());

        let native_traces_dir = temp_dir_path.join("native_traces");
        if !native_traces_dir.exists() {
            info!("No native traces found");
            return Ok(0);
        }

        fs::create_dir_all(trace_dir_host)?;
        let mut pulled = 0;
        for entry in fs::read_dir(native_traces_dir)? {
            let entry = entry?;
            fs::copy(entry.path(), trace_dir_host.join(entry.file_name()))?;
            pulled += 1;
        }

        // Delete the files on the device
        self.run_command(&format!("rm -rf {}", trace_dir))?;

        Ok(pulled)
    }

    /// Grant content provider uri permissions to the given package.
    pub fn grant_uri_permissions(&self, package: &str) -> Result<(), DeviceError> {
        self.run_command(&format!(
            "am broadcast -n 'org.gts3.jnifuzz.contentprovider/org.gts3.jnifuzz.contentprovider.UriPermissionManager' \
            -a org.gts3.jnifuzz.sampleintent.GRANT_PERMISSION \
            --es android.intent.extra.PACKAGE_NAME '{}'",
            package,
        ))?;
        Ok(())
    }

    /// Set the given app as debug app.
    pub fn set_debug_app(&self, package: &str) -> Result<(), DeviceError> {
        self.run_command(&format!("am set-debug-app --persistent {}", package))?;
        Ok(())
    }
}

impl Device for AdbDevice {
    fn deliver(&mut self, command: &str, timeout: Duration) -> Result<(), DeviceError> {
        debug!("Delivering: {}", command);

        let mut p = Popen::create(
            &self.adb_argv(command),
            PopenConfig {
                stdout: Redirection::Pipe,
                stderr: Redirection::Pipe,
                ..Default::default()
            },
        )
        .map_err(|err| DeviceError::Spawn {
            command: command.to_owned(),
            source: popen_error(err),
        })?;

        // Wait for the command to finish
        let finished = p
            .wait_timeout(timeout)
            .map_err(|err| DeviceError::Io(popen_error(err)))?;
        if finished.is_none() {
            warn!("Command timed out: {}", command);
            if let Err(err) = p.kill() {
                warn!("Failed to kill adb: {}", err);
            }
            let _ = p.wait();
            return Err(DeviceError::TimedOut(command.to_owned()));
        }

        // Capture stdout and stderr
        let mut stdout = Vec::new();
        if let Some(mut pipe) = p.stdout.take() {
            pipe.read_to_end(&mut stdout)?;
        }
        let mut stderr = Vec::new();
        if let Some(mut pipe) = p.stderr.take() {
            pipe.read_to_end(&mut stderr)?;
        }
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let exit_status = p.poll();

        classify_delivery(command, exit_status, stdout, stderr)
    }

    fn create_file(&mut self, path: &str, content: &[u8]) -> Result<(), DeviceError> {
        self.run_command(&format!("touch {}", path))?;

        self.run_command(&format!(
            "echo -n -e \"{}\" > {}",
            encode_hex(content),
            path
        ))?;
        Ok(())
    }

    fn register_content(&mut self, uri: &[u8], content: &[u8]) -> Result<(), DeviceError> {
        let uri = String::from_utf8_lossy(uri);
        let command = format!("content write --uri {}", uri);
        let mut child = self.spawn_command(&command)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content)?;
            // Closing stdin ends the upload
        }

        let status = child.wait()?;
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(DeviceError::Rejected {
                command,
                stdout: String::new(),
                stderr,
            });
        }
        Ok(())
    }

    fn clock(&mut self) -> Result<SystemTime, DeviceError> {
        let command = "date +%s.%N";
        let output = self.run_command(command)?;
        parse_device_time(&output).ok_or_else(|| DeviceError::Rejected {
            command: command.to_owned(),
            stdout: output,
            stderr: "unexpected date format".to_owned(),
        })
    }

    fn arm_idle(&mut self) -> Result<(), DeviceError> {
        self.idle_armed_at = Some(self.clock()?);
        Ok(())
    }

    fn wait_idle(&mut self, timeout: Duration) -> Result<IdleWait, DeviceError> {
        let armed_at = match self.idle_armed_at.take() {
            Some(time) => time,
            None => self.clock()?,
        };

        // Follow the log from the moment the barrier was armed.
        let mut logcat = self.spawn_command(&format!("logcat -T '{}'", logcat_time(armed_at)))?;
        let Some(stdout) = logcat.stdout.take() else {
            let _ = logcat.kill();
            return Err(DeviceError::TimedOut("logcat has no stdout".to_owned()));
        };

        let (sender, receiver) = mpsc::channel();
        let reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else {
                    continue;
                };
                if line.contains(IDLE_MARKER) {
                    debug!("Found idle message: {}", line);
                    let _ = sender.send(());
                    return;
                }
            }
        });

        let result = match receiver.recv_timeout(timeout) {
            Ok(()) => IdleWait::Released,
            Err(_) => IdleWait::TimedOut,
        };

        // Killing logcat closes its stdout, which ends the reader.
        if let Err(err) = logcat.kill() {
            debug!("logcat already exited: {}", err);
        }
        let _ = logcat.wait();
        let _ = reader.join();

        Ok(result)
    }

    fn pid_of(&mut self, package: &str) -> Result<Option<String>, DeviceError> {
        match self.run_command(&format!("pidof -s {}", package)) {
            Ok(output) => {
                let pid = output.trim().to_owned();
                Ok(Some(pid).filter(|pid| !pid.is_empty()))
            }
            // pidof exits non-zero when no process matches
            Err(DeviceError::Rejected { stdout, stderr, .. }) if stderr.trim().is_empty() => {
                let pid = stdout.trim().to_owned();
                Ok(Some(pid).filter(|pid| !pid.is_empty()))
            }
            Err(err) => Err(err),
        }
    }

    fn restart_app(&mut self, app_name: &str) -> Result<(), DeviceError> {
        info!("Restarting app: {}", app_name);

        let mut last_error = None;
        for i in 0..5 {
            if i > 1 {
                self.restart_device()?;
            }

            self.stop_app(app_name)?;

            // Some apps need to be started immediately, others need some time
            thread::sleep(Duration::from_secs(i % 2));

            match self.start_app(app_name) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("Failed to start app: {}", err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DeviceError::AppStart {
            app: app_name.to_owned(),
            reason: "out of attempts".to_owned(),
        }))
    }

    fn crash_log_since(&mut self, since: SystemTime) -> Result<String, DeviceError> {
        self.run_command(&format!("logcat -b crash -d -t '{}'", logcat_time(since)))
    }

    fn log_tail(&mut self, lines: usize) -> Result<String, DeviceError> {
        self.run_command(&format!("logcat -d -t {}", lines))
    }
}

/// Decides whether `am` accepted an intent from its exit status and output.
fn classify_delivery(
    command: &str,
    exit_status: Option<ExitStatus>,
    stdout: String,
    stderr: String,
) -> Result<(), DeviceError> {
    if stderr.contains("intent has been delivered to currently running top-most instance.") {
        return Ok(());
    }

    // If the device is low on resources, the app needs a restart
    if stderr.contains("OutOfResourcesException")
        || stderr.contains("Activity not started, its current task has been brought to the front")
    {
        return Err(DeviceError::OutOfResources(command.to_owned()));
    }

    // Successful if stderr is empty
    if let Some(ExitStatus::Exited(0)) = exit_status {
        if stderr.trim().is_empty() && !stdout.contains("Error:") {
            return Ok(());
        }
    }

    Err(DeviceError::Rejected {
        command: command.to_owned(),
        stdout,
        stderr,
    })
}

fn popen_error<E>(err: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::Other, err)
}

/// `<epoch secs>.<millis>`, the timestamp format logcat's `-t`/`-T` accept.
fn logcat_time(time: SystemTime) -> String {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:03}", since_epoch.as_secs(), since_epoch.subsec_millis())
}

/// Parses `date +%s.%N` output. Shells without `%N` print it literally, the
/// fraction is dropped then.
fn parse_device_time(output: &str) -> Option<SystemTime> {
    let (secs, fraction) = match output.trim().split_once('.') {
        Some((secs, fraction)) => (secs, fraction),
        None => (output.trim(), ""),
    };
    let secs = secs.parse::<u64>().ok()?;

    let nanos = if !fraction.is_empty() && fraction.bytes().all(|b| b.is_ascii_digit()) {
        let digits: String = fraction.chars().chain("000000000".chars()).take(9).collect();
        digits.parse::<u32>().ok()?
    } else {
        0
    };

    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}

/// The file ".hook_native" in the app's data directory turns native hooking on.
fn native_hook_marker(app_name: &str) -> String {
    format!("/data/user/0/{}/.hook_native", app_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_most_instance_counts_as_delivered() {
        let stderr = "Warning: Activity not started, intent has been delivered to currently running top-most instance.".to_owned();
        assert!(classify_delivery("am start", Some(ExitStatus::Exited(0)), String::new(), stderr).is_ok());
    }

    #[test]
    fn clean_exit_is_delivered() {
        let stdout = "Starting: Intent { cmp=com.example/.Main }".to_owned();
        assert!(classify_delivery("am start", Some(ExitStatus::Exited(0)), stdout, String::new()).is_ok());
    }

    #[test]
    fn missing_activity_is_rejected() {
        let stderr = "Error type 3\nError: Activity class {com.example/.Nope} does not exist.".to_owned();
        let result = classify_delivery("am start", Some(ExitStatus::Exited(0)), String::new(), stderr);
        assert!(matches!(result, Err(DeviceError::Rejected { .. })));
    }

    #[test]
    fn out_of_resources_is_reported() {
        let stderr = "java.lang.RuntimeException: OutOfResourcesException".to_owned();
        let result = classify_delivery("am start", Some(ExitStatus::Exited(255)), String::new(), stderr);
        assert!(matches!(result, Err(DeviceError::OutOfResources(_))));
    }

    #[test]
    fn non_zero_exit_is_rejected() {
        let result = classify_delivery("am broadcast", Some(ExitStatus::Exited(1)), String::new(), String::new());
        assert!(matches!(result, Err(DeviceError::Rejected { .. })));
    }

    #[test]
    fn logcat_time_has_millis() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_042);
        assert_eq!(logcat_time(time), "1700000000.042");
    }

    #[test]
    fn device_time_is_parsed_to_logcat_time() {
        let time = parse_device_time("1700000000.042123456\n").unwrap();
        assert_eq!(logcat_time(time), "1700000000.042");

        // toybox without %N support
        let time = parse_device_time("1700000000.N\n").unwrap();
        assert_eq!(logcat_time(time), "1700000000.000");

        let time = parse_device_time("1700000000.5").unwrap();
        assert_eq!(logcat_time(time), "1700000000.500");

        assert_eq!(parse_device_time("date: bad format"), None);
    }

    #[test]
    fn serial_selects_the_device() {
        let device = AdbDevice::new("adb", Some("emulator-5554"));
        assert_eq!(
            device.adb_argv("pidof -s com.example"),
            vec!["adb", "-s", "emulator-5554", "shell", "pidof -s com.example"]
        );
    }
}
