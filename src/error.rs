//! Error types of the fuzzer, one enum per failure domain.

use std::{io, path::PathBuf};

use thiserror::Error;

/// A malformed or conflicting intent template. Fatal at startup.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to read intent template {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Malformed intent template {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Intent template {path} declares extra `{key}` with unknown kind `{kind}`")]
    UnknownKind {
        path: PathBuf,
        key: String,
        kind: String,
    },
    #[error("Intent template {path} has unknown receiver type `{receiver_type}`")]
    UnknownReceiverType { path: PathBuf, receiver_type: String },
    #[error("Intent template {path} has an invalid component `{component}`")]
    InvalidComponent { path: PathBuf, component: String },
    #[error("Component {component} is declared by both {first} and {second}")]
    DuplicateComponent {
        component: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Intent templates target more than one package ({first} and {second})")]
    MixedPackages { first: String, second: String },
    #[error("No intent templates found in {0}")]
    Empty(PathBuf),
}

/// A failed interaction with the device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("Command rejected: {command}\nStdout: {stdout}\nStderr: {stderr}")]
    Rejected {
        command: String,
        stdout: String,
        stderr: String,
    },
    #[error("Device is out of resources while running `{0}`")]
    OutOfResources(String),
    #[error("Command timed out: {0}")]
    TimedOut(String),
    #[error("Failed to start app {app}: {reason}")]
    AppStart { app: String, reason: String },
    #[error("Failed to stop app {0}")]
    AppStop(String),
    #[error("I/O error talking to the device: {0}")]
    Io(#[from] io::Error),
}

/// The coverage agent socket is unavailable or broken.
#[derive(Debug, Error)]
pub enum CoverageLinkError {
    #[error("Failed to connect to coverage agent at {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("Coverage agent socket error: {0}")]
    Io(#[from] io::Error),
    #[error("Unexpected reply from coverage agent (expected {expected:?}, got {got:?})")]
    Protocol { expected: u8, got: u8 },
    #[error("Coverage agent unreachable after {0} attempts")]
    Exhausted(u32),
    #[error("Coverage collector is not connected")]
    NotConnected,
}

/// Persisting the corpus, crashes or coverage ledger failed. Fatal, since
/// losing entries silently would break resuming the session.
#[derive(Debug, Error)]
pub enum CorpusIoError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to (de)serialize {path}: {source}")]
    Serde {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl CorpusIoError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CorpusIoError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serde(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        CorpusIoError::Serde {
            path: path.into(),
            source,
        }
    }
}

/// Errors that end a fuzzing session.
#[derive(Debug, Error)]
pub enum FuzzerError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    CoverageLink(#[from] CoverageLinkError),
    #[error(transparent)]
    CorpusIo(#[from] CorpusIoError),
    #[error("Environment fault: {failures} consecutive delivery failures, last command: {command}")]
    EnvironmentFault { command: String, failures: u32 },
    #[error("Mutation failed: {0}")]
    Mutation(String),
    #[error("Coverage classification failed: {0}")]
    Coverage(String),
    #[error("Failed to encode session stats: {0}")]
    Stats(#[from] toml::ser::Error),
    #[error("Nothing to fuzz: no seed inputs and an empty corpus")]
    NoLiveEntries,
}
