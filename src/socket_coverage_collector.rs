//! Handles getting the coverage map from CoverageAgent over a socket.
//!
//! The agent speaks a byte protocol: `ss`/`se` selects synchronised or
//! unsynchronised mode right after connecting, `ts<name>\n` names the next
//! native trace file, `r` resets the counters (answered by `d`) and `d`
//! dumps them (answered by exactly `map_size` bytes).

use std::{
    io::{BufReader, Read, Write},
    net::TcpStream,
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::error::CoverageLinkError;

/// Default size of the agent's edge map.
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024;

/// A source of per-execution edge counters.
pub trait CoverageSource {
    /// Number of edge counters in every sample.
    fn map_size(&self) -> usize;

    fn connect(&mut self) -> Result<(), CoverageLinkError>;

    /// Drops the link and connects again, with bounded retries.
    fn reconnect(&mut self) -> Result<(), CoverageLinkError>;

    /// Resets the agent's counters before an execution. `trace_name` names
    /// the native trace file of the execution, if tracing is on.
    fn begin_execution(&mut self, trace_name: Option<&str>) -> Result<(), CoverageLinkError>;

    /// The counters hit since [CoverageSource::begin_execution]. `None` if
    /// the dump was lost and the link had to be re-established; the
    /// execution's coverage is unknown then.
    fn sample(&mut self) -> Result<Option<Vec<u8>>, CoverageLinkError>;

    fn disconnect(&mut self);
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    /// `host:port` of the coverage agent.
    pub address: String,
    pub map_size: usize,
    /// Synchronised mode, used for activities.
    pub synchronization: bool,
    /// Connection attempts before giving up.
    pub retries: u32,
    /// Delay before the first retry, doubled on every further one.
    pub backoff: Duration,
    pub read_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            address: "localhost:6249".to_owned(),
            map_size: DEFAULT_MAP_SIZE,
            synchronization: true,
            retries: 5,
            backoff: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
        }
    }
}

struct Link {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

pub struct SocketCoverageCollector {
    config: CollectorConfig,
    link: Option<Link>,
}

impl SocketCoverageCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config, link: None }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn open(&self) -> Result<Link, CoverageLinkError> {
        let connect_error = |source| CoverageLinkError::Connect {
            address: self.config.address.clone(),
            source,
        };

        let mut stream = TcpStream::connect(&self.config.address).map_err(connect_error)?;
        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(connect_error)?;
        stream.set_nodelay(true).map_err(connect_error)?;
        let reader = BufReader::new(stream.try_clone().map_err(connect_error)?);

        // Set up the socket for synchronization if requested.
        stream.write_all(if self.config.synchronization {
            b"ss"
        } else {
            b"se"
        })?;

        Ok(Link { stream, reader })
    }

    /// Tries to open the link up to `retries` times, backing off in between.
    fn open_with_retries(&mut self) -> Result<(), CoverageLinkError> {
        let attempts = self.config.retries.max(1);
        let mut backoff = self.config.backoff;

        for attempt in 1..=attempts {
            match self.open() {
                Ok(link) => {
                    info!("Connected to coverage agent at {}", self.config.address);
                    self.link = Some(link);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "Coverage agent connection attempt {}/{} failed: {}",
                        attempt, attempts, err
                    );
                    if attempt < attempts {
                        thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }

        Err(CoverageLinkError::Exhausted(attempts))
    }

    fn link(&mut self) -> Result<&mut Link, CoverageLinkError> {
        self.link.as_mut().ok_or(CoverageLinkError::NotConnected)
    }

    fn reset_coverage(&mut self, trace_name: Option<&str>) -> Result<(), CoverageLinkError> {
        let link = self.link()?;

        if let Some(name) = trace_name {
            // Write "ts", the filename, and a newline to the socket.
            link.stream.write_all(b"ts")?;
            link.stream.write_all(name.as_bytes())?;
            link.stream.write_all(b"\n")?;
        }

        link.stream.write_all(b"r")?;
        let mut buffer = [0; 1];
        link.reader.read_exact(&mut buffer)?;
        // Check buffer contains b'd'
        if buffer[0] != b'd' {
            return Err(CoverageLinkError::Protocol {
                expected: b'd',
                got: buffer[0],
            });
        }
        Ok(())
    }

    fn dump_coverage(&mut self) -> Result<Vec<u8>, CoverageLinkError> {
        let map_size = self.config.map_size;
        let link = self.link()?;

        // Retrieve the coverage from the socket.
        link.stream.write_all(b"d")?;
        let mut buffer = vec![0; map_size];
        link.reader.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

impl CoverageSource for SocketCoverageCollector {
    fn map_size(&self) -> usize {
        self.config.map_size
    }

    fn connect(&mut self) -> Result<(), CoverageLinkError> {
        self.open_with_retries()
    }

    fn reconnect(&mut self) -> Result<(), CoverageLinkError> {
        self.disconnect();
        self.open_with_retries()
    }

    fn begin_execution(&mut self, trace_name: Option<&str>) -> Result<(), CoverageLinkError> {
        match self.reset_coverage(trace_name) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Failed to reset coverage, reconnecting: {}", err);
                self.reconnect()?;
                self.reset_coverage(trace_name)
            }
        }
    }

    fn sample(&mut self) -> Result<Option<Vec<u8>>, CoverageLinkError> {
        if !self.is_connected() {
            return Err(CoverageLinkError::NotConnected);
        }

        match self.dump_coverage() {
            Ok(map) => Ok(Some(map)),
            Err(err) => {
                // A half-read dump leaves the stream out of sync.
                warn!("Failed to dump coverage, reconnecting: {}", err);
                self.reconnect()?;
                Ok(None)
            }
        }
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            debug!("Disconnected from coverage agent");
        }
    }
}
