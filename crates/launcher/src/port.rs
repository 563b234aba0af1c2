//! Rendezvous port selection
//!
//! Picks a random port and checks it against the machine's listening-socket
//! table. The check is not a reservation: another process can still bind the
//! port before the parameter servers do.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::Command;

use launch_core::{AllocatedPort, Error, Result};
use rand::Rng;
use tracing::{debug, info};

/// Range candidate ports are drawn from
pub const CANDIDATE_PORTS: RangeInclusive<u16> = 10000..=65535;

/// Default number of candidates tried before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// TCP state code for LISTEN in `/proc/net/tcp*`
const TCP_LISTEN: &str = "0A";

/// Source of the local listening-port table
pub trait ListeningPorts: Send + Sync {
    /// Ports currently in LISTEN state on this machine
    fn listening_ports(&self) -> Result<HashSet<u16>>;
}

/// Reads `/proc/net/tcp` and `/proc/net/tcp6`
#[derive(Debug, Clone)]
pub struct ProcNetTable {
    paths: Vec<PathBuf>,
}

impl ProcNetTable {
    pub fn new() -> Self {
        Self {
            paths: vec![
                PathBuf::from("/proc/net/tcp"),
                PathBuf::from("/proc/net/tcp6"),
            ],
        }
    }

    /// Read from explicit table files instead of `/proc`
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }
}

impl Default for ProcNetTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ListeningPorts for ProcNetTable {
    fn listening_ports(&self) -> Result<HashSet<u16>> {
        let mut ports = HashSet::new();
        for path in &self.paths {
            match std::fs::read_to_string(path) {
                Ok(contents) => ports.extend(parse_proc_net(&contents)),
                // tcp6 is absent on hosts without IPv6
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Socket table not present, skipping");
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(ports)
    }
}

/// Runs `netstat -tuln` for platforms without `/proc/net`
#[derive(Debug, Clone, Default)]
pub struct NetstatTable;

impl ListeningPorts for NetstatTable {
    fn listening_ports(&self) -> Result<HashSet<u16>> {
        let output = Command::new("netstat").arg("-tuln").output()?;
        if !output.status.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "netstat exited with {}",
                output.status
            ))));
        }
        Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Best listening-port source for the current platform
pub fn system_table() -> Box<dyn ListeningPorts> {
    if ProcNetTable::is_available() {
        Box::new(ProcNetTable::new())
    } else {
        Box::new(NetstatTable)
    }
}

/// Extract LISTEN ports from the contents of a `/proc/net/tcp*` file
fn parse_proc_net(contents: &str) -> HashSet<u16> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let local = fields.nth(1)?;
            let state = fields.nth(1)?;
            if state != TCP_LISTEN {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

/// Extract LISTEN ports from `netstat -tuln` output
fn parse_netstat(output: &str) -> HashSet<u16> {
    output
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .filter_map(|line| {
            let local = line.split_whitespace().nth(3)?;
            let (_, port) = local.rsplit_once(':')?;
            port.parse().ok()
        })
        .collect()
}

/// Picks a free rendezvous port
pub struct PortAllocator {
    table: Box<dyn ListeningPorts>,
    range: RangeInclusive<u16>,
    max_attempts: u32,
}

impl PortAllocator {
    /// Create an allocator backed by the system socket table
    pub fn new(max_attempts: u32) -> Self {
        Self::with_table(system_table(), max_attempts)
    }

    /// Create an allocator backed by a custom socket table
    pub fn with_table(table: Box<dyn ListeningPorts>, max_attempts: u32) -> Self {
        Self {
            table,
            range: CANDIDATE_PORTS,
            max_attempts,
        }
    }

    /// Restrict the candidate range
    pub fn with_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.range = range;
        self
    }

    /// Draw candidates until one is not listening, or the attempt budget runs out
    pub fn allocate(&self) -> Result<AllocatedPort> {
        let mut rng = rand::thread_rng();

        for attempt in 1..=self.max_attempts {
            let candidate = rng.gen_range(self.range.clone());
            let listening = self.table.listening_ports()?;

            if !listening.contains(&candidate) {
                info!(port = candidate, attempt, "Allocated rendezvous port");
                return Ok(AllocatedPort::new(candidate));
            }

            debug!(port = candidate, attempt, "Candidate port in use");
        }

        Err(Error::PortAllocationFailed {
            attempts: self.max_attempts,
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
