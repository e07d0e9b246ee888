//! Test configuration: roles, protocol selection, bounds and defaults.

use crate::error::{Error, Result};

/// Default control/data port
pub const DEFAULT_PORT: u16 = 5201;

/// Default test duration in seconds
pub const DEFAULT_DURATION_SECS: u64 = 10;

/// Default block size for TCP streams
pub const DEFAULT_TCP_BLKSIZE: usize = 128 * 1024;

/// Default block size for UDP streams
pub const DEFAULT_UDP_BLKSIZE: usize = 8 * 1024;

/// Default UDP target rate in bits per second
pub const DEFAULT_UDP_RATE: u64 = 1024 * 1024;

pub const MAX_TIME_SECS: u64 = 86400;
pub const MAX_STREAMS: u32 = 128;
pub const MAX_BLOCKSIZE: usize = 1024 * 1024;
pub const MAX_INTERVAL_SECS: u64 = 60;
pub const MAX_MSS: u32 = 9216;
pub const MAX_BUFFER: usize = 512 * 1024 * 1024;

/// Which endpoint this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Data-channel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn default_blksize(self) -> usize {
        match self {
            Protocol::Tcp => DEFAULT_TCP_BLKSIZE,
            Protocol::Udp => DEFAULT_UDP_BLKSIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Configuration for one test, assembled from the CLI on the client and from
/// the parameter exchange on the server.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub role: Role,
    pub protocol: Protocol,

    /// Server hostname (client only)
    pub server_host: Option<String>,
    pub port: u16,

    /// Test duration in seconds; ignored when `bytes` is set
    pub duration_secs: u64,

    /// Total byte target across all streams (0 = time-bounded)
    pub bytes: u64,

    /// Number of parallel data streams
    pub parallel: u32,

    /// Reverse mode: the server sends to the client
    pub reverse: bool,

    /// Size of one send/receive block
    pub blksize: usize,

    /// Socket buffer size (0 = kernel default)
    pub window: usize,

    /// UDP target rate in bits per second
    pub rate: u64,

    /// Reporting interval in seconds (0 = final summary only)
    pub interval_secs: u64,

    /// TCP maximum segment size to request (0 = default)
    pub mss: u32,

    /// Set TCP_NODELAY on data connections
    pub no_delay: bool,

    /// Report the data connection MSS after the test (client)
    pub print_mss: bool,

    /// Take a TCP diagnostic snapshot per interval
    pub tcp_info: bool,

    /// Unit format for the bandwidth column, one of `kKmMgGaA`
    pub format: char,

    pub verbose: bool,
    pub debug: bool,
}

impl TestConfig {
    /// Client-side defaults for the given server host
    pub fn client(host: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            server_host: Some(host.into()),
            ..Self::server()
        }
    }

    /// Server-side defaults
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            protocol: Protocol::Tcp,
            server_host: None,
            port: DEFAULT_PORT,
            duration_secs: DEFAULT_DURATION_SECS,
            bytes: 0,
            parallel: 1,
            reverse: false,
            blksize: DEFAULT_TCP_BLKSIZE,
            window: 0,
            rate: DEFAULT_UDP_RATE,
            interval_secs: 0,
            mss: 0,
            no_delay: false,
            print_mss: false,
            tcp_info: false,
            format: 'a',
            verbose: false,
            debug: false,
        }
    }

    /// True when this endpoint is the data sender
    pub fn sending(&self) -> bool {
        match self.role {
            Role::Client => !self.reverse,
            Role::Server => self.reverse,
        }
    }

    /// Check the configured values against the protocol bounds.
    pub fn validate(&self) -> Result<()> {
        if self.role == Role::Client && self.server_host.is_none() {
            return Err(Error::InvalidParameter("client requires a server host".into()));
        }
        if self.duration_secs == 0 && self.bytes == 0 {
            return Err(Error::InvalidParameter(
                "test must be bounded by time (-t) or bytes (-n)".into(),
            ));
        }
        if self.duration_secs > MAX_TIME_SECS {
            return Err(Error::InvalidParameter(format!(
                "duration {} exceeds maximum {}",
                self.duration_secs, MAX_TIME_SECS
            )));
        }
        if self.parallel == 0 || self.parallel > MAX_STREAMS {
            return Err(Error::InvalidParameter(format!(
                "stream count must be between 1 and {}",
                MAX_STREAMS
            )));
        }
        if self.blksize == 0 || self.blksize > MAX_BLOCKSIZE {
            return Err(Error::InvalidParameter(format!(
                "block size must be between 1 and {}",
                MAX_BLOCKSIZE
            )));
        }
        if self.protocol == Protocol::Udp && self.blksize < crate::protocol::UDP_HEADER_SIZE {
            return Err(Error::InvalidParameter(format!(
                "UDP block size must hold the {}-byte packet header",
                crate::protocol::UDP_HEADER_SIZE
            )));
        }
        if self.interval_secs > MAX_INTERVAL_SECS {
            return Err(Error::InvalidParameter(format!(
                "interval {} exceeds maximum {}",
                self.interval_secs, MAX_INTERVAL_SECS
            )));
        }
        if self.mss > MAX_MSS {
            return Err(Error::InvalidParameter(format!(
                "MSS {} exceeds maximum {}",
                self.mss, MAX_MSS
            )));
        }
        if self.window > MAX_BUFFER {
            return Err(Error::InvalidParameter(format!(
                "socket buffer {} exceeds maximum {}",
                self.window, MAX_BUFFER
            )));
        }
        if !crate::units::valid_format(self.format) {
            return Err(Error::InvalidParameter(format!(
                "unknown unit format '{}'",
                self.format
            )));
        }
        Ok(())
    }
}
