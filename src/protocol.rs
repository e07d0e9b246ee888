//! Wire protocol definitions.
//!
//! The control channel is a single TCP stream carrying one-byte state codes
//! plus two length-prefixed payloads: the parameter blob (client to server)
//! and the results blob (both directions). Data channels carry raw blocks;
//! UDP blocks start with a 12-byte sequencing header.

use crate::config::{Protocol, TestConfig};
use crate::error::{Error, Result};

/// Length of the opaque test cookie
pub const COOKIE_SIZE: usize = 37;

/// Length of the UDP per-packet header
pub const UDP_HEADER_SIZE: usize = 12;

/// 4-byte magic exchanged on a fresh UDP data connection, the ASCII bytes '6789'
pub const UDP_CONNECT_MAGIC: u32 = 0x36373839;

/// Control-channel state codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum State {
    TestStart = 1,
    TestRunning = 2,
    TestEnd = 4,
    StreamBegin = 5,
    StreamRunning = 6,
    StreamEnd = 7,
    ParamExchange = 9,
    CreateStreams = 10,
    ServerTerminate = 11,
    ClientTerminate = 12,
    ExchangeResults = 13,
    DisplayResults = 14,
    IperfDone = 15,
    AccessDenied = -1,
}

impl State {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b as i8 {
            1 => Some(State::TestStart),
            2 => Some(State::TestRunning),
            4 => Some(State::TestEnd),
            5 => Some(State::StreamBegin),
            6 => Some(State::StreamRunning),
            7 => Some(State::StreamEnd),
            9 => Some(State::ParamExchange),
            10 => Some(State::CreateStreams),
            11 => Some(State::ServerTerminate),
            12 => Some(State::ClientTerminate),
            13 => Some(State::ExchangeResults),
            14 => Some(State::DisplayResults),
            15 => Some(State::IperfDone),
            -1 => Some(State::AccessDenied),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self as i8) as u8
    }
}

/// Generate a fresh cookie: a textual UUID plus a terminating NUL.
pub fn make_cookie() -> [u8; COOKIE_SIZE] {
    let text = uuid::Uuid::new_v4().to_string();
    let mut cookie = [0u8; COOKIE_SIZE];
    cookie[..text.len()].copy_from_slice(text.as_bytes());
    cookie
}

/// Test parameters carried in the parameter blob.
///
/// The blob is one length byte followed by space-separated flag tokens
/// mirroring a subset of the CLI. Unknown tokens are ignored by the parser
/// for forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestParams {
    pub udp: bool,
    pub parallel: u32,
    pub reverse: bool,
    pub window: usize,
    pub rate: u64,
    pub mss: u32,
    pub no_delay: bool,
    pub bytes: u64,
    pub duration_secs: u64,
    pub blksize: usize,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            udp: false,
            parallel: 1,
            reverse: false,
            window: 0,
            rate: 0,
            mss: 0,
            no_delay: false,
            bytes: 0,
            duration_secs: 0,
            blksize: 0,
        }
    }
}

impl TestParams {
    pub fn from_config(cfg: &TestConfig) -> Self {
        Self {
            udp: cfg.protocol == Protocol::Udp,
            parallel: cfg.parallel,
            reverse: cfg.reverse,
            window: cfg.window,
            rate: if cfg.protocol == Protocol::Udp { cfg.rate } else { 0 },
            mss: cfg.mss,
            no_delay: cfg.no_delay,
            bytes: cfg.bytes,
            duration_secs: if cfg.bytes == 0 { cfg.duration_secs } else { 0 },
            blksize: cfg.blksize,
        }
    }

    pub fn protocol(&self) -> Protocol {
        if self.udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// Render the length-prefixed token string.
    pub fn encode(&self) -> Vec<u8> {
        let mut tokens: Vec<String> = Vec::new();
        tokens.push(if self.udp { "-u" } else { "-p" }.to_string());
        tokens.push(format!("-P {}", self.parallel));
        if self.reverse {
            tokens.push("-R".to_string());
        }
        if self.window > 0 {
            tokens.push(format!("-w {}", self.window));
        }
        if self.rate > 0 {
            tokens.push(format!("-b {}", self.rate));
        }
        if self.mss > 0 {
            tokens.push(format!("-m {}", self.mss));
        }
        if self.no_delay {
            tokens.push("-N".to_string());
        }
        if self.bytes > 0 {
            tokens.push(format!("-n {}", self.bytes));
        }
        if self.duration_secs > 0 {
            tokens.push(format!("-t {}", self.duration_secs));
        }
        if self.blksize > 0 {
            tokens.push(format!("-l {}", self.blksize));
        }
        let payload = tokens.join(" ");
        debug_assert!(payload.len() <= u8::MAX as usize);
        let mut blob = Vec::with_capacity(payload.len() + 1);
        blob.push(payload.len() as u8);
        blob.extend_from_slice(payload.as_bytes());
        blob
    }

    /// Parse the token payload (without the length byte).
    pub fn decode(payload: &str) -> Self {
        let mut params = Self::default();
        let mut tokens = payload.split_whitespace();
        while let Some(token) = tokens.next() {
            match token {
                "-p" => params.udp = false,
                "-u" => params.udp = true,
                "-R" => params.reverse = true,
                "-N" => params.no_delay = true,
                "-P" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.parallel = v;
                    }
                }
                "-w" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.window = v;
                    }
                }
                "-b" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.rate = v;
                    }
                }
                "-m" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.mss = v;
                    }
                }
                "-n" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.bytes = v;
                    }
                }
                "-t" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.duration_secs = v;
                    }
                }
                "-l" => {
                    if let Some(v) = tokens.next().and_then(|t| t.parse().ok()) {
                        params.blksize = v;
                    }
                }
                _ => {} // unknown token, skip
            }
        }
        params
    }
}

/// One line of the results blob: what one side measured for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub id: u32,
    pub bytes: u64,
    pub jitter_secs: f64,
    pub lost: u64,
    pub packets: u64,
}

/// Render the results payload, one line per stream:
/// `<id>:<bytes>,<jitter>,<lost>,<packets>\n`
pub fn encode_results(summaries: &[StreamSummary]) -> String {
    let mut out = String::new();
    for s in summaries {
        out.push_str(&format!(
            "{}:{},{:.6},{},{}\n",
            s.id, s.bytes, s.jitter_secs, s.lost, s.packets
        ));
    }
    out
}

/// Parse a results payload back into per-stream summaries.
pub fn decode_results(payload: &str) -> Result<Vec<StreamSummary>> {
    let mut out = Vec::new();
    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, rest) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed results line: {line:?}")))?;
        let mut fields = rest.split(',');
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| Error::Protocol(format!("results line missing {name}: {line:?}")))
        };
        let summary = StreamSummary {
            id: id
                .parse()
                .map_err(|_| Error::Protocol(format!("bad stream id in results: {line:?}")))?,
            bytes: parse_field(next("bytes")?, line)?,
            jitter_secs: parse_field(next("jitter")?, line)?,
            lost: parse_field(next("lost")?, line)?,
            packets: parse_field(next("packets")?, line)?,
        };
        out.push(summary);
    }
    Ok(out)
}

fn parse_field<T: std::str::FromStr>(field: &str, line: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| Error::Protocol(format!("bad field {field:?} in results line {line:?}")))
}

/// The 12-byte header prepended to every UDP block:
/// `{seq, sec, usec}`, all u32 big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub seq: u32,
    pub sec: u32,
    pub usec: u32,
}

impl DatagramHeader {
    /// Stamp a header with the current wall-clock time.
    pub fn stamped(seq: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            seq,
            sec: now.timestamp() as u32,
            usec: now.timestamp_subsec_micros(),
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sec.to_be_bytes());
        buf[8..12].copy_from_slice(&self.usec.to_be_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_HEADER_SIZE {
            return None;
        }
        Some(Self {
            seq: u32::from_be_bytes(buf[0..4].try_into().ok()?),
            sec: u32::from_be_bytes(buf[4..8].try_into().ok()?),
            usec: u32::from_be_bytes(buf[8..12].try_into().ok()?),
        })
    }

    /// Transit time from the sender's stamp to now, in seconds. Clock offset
    /// between hosts shifts every transit equally, so the jitter estimate is
    /// unaffected.
    pub fn transit_to_now(&self) -> f64 {
        let now = chrono::Utc::now();
        let now_secs = now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1e6;
        let sent_secs = self.sec as f64 + self.usec as f64 / 1e6;
        now_secs - sent_secs
    }
}
