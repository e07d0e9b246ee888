//! One data connection: its counters, buffers, per-datagram state and the
//! protocol-specific send/receive behavior driven by a per-stream task.

use crate::diag::TcpDiag;
use crate::error::Result;
use crate::protocol::{DatagramHeader, UDP_HEADER_SIZE};
use crate::timer::Pacer;
use rand::RngCore;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex};

/// How long one readiness wait may block before the loop re-checks state.
/// Expiry is not an error.
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte counters for one stream, updated by the stream's I/O task and
/// drained by the interval snapshot.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent_this_interval: AtomicU64,
    pub bytes_received_this_interval: AtomicU64,
}

impl Counters {
    pub fn record_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.bytes_sent_this_interval.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.bytes_received_this_interval.fetch_add(n, Ordering::Relaxed);
    }

    /// Drain the interval counter for the active data direction and zero
    /// both. The exchange makes the reset atomic with the snapshot.
    pub fn take_interval(&self, sending: bool) -> u64 {
        let sent = self.bytes_sent_this_interval.swap(0, Ordering::Relaxed);
        let received = self.bytes_received_this_interval.swap(0, Ordering::Relaxed);
        if sending {
            sent
        } else {
            received
        }
    }
}

/// Sequencing state for a UDP stream.
///
/// On the receiving side `packet_count` tracks the highest sequence number
/// seen plus one, so `packet_count - cnt_error` is the number of datagrams
/// that arrived in order. On the sending side it simply counts emissions.
#[derive(Debug, Default, Clone)]
pub struct DatagramStats {
    pub packet_count: u64,
    pub jitter_secs: f64,
    pub cnt_error: u64,
    pub outoforder_packets: u64,
    prev_transit: Option<f64>,
    next_seq: u64,
}

impl DatagramStats {
    pub fn on_sent(&mut self) {
        self.packet_count += 1;
    }

    pub fn on_received(&mut self, seq: u32, transit_secs: f64) {
        let seq = seq as u64;
        if seq >= self.next_seq {
            // Any gap counts as that many lost datagrams.
            self.cnt_error += seq - self.next_seq;
            self.next_seq = seq + 1;
            self.packet_count = self.next_seq;
        } else {
            // Late arrival; not a loss.
            self.outoforder_packets += 1;
        }

        // RFC 1889 interarrival jitter estimate.
        if let Some(prev) = self.prev_transit {
            let d = (transit_secs - prev).abs();
            self.jitter_secs += (d - self.jitter_secs) / 16.0;
        }
        self.prev_transit = Some(transit_secs);
    }
}

/// One interval's worth of transfer for one stream.
#[derive(Debug, Clone, Copy)]
pub struct IntervalResult {
    pub bytes_transferred: u64,
    /// Offsets from the stream's start time, in seconds
    pub start_secs: f64,
    pub end_secs: f64,
    pub duration_secs: f64,
    pub diag: Option<TcpDiag>,
}

/// Accumulated results for one stream.
#[derive(Debug, Default)]
pub struct StreamResult {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub intervals: Vec<IntervalResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Begin,
    Running,
    End,
}

/// The engine-side view of one data connection. The socket itself lives in
/// the stream's I/O task; the engine sees the shared counters and, for TCP
/// diagnostics, the raw descriptor.
pub struct Stream {
    pub id: u32,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub state: StreamState,
    pub counters: Arc<Counters>,
    pub datagram: Arc<Mutex<DatagramStats>>,
    pub result: StreamResult,
    pub diag_fd: Option<RawFd>,
    /// The connection's MSS, captured while the socket is alive (TCP only)
    pub mss: Option<u32>,
    /// What the peer measured for this stream, from the results exchange
    pub peer_summary: Option<crate::protocol::StreamSummary>,
}

impl Stream {
    pub fn new(id: u32, local_addr: SocketAddr, peer_addr: SocketAddr, diag_fd: Option<RawFd>) -> Self {
        Self {
            id,
            local_addr,
            peer_addr,
            state: StreamState::Begin,
            counters: Arc::new(Counters::default()),
            datagram: Arc::new(Mutex::new(DatagramStats::default())),
            result: StreamResult::default(),
            diag_fd,
            mss: diag_fd.and_then(crate::diag::mss),
            peer_summary: None,
        }
    }
}

/// The socket half handed to the stream's I/O task.
pub enum DataSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DataSocket {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            DataSocket::Tcp(s) => s.local_addr(),
            DataSocket::Udp(s) => s.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            DataSocket::Tcp(s) => s.peer_addr(),
            DataSocket::Udp(s) => s.peer_addr(),
        }
    }
}

/// Protocol-specific send/receive behavior plus the owned block buffer.
pub struct StreamIo {
    sock: DataSocket,
    buffer: Vec<u8>,
    counters: Arc<Counters>,
    datagram: Arc<Mutex<DatagramStats>>,
    pacer: Option<Pacer>,
    quota: Option<Arc<AtomicI64>>,
    seq: u32,
}

impl StreamIo {
    /// Build the I/O half. The block buffer is filled with pseudo-random
    /// bytes once; only its size matters on the wire.
    pub fn new(
        sock: DataSocket,
        blksize: usize,
        counters: Arc<Counters>,
        datagram: Arc<Mutex<DatagramStats>>,
    ) -> Self {
        let mut buffer = vec![0u8; blksize];
        rand::thread_rng().fill_bytes(&mut buffer);
        Self {
            sock,
            buffer,
            counters,
            datagram,
            pacer: None,
            quota: None,
            seq: 0,
        }
    }

    /// Arm the rate pacer; called when the stream begins emitting datagrams.
    pub fn set_rate(&mut self, rate_bits_per_sec: u64) {
        if matches!(self.sock, DataSocket::Udp(_)) && rate_bits_per_sec > 0 {
            self.pacer = Some(Pacer::new(rate_bits_per_sec, self.buffer.len()));
        }
    }

    /// Share the aggregate byte budget of a byte-bounded test. Every stream
    /// debits the same budget; once it is spent the senders go quiet and the
    /// engine closes the test.
    pub fn set_quota(&mut self, quota: Arc<AtomicI64>) {
        self.quota = Some(quota);
    }

    fn quota_spent(&self) -> bool {
        self.quota
            .as_ref()
            .map(|q| q.load(Ordering::Relaxed) <= 0)
            .unwrap_or(false)
    }

    fn debit_quota(&self, n: u64) {
        if let Some(quota) = &self.quota {
            quota.fetch_sub(n as i64, Ordering::Relaxed);
        }
    }

    /// Write one block. TCP writes whatever the socket accepts of the block;
    /// UDP stamps the 12-byte header and sends one datagram, gated by the
    /// pacer. Returns the bytes written (0 when the socket was not ready).
    pub async fn send_block(&mut self) -> Result<usize> {
        match &self.sock {
            DataSocket::Tcp(s) => {
                match tokio::time::timeout(READY_TIMEOUT, s.writable()).await {
                    Err(_) => Ok(0),
                    Ok(ready) => {
                        ready?;
                        match s.try_write(&self.buffer) {
                            Ok(n) => {
                                self.counters.record_sent(n as u64);
                                self.debit_quota(n as u64);
                                Ok(n)
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                            Err(e) => Err(e.into()),
                        }
                    }
                }
            }
            DataSocket::Udp(s) => {
                if let Some(pacer) = &mut self.pacer {
                    while !pacer.should_send() {
                        tokio::time::sleep_until(pacer.next_due().into()).await;
                    }
                }
                DatagramHeader::stamped(self.seq).write_to(&mut self.buffer[..UDP_HEADER_SIZE]);
                self.seq = self.seq.wrapping_add(1);
                let n = s.send(&self.buffer).await?;
                self.datagram.lock().await.on_sent();
                self.counters.record_sent(n as u64);
                self.debit_quota(n as u64);
                Ok(n)
            }
        }
    }

    /// Read up to one block. UDP parses the header and folds the packet into
    /// the jitter/loss state. Returns `None` on TCP end-of-stream.
    pub async fn recv_block(&mut self) -> Result<Option<usize>> {
        match &self.sock {
            DataSocket::Tcp(s) => {
                match tokio::time::timeout(READY_TIMEOUT, s.readable()).await {
                    Err(_) => Ok(Some(0)),
                    Ok(ready) => {
                        ready?;
                        match s.try_read(&mut self.buffer) {
                            Ok(0) => Ok(None),
                            Ok(n) => {
                                self.counters.record_received(n as u64);
                                Ok(Some(n))
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Some(0)),
                            Err(e) => Err(e.into()),
                        }
                    }
                }
            }
            DataSocket::Udp(s) => {
                match tokio::time::timeout(READY_TIMEOUT, s.recv(&mut self.buffer)).await {
                    Err(_) => Ok(Some(0)),
                    Ok(res) => {
                        let n = res?;
                        if let Some(header) = DatagramHeader::read_from(&self.buffer[..n]) {
                            let transit = header.transit_to_now();
                            self.datagram.lock().await.on_received(header.seq, transit);
                        }
                        self.counters.record_received(n as u64);
                        Ok(Some(n))
                    }
                }
            }
        }
    }
}

/// Drive one sending stream until shutdown, an exhausted byte budget or a
/// fatal socket error.
pub async fn run_sender(mut io: StreamIo, mut shutdown: broadcast::Receiver<()>) {
    loop {
        if io.quota_spent() {
            // The engine notices the aggregate count and ends the test.
            let _ = shutdown.recv().await;
            break;
        }
        tokio::select! {
            _ = shutdown.recv() => break,
            res = io.send_block() => {
                if let Err(e) = res {
                    tracing::debug!("stream send ended: {}", e);
                    break;
                }
            }
        }
    }
}

/// Drive one receiving stream until shutdown, end-of-stream or a fatal
/// socket error.
pub async fn run_receiver(mut io: StreamIo, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            res = io.recv_block() => {
                match res {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("stream receive ended: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
