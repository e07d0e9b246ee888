//! The transfer-phase engine shared by both endpoints.
//!
//! A `TestRun` owns the streams for one test: it spawns one cooperative I/O
//! task per stream, drives the stats and reporter timers, enforces the
//! time/byte bound on the sending side and folds everything back together at
//! teardown. Ownership is exclusive: no stream or task outlives its run.

use crate::error::{Error, Result};
use crate::protocol::{StreamSummary, TestParams};
use crate::report::{self, FinalSummary};
use crate::stats;
use crate::stream::{self, DataSocket, Stream, StreamIo, StreamState};
use crate::timer::Timer;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Granularity of the engine's timer checks during transfer
pub const ENGINE_TICK: std::time::Duration = std::time::Duration::from_millis(100);

pub struct TestRun {
    pub params: TestParams,
    pub format: char,
    pub interval_secs: u64,
    /// True when this endpoint is the data sender
    pub sending: bool,
    pub tcp_info: bool,
    pub streams: Vec<Stream>,
    pending_io: Vec<StreamIo>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    total_timer: Option<Timer>,
    stats_timer: Option<Timer>,
    reporter_timer: Option<Timer>,
    finished: bool,
}

impl TestRun {
    pub fn new(params: TestParams, format: char, interval_secs: u64, sending: bool, tcp_info: bool) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            params,
            format,
            interval_secs,
            sending,
            tcp_info,
            streams: Vec::new(),
            pending_io: Vec::new(),
            tasks: Vec::new(),
            shutdown_tx,
            started_at: None,
            ended_at: None,
            total_timer: None,
            stats_timer: None,
            reporter_timer: None,
            finished: false,
        }
    }

    /// Register one established data connection. Stream ids are dense,
    /// assigned in the order the connections are added.
    pub fn add_stream(&mut self, sock: DataSocket) -> Result<u32> {
        let id = self.streams.len() as u32 + 1;
        let local = sock.local_addr()?;
        let peer = sock.peer_addr()?;
        let diag_fd = match &sock {
            DataSocket::Tcp(s) => Some(s.as_raw_fd()),
            DataSocket::Udp(_) => None,
        };
        let stream = Stream::new(id, local, peer, diag_fd);
        let io = StreamIo::new(
            sock,
            self.params.blksize,
            stream.counters.clone(),
            stream.datagram.clone(),
        );
        report::connect_message(id, local, peer);
        self.streams.push(stream);
        self.pending_io.push(io);
        Ok(id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Arm the timers and launch the per-stream I/O tasks.
    ///
    /// The total timer exists only on the sending side of a time-bounded
    /// test; byte-bounded tests end on the aggregate byte count instead.
    pub fn start(&mut self) {
        let now = Instant::now();
        self.started_at = Some(now);

        if self.sending && self.params.bytes == 0 && self.params.duration_secs > 0 {
            self.total_timer = Some(Timer::new(self.params.duration_secs, 0));
        }
        if self.interval_secs > 0 {
            self.stats_timer = Some(Timer::new(self.interval_secs, 0));
            self.reporter_timer = Some(Timer::new(self.interval_secs, 0));
        }

        let quota = if self.sending && self.params.bytes > 0 {
            Some(std::sync::Arc::new(std::sync::atomic::AtomicI64::new(
                self.params.bytes as i64,
            )))
        } else {
            None
        };

        for (stream, mut io) in self.streams.iter_mut().zip(self.pending_io.drain(..)) {
            stream.state = StreamState::Running;
            stream.result.start_time = Some(now);
            let shutdown = self.shutdown_tx.subscribe();
            let handle = if self.sending {
                io.set_rate(self.params.rate);
                if let Some(quota) = &quota {
                    io.set_quota(quota.clone());
                }
                tokio::spawn(stream::run_sender(io, shutdown))
            } else {
                tokio::spawn(stream::run_receiver(io, shutdown))
            };
            self.tasks.push(handle);
        }
    }

    /// Run the periodic callbacks: snapshot all streams first, then render,
    /// so interval records are complete before any output for the tick.
    pub fn tick(&mut self) {
        let Some(started_at) = self.started_at else {
            return;
        };
        let mut snapped = false;
        if let Some(timer) = &mut self.stats_timer {
            if timer.expired() {
                stats::gather(&mut self.streams, started_at, self.sending, self.tcp_info);
                timer.update(self.interval_secs, 0);
                snapped = true;
            }
        }
        if let Some(timer) = &mut self.reporter_timer {
            if timer.expired() && snapped {
                report::interval(&self.streams, self.format);
                timer.update(self.interval_secs, 0);
            }
        }
    }

    /// Bytes moved in this side's data direction, across all streams.
    pub fn total_transferred(&self) -> u64 {
        self.streams
            .iter()
            .map(|s| {
                if self.sending {
                    s.counters.bytes_sent.load(Ordering::Relaxed)
                } else {
                    s.counters.bytes_received.load(Ordering::Relaxed)
                }
            })
            .sum()
    }

    /// True once the sender's bound is reached: the aggregate byte target,
    /// or the total timer on a time-bounded test.
    pub fn bound_reached(&self) -> bool {
        if self.params.bytes > 0 {
            self.total_transferred() >= self.params.bytes
        } else {
            self.total_timer.map(|t| t.expired()).unwrap_or(false)
        }
    }

    /// Stop the I/O tasks, take the closing snapshot and fold the totals.
    /// Safe to call on every exit path; only the first call does work.
    pub async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        // The closing snapshot runs after the tasks are joined, so every
        // byte ends up in exactly one interval record.
        if let Some(started_at) = self.started_at {
            stats::gather(&mut self.streams, started_at, self.sending, self.tcp_info);
        }

        let now = Instant::now();
        self.ended_at = Some(now);
        for stream in &mut self.streams {
            stream.result.bytes_sent = stream.counters.bytes_sent.load(Ordering::Relaxed);
            stream.result.bytes_received = stream.counters.bytes_received.load(Ordering::Relaxed);
            stream.result.end_time = Some(now);
            stream.state = StreamState::End;
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            (Some(start), None) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    /// This side's results-blob lines. The byte figure is the one for this
    /// side's data direction.
    pub async fn local_summaries(&self) -> Vec<StreamSummary> {
        let mut out = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let datagram = stream.datagram.lock().await;
            out.push(StreamSummary {
                id: stream.id,
                bytes: if self.sending {
                    stream.result.bytes_sent
                } else {
                    stream.result.bytes_received
                },
                jitter_secs: datagram.jitter_secs,
                lost: datagram.cnt_error,
                packets: datagram.packet_count,
            });
        }
        out
    }

    /// Store the peer's numbers onto the matching streams. A sender learns
    /// what the receiver got (bytes received plus jitter/loss). The local
    /// total for this side's own direction stays authoritative, so it always
    /// matches the stream's interval records.
    pub fn apply_peer_results(&mut self, peer: Vec<StreamSummary>) -> Result<()> {
        for summary in peer {
            let stream = self
                .streams
                .iter_mut()
                .find(|s| s.id == summary.id)
                .ok_or_else(|| Error::Protocol(format!("no stream with id {}", summary.id)))?;
            if self.sending {
                stream.result.bytes_received = summary.bytes;
            }
            stream.peer_summary = Some(summary);
        }
        Ok(())
    }

    /// Per-stream numbers for the final report. Jitter and loss come from
    /// whichever side received: locally measured here, or peer-reported when
    /// this side sent.
    pub async fn final_summaries(&self) -> Vec<FinalSummary> {
        let mut out = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let datagram = stream.datagram.lock().await;
            let (jitter_secs, lost, packets) = if self.sending {
                match &stream.peer_summary {
                    Some(p) => (p.jitter_secs, p.lost, p.packets),
                    None => (0.0, 0, datagram.packet_count),
                }
            } else {
                (datagram.jitter_secs, datagram.cnt_error, datagram.packet_count)
            };
            out.push(FinalSummary {
                id: stream.id,
                bytes_sent: stream.result.bytes_sent,
                bytes_received: stream.result.bytes_received,
                jitter_secs,
                lost,
                packets,
                outoforder: datagram.outoforder_packets,
            });
        }
        out
    }

    /// The first stream's MSS, for the `-m` report.
    pub fn mss(&self) -> Option<u32> {
        self.streams.first().and_then(|s| s.mss)
    }
}
