//! The interval statistics pipeline.

use crate::diag;
use crate::stream::{IntervalResult, Stream};
use std::time::Instant;

/// Snapshot every stream's interval counter into a new interval record, in
/// stream-list order, zeroing the counters as they are read.
///
/// The first interval starts at the test start; each later interval starts
/// where the previous one ended.
pub fn gather(streams: &mut [Stream], started_at: Instant, sending: bool, tcp_info: bool) {
    let now = Instant::now();
    let end_secs = now.duration_since(started_at).as_secs_f64();
    for stream in streams.iter_mut() {
        let bytes = stream.counters.take_interval(sending);
        let start_secs = stream
            .result
            .intervals
            .last()
            .map(|i| i.end_secs)
            .unwrap_or(0.0);
        let diag = match (tcp_info, stream.diag_fd) {
            (true, Some(fd)) => diag::snapshot(fd),
            _ => None,
        };
        stream.result.intervals.push(IntervalResult {
            bytes_transferred: bytes,
            start_secs,
            end_secs,
            duration_secs: end_secs - start_secs,
            diag,
        });
    }
}
