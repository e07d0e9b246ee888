//! Rendering of interval and final summaries.
//!
//! Reports are program output and go to stdout; diagnostics go through
//! `tracing` elsewhere.

use crate::config::Protocol;
use crate::stream::Stream;
use crate::units;

/// Final per-stream numbers after the results exchange, ready to render.
#[derive(Debug, Clone)]
pub struct FinalSummary {
    pub id: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub jitter_secs: f64,
    pub lost: u64,
    pub packets: u64,
    pub outoforder: u64,
}

pub fn connect_message(id: u32, local: std::net::SocketAddr, peer: std::net::SocketAddr) {
    println!(
        "[{:3}] local {} port {} connected to {} port {}",
        id,
        local.ip(),
        local.port(),
        peer.ip(),
        peer.port()
    );
}

pub fn test_banner(protocol: Protocol, parallel: u32, blksize: usize, duration_secs: u64, bytes: u64) {
    if bytes > 0 {
        println!(
            "Starting test: protocol {}, {} stream(s), {} byte blocks, {} bytes to send",
            protocol.name(),
            parallel,
            blksize,
            bytes
        );
    } else {
        println!(
            "Starting test: protocol {}, {} stream(s), {} byte blocks, {} seconds",
            protocol.name(),
            parallel,
            blksize,
            duration_secs
        );
    }
}

fn print_header() {
    println!("[ ID] Interval       Transfer     Bandwidth");
}

fn bw_line(tag: &str, start: f64, end: f64, bytes: u64, duration: f64, format: char) {
    let rate = if duration > 0.0 {
        bytes as f64 / duration
    } else {
        0.0
    };
    println!(
        "[{:>3}] {:4.1}-{:4.1} sec  {:>11}  {:>14}",
        tag,
        start,
        end,
        units::format_bytes(bytes as f64),
        units::format_rate(rate, format)
    );
}

/// Print one line per stream for the latest interval, plus an aggregate line
/// when more than one stream is running. The aggregate uses the first
/// stream's interval timing.
pub fn interval(streams: &[Stream], format: char) {
    let mut sum = 0u64;
    print_header();
    for stream in streams {
        let Some(ir) = stream.result.intervals.last() else {
            continue;
        };
        sum += ir.bytes_transferred;
        bw_line(
            &stream.id.to_string(),
            ir.start_secs,
            ir.end_secs,
            ir.bytes_transferred,
            ir.duration_secs,
            format,
        );
        if let Some(diag) = ir.diag {
            println!(
                "      retrans {}  rtt {} us  cwnd {}",
                diag.retransmits, diag.rtt_micros, diag.snd_cwnd
            );
        }
    }
    if streams.len() > 1 {
        if let Some(ir) = streams[0].result.intervals.last() {
            bw_line("SUM", ir.start_secs, ir.end_secs, sum, ir.duration_secs, format);
        }
    }
}

fn loss_percent(lost: u64, packets: u64) -> f64 {
    if packets == 0 {
        0.0
    } else {
        100.0 * lost as f64 / packets as f64
    }
}

/// Print the final per-stream totals and, with more than one stream, the
/// per-direction totals (TCP) or the aggregated jitter/loss figures (UDP).
pub fn final_summary(
    summaries: &[FinalSummary],
    elapsed_secs: f64,
    protocol: Protocol,
    format: char,
    mss: Option<u32>,
) {
    println!("Test complete. Summary:");
    print_header();

    let mut total_sent = 0u64;
    let mut total_received = 0u64;
    let mut total_packets = 0u64;
    let mut total_lost = 0u64;
    let mut jitter_sum = 0.0f64;

    for s in summaries {
        total_sent += s.bytes_sent;
        total_received += s.bytes_received;
        total_packets += s.packets;
        total_lost += s.lost;
        jitter_sum += s.jitter_secs;

        match protocol {
            Protocol::Tcp => {
                if s.bytes_sent > 0 {
                    println!("      sent");
                    bw_line(&s.id.to_string(), 0.0, elapsed_secs, s.bytes_sent, elapsed_secs, format);
                }
                if s.bytes_received > 0 {
                    println!("      received");
                    bw_line(&s.id.to_string(), 0.0, elapsed_secs, s.bytes_received, elapsed_secs, format);
                }
            }
            Protocol::Udp => {
                let bytes = s.bytes_sent.max(s.bytes_received);
                bw_line(&s.id.to_string(), 0.0, elapsed_secs, bytes, elapsed_secs, format);
                println!(
                    "      jitter {:.3} ms  lost/total {}/{} ({:.1}%)",
                    s.jitter_secs * 1000.0,
                    s.lost,
                    s.packets,
                    loss_percent(s.lost, s.packets)
                );
                if s.outoforder > 0 {
                    println!("      {} datagrams arrived out of order", s.outoforder);
                }
            }
        }
    }

    if summaries.len() > 1 {
        match protocol {
            Protocol::Tcp => {
                println!("      total sent");
                bw_line("SUM", 0.0, elapsed_secs, total_sent, elapsed_secs, format);
                println!("      total received");
                bw_line("SUM", 0.0, elapsed_secs, total_received, elapsed_secs, format);
            }
            Protocol::Udp => {
                let bytes = total_sent.max(total_received);
                bw_line("SUM", 0.0, elapsed_secs, bytes, elapsed_secs, format);
                println!(
                    "      jitter {:.3} ms  lost/total {}/{} ({:.1}%)",
                    jitter_sum / summaries.len() as f64 * 1000.0,
                    total_lost,
                    total_packets,
                    loss_percent(total_lost, total_packets)
                );
            }
        }
    }

    if let Some(mss) = mss {
        println!("TCP maximum segment size: {}", mss);
    }
}
