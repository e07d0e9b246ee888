//! Integration tests: wire-format round trips, counter bookkeeping, and
//! end-to-end loopback tests between an in-process server and client.

use netmeter::config::{Protocol, TestConfig};
use netmeter::protocol::{
    self, DatagramHeader, State, StreamSummary, TestParams, COOKIE_SIZE, UDP_HEADER_SIZE,
};
use netmeter::stream::{Counters, DatagramStats, Stream};
use netmeter::timer::{Pacer, Timer};
use netmeter::{client, stats, units, Server};
use std::time::{Duration, Instant};

#[test]
fn test_state_code_conversion() {
    let states = [
        State::TestStart,
        State::TestRunning,
        State::TestEnd,
        State::StreamBegin,
        State::StreamRunning,
        State::StreamEnd,
        State::ParamExchange,
        State::CreateStreams,
        State::ServerTerminate,
        State::ClientTerminate,
        State::ExchangeResults,
        State::DisplayResults,
        State::IperfDone,
        State::AccessDenied,
    ];

    for state in states {
        let byte = state.to_byte();
        assert_eq!(State::from_byte(byte), Some(state));
    }
    assert_eq!(State::from_byte(99), None);
}

#[test]
fn test_cookie_shape() {
    let cookie = protocol::make_cookie();
    assert_eq!(cookie.len(), COOKIE_SIZE);
    assert_eq!(cookie[COOKIE_SIZE - 1], 0);
    assert!(cookie[..COOKIE_SIZE - 1]
        .iter()
        .all(|b| b.is_ascii_graphic()));
    assert_ne!(cookie, protocol::make_cookie());
}

#[test]
fn test_params_roundtrip() {
    let params = TestParams {
        udp: true,
        parallel: 4,
        reverse: true,
        window: 65536,
        rate: 1_000_000,
        mss: 1400,
        no_delay: true,
        bytes: 0,
        duration_secs: 30,
        blksize: 1000,
    };
    let blob = params.encode();
    assert_eq!(blob[0] as usize, blob.len() - 1);
    let decoded = TestParams::decode(&String::from_utf8_lossy(&blob[1..]));
    assert_eq!(decoded, params);
}

#[test]
fn test_params_defaults_and_unknown_tokens() {
    let params = TestParams::decode("-u -P 3 -X 7 --future-flag -t 5");
    assert!(params.udp);
    assert_eq!(params.parallel, 3);
    assert_eq!(params.duration_secs, 5);
    assert_eq!(params.bytes, 0);
    assert!(!params.reverse);

    let tcp = TestParams::decode("-p -P 1 -t 10 -l 131072");
    assert!(!tcp.udp);
    assert_eq!(tcp.blksize, 131072);
}

#[test]
fn test_results_roundtrip() {
    let summaries = vec![
        StreamSummary {
            id: 1,
            bytes: 123456789,
            jitter_secs: 0.001250,
            lost: 3,
            packets: 125,
        },
        StreamSummary {
            id: 2,
            bytes: 987654321,
            jitter_secs: 0.0,
            lost: 0,
            packets: 200,
        },
    ];
    let payload = protocol::encode_results(&summaries);
    let decoded = protocol::decode_results(&payload).unwrap();
    assert_eq!(decoded, summaries);
    // the payload itself round-trips byte for byte
    assert_eq!(protocol::encode_results(&decoded), payload);
}

#[test]
fn test_results_reject_garbage() {
    assert!(protocol::decode_results("not a results line\n").is_err());
    assert!(protocol::decode_results("1:12,0.0\n").is_err());
    assert!(protocol::decode_results("").unwrap().is_empty());
}

#[test]
fn test_datagram_header_roundtrip() {
    let header = DatagramHeader {
        seq: 42,
        sec: 1_700_000_000,
        usec: 125_000,
    };
    let mut buf = [0u8; UDP_HEADER_SIZE];
    header.write_to(&mut buf);
    assert_eq!(DatagramHeader::read_from(&buf), Some(header));
    assert_eq!(DatagramHeader::read_from(&buf[..8]), None);
}

#[test]
fn test_datagram_loss_accounting() {
    let mut stats = DatagramStats::default();
    for seq in 0..10 {
        stats.on_received(seq, 0.0);
    }
    assert_eq!(stats.packet_count, 10);
    assert_eq!(stats.cnt_error, 0);
    assert_eq!(stats.outoforder_packets, 0);

    // gap of three
    stats.on_received(13, 0.0);
    assert_eq!(stats.packet_count, 14);
    assert_eq!(stats.cnt_error, 3);

    // late arrival is out of order, not another loss
    stats.on_received(11, 0.0);
    assert_eq!(stats.cnt_error, 3);
    assert_eq!(stats.outoforder_packets, 1);
    assert_eq!(stats.packet_count, 14);

    // in-order receptions = packet_count - cnt_error
    assert_eq!(stats.packet_count - stats.cnt_error, 11);
}

#[test]
fn test_jitter_estimate() {
    let mut stats = DatagramStats::default();
    // constant transit: no jitter
    for seq in 0..20 {
        stats.on_received(seq, 0.050);
    }
    assert_eq!(stats.jitter_secs, 0.0);

    // alternating transit converges toward the 1 ms deviation
    let mut stats = DatagramStats::default();
    for seq in 0..200 {
        let transit = if seq % 2 == 0 { 0.050 } else { 0.051 };
        stats.on_received(seq, transit);
    }
    assert!(stats.jitter_secs > 0.0005);
    assert!(stats.jitter_secs <= 0.001 + f64::EPSILON);
}

#[test]
fn test_interval_counter_reset() {
    let counters = Counters::default();
    counters.record_sent(1000);
    counters.record_received(50);

    assert_eq!(counters.take_interval(true), 1000);
    // both interval counters are zeroed by the snapshot
    assert_eq!(counters.take_interval(true), 0);
    assert_eq!(counters.take_interval(false), 0);

    counters.record_received(70);
    assert_eq!(counters.take_interval(false), 70);

    // totals are untouched
    use std::sync::atomic::Ordering;
    assert_eq!(counters.bytes_sent.load(Ordering::Relaxed), 1000);
    assert_eq!(counters.bytes_received.load(Ordering::Relaxed), 120);
}

#[test]
fn test_interval_records_sum_to_totals() {
    let addr = "127.0.0.1:0".parse().unwrap();
    let mut streams = vec![Stream::new(1, addr, addr, None), Stream::new(2, addr, addr, None)];
    let started_at = Instant::now();

    streams[0].counters.record_sent(300);
    streams[1].counters.record_sent(500);
    stats::gather(&mut streams, started_at, true, false);

    streams[0].counters.record_sent(200);
    stats::gather(&mut streams, started_at, true, false);

    for stream in &streams {
        let interval_sum: u64 = stream
            .result
            .intervals
            .iter()
            .map(|i| i.bytes_transferred)
            .sum();
        use std::sync::atomic::Ordering;
        assert_eq!(interval_sum, stream.counters.bytes_sent.load(Ordering::Relaxed));

        // interval records chain: each starts where the previous ended
        let intervals = &stream.result.intervals;
        assert_eq!(intervals[0].start_secs, 0.0);
        assert_eq!(intervals[1].start_secs, intervals[0].end_secs);
    }
}

#[test]
fn test_timer_basics() {
    let timer = Timer::new(0, 0);
    assert!(timer.expired());

    let mut timer = Timer::new(600, 0);
    assert!(!timer.expired());
    timer.update(0, 0);
    assert!(timer.expired());
    timer.update(600, 0);
    assert!(!timer.expired());
}

#[test]
fn test_pacer_interval() {
    // 1 Mbit/s with 1000-byte blocks: one packet every 8 ms
    let mut pacer = Pacer::new(1_000_000, 1000);
    assert_eq!(pacer.interval(), Duration::from_millis(8));
    assert!(pacer.should_send());
    assert!(!pacer.should_send());
}

#[test]
fn test_unit_parsing() {
    assert_eq!(units::parse_size("128"), Some(128));
    assert_eq!(units::parse_size("10M"), Some(10 * 1024 * 1024));
    assert_eq!(units::parse_size("10MB"), Some(10 * 1024 * 1024));
    assert_eq!(units::parse_size("2.5k"), Some(2560));
    assert_eq!(units::parse_size("junk"), None);

    assert_eq!(units::parse_rate("1M"), Some(1_000_000));
    assert_eq!(units::parse_rate("800k"), Some(800_000));
    assert_eq!(units::parse_rate("5"), Some(5));
}

#[test]
fn test_unit_formatting() {
    assert_eq!(units::format_bytes(1024.0 * 1024.0), "1.00 MBytes");
    assert_eq!(units::format_rate(125_000.0, 'k'), "1000 Kbits/sec");
    assert_eq!(units::format_rate(1_250_000.0, 'a'), "10.0 Mbits/sec");
    assert_eq!(units::format_rate(1024.0 * 1024.0, 'M'), "1.00 MBytes/sec");
}

#[test]
fn test_config_validation() {
    let cfg = TestConfig::client("localhost");
    assert!(cfg.validate().is_ok());
    assert!(cfg.sending());

    let mut cfg = TestConfig::client("localhost");
    cfg.reverse = true;
    assert!(!cfg.sending());

    let mut cfg = TestConfig::client("localhost");
    cfg.duration_secs = 0;
    cfg.bytes = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = TestConfig::client("localhost");
    cfg.parallel = 200;
    assert!(cfg.validate().is_err());

    let mut cfg = TestConfig::client("localhost");
    cfg.format = 'x';
    assert!(cfg.validate().is_err());
}

// ---------------------------------------------------------------------------
// End-to-end loopback tests
// ---------------------------------------------------------------------------

/// Bind a server on an ephemeral port, run it in the background, and return
/// the port the client should dial.
fn start_server(cfg: TestConfig) -> u16 {
    let server = Server::bind(cfg).expect("bind server");
    let port = server.local_addr().expect("local addr").port();
    tokio::spawn(server.run());
    port
}

fn client_config(port: u16) -> TestConfig {
    let mut cfg = TestConfig::client("127.0.0.1");
    cfg.port = port;
    cfg.duration_secs = 1;
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_end_to_end() {
    let port = start_server(TestConfig::server());

    let report = client::run(client_config(port)).await.expect("client run");
    assert_eq!(report.protocol, Protocol::Tcp);
    assert_eq!(report.streams.len(), 1);
    assert_eq!(report.streams[0].id, 1);
    assert!(report.streams[0].bytes_sent > 0);
    assert!(report.streams[0].bytes_received > 0);
    assert!(report.streams[0].bytes_received <= report.streams[0].bytes_sent);
    assert!(report.elapsed_secs > 0.5 && report.elapsed_secs < 5.0);

    // the server is ready for the next test on the same port
    let report = client::run(client_config(port)).await.expect("second run");
    assert!(report.streams[0].bytes_sent > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_parallel_streams() {
    let port = start_server(TestConfig::server());

    let mut cfg = client_config(port);
    cfg.parallel = 4;
    cfg.interval_secs = 1; // exercise the periodic report path
    let report = client::run(cfg).await.expect("client run");

    let ids: Vec<u32> = report.streams.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    for stream in &report.streams {
        assert!(stream.bytes_sent > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_reverse_mode() {
    let port = start_server(TestConfig::server());

    let mut cfg = client_config(port);
    cfg.reverse = true;
    let report = client::run(cfg).await.expect("client run");

    assert_eq!(report.streams.len(), 1);
    assert!(report.streams[0].bytes_received > 0);
    assert_eq!(report.streams[0].bytes_sent, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_jitter_and_loss() {
    let port = start_server(TestConfig::server());

    let mut cfg = client_config(port);
    cfg.protocol = Protocol::Udp;
    cfg.blksize = 1000;
    cfg.rate = 800_000; // 100 packets/sec
    let report = client::run(cfg).await.expect("client run");

    let stream = &report.streams[0];
    assert!(stream.bytes_sent > 0);
    assert!(stream.packets >= 10 && stream.packets <= 400, "packets = {}", stream.packets);
    assert!(stream.lost <= stream.packets);
    assert!(stream.jitter_secs >= 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_byte_bounded_test() {
    let port = start_server(TestConfig::server());

    let mut cfg = client_config(port);
    cfg.bytes = 4 * 1024 * 1024;
    let started = Instant::now();
    let report = client::run(cfg).await.expect("client run");

    let sent = report.streams[0].bytes_sent;
    assert!(sent >= 4 * 1024 * 1024, "sent = {}", sent);
    // quota overshoot is at most about a block per stream
    assert!(sent < 5 * 1024 * 1024, "sent = {}", sent);
    // the byte bound ends the test well before the default duration
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_client_denied_while_busy() {
    let port = start_server(TestConfig::server());

    let mut cfg = client_config(port);
    cfg.duration_secs = 3;
    let first = tokio::spawn(client::run(cfg));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let denied = client::run(client_config(port)).await;
    assert!(matches!(denied, Err(netmeter::Error::AccessDenied)));

    let report = first.await.expect("join").expect("first client");
    assert!(report.streams[0].bytes_sent > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_survives_client_drop() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let port = start_server(TestConfig::server());

    // a client that handshakes and then vanishes mid-test
    {
        let mut raw = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect");
        raw.write_all(&protocol::make_cookie()).await.expect("cookie");
        let mut state = [0u8; 1];
        raw.read_exact(&mut state).await.expect("param exchange");
        assert_eq!(State::from_byte(state[0]), Some(State::ParamExchange));
    } // dropped here

    // the server returns to accept and serves a real test
    let report = client::run(client_config(port)).await.expect("client run");
    assert!(report.streams[0].bytes_sent > 0);
}
