//! The client-side test engine: dial the server, run the control-channel
//! state machine, drive the data streams, exchange results.

use crate::config::{Protocol, TestConfig};
use crate::control::ControlChannel;
use crate::error::{Error, Result};
use crate::net::{self, DataSocketOptions};
use crate::protocol::{self, State, TestParams, COOKIE_SIZE, UDP_CONNECT_MAGIC};
use crate::report::{self, FinalSummary};
use crate::session::{TestRun, ENGINE_TICK};
use crate::stream::DataSocket;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// How long to wait for the UDP connect reply
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a completed test measured, as returned to the caller.
#[derive(Debug)]
pub struct TestReport {
    pub streams: Vec<FinalSummary>,
    pub elapsed_secs: f64,
    pub protocol: Protocol,
}

/// Run one test against the configured server.
pub async fn run(cfg: TestConfig) -> Result<TestReport> {
    cfg.validate()?;
    let host = cfg
        .server_host
        .clone()
        .ok_or_else(|| Error::InvalidParameter("client requires a server host".into()))?;
    let addr = net::resolve(&host, cfg.port).await?;

    info!("connecting to host {}, port {}", host, cfg.port);
    let mut control = ControlChannel::new(net::dial_control(addr).await?);
    let cookie = protocol::make_cookie();
    control.send_cookie(&cookie).await?;

    // SIGINT turns into CLIENT_TERMINATE through the normal loop.
    let (sig_tx, mut sig_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = sig_tx.send(());
            }
            // Keep the sender alive so the receivers stay quiet.
            Err(_) => std::future::pending::<()>().await,
        }
    });

    let params = TestParams::from_config(&cfg);
    let mut run = TestRun::new(params, cfg.format, cfg.interval_secs, cfg.sending(), cfg.tcp_info);

    let outcome = conduct(&cfg, addr, &cookie, &mut control, &mut run, &mut sig_rx).await;
    run.finish().await;

    match outcome {
        Ok(()) => Ok(TestReport {
            streams: run.final_summaries().await,
            elapsed_secs: run.elapsed_secs(),
            protocol: run.params.protocol(),
        }),
        Err(e) => {
            // Report whatever made it through the results exchange.
            if run.streams.iter().any(|s| s.peer_summary.is_some()) {
                let summaries = run.final_summaries().await;
                report::final_summary(
                    &summaries,
                    run.elapsed_secs(),
                    run.params.protocol(),
                    cfg.format,
                    None,
                );
            }
            Err(e)
        }
    }
}

/// The control-channel state machine. Every state code the server sends
/// drives one step; a signal interrupts any of them.
async fn conduct(
    cfg: &TestConfig,
    addr: SocketAddr,
    cookie: &[u8; COOKIE_SIZE],
    control: &mut ControlChannel,
    run: &mut TestRun,
    sig_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            state = control.read_state() => match state? {
                State::ParamExchange => control.send_params(&run.params).await?,
                State::CreateStreams => create_streams(cfg, addr, cookie, run).await?,
                State::TestStart => {
                    report::test_banner(
                        cfg.protocol,
                        cfg.parallel,
                        cfg.blksize,
                        run.params.duration_secs,
                        run.params.bytes,
                    );
                    run.start();
                }
                State::TestRunning => transfer(control, run, sig_rx).await?,
                State::TestEnd => run.finish().await,
                State::ExchangeResults => {
                    let local = protocol::encode_results(&run.local_summaries().await);
                    control.send_results(&local).await?;
                    let peer = protocol::decode_results(&control.read_results().await?)?;
                    run.apply_peer_results(peer)?;
                }
                State::DisplayResults => {
                    let summaries = run.final_summaries().await;
                    let mss = if cfg.print_mss { run.mss() } else { None };
                    report::final_summary(
                        &summaries,
                        run.elapsed_secs(),
                        run.params.protocol(),
                        cfg.format,
                        mss,
                    );
                    control.send_state(State::IperfDone).await?;
                    return Ok(());
                }
                State::AccessDenied => return Err(Error::AccessDenied),
                State::ServerTerminate => return Err(Error::ServerTerminated),
                other => debug!("ignoring control state {:?}", other),
            },
            _ = sig_rx.recv() => return terminate(control).await,
        }
    }
}

/// The steady-state loop: advance timers, watch the control channel, and on
/// the sending side end the test when the bound is reached.
async fn transfer(
    control: &mut ControlChannel,
    run: &mut TestRun,
    sig_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            state = control.read_state() => match state? {
                // Reverse mode: the sending server says the test is over.
                State::TestEnd => {
                    run.finish().await;
                    return Ok(());
                }
                State::ServerTerminate => return Err(Error::ServerTerminated),
                other => debug!("ignoring control state {:?} during transfer", other),
            },
            _ = tokio::time::sleep(ENGINE_TICK) => {
                run.tick();
                if run.sending && run.bound_reached() {
                    run.finish().await;
                    control.send_state(State::TestEnd).await?;
                    return Ok(());
                }
            }
            _ = sig_rx.recv() => return terminate(control).await,
        }
    }
}

async fn terminate(control: &mut ControlChannel) -> Result<()> {
    info!("interrupted, telling the server to tear down");
    let _ = control.send_state(State::ClientTerminate).await;
    Err(Error::Interrupted)
}

/// Open the data connections: TCP streams introduce themselves with the
/// cookie, UDP streams with the 4-byte handshake in each direction.
async fn create_streams(
    cfg: &TestConfig,
    addr: SocketAddr,
    cookie: &[u8; COOKIE_SIZE],
    run: &mut TestRun,
) -> Result<()> {
    let opts = DataSocketOptions {
        no_delay: cfg.no_delay,
        mss: cfg.mss,
        window: cfg.window,
        sending: cfg.sending(),
    };
    for _ in 0..cfg.parallel {
        let sock = match cfg.protocol {
            Protocol::Tcp => {
                let mut stream = net::dial_data_tcp(addr, &opts).await?;
                stream.write_all(cookie).await?;
                DataSocket::Tcp(stream)
            }
            Protocol::Udp => {
                let socket = net::dial_data_udp(addr, &opts).await?;
                udp_handshake(&socket).await?;
                DataSocket::Udp(socket)
            }
        };
        run.add_stream(sock)?;
    }
    Ok(())
}

/// Send the 4-byte hello until the server's per-stream socket answers. The
/// hello can race the server binding that socket, so a lost or refused
/// datagram is retried rather than fatal.
async fn udp_handshake(socket: &tokio::net::UdpSocket) -> Result<()> {
    let deadline = tokio::time::Instant::now() + STREAM_CONNECT_TIMEOUT;
    let mut reply = [0u8; 4];
    loop {
        socket.send(&UDP_CONNECT_MAGIC.to_be_bytes()).await?;
        match tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut reply)).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout("waiting for the UDP connect reply".into()));
        }
    }
}
