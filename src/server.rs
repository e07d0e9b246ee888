//! The server-side engine: accept a control connection, run one test at a
//! time, then go back to accepting.

use crate::config::{TestConfig, MAX_BLOCKSIZE, MAX_STREAMS, MAX_TIME_SECS};
use crate::control::ControlChannel;
use crate::error::{Error, Result};
use crate::net::{self, DataSocketOptions};
use crate::protocol::{self, State, COOKIE_SIZE, UDP_CONNECT_MAGIC};
use crate::report;
use crate::session::{TestRun, ENGINE_TICK};
use crate::stream::DataSocket;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// How long the peer gets to produce its cookie or data connections
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after TEST_END for data still in flight
const POST_TEST_DELAY: Duration = Duration::from_millis(100);

/// The netmeter server
pub struct Server {
    cfg: TestConfig,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listening socket. Must be called within a tokio runtime.
    pub fn bind(cfg: TestConfig) -> Result<Self> {
        let listener = net::listen_tcp(cfg.port)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            cfg,
            listener,
            shutdown_tx,
        })
    }

    /// The address actually bound, useful when the port was 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for asking the accept loop to stop.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept clients forever, one test at a time. A client that drops the
    /// control channel mid-test only ends its own session; the server
    /// returns to accepting.
    pub async fn run(mut self) -> Result<()> {
        info!("server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("accept error: {}", e);
                            continue;
                        }
                    };
                    info!("new control connection from {}", peer);
                    match self.run_session(stream, peer).await {
                        Ok(()) => info!("session with {} completed", peer),
                        Err(Error::ClientTerminated) | Err(Error::ControlClosed) => {
                            warn!("client {} terminated the test, returning to accept", peer);
                        }
                        Err(Error::Interrupted) => {
                            info!("server shutting down");
                            return Ok(());
                        }
                        Err(e) => error!("session with {} failed: {}", peer, e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn run_session(&mut self, ctrl: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut control = ControlChannel::new(ctrl);
        let cookie = tokio::time::timeout(STREAM_CONNECT_TIMEOUT, control.read_cookie())
            .await
            .map_err(|_| Error::Timeout("waiting for the client cookie".into()))??;
        debug!(
            "cookie from {}: {}",
            peer,
            String::from_utf8_lossy(&cookie).trim_end_matches('\0')
        );

        control.send_state(State::ParamExchange).await?;
        let mut params = control.read_params().await?;
        debug!("test parameters: {:?}", params);

        if params.parallel == 0 || params.parallel > MAX_STREAMS {
            return Err(Error::Protocol(format!(
                "unacceptable stream count {}",
                params.parallel
            )));
        }
        if params.blksize == 0 {
            params.blksize = params.protocol().default_blksize();
        }
        if params.blksize > MAX_BLOCKSIZE {
            params.blksize = MAX_BLOCKSIZE;
        }
        if params.udp && params.blksize < protocol::UDP_HEADER_SIZE {
            params.blksize = protocol::UDP_HEADER_SIZE;
        }
        if params.duration_secs > MAX_TIME_SECS {
            info!(
                "limiting test duration from {} to {} seconds",
                params.duration_secs, MAX_TIME_SECS
            );
            params.duration_secs = MAX_TIME_SECS;
        }

        let sending = params.reverse;
        let mut run = TestRun::new(
            params,
            self.cfg.format,
            self.cfg.interval_secs,
            sending,
            self.cfg.tcp_info,
        );

        let outcome = self.conduct_session(&mut control, &mut run, &cookie).await;
        run.finish().await;
        outcome
    }

    async fn conduct_session(
        &mut self,
        control: &mut ControlChannel,
        run: &mut TestRun,
        cookie: &[u8; COOKIE_SIZE],
    ) -> Result<()> {
        control.send_state(State::CreateStreams).await?;
        if run.params.udp {
            self.accept_udp_streams(run).await?;
        } else {
            self.accept_tcp_streams(run, cookie).await?;
        }
        debug!("all {} data connections are up", run.stream_count());

        control.send_state(State::TestStart).await?;
        run.start();
        control.send_state(State::TestRunning).await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                state = control.read_state() => match state? {
                    State::TestEnd => {
                        // Let data still in flight drain before the books close.
                        tokio::time::sleep(POST_TEST_DELAY).await;
                        run.finish().await;
                        break;
                    }
                    State::ClientTerminate => return Err(Error::ClientTerminated),
                    other => debug!("ignoring control state {:?} during transfer", other),
                },
                _ = tokio::time::sleep(ENGINE_TICK) => {
                    run.tick();
                    if run.sending && run.bound_reached() {
                        run.finish().await;
                        control.send_state(State::TestEnd).await?;
                        break;
                    }
                }
                // Only one test runs at a time; anyone else gets turned away.
                busy = self.listener.accept() => {
                    if let Ok((stream, addr)) = busy {
                        debug!("server busy, denying {}", addr);
                        deny(stream).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = control.send_state(State::ServerTerminate).await;
                    return Err(Error::Interrupted);
                }
            }
        }

        control.send_state(State::ExchangeResults).await?;
        let peer_results = protocol::decode_results(&control.read_results().await?)?;
        run.apply_peer_results(peer_results)?;
        let local = protocol::encode_results(&run.local_summaries().await);
        control.send_results(&local).await?;

        control.send_state(State::DisplayResults).await?;
        report::final_summary(
            &run.final_summaries().await,
            run.elapsed_secs(),
            run.params.protocol(),
            self.cfg.format,
            None,
        );

        match control.read_state().await? {
            State::IperfDone => {}
            other => warn!("expected IPERF_DONE, got {:?}", other),
        }
        Ok(())
    }

    /// Collect the client's TCP data connections off the shared listener,
    /// binding each to the test by its cookie. A connection carrying any
    /// other cookie belongs to someone else's test and is denied.
    async fn accept_tcp_streams(&mut self, run: &mut TestRun, cookie: &[u8; COOKIE_SIZE]) -> Result<()> {
        let expected = run.params.parallel as usize;
        let deadline = Instant::now() + STREAM_CONNECT_TIMEOUT;
        let opts = DataSocketOptions {
            no_delay: run.params.no_delay,
            mss: 0,
            window: run.params.window,
            sending: run.sending,
        };

        while run.stream_count() < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "waiting for {} data connections, got {}",
                    expected,
                    run.stream_count()
                )));
            }
            let (mut stream, addr) = tokio::time::timeout(remaining, self.listener.accept())
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "waiting for {} data connections, got {}",
                        expected,
                        run.stream_count()
                    ))
                })??;

            let mut presented = [0u8; COOKIE_SIZE];
            match tokio::time::timeout(STREAM_CONNECT_TIMEOUT, stream.read_exact(&mut presented)).await {
                Ok(Ok(_)) if presented == *cookie => {
                    let stream = net::configure_accepted_tcp(stream, &opts)?;
                    run.add_stream(DataSocket::Tcp(stream))?;
                }
                Ok(Ok(_)) => {
                    debug!("unknown cookie from {}, denying", addr);
                    let _ = stream.write_all(&[State::AccessDenied.to_byte()]).await;
                }
                Ok(Err(e)) => debug!("no cookie from {}: {}", addr, e),
                Err(_) => debug!("no cookie from {} in time", addr),
            }
        }
        Ok(())
    }

    /// Accept the client's UDP data streams: one socket per stream bound to
    /// the test port, connected to whichever peer sends the 4-byte hello,
    /// acknowledged with the same magic.
    async fn accept_udp_streams(&mut self, run: &mut TestRun) -> Result<()> {
        let expected = run.params.parallel as usize;
        let port = self.local_addr()?.port();
        let deadline = Instant::now() + STREAM_CONNECT_TIMEOUT;
        let opts = DataSocketOptions {
            no_delay: false,
            mss: 0,
            window: run.params.window,
            sending: run.sending,
        };

        for n in 0..expected {
            let socket = net::bind_udp_listener(port, &opts)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut hello = [0u8; 4];
            let (_, peer) = tokio::time::timeout(remaining, socket.recv_from(&mut hello))
                .await
                .map_err(|_| Error::Timeout(format!("waiting for UDP stream {}", n + 1)))??;
            socket.connect(peer).await?;
            socket.send(&UDP_CONNECT_MAGIC.to_be_bytes()).await?;
            debug!("UDP stream {} connected to {}", n + 1, peer);
            run.add_stream(DataSocket::Udp(socket))?;
        }
        Ok(())
    }
}

/// A rejected control connection still gets its cookie read before the
/// denial goes out.
async fn deny(mut stream: TcpStream) {
    let mut cookie = [0u8; COOKIE_SIZE];
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut cookie)).await;
    let _ = stream.write_all(&[State::AccessDenied.to_byte()]).await;
}
