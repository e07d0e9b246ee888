//! Control-channel framing over the single client/server TCP stream.

use crate::error::{Error, Result};
use crate::protocol::{State, TestParams, COOKIE_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a results payload
const MAX_PAYLOAD: usize = 1024 * 1024;

/// The control channel owned by a Test for its whole lifetime.
pub struct ControlChannel {
    stream: TcpStream,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Send a one-byte state code.
    pub async fn send_state(&mut self, state: State) -> Result<()> {
        self.stream.write_all(&[state.to_byte()]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next state code. EOF maps to `ControlClosed`, an unknown
    /// byte to a protocol error.
    pub async fn read_state(&mut self) -> Result<State> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        State::from_byte(buf[0])
            .ok_or_else(|| Error::Protocol(format!("unknown state code {}", buf[0] as i8)))
    }

    pub async fn send_cookie(&mut self, cookie: &[u8; COOKIE_SIZE]) -> Result<()> {
        self.stream.write_all(cookie).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_cookie(&mut self) -> Result<[u8; COOKIE_SIZE]> {
        let mut cookie = [0u8; COOKIE_SIZE];
        self.read_exact(&mut cookie).await?;
        Ok(cookie)
    }

    /// Send the parameter blob: one length byte plus the token payload.
    pub async fn send_params(&mut self, params: &TestParams) -> Result<()> {
        self.stream.write_all(&params.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_params(&mut self) -> Result<TestParams> {
        let mut len = [0u8; 1];
        self.read_exact(&mut len).await?;
        let mut payload = vec![0u8; len[0] as usize];
        self.read_exact(&mut payload).await?;
        let text = String::from_utf8_lossy(&payload);
        Ok(TestParams::decode(&text))
    }

    /// Send a results payload: u32 big-endian length, then the ASCII lines.
    pub async fn send_results(&mut self, payload: &str) -> Result<()> {
        let len = payload.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(payload.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_results(&mut self) -> Result<String> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::Protocol(format!("results payload too large: {len} bytes")));
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ControlClosed),
            Err(e) => Err(e.into()),
        }
    }
}
