//! Connection factory: listening endpoints, data-connection dialing and the
//! socket options that go with them.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// Options applied to a data connection before use.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSocketOptions {
    pub no_delay: bool,
    pub mss: u32,
    /// Socket buffer size; applied as SO_SNDBUF on the sending side and
    /// SO_RCVBUF on the receiving side.
    pub window: usize,
    pub sending: bool,
}

/// Resolve a server hostname, preferring IPv4 addresses.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| Error::HostResolution(host.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::HostResolution(host.to_string()))
}

/// Server: the TCP listening socket for the control channel and TCP data
/// connections, with SO_REUSEADDR so restarts do not collide with TIME_WAIT.
pub fn listen_tcp(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Client: dial the control channel.
pub async fn dial_control(addr: SocketAddr) -> Result<TcpStream> {
    Ok(TcpStream::connect(addr).await?)
}

/// Client: dial one TCP data connection, applying the requested socket
/// options before connect. MSS in particular must be set on the unconnected
/// socket for the kernel to honor it.
pub async fn dial_data_tcp(addr: SocketAddr, opts: &DataSocketOptions) -> Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP))?;
    if opts.no_delay {
        socket.set_nodelay(true)?;
    }
    if opts.mss > 0 {
        socket.set_mss(opts.mss)?;
    }
    apply_buffer(&socket, opts)?;
    socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(socket.into());
    Ok(socket.connect(addr).await?)
}

/// Server: apply data-connection options to an accepted TCP stream.
pub fn configure_accepted_tcp(stream: TcpStream, opts: &DataSocketOptions) -> Result<TcpStream> {
    let std_stream = stream.into_std()?;
    {
        let socket = socket2::SockRef::from(&std_stream);
        if opts.no_delay {
            socket.set_nodelay(true)?;
        }
        apply_buffer(&socket, opts)?;
    }
    Ok(TcpStream::from_std(std_stream)?)
}

/// Server: a UDP socket awaiting one data-stream handshake on the test port.
///
/// Each stream gets its own socket bound to the same port; SO_REUSEADDR (and
/// SO_REUSEPORT where available) let the next stream's socket bind while
/// earlier ones stay connected to their peers.
pub fn bind_udp_listener(port: u16, opts: &DataSocketOptions) -> Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    apply_buffer(&socket, opts)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Client: dial one UDP data connection.
pub async fn dial_data_udp(addr: SocketAddr, opts: &DataSocketOptions) -> Result<UdpSocket> {
    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    apply_buffer(&socket, opts)?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket.into())?;
    socket.connect(addr).await?;
    Ok(socket)
}

fn apply_buffer(socket: &Socket, opts: &DataSocketOptions) -> Result<()> {
    if opts.window > 0 {
        if opts.sending {
            socket.set_send_buffer_size(opts.window)?;
        } else {
            socket.set_recv_buffer_size(opts.window)?;
        }
    }
    Ok(())
}
