//! TCP diagnostic snapshots for interval reports.
//!
//! Backed by `getsockopt(TCP_INFO)` where the platform has it; elsewhere the
//! snapshot is simply absent and interval records carry no diagnostics.

use std::os::unix::io::RawFd;

/// Point-in-time TCP state for one data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpDiag {
    pub retransmits: u64,
    pub rtt_micros: u32,
    pub snd_cwnd: u32,
}

#[cfg(target_os = "linux")]
pub fn snapshot(fd: RawFd) -> Option<TcpDiag> {
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(TcpDiag {
        retransmits: info.tcpi_total_retrans as u64,
        rtt_micros: info.tcpi_rtt,
        snd_cwnd: info.tcpi_snd_cwnd,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn snapshot(_fd: RawFd) -> Option<TcpDiag> {
    None
}

/// The maximum segment size the kernel settled on for a connection.
#[cfg(target_os = "linux")]
pub fn mss(fd: RawFd) -> Option<u32> {
    let mut mss: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            &mut mss as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(mss as u32)
}

#[cfg(not(target_os = "linux"))]
pub fn mss(_fd: RawFd) -> Option<u32> {
    None
}
