//! Socket transports: TCP, SDP, UDP, RDS.
//!
//! The data sockets go through raw libc calls rather than `std::net`
//! because SDP and RDS live in address families std cannot open, and the
//! measurement loops need to see EINTR from the duration alarm rather than
//! having it retried away.

mod dgram;
mod stream;

use std::fs;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use log::debug;
use netbench_core::error::{Error, Result};
use netbench_core::ParamId;

use crate::ctx::Run;

/// Address family for the Sockets Direct Protocol.
pub const AF_INET_SDP: i32 = 27;

const K64: u32 = 64 * 1024;
const K32: u32 = 32 * 1024;
const K8: u32 = 8 * 1024;

/// Address family for RDS. The kernel decides the value; read it from
/// procfs and fall back to the historical constant when the module is not
/// loaded.
pub fn af_rds() -> i32 {
    rds_family_from(fs::read_to_string("/proc/sys/net/rds/pf_rds").ok().as_deref())
}

fn rds_family_from(proc_value: Option<&str>) -> i32 {
    proc_value
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(21)
}

/// A data-transfer socket in an arbitrary address family.
pub struct DataSock {
    fd: RawFd,
}

impl Drop for DataSock {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn sockaddr_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

fn sockaddr_to(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

impl DataSock {
    pub fn open(family: i32, sock_type: libc::c_int) -> Result<DataSock> {
        let fd = unsafe { libc::socket(family, sock_type, 0) };
        if fd < 0 {
            return Err(Error::sys("socket failed"));
        }
        Ok(DataSock { fd })
    }

    pub fn stream(family: i32) -> Result<DataSock> {
        Self::open(family, libc::SOCK_STREAM)
    }

    pub fn datagram(family: i32) -> Result<DataSock> {
        Self::open(family, libc::SOCK_DGRAM)
    }

    /// Bind to INADDR_ANY at `port`; 0 picks an ephemeral port.
    pub fn bind(&self, port: u16) -> Result<()> {
        let sin = sockaddr_from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let rc = unsafe {
            libc::bind(
                self.fd,
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::sys("bind failed"));
        }
        Ok(())
    }

    pub fn local_port(&self) -> Result<u16> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(Error::sys("getsockname failed"));
        }
        Ok(u16::from_be(sin.sin_port))
    }

    pub fn set_reuse_addr(&self) -> Result<()> {
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::sys("failed to reuse address on socket"));
        }
        Ok(())
    }

    /// Apply both socket buffer sizes; 0 keeps the system default.
    pub fn set_buffer_size(&self, size: u32) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        for (opt, what) in [
            (libc::SO_SNDBUF, "failed to set send buffer size on socket"),
            (libc::SO_RCVBUF, "failed to set receive buffer size on socket"),
        ] {
            let val = size as libc::c_int;
            let rc = unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::SOL_SOCKET,
                    opt,
                    &val as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(Error::sys(what));
            }
        }
        Ok(())
    }

    pub fn listen(&self) -> Result<()> {
        if unsafe { libc::listen(self.fd, 1) } < 0 {
            return Err(Error::sys("listen failed"));
        }
        Ok(())
    }

    pub fn accept(&self) -> Result<DataSock> {
        loop {
            let fd = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                debug!("accepted data connection");
                return Ok(DataSock { fd });
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(Error::io("accept failed", e));
            }
        }
    }

    pub fn connect(&self, addr: SocketAddrV4) -> Result<()> {
        let sin = sockaddr_from(addr);
        let rc = unsafe {
            libc::connect(
                self.fd,
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::sys("connect failed"));
        }
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        let sin = sockaddr_from(addr);
        let n = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut sin as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok((n as usize, sockaddr_to(&sin)))
        }
    }
}

/// Defaults and parameter consumption shared by all socket tests.
fn ip_params(run: &mut Run, msg_size: u32, uses_flip: bool) -> Result<()> {
    if run.client {
        run.params.set_default(ParamId::MsgSize, msg_size);
        run.params.mark_used(ParamId::Port);
        run.params.mark_used(ParamId::SockBufSize);
        if uses_flip {
            run.params.mark_used(ParamId::Flip);
        }
        let name = run.test_name.clone();
        run.params.validate(&name)?;
        run.refresh_req();
    }
    Ok(())
}

pub fn run_client_tcp_bw(run: &mut Run) -> Result<()> {
    ip_params(run, K64, true)?;
    stream::client_bw(run, libc::AF_INET)
}

pub fn run_server_tcp_bw(run: &mut Run) -> Result<()> {
    stream::server_bw(run, libc::AF_INET)
}

pub fn run_client_tcp_lat(run: &mut Run) -> Result<()> {
    ip_params(run, 1, false)?;
    stream::client_lat(run, libc::AF_INET)
}

pub fn run_server_tcp_lat(run: &mut Run) -> Result<()> {
    stream::server_lat(run, libc::AF_INET)
}

pub fn run_client_sdp_bw(run: &mut Run) -> Result<()> {
    ip_params(run, K64, true)?;
    stream::client_bw(run, AF_INET_SDP)
}

pub fn run_server_sdp_bw(run: &mut Run) -> Result<()> {
    stream::server_bw(run, AF_INET_SDP)
}

pub fn run_client_sdp_lat(run: &mut Run) -> Result<()> {
    ip_params(run, 1, false)?;
    stream::client_lat(run, AF_INET_SDP)
}

pub fn run_server_sdp_lat(run: &mut Run) -> Result<()> {
    stream::server_lat(run, AF_INET_SDP)
}

pub fn run_client_udp_bw(run: &mut Run) -> Result<()> {
    ip_params(run, K32, false)?;
    dgram::client_bw(run, libc::AF_INET)
}

pub fn run_server_udp_bw(run: &mut Run) -> Result<()> {
    dgram::server_bw(run, libc::AF_INET)
}

pub fn run_client_udp_lat(run: &mut Run) -> Result<()> {
    ip_params(run, 1, false)?;
    dgram::client_lat(run, libc::AF_INET)
}

pub fn run_server_udp_lat(run: &mut Run) -> Result<()> {
    dgram::server_lat(run, libc::AF_INET)
}

pub fn run_client_rds_bw(run: &mut Run) -> Result<()> {
    ip_params(run, K8, false)?;
    dgram::client_bw(run, af_rds())
}

pub fn run_server_rds_bw(run: &mut Run) -> Result<()> {
    dgram::server_bw(run, af_rds())
}

pub fn run_client_rds_lat(run: &mut Run) -> Result<()> {
    ip_params(run, 1, false)?;
    dgram::client_lat(run, af_rds())
}

pub fn run_server_rds_lat(run: &mut Run) -> Result<()> {
    dgram::server_lat(run, af_rds())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rds_family_prefers_procfs() {
        assert_eq!(rds_family_from(Some("30\n")), 30);
        assert_eq!(rds_family_from(Some(" 28 ")), 28);
    }

    #[test]
    fn rds_family_falls_back_to_21() {
        assert_eq!(rds_family_from(None), 21);
        assert_eq!(rds_family_from(Some("not a number")), 21);
        assert_eq!(rds_family_from(Some("")), 21);
    }

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 7, 9), 19765);
        assert_eq!(sockaddr_to(&sockaddr_from(addr)), addr);
    }

    #[test]
    fn loopback_datagram_pair() {
        let a = DataSock::datagram(libc::AF_INET).unwrap();
        a.bind(0).unwrap();
        let b = DataSock::datagram(libc::AF_INET).unwrap();
        b.bind(0).unwrap();
        let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, b.local_port().unwrap());

        assert_eq!(a.send_to(b"ping", dst).unwrap(), 4);
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.ip(), &Ipv4Addr::LOCALHOST);
    }
}
