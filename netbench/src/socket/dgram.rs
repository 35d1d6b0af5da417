//! Datagram-socket measurement loops (UDP and RDS).
//!
//! Datagrams are never fragmented by the loop; a send or receive that moves
//! anything other than exactly `msg_size` bytes counts as an error.

use std::io;
use std::net::SocketAddrV4;

use log::debug;
use netbench_core::clock;
use netbench_core::error::{Error, Result};

use super::DataSock;
use crate::ctx::{barrier_failed, Run};
use crate::report::{self, Measure};

/// Client setup: request, datagram socket on an ephemeral port, learn the
/// server's bound port.
fn client_init(run: &mut Run, domain: i32) -> Result<(DataSock, SocketAddrV4)> {
    run.send_request()?;
    let sock = DataSock::datagram(domain)?;
    sock.bind(0)?;
    sock.set_buffer_size(run.req.sock_buf_size)?;

    let port = run.ctl.recv_u32("port")?;
    let peer = run
        .ctl
        .peer_addr()
        .ok_or_else(|| Error::Config("control channel has no peer".into()))?;
    let std::net::SocketAddr::V4(peer) = peer else {
        return Err(Error::Config("data transports require an IPv4 peer".into()));
    };
    debug!(
        "sending datagrams from port {} to {}:{}",
        sock.local_port()?,
        peer.ip(),
        port
    );
    Ok((sock, SocketAddrV4::new(*peer.ip(), port as u16)))
}

/// Server setup: bind the data port and hand it to the client.
fn server_init(run: &mut Run, domain: i32) -> Result<DataSock> {
    let sock = DataSock::datagram(domain)?;
    sock.bind(run.req.port as u16)?;
    sock.set_buffer_size(run.req.sock_buf_size)?;
    run.ctl.send_u32(u32::from(sock.local_port()?), "port")?;
    Ok(sock)
}

fn msg_buf(run: &Run) -> Result<Vec<u8>> {
    let size = run.req.msg_size as usize;
    if size == 0 {
        return Err(Error::Config("msg_size must be at least 1".into()));
    }
    Ok(vec![0u8; size])
}

/// Retry a datagram syscall on EINTR until the alarm has actually fired;
/// an interrupted call with the flag set surfaces so the loop can exit
/// before accounting.
fn dgram_op<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted && !clock::finished() => continue,
            other => return other,
        }
    }
}

/// Exactly `msg_size` bytes moved is a success.
fn account_send(run: &mut Run, outcome: io::Result<usize>, want: usize) {
    match outcome {
        Err(e) => {
            debug!("send failed: {e}");
            run.lstat.s.no_errs += 1;
        }
        Ok(n) if n != want => {
            run.lstat.s.no_errs += 1;
        }
        Ok(n) => {
            run.lstat.s.no_bytes += n as u64;
            run.lstat.s.no_msgs += 1;
        }
    }
}

fn account_recv(run: &mut Run, outcome: io::Result<usize>, want: usize) {
    match outcome {
        Err(e) => {
            debug!("receive failed: {e}");
            run.lstat.r.no_errs += 1;
        }
        Ok(n) if n != want => {
            run.lstat.r.no_errs += 1;
        }
        Ok(n) => {
            run.lstat.r.no_bytes += n as u64;
            run.lstat.r.no_msgs += 1;
        }
    }
}

pub fn client_bw(run: &mut Run, domain: i32) -> Result<()> {
    let mut sock = None;
    let body = (|| {
        let (s, server) = client_init(run, domain)?;
        let s = sock.insert(s);
        let buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        while !clock::finished() {
            let n = dgram_op(|| s.send_to(&buf, server));
            if clock::finished() {
                break;
            }
            account_send(run, n, buf.len());
            if run.hit_msg_cap(run.lstat.s.no_msgs + run.lstat.s.no_errs) {
                break;
            }
        }
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    if run.successful {
        report::show_results(run, Measure::BandwidthSr);
    }
    outcome
}

pub fn server_bw(run: &mut Run, domain: i32) -> Result<()> {
    let mut sock = None;
    let body = (|| {
        let s = sock.insert(server_init(run, domain)?);
        let mut buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        while !clock::finished() {
            let n = dgram_op(|| s.recv(&mut buf));
            if clock::finished() {
                break;
            }
            account_recv(run, n, buf.len());
            if run.hit_msg_cap(run.lstat.r.no_msgs + run.lstat.r.no_errs) {
                break;
            }
        }
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    outcome
}

pub fn client_lat(run: &mut Run, domain: i32) -> Result<()> {
    let mut sock = None;
    let body = (|| {
        let (s, server) = client_init(run, domain)?;
        let s = sock.insert(s);
        let mut buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        while !clock::finished() {
            let n = dgram_op(|| s.send_to(&buf, server));
            if clock::finished() {
                break;
            }
            account_send(run, n, buf.len());

            let n = dgram_op(|| s.recv(&mut buf));
            if clock::finished() {
                break;
            }
            account_recv(run, n, buf.len());
        }
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    if run.successful {
        report::show_results(run, Measure::Latency);
    }
    outcome
}

/// The latency server echoes to the source address of the most recent
/// datagram.
pub fn server_lat(run: &mut Run, domain: i32) -> Result<()> {
    let mut sock = None;
    let body = (|| {
        let s = sock.insert(server_init(run, domain)?);
        let mut buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        while !clock::finished() {
            let recv = dgram_op(|| s.recv_from(&mut buf));
            if clock::finished() {
                break;
            }
            let from = match recv {
                Err(e) => {
                    account_recv(run, Err(e), buf.len());
                    continue;
                }
                Ok((n, from)) => {
                    account_recv(run, Ok(n), buf.len());
                    from
                }
            };

            let n = dgram_op(|| s.send_to(&buf, from));
            if clock::finished() {
                break;
            }
            account_send(run, n, buf.len());
        }
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    outcome
}
