//! Stream-socket measurement loops (TCP and SDP).

use std::io;

use log::debug;
use netbench_core::clock;
use netbench_core::error::{Error, Result};

use super::DataSock;
use crate::ctx::{barrier_failed, Run};
use crate::report::{self, Measure};

/// Write a complete message. A zero-byte write is end-of-file and ends the
/// test; EINTR is no work done this iteration.
fn send_full(sock: &DataSock, buf: &[u8]) -> io::Result<usize> {
    let mut off = 0;
    while !clock::finished() && off < buf.len() {
        match sock.send(&buf[off..]) {
            Ok(0) => clock::set_finished(),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(off)
}

/// Read a complete message, with the same termination rules as
/// [`send_full`].
fn recv_full(sock: &DataSock, buf: &mut [u8]) -> io::Result<usize> {
    let mut off = 0;
    while !clock::finished() && off < buf.len() {
        match sock.recv(&mut buf[off..]) {
            Ok(0) => clock::set_finished(),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(off)
}

/// Client-side setup: request, data socket, buffer size, receive the
/// server's bound port, connect.
fn client_init(run: &mut Run, domain: i32) -> Result<DataSock> {
    run.send_request()?;
    let sock = DataSock::stream(domain)?;
    sock.bind(0)?;
    sock.set_buffer_size(run.req.sock_buf_size)?;

    let port = run.ctl.recv_u32("port")?;
    let host = run
        .ctl
        .peer_addr()
        .ok_or_else(|| Error::Config("control channel has no peer".into()))?;
    let std::net::SocketAddr::V4(peer) = host else {
        return Err(Error::Config("data transports require an IPv4 peer".into()));
    };
    debug!(
        "connecting data socket from port {} to {}:{}",
        sock.local_port()?,
        peer.ip(),
        port
    );
    sock.connect(std::net::SocketAddrV4::new(*peer.ip(), port as u16))?;
    Ok(sock)
}

/// Server-side setup: bind the data port, hand it to the client, accept.
fn server_init(run: &mut Run, domain: i32) -> Result<DataSock> {
    let listener = DataSock::stream(domain)?;
    listener.set_reuse_addr()?;
    listener.bind(run.req.port as u16)?;
    let port = listener.local_port()?;
    listener.listen()?;
    run.ctl.send_u32(u32::from(port), "port")?;
    let sock = listener.accept()?;
    sock.set_buffer_size(run.req.sock_buf_size)?;
    Ok(sock)
}

fn msg_buf(run: &Run) -> Result<Vec<u8>> {
    let size = run.req.msg_size as usize;
    if size == 0 {
        return Err(Error::Config("msg_size must be at least 1".into()));
    }
    Ok(vec![0u8; size])
}

fn send_loop(run: &mut Run, sock: &DataSock, buf: &[u8]) {
    while !clock::finished() {
        let n = send_full(sock, buf);
        if clock::finished() {
            break;
        }
        match n {
            Err(e) => {
                debug!("send failed: {e}");
                run.lstat.s.no_errs += 1;
            }
            Ok(n) => {
                run.lstat.s.no_bytes += n as u64;
                run.lstat.s.no_msgs += 1;
            }
        }
        if run.hit_msg_cap(run.lstat.s.no_msgs + run.lstat.s.no_errs) {
            break;
        }
    }
}

fn recv_loop(run: &mut Run, sock: &DataSock, buf: &mut [u8]) {
    while !clock::finished() {
        let n = recv_full(sock, buf);
        if clock::finished() {
            break;
        }
        match n {
            Err(e) => {
                debug!("receive failed: {e}");
                run.lstat.r.no_errs += 1;
            }
            Ok(n) => {
                run.lstat.r.no_bytes += n as u64;
                run.lstat.r.no_msgs += 1;
            }
        }
        if run.hit_msg_cap(run.lstat.r.no_msgs + run.lstat.r.no_errs) {
            break;
        }
    }
}

pub fn client_bw(run: &mut Run, domain: i32) -> Result<()> {
    let mut sock = None;
    let body = (|| {
        let s = sock.insert(client_init(run, domain)?);
        let mut buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        if run.req.flip == 0 {
            send_loop(run, s, &buf);
        } else {
            recv_loop(run, s, &mut buf);
        }
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    if run.successful {
        report::show_results(run, Measure::Bandwidth);
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
        if run.req.flip == 0 {
            recv_loop(run, s, &mut buf);
        } else {
            send_loop(run, s, &buf);
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
        let s = sock.insert(client_init(run, domain)?);
        let mut buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        ping_pong(run, s, &mut buf, true);
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    if run.successful {
        report::show_results(run, Measure::Latency);
    }
    outcome
}

pub fn server_lat(run: &mut Run, domain: i32) -> Result<()> {
    let mut sock = None;
    let body = (|| {
        let s = sock.insert(server_init(run, domain)?);
        let mut buf = msg_buf(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        ping_pong(run, s, &mut buf, false);
        Ok(())
    })();
    let outcome = run.conclude(body);
    drop(sock);
    outcome
}

/// One send leg of the ping-pong. Returns false when the loop should
/// restart the iteration (error counted, or time ran out).
fn pong_send(run: &mut Run, sock: &DataSock, buf: &[u8]) -> bool {
    let n = send_full(sock, buf);
    if clock::finished() {
        return false;
    }
    match n {
        Err(e) => {
            debug!("send failed: {e}");
            run.lstat.s.no_errs += 1;
            false
        }
        Ok(n) => {
            run.lstat.s.no_bytes += n as u64;
            run.lstat.s.no_msgs += 1;
            true
        }
    }
}

fn pong_recv(run: &mut Run, sock: &DataSock, buf: &mut [u8]) -> bool {
    let n = recv_full(sock, buf);
    if clock::finished() {
        return false;
    }
    match n {
        Err(e) => {
            debug!("receive failed: {e}");
            run.lstat.r.no_errs += 1;
            false
        }
        Ok(n) => {
            run.lstat.r.no_bytes += n as u64;
            run.lstat.r.no_msgs += 1;
            true
        }
    }
}

/// Alternate a send and a receive per iteration; the client fires first,
/// the server echoes.
fn ping_pong(run: &mut Run, sock: &DataSock, buf: &mut [u8], client: bool) {
    while !clock::finished() {
        if client {
            if !pong_send(run, sock, buf) {
                continue;
            }
            pong_recv(run, sock, buf);
        } else {
            if !pong_recv(run, sock, buf) {
                continue;
            }
            pong_send(run, sock, buf);
        }
    }
}
