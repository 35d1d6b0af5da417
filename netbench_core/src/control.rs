//! The control channel.
//!
//! A single TCP connection per test carries the request, transport
//! parameters (data ports, RDMA connection contexts), the barrier tokens,
//! and the final statistics. It is the only path the end-of-test signal
//! travels; failures on the data path never end a test, failures here
//! always do.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use log::debug;

use crate::clock;
use crate::error::{Error, Result};
use crate::stats::{Stat, STAT_WIRE_LEN};
use crate::wire::{Request, REQUEST_WIRE_LEN};

/// Well-known control-channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 19765;

/// One side of the control channel.
pub struct Control {
    stream: TcpStream,
}

impl Control {
    /// Bind the listening socket (server side).
    pub fn listen(port: u16) -> Result<TcpListener> {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| Error::io("unable to bind to listen port", e))
    }

    /// Accept one client (server side).
    pub fn accept(listener: &TcpListener) -> Result<Control> {
        let (stream, peer) = listener
            .accept()
            .map_err(|e| Error::io("accept failed", e))?;
        debug!("accepted control connection from {peer}");
        stream
            .set_nodelay(true)
            .map_err(|e| Error::io("failed to set nodelay", e))?;
        Ok(Control { stream })
    }

    /// Connect to the server (client side), retrying for up to `wait`
    /// seconds while it comes up.
    pub fn connect(host: &str, port: u16, wait: u32) -> Result<Control> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(wait));
        let stream = loop {
            match TcpStream::connect((host, port)) {
                Ok(s) => break s,
                Err(e) if Instant::now() < deadline => {
                    debug!("control connect to {host}:{port} failed ({e}), retrying");
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => {
                    return Err(Error::io(format!("{host}: failed to connect"), e));
                }
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| Error::io("failed to set nodelay", e))?;
        Ok(Control { stream })
    }

    /// Peer address; the data-socket drivers derive the server's IPv4
    /// address from the control connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Write a fully-counted control message.
    pub fn send_mesg(&mut self, bytes: &[u8], what: &'static str) -> Result<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| Error::io(format!("failed to send {what}"), e))
    }

    /// Read a fully-counted control message.
    pub fn recv_mesg(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| Error::io(format!("failed to receive {what}"), e))?;
        Ok(buf)
    }

    /// Ship a single u32 (data-port handoff).
    pub fn send_u32(&mut self, v: u32, what: &'static str) -> Result<()> {
        let mut enc = crate::codec::Encoder::with_capacity(4);
        enc.put_uint(v.into(), 4);
        self.send_mesg(&enc.finish(), what)
    }

    /// Receive a single u32 (data-port handoff).
    pub fn recv_u32(&mut self, what: &'static str) -> Result<u32> {
        let buf = self.recv_mesg(4, what)?;
        let mut dec = crate::codec::Decoder::new(&buf);
        Ok(dec.get_uint(4, what)? as u32)
    }

    /// Send the request (client only).
    pub fn send_request(&mut self, req: &Request) -> Result<()> {
        debug!("sending request: test index {}", req.test_index);
        self.send_mesg(&req.encode(), "request data")
    }

    /// Receive and validate the request (server only).
    pub fn recv_request(&mut self, num_tests: u16) -> Result<Request> {
        let buf = self.recv_mesg(REQUEST_WIRE_LEN, "request data")?;
        let req = Request::decode(&buf)?;
        req.check_version()?;
        if req.test_index >= num_tests {
            return Err(Error::BadTest(req.test_index));
        }
        Ok(req)
    }

    /// Two-way barrier: write one byte, read one byte. Returns false if the
    /// peer already closed the channel; the caller then skips its
    /// measurement loop but still completes the statistics exchange.
    pub fn synchronize(&mut self, label: &'static str) -> bool {
        let token = [0u8; 1];
        if let Err(e) = self
            .stream
            .write_all(&token)
            .and_then(|()| self.stream.flush())
        {
            debug!("{label}: barrier send failed: {e}");
            return false;
        }
        let mut token = [0u8; 1];
        if let Err(e) = self.stream.read_exact(&mut token) {
            debug!("{label}: barrier receive failed: {e}");
            return false;
        }
        true
    }

    /// Barrier plus timer start: on release both sides begin measuring.
    pub fn sync_test(&mut self, stat: &mut Stat, seconds: u32) -> bool {
        if !self.synchronize("synchronization before test") {
            return false;
        }
        clock::start_timer(stat, seconds);
        true
    }

    /// Symmetric statistics exchange: write ours, read the peer's. The
    /// blocks are small enough that both sides writing first cannot
    /// deadlock.
    pub fn exchange_results(&mut self, local: &Stat) -> Result<Stat> {
        self.send_mesg(&local.encode(), "results")?;
        let buf = self.recv_mesg(STAT_WIRE_LEN, "results")?;
        Stat::decode(&buf)
    }
}
