//! Control-channel wire types: the per-test request and the RDMA connection
//! context.
//!
//! The on-wire version must not be advanced except when breaking
//! compatibility; additive fields go at the end of the request with a minor
//! version bump, and receivers ignore trailing bytes they do not know.

use std::fmt;

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};

/// Major protocol version. A mismatch is refused outright.
pub const VER_MAJ: u16 = 0;
/// Minor protocol version. Drift is tolerated by ignoring trailing bytes.
pub const VER_MIN: u16 = 1;
/// Incremental version, informational only.
pub const VER_INC: u16 = 0;

/// Fixed size of the string fields in the request.
pub const STR_SIZE: usize = 64;

/// Wire length of an encoded [`Request`].
pub const REQUEST_WIRE_LEN: usize = 4 * 2 + 13 * 4 + 2 * STR_SIZE;

/// Wire length of an encoded [`ConnContext`].
pub const CONN_WIRE_LEN: usize = 4 * 4 + 8;

/// A protocol version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub maj: u16,
    pub min: u16,
    pub inc: u16,
}

impl Version {
    pub fn ours() -> Self {
        Version {
            maj: VER_MAJ,
            min: VER_MIN,
            inc: VER_INC,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.maj, self.min, self.inc)
    }
}

/// The request sent once, client to server, at the start of every test.
///
/// The thirteen u32 parameters are encoded in stable alphabetical order,
/// followed by the two fixed-length strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub ver_maj: u16,
    pub ver_min: u16,
    pub ver_inc: u16,
    /// Index into the test registry.
    pub test_index: u16,

    /// Touch received data before accounting it.
    pub access_recv: u32,
    /// Processor affinity; `a` pins to CPU `a - 1`, 0 is unpinned.
    pub affinity: u32,
    /// Alternate data port.
    pub alt_port: u32,
    /// Exchange the sending and receiving roles of the two nodes.
    pub flip: u32,
    /// Message size in bytes.
    pub msg_size: u32,
    /// Path MTU for RDMA transports.
    pub mtu_size: u32,
    /// Stop after this many messages; 0 means duration-bounded only.
    pub no_msgs: u32,
    /// Spin on the completion queue instead of sleeping on events.
    pub poll_mode: u32,
    /// Requested data port; 0 means bind ephemerally.
    pub port: u32,
    /// Outstanding RDMA reads and atomics.
    pub rd_atomic: u32,
    /// Socket buffer size; 0 leaves the system default.
    pub sock_buf_size: u32,
    /// Test duration in seconds.
    pub time: u32,
    /// Timeout for connection establishment, in seconds.
    pub timeout: u32,

    /// Device identifier, `"device[:port]"`.
    pub id: String,
    /// Static rate, e.g. `"4xQDR"` or `"10"`.
    pub rate: String,
}

impl Request {
    /// Stamp the current protocol version.
    pub fn versioned(mut self, test_index: u16) -> Self {
        self.ver_maj = VER_MAJ;
        self.ver_min = VER_MIN;
        self.ver_inc = VER_INC;
        self.test_index = test_index;
        self
    }

    pub fn version(&self) -> Version {
        Version {
            maj: self.ver_maj,
            min: self.ver_min,
            inc: self.ver_inc,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(REQUEST_WIRE_LEN);
        enc.put_uint(self.ver_maj.into(), 2);
        enc.put_uint(self.ver_min.into(), 2);
        enc.put_uint(self.ver_inc.into(), 2);
        enc.put_uint(self.test_index.into(), 2);
        enc.put_uint(self.access_recv.into(), 4);
        enc.put_uint(self.affinity.into(), 4);
        enc.put_uint(self.alt_port.into(), 4);
        enc.put_uint(self.flip.into(), 4);
        enc.put_uint(self.msg_size.into(), 4);
        enc.put_uint(self.mtu_size.into(), 4);
        enc.put_uint(self.no_msgs.into(), 4);
        enc.put_uint(self.poll_mode.into(), 4);
        enc.put_uint(self.port.into(), 4);
        enc.put_uint(self.rd_atomic.into(), 4);
        enc.put_uint(self.sock_buf_size.into(), 4);
        enc.put_uint(self.time.into(), 4);
        enc.put_uint(self.timeout.into(), 4);
        enc.put_str(&self.id, STR_SIZE);
        enc.put_str(&self.rate, STR_SIZE);
        enc.finish()
    }

    /// Decode a request. Trailing bytes beyond the fields we know are
    /// ignored; they belong to a peer with a newer minor version.
    pub fn decode(buf: &[u8]) -> Result<Request> {
        let mut dec = Decoder::new(buf);
        let w = "request";
        Ok(Request {
            ver_maj: dec.get_uint(2, w)? as u16,
            ver_min: dec.get_uint(2, w)? as u16,
            ver_inc: dec.get_uint(2, w)? as u16,
            test_index: dec.get_uint(2, w)? as u16,
            access_recv: dec.get_uint(4, w)? as u32,
            affinity: dec.get_uint(4, w)? as u32,
            alt_port: dec.get_uint(4, w)? as u32,
            flip: dec.get_uint(4, w)? as u32,
            msg_size: dec.get_uint(4, w)? as u32,
            mtu_size: dec.get_uint(4, w)? as u32,
            no_msgs: dec.get_uint(4, w)? as u32,
            poll_mode: dec.get_uint(4, w)? as u32,
            port: dec.get_uint(4, w)? as u32,
            rd_atomic: dec.get_uint(4, w)? as u32,
            sock_buf_size: dec.get_uint(4, w)? as u32,
            time: dec.get_uint(4, w)? as u32,
            timeout: dec.get_uint(4, w)? as u32,
            id: dec.get_str(STR_SIZE, w)?,
            rate: dec.get_str(STR_SIZE, w)?,
        })
    }

    /// Refuse a differing major version; minor drift is fine.
    pub fn check_version(&self) -> Result<()> {
        if self.ver_maj != VER_MAJ {
            return Err(Error::Version {
                local: Version::ours(),
                remote: self.version(),
            });
        }
        Ok(())
    }
}

/// RDMA connection context, exchanged once per side per test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnContext {
    /// Local identifier of the port.
    pub lid: u32,
    /// Queue pair number.
    pub qpn: u32,
    /// Starting packet sequence number (24 bits used).
    pub psn: u32,
    /// Remote key of the memory region.
    pub rkey: u32,
    /// Virtual address of the memory region.
    pub vaddr: u64,
}

impl ConnContext {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(CONN_WIRE_LEN);
        enc.put_uint(self.lid.into(), 4);
        enc.put_uint(self.qpn.into(), 4);
        enc.put_uint(self.psn.into(), 4);
        enc.put_uint(self.rkey.into(), 4);
        enc.put_uint(self.vaddr, 8);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<ConnContext> {
        let mut dec = Decoder::new(buf);
        let w = "connection context";
        Ok(ConnContext {
            lid: dec.get_uint(4, w)? as u32,
            qpn: dec.get_uint(4, w)? as u32,
            psn: dec.get_uint(4, w)? as u32,
            rkey: dec.get_uint(4, w)? as u32,
            vaddr: dec.get_uint(8, w)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        Request {
            msg_size: 65536,
            mtu_size: 2048,
            time: 2,
            timeout: 5,
            poll_mode: 1,
            rd_atomic: 16,
            id: "mlx5_0:1".into(),
            rate: "4xQDR".into(),
            ..Default::default()
        }
        .versioned(7)
    }

    #[test]
    fn request_wire_len() {
        assert_eq!(sample_request().encode().len(), REQUEST_WIRE_LEN);
        assert_eq!(REQUEST_WIRE_LEN, 188);
    }

    #[test]
    fn request_round_trip() {
        let req = sample_request();
        let decoded = Request::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn request_ignores_trailing_bytes() {
        let req = sample_request();
        let mut buf = req.encode();
        buf.extend_from_slice(&[0xaa; 16]);
        let decoded = Request::decode(&buf).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn major_version_is_refused() {
        let mut req = sample_request();
        req.ver_maj = VER_MAJ + 1;
        assert!(matches!(
            Request::decode(&req.encode()).unwrap().check_version(),
            Err(Error::Version { .. })
        ));
    }

    #[test]
    fn minor_drift_is_tolerated() {
        let mut req = sample_request();
        req.ver_min = VER_MIN + 3;
        assert!(Request::decode(&req.encode())
            .unwrap()
            .check_version()
            .is_ok());
    }

    #[test]
    fn conn_context_round_trip() {
        let con = ConnContext {
            lid: 0x11,
            qpn: 0x123456,
            psn: 0xabcdef,
            rkey: 0xdead_beef,
            vaddr: 0x7fff_0000_1234,
        };
        let buf = con.encode();
        assert_eq!(buf.len(), CONN_WIRE_LEN);
        assert_eq!(ConnContext::decode(&buf).unwrap(), con);
    }

    #[test]
    fn conn_context_field_order() {
        let con = ConnContext {
            lid: 1,
            qpn: 2,
            psn: 3,
            rkey: 4,
            vaddr: 5,
        };
        let buf = con.encode();
        assert_eq!(buf[3], 1);
        assert_eq!(buf[7], 2);
        assert_eq!(buf[11], 3);
        assert_eq!(buf[15], 4);
        assert_eq!(buf[23], 5);
    }
}
