//! The negotiated parameter table.
//!
//! Every recognized option exists twice, once for the local node and once
//! for the remote node. The client folds its command line into both views,
//! ships the remote view inside the request, and the server adopts it. A
//! parameter carries a "set" bit (the user supplied it) and a "used" bit (a
//! driver consumed it); after driver startup any parameter that is set but
//! unused fails the test, because silently ignoring an option the user asked
//! for produces numbers that do not mean what they look like.

use crate::error::{Error, Result};
use crate::wire::Request;

/// One logical parameter; each covers a local/remote pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    AccessRecv,
    Affinity,
    AltPort,
    Flip,
    Id,
    MsgSize,
    MtuSize,
    NoMsgs,
    PollMode,
    Port,
    RdAtomic,
    Rate,
    SockBufSize,
    Time,
    Timeout,
}

pub const PARAM_COUNT: usize = 15;

impl ParamId {
    fn index(self) -> usize {
        self as usize
    }

    /// Canonical option name, used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ParamId::AccessRecv => "access_recv",
            ParamId::Affinity => "affinity",
            ParamId::AltPort => "alt_port",
            ParamId::Flip => "flip",
            ParamId::Id => "id",
            ParamId::MsgSize => "msg_size",
            ParamId::MtuSize => "mtu_size",
            ParamId::NoMsgs => "no_msgs",
            ParamId::PollMode => "poll_mode",
            ParamId::Port => "port",
            ParamId::RdAtomic => "rd_atomic",
            ParamId::Rate => "rate",
            ParamId::SockBufSize => "sock_buf_size",
            ParamId::Time => "time",
            ParamId::Timeout => "timeout",
        }
    }

    pub fn all() -> [ParamId; PARAM_COUNT] {
        [
            ParamId::AccessRecv,
            ParamId::Affinity,
            ParamId::AltPort,
            ParamId::Flip,
            ParamId::Id,
            ParamId::MsgSize,
            ParamId::MtuSize,
            ParamId::NoMsgs,
            ParamId::PollMode,
            ParamId::Port,
            ParamId::RdAtomic,
            ParamId::Rate,
            ParamId::SockBufSize,
            ParamId::Time,
            ParamId::Timeout,
        ]
    }

    pub fn from_name(name: &str) -> Option<ParamId> {
        ParamId::all().into_iter().find(|p| p.name() == name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    set: bool,
    used: bool,
}

/// The two per-node views plus set/used bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    /// The local node's view (`L_*`).
    pub local: Request,
    /// The remote node's view (`R_*`), shipped inside the request.
    pub remote: Request,
    // [param][side: 0 = local, 1 = remote]
    flags: [[Flags; 2]; PARAM_COUNT],
}

fn u32_field(req: &mut Request, id: ParamId) -> Option<&mut u32> {
    match id {
        ParamId::AccessRecv => Some(&mut req.access_recv),
        ParamId::Affinity => Some(&mut req.affinity),
        ParamId::AltPort => Some(&mut req.alt_port),
        ParamId::Flip => Some(&mut req.flip),
        ParamId::MsgSize => Some(&mut req.msg_size),
        ParamId::MtuSize => Some(&mut req.mtu_size),
        ParamId::NoMsgs => Some(&mut req.no_msgs),
        ParamId::PollMode => Some(&mut req.poll_mode),
        ParamId::Port => Some(&mut req.port),
        ParamId::RdAtomic => Some(&mut req.rd_atomic),
        ParamId::SockBufSize => Some(&mut req.sock_buf_size),
        ParamId::Time => Some(&mut req.time),
        ParamId::Timeout => Some(&mut req.timeout),
        ParamId::Id | ParamId::Rate => None,
    }
}

fn str_field(req: &mut Request, id: ParamId) -> Option<&mut String> {
    match id {
        ParamId::Id => Some(&mut req.id),
        ParamId::Rate => Some(&mut req.rate),
        _ => None,
    }
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user-supplied numeric value on both views.
    pub fn set_by_user_u32(&mut self, id: ParamId, v: u32) {
        for (side, req) in [&mut self.local, &mut self.remote].into_iter().enumerate() {
            if let Some(field) = u32_field(req, id) {
                *field = v;
            }
            self.flags[id.index()][side].set = true;
        }
    }

    /// Record a user-supplied string value on both views.
    pub fn set_by_user_str(&mut self, id: ParamId, v: &str) {
        for (side, req) in [&mut self.local, &mut self.remote].into_iter().enumerate() {
            if let Some(field) = str_field(req, id) {
                *field = v.to_owned();
            }
            self.flags[id.index()][side].set = true;
        }
    }

    /// Driver-internal default: marks the parameter used and assigns only
    /// if the user has not set it.
    pub fn set_default(&mut self, id: ParamId, v: u32) {
        for (side, req) in [&mut self.local, &mut self.remote].into_iter().enumerate() {
            let flags = &mut self.flags[id.index()][side];
            flags.used = true;
            if !flags.set {
                if let Some(field) = u32_field(req, id) {
                    *field = v;
                }
            }
        }
    }

    /// Note both sides of a parameter pair as consumed by the driver.
    pub fn mark_used(&mut self, id: ParamId) {
        for side in 0..2 {
            self.flags[id.index()][side].used = true;
        }
    }

    pub fn is_set(&self, id: ParamId) -> bool {
        self.flags[id.index()].iter().any(|f| f.set)
    }

    /// Fail on any parameter the user set that no driver consumed.
    pub fn validate(&self, test: &str) -> Result<()> {
        for id in ParamId::all() {
            for flags in &self.flags[id.index()] {
                if flags.set && !flags.used {
                    return Err(Error::UnusedParam {
                        name: id.name().to_owned(),
                        test: test.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Effective value of a named parameter on the local view, for `--op`.
    pub fn display_value(&self, name: &str) -> Option<String> {
        let id = ParamId::from_name(name)?;
        let mut req = self.local.clone();
        if let Some(field) = u32_field(&mut req, id) {
            return Some(field.to_string());
        }
        str_field(&mut req, id).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_does_not_clobber_user_value() {
        let mut t = ParamTable::new();
        t.set_by_user_u32(ParamId::MsgSize, 128);
        t.set_default(ParamId::MsgSize, 65536);
        assert_eq!(t.local.msg_size, 128);
        assert_eq!(t.remote.msg_size, 128);
    }

    #[test]
    fn default_fills_unset_value_and_marks_used() {
        let mut t = ParamTable::new();
        t.set_default(ParamId::MsgSize, 65536);
        assert_eq!(t.local.msg_size, 65536);
        assert!(t.validate("tcp_bw").is_ok());
    }

    #[test]
    fn set_but_unused_parameter_fails_validation() {
        let mut t = ParamTable::new();
        t.set_by_user_u32(ParamId::MtuSize, 1024);
        let err = t.validate("tcp_bw").unwrap_err();
        assert!(matches!(err, Error::UnusedParam { .. }));
    }

    #[test]
    fn mark_used_clears_the_complaint() {
        let mut t = ParamTable::new();
        t.set_by_user_u32(ParamId::MtuSize, 1024);
        t.mark_used(ParamId::MtuSize);
        assert!(t.validate("rc_bw").is_ok());
    }

    #[test]
    fn both_views_receive_user_values() {
        let mut t = ParamTable::new();
        t.set_by_user_str(ParamId::Id, "mlx5_0:2");
        assert_eq!(t.local.id, "mlx5_0:2");
        assert_eq!(t.remote.id, "mlx5_0:2");
    }

    #[test]
    fn display_value_reads_the_local_view() {
        let mut t = ParamTable::new();
        t.set_by_user_u32(ParamId::Time, 10);
        assert_eq!(t.display_value("time").as_deref(), Some("10"));
        assert!(t.display_value("bogus").is_none());
    }
}
