//! Measurement statistics.
//!
//! Counters are monotonic within a run and are updated only by the side
//! that owns them. `rem_s`/`rem_r` hold work the *peer* performed that only
//! this side observed — RDMA reads and atomics complete locally without any
//! completion on the passive side, so the active side credits the passive
//! side's send counters on its behalf. After the exchange at end of test,
//! folding the peer's remote-observed counters into each side's own gives
//! both nodes the same four-role picture.

use crate::codec::{Decoder, Encoder};
use crate::error::Result;

/// Number of time samples: real, user, nice, kernel, idle, iowait, irq,
/// soft-irq, steal.
pub const TIME_N: usize = 9;

pub const T_REAL: usize = 0;
pub const T_USER: usize = 1;
pub const T_NICE: usize = 2;
pub const T_KERNEL: usize = 3;
pub const T_IDLE: usize = 4;
pub const T_IOWAIT: usize = 5;
pub const T_IRQ: usize = 6;
pub const T_SOFTIRQ: usize = 7;
pub const T_STEAL: usize = 8;

/// Wire length of an encoded [`Stat`].
pub const STAT_WIRE_LEN: usize = 3 * 4 + 2 * TIME_N * 8 + 4 * 3 * 8;

/// One transfer-direction counter triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UStat {
    pub no_bytes: u64,
    pub no_msgs: u64,
    pub no_errs: u64,
}

impl UStat {
    /// Fold in counters the remote node kept on our behalf.
    pub fn add(&mut self, other: &UStat) {
        self.no_bytes += other.no_bytes;
        self.no_msgs += other.no_msgs;
        self.no_errs += other.no_errs;
    }
}

/// The per-side statistics block exchanged at end of test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stat {
    /// Number of online processors.
    pub no_cpus: u32,
    /// Clock ticks per second for every time sample.
    pub no_ticks: u32,
    /// High-water mark of completions harvested in one poll.
    pub max_cqes: u32,
    /// Time samples at measurement start.
    pub time_s: [u64; TIME_N],
    /// Time samples at measurement end.
    pub time_e: [u64; TIME_N],
    /// Local send counters.
    pub s: UStat,
    /// Local receive counters.
    pub r: UStat,
    /// Remote send work observed locally.
    pub rem_s: UStat,
    /// Remote receive work observed locally.
    pub rem_r: UStat,
}

impl Stat {
    /// Raise the completion-batch high-water mark.
    pub fn note_cq_depth(&mut self, n: usize) {
        if n as u32 > self.max_cqes {
            self.max_cqes = n as u32;
        }
    }

    /// Elapsed real time in seconds.
    pub fn elapsed_real(&self) -> f64 {
        if self.no_ticks == 0 {
            return 0.0;
        }
        self.time_e[T_REAL].wrapping_sub(self.time_s[T_REAL]) as f64 / self.no_ticks as f64
    }

    /// CPU seconds burned during the run (everything but real and idle).
    pub fn elapsed_cpu(&self) -> f64 {
        if self.no_ticks == 0 {
            return 0.0;
        }
        let mut ticks = 0u64;
        for i in 0..TIME_N {
            if i != T_REAL && i != T_IDLE {
                ticks += self.time_e[i].wrapping_sub(self.time_s[i]);
            }
        }
        ticks as f64 / self.no_ticks as f64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(STAT_WIRE_LEN);
        enc.put_uint(self.no_cpus.into(), 4);
        enc.put_uint(self.no_ticks.into(), 4);
        enc.put_uint(self.max_cqes.into(), 4);
        for t in &self.time_s {
            enc.put_uint(*t, 8);
        }
        for t in &self.time_e {
            enc.put_uint(*t, 8);
        }
        for u in [&self.s, &self.r, &self.rem_s, &self.rem_r] {
            enc.put_uint(u.no_bytes, 8);
            enc.put_uint(u.no_msgs, 8);
            enc.put_uint(u.no_errs, 8);
        }
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Stat> {
        let mut dec = Decoder::new(buf);
        let w = "statistics";
        let mut stat = Stat {
            no_cpus: dec.get_uint(4, w)? as u32,
            no_ticks: dec.get_uint(4, w)? as u32,
            max_cqes: dec.get_uint(4, w)? as u32,
            ..Default::default()
        };
        for i in 0..TIME_N {
            stat.time_s[i] = dec.get_uint(8, w)?;
        }
        for i in 0..TIME_N {
            stat.time_e[i] = dec.get_uint(8, w)?;
        }
        for u in [
            &mut stat.s,
            &mut stat.r,
            &mut stat.rem_s,
            &mut stat.rem_r,
        ] {
            u.no_bytes = dec.get_uint(8, w)?;
            u.no_msgs = dec.get_uint(8, w)?;
            u.no_errs = dec.get_uint(8, w)?;
        }
        Ok(stat)
    }

    /// Fold the peer's remote-observed counters into our own and vice
    /// versa, so both blocks carry the complete four-role picture.
    pub fn merge_observed(local: &mut Stat, remote: &mut Stat) {
        let remote_rem_s = remote.rem_s;
        let remote_rem_r = remote.rem_r;
        local.s.add(&remote_rem_s);
        local.r.add(&remote_rem_r);
        remote.s.add(&local.rem_s);
        remote.r.add(&local.rem_r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Stat {
        let mut stat = Stat {
            no_cpus: 8,
            no_ticks: 100,
            max_cqes: 17,
            ..Default::default()
        };
        for i in 0..TIME_N {
            stat.time_s[i] = 1000 + i as u64;
            stat.time_e[i] = 1300 + 2 * i as u64;
        }
        stat.s = UStat {
            no_bytes: 1 << 30,
            no_msgs: 16384,
            no_errs: 0,
        };
        stat.r = UStat {
            no_bytes: 512,
            no_msgs: 2,
            no_errs: 1,
        };
        stat
    }

    #[test]
    fn wire_round_trip() {
        let stat = sample();
        let buf = stat.encode();
        assert_eq!(buf.len(), STAT_WIRE_LEN);
        assert_eq!(Stat::decode(&buf).unwrap(), stat);
    }

    #[test]
    fn elapsed_real_uses_ticks() {
        let stat = sample();
        // 300 ticks at 100 Hz
        assert!((stat.elapsed_real() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn merge_is_symmetric() {
        let mut a = sample();
        a.rem_s.no_msgs = 7;
        a.rem_s.no_bytes = 700;
        let mut b = Stat::default();
        b.rem_r.no_msgs = 3;
        b.rem_r.no_bytes = 90;

        let a_send_before = a.s.no_msgs;
        Stat::merge_observed(&mut a, &mut b);
        // b credited a's receives, a credited b's sends
        assert_eq!(a.r.no_msgs, sample().r.no_msgs + 3);
        assert_eq!(b.s.no_msgs, 7);
        assert_eq!(a.s.no_msgs, a_send_before);
    }

    #[test]
    fn cq_depth_is_a_high_water_mark() {
        let mut stat = Stat::default();
        stat.note_cq_depth(5);
        stat.note_cq_depth(3);
        assert_eq!(stat.max_cqes, 5);
        stat.note_cq_depth(9);
        assert_eq!(stat.max_cqes, 9);
    }
}
