//! Per-test run context threaded through every driver.

use log::debug;
use netbench_core::clock;
use netbench_core::error::{Error, Result};
use netbench_core::{Control, ParamTable, Request, Stat};

/// Everything one test run owns: the control channel, the effective
/// request, the parameter table (client side), and the statistics.
pub struct Run {
    pub ctl: Control,
    /// Effective request for this node.
    pub req: Request,
    /// Parameter table; only the client's carries user-set bits.
    pub params: ParamTable,
    /// Local statistics.
    pub lstat: Stat,
    /// Peer statistics, present after the exchange.
    pub rstat: Option<Stat>,
    pub test_name: String,
    pub test_index: u16,
    pub client: bool,
    pub successful: bool,
}

fn fresh_stat() -> Stat {
    Stat {
        no_cpus: clock::online_cpus(),
        no_ticks: clock::ticks_per_sec(),
        ..Default::default()
    }
}

impl Run {
    pub fn client(ctl: Control, params: ParamTable, name: &str, index: u16) -> Run {
        let req = params.local.clone().versioned(index);
        Run {
            ctl,
            req,
            params,
            lstat: fresh_stat(),
            rstat: None,
            test_name: name.to_owned(),
            test_index: index,
            client: true,
            successful: false,
        }
    }

    pub fn server(ctl: Control, req: Request, name: &str) -> Run {
        let test_index = req.test_index;
        Run {
            ctl,
            req,
            params: ParamTable::new(),
            lstat: fresh_stat(),
            rstat: None,
            test_name: name.to_owned(),
            test_index,
            client: false,
            successful: false,
        }
    }

    /// Adopt the local parameter view as this run's effective request.
    /// Called once per test after the driver's defaults have landed;
    /// drivers may adjust `req` afterwards (e.g. the rd_atomic clamp)
    /// without the change being lost.
    pub fn refresh_req(&mut self) {
        self.req = self.params.local.clone().versioned(self.test_index);
    }

    /// Ship the remote parameter view to the server.
    pub fn send_request(&mut self) -> Result<()> {
        let rreq = self.params.remote.clone().versioned(self.test_index);
        self.ctl.send_request(&rreq)
    }

    /// Barrier plus timer start. With a message cap and no explicit
    /// duration the run is count-bounded and the alarm stays unarmed.
    pub fn sync_test(&mut self) -> bool {
        let seconds = self.req.time;
        self.ctl.sync_test(&mut self.lstat, seconds)
    }

    /// Stop timing and perform the one statistics exchange of this test.
    /// Runs on success and failure alike so the peer's exchange always
    /// completes; an exchange failure after a failed body stays secondary.
    pub fn conclude(&mut self, body: Result<()>) -> Result<()> {
        clock::stop_timer(&mut self.lstat);
        match self.ctl.exchange_results(&self.lstat) {
            Ok(peer) => self.rstat = Some(peer),
            Err(e) => {
                if body.is_ok() {
                    return Err(e);
                }
                debug!("statistics exchange after failed test: {e}");
            }
        }
        if body.is_ok() {
            self.successful = true;
        }
        body
    }

    /// Apply the processor-affinity parameter; `a` pins to CPU `a - 1`.
    pub fn set_affinity(&self) -> Result<()> {
        let a = self.req.affinity;
        if a == 0 {
            return Ok(());
        }
        let mut set = nix::sched::CpuSet::new();
        set.set(a as usize - 1)
            .map_err(|e| Error::Config(format!("bad affinity cpu {}: {e}", a - 1)))?;
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set).map_err(|e| {
            Error::io(
                format!("cannot set processor affinity (cpu {})", a - 1),
                e.into(),
            )
        })
    }

    /// Message-count cap reached? `done` counts successes plus errors.
    pub fn hit_msg_cap(&self, done: u64) -> bool {
        msg_cap_reached(self.req.no_msgs, done)
    }

    /// How many of `room` slots may still be posted under the cap.
    pub fn left_to_send(&self, sent: u64, room: usize) -> usize {
        left_to_send(self.req.no_msgs, sent, room)
    }
}

/// The peer vanished at the pre-test barrier; the measurement loop is
/// skipped but the statistics exchange still runs.
pub fn barrier_failed() -> Error {
    Error::io(
        "synchronization before test",
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed the control channel",
        ),
    )
}

pub fn msg_cap_reached(no_msgs: u32, done: u64) -> bool {
    no_msgs != 0 && done >= u64::from(no_msgs)
}

pub fn left_to_send(no_msgs: u32, sent: u64, room: usize) -> usize {
    if no_msgs == 0 {
        return room;
    }
    let left = u64::from(no_msgs).saturating_sub(sent);
    left.min(room as u64) as usize
}

/// Pull one byte per cache line so the data actually lands in the cache.
pub fn touch_data(buf: *const u8, len: usize) {
    let mut off = 0;
    while off < len {
        unsafe {
            std::ptr::read_volatile(buf.add(off));
        }
        off += 64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_cap_bounds_the_room() {
        assert_eq!(left_to_send(10, 0, 1024), 10);
        assert_eq!(left_to_send(10, 4, 1024), 6);
        assert_eq!(left_to_send(10, 10, 1024), 0);
        assert!(msg_cap_reached(10, 10));
        assert!(!msg_cap_reached(10, 9));
    }

    #[test]
    fn no_cap_means_full_room() {
        assert_eq!(left_to_send(0, 1 << 40, 1024), 1024);
        assert!(!msg_cap_reached(0, u64::MAX));
    }
}
