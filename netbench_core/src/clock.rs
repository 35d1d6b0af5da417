//! Wall-clock and CPU timestamping plus the duration alarm.
//!
//! The alarm is the only concurrent actor in the process. Its handler
//! writes exactly one atomic flag; everything else (sampling `/proc/stat`,
//! recording end times) happens on the main execution path, because none of
//! it is async-signal-safe. The interval timer re-fires every 10 ms after
//! the first expiry so a signal that lands between a `finished()` check and
//! the following blocking syscall still interrupts that syscall.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};
use crate::stats::{Stat, TIME_N, T_REAL};

static FINISHED: AtomicBool = AtomicBool::new(false);

/// True once the duration alarm has fired (or the run was ended early).
#[inline]
pub fn finished() -> bool {
    FINISHED.load(Ordering::SeqCst)
}

/// Mark the current test finished. Write-once per test; the flag is cleared
/// by the next [`start_timer`].
pub fn set_finished() {
    FINISHED.store(true, Ordering::SeqCst);
}

extern "C" fn on_alarm(_signo: libc::c_int) {
    FINISHED.store(true, Ordering::SeqCst);
}

/// Install the SIGALRM and SIGPIPE handlers. SA_RESTART is deliberately
/// absent: blocking syscalls must return EINTR when the alarm fires.
pub fn install_signal_handlers() -> Result<()> {
    let act = SigAction::new(SigHandler::Handler(on_alarm), SaFlags::empty(), SigSet::empty());
    unsafe {
        for sig in [Signal::SIGALRM, Signal::SIGPIPE] {
            signal::sigaction(sig, &act)
                .map_err(|e| Error::io("sigaction failed", e.into()))?;
        }
    }
    Ok(())
}

fn set_itimer(seconds: u32) {
    let mut it: libc::itimerval = unsafe { std::mem::zeroed() };
    if seconds != 0 {
        it.it_value.tv_sec = seconds as libc::time_t;
        // Some kernels deliver the follow-up signal almost immediately with
        // a very small interval; 10 ms keeps the re-delivery sane.
        it.it_interval.tv_usec = 10_000;
    }
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &it, ptr::null_mut());
    }
}

/// Clear the finished flag, record start times, and arm the duration alarm.
/// `seconds == 0` records start times without arming (message-count-bounded
/// runs).
pub fn start_timer(stat: &mut Stat, seconds: u32) {
    FINISHED.store(false, Ordering::SeqCst);
    stat.time_s = sample_times();
    set_itimer(0);
    if seconds != 0 {
        log::debug!("starting timer for {seconds} seconds");
        set_itimer(seconds);
    }
}

/// Record end times, disarm the alarm, and reset the flag for the next
/// test. Loops must have exited before this is called so no in-flight
/// completion is accounted after its timestamps.
pub fn stop_timer(stat: &mut Stat) {
    set_finished();
    stat.time_e = sample_times();
    set_itimer(0);
    FINISHED.store(false, Ordering::SeqCst);
    log::debug!("stopping timer");
}

/// Clock ticks per second underlying every time sample.
pub fn ticks_per_sec() -> u32 {
    let t = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if t > 0 {
        t as u32
    } else {
        100
    }
}

/// Number of online processors.
pub fn online_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as u32
    } else {
        1
    }
}

/// Sample all nine clocks: real time from `times(2)`, the rest from the
/// aggregate `cpu` line of `/proc/stat`. Everything is in USER_HZ ticks.
pub fn sample_times() -> [u64; TIME_N] {
    let mut samples = [0u64; TIME_N];

    let mut tms: libc::tms = unsafe { std::mem::zeroed() };
    samples[T_REAL] = unsafe { libc::times(&mut tms) } as u64;

    PROC_STAT.with(|cell| {
        let mut borrow = cell.borrow_mut();
        if borrow.is_none() {
            *borrow = File::open("/proc/stat").ok();
        }
        if let Some(file) = borrow.as_mut() {
            let mut buf = String::new();
            if file.seek(SeekFrom::Start(0)).is_ok() && file.read_to_string(&mut buf).is_ok() {
                if let Some(cpu) = parse_proc_stat(&buf) {
                    samples[1..].copy_from_slice(&cpu);
                }
            }
        }
    });
    samples
}

std::thread_local! {
    static PROC_STAT: std::cell::RefCell<Option<File>> = const { std::cell::RefCell::new(None) };
}

/// Pull the eight per-mode tick counters out of the first `cpu ` line.
/// Kernels older than the steal counter report fewer columns; missing ones
/// read as zero.
fn parse_proc_stat(content: &str) -> Option<[u64; TIME_N - 1]> {
    let line = content.lines().next()?;
    let rest = line.strip_prefix("cpu ")?;
    let mut out = [0u64; TIME_N - 1];
    for (slot, field) in out.iter_mut().zip(rest.split_ascii_whitespace()) {
        *slot = field.parse().ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_modern_cpu_line() {
        let content = "cpu  101 2 303 40000 55 6 77 8 9 0\ncpu0 1 2 3 4\n";
        let cpu = parse_proc_stat(content).unwrap();
        assert_eq!(cpu, [101, 2, 303, 40000, 55, 6, 77, 8, 9]);
    }

    #[test]
    fn tolerates_short_cpu_lines() {
        let content = "cpu  1 2 3 4\n";
        let cpu = parse_proc_stat(content).unwrap();
        assert_eq!(cpu, [1, 2, 3, 4, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_proc_stat("intr 12 34").is_none());
        assert!(parse_proc_stat("cpu  x y z").is_none());
    }

    #[test]
    fn finished_flag_round_trip() {
        let mut stat = Stat::default();
        stat.no_ticks = ticks_per_sec();
        start_timer(&mut stat, 0);
        assert!(!finished());
        set_finished();
        assert!(finished());
        stop_timer(&mut stat);
        assert!(!finished());
        assert!(stat.time_e[T_REAL] >= stat.time_s[T_REAL]);
    }

    #[test]
    fn sample_times_is_monotonic_in_real_time() {
        let a = sample_times();
        let b = sample_times();
        assert!(b[T_REAL] >= a[T_REAL]);
    }
}
