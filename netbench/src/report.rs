//! Result computation and output.
//!
//! Only the raw byte/message/error/time tuples are computed here; fancy
//! unit scaling is a front-end concern and stays out of the core.

use log::info;
use netbench_core::Stat;

use crate::ctx::Run;

/// What the selected test measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Latency,
    MsgRate,
    Bandwidth,
    BandwidthSr,
}

#[derive(Debug, Default, Clone, Copy)]
struct Results {
    send_bw: f64,
    recv_bw: f64,
    msg_rate: f64,
    latency: f64,
}

/// Fold the remote-observed counters both ways, then derive the metrics
/// exactly as the counters dictate: a side that moved no bytes contributes
/// no time.
fn calc_results(local: &mut Stat, remote: &mut Stat) -> Results {
    Stat::merge_observed(local, remote);

    let mut res = Results::default();
    let loc_time = local.elapsed_real();
    let rem_time = remote.elapsed_real();
    let mid_time = (loc_time + rem_time) / 2.0;

    let recv_msgs = local.r.no_msgs + remote.r.no_msgs;
    if recv_msgs != 0 {
        res.latency = loc_time / recv_msgs as f64;
    }

    if loc_time == 0.0 || rem_time == 0.0 {
        return res;
    }

    res.msg_rate = if remote.r.no_msgs == 0 {
        local.r.no_msgs as f64 / rem_time
    } else if local.r.no_msgs == 0 {
        remote.r.no_msgs as f64 / loc_time
    } else {
        recv_msgs as f64 / mid_time
    };

    res.send_bw = if remote.s.no_bytes == 0 {
        local.s.no_bytes as f64 / loc_time
    } else if local.s.no_bytes == 0 {
        remote.s.no_bytes as f64 / rem_time
    } else {
        (local.s.no_bytes + remote.s.no_bytes) as f64 / mid_time
    };

    res.recv_bw = if remote.r.no_bytes == 0 {
        local.r.no_bytes as f64 / loc_time
    } else if local.r.no_bytes == 0 {
        remote.r.no_bytes as f64 / rem_time
    } else {
        (local.r.no_bytes + remote.r.no_bytes) as f64 / mid_time
    };

    res
}

/// Print the selected metrics for a finished client-side test.
pub fn show_results(run: &mut Run, measure: Measure) {
    let Some(mut remote) = run.rstat.take() else {
        return;
    };
    let mut local = run.lstat.clone();
    let res = calc_results(&mut local, &mut remote);

    println!("{}:", run.test_name);
    match measure {
        Measure::Latency => {
            println!("    latency   = {:.9} sec", res.latency);
            println!("    msg_rate  = {:.0} /sec", res.msg_rate);
        }
        Measure::MsgRate => {
            println!("    msg_rate  = {:.0} /sec", res.msg_rate);
        }
        Measure::Bandwidth => {
            println!("    bw        = {:.0} bytes/sec", res.recv_bw);
            println!("    msg_rate  = {:.0} /sec", res.msg_rate);
        }
        Measure::BandwidthSr => {
            println!("    send_bw   = {:.0} bytes/sec", res.send_bw);
            println!("    recv_bw   = {:.0} bytes/sec", res.recv_bw);
            println!("    msg_rate  = {:.0} /sec", res.msg_rate);
        }
    }

    info!(
        "loc: send {}B/{} msgs/{} errs, recv {}B/{} msgs/{} errs, max_cqe {}",
        local.s.no_bytes,
        local.s.no_msgs,
        local.s.no_errs,
        local.r.no_bytes,
        local.r.no_msgs,
        local.r.no_errs,
        local.max_cqes,
    );
    info!(
        "rem: send {}B/{} msgs/{} errs, recv {}B/{} msgs/{} errs, max_cqe {}",
        remote.s.no_bytes,
        remote.s.no_msgs,
        remote.s.no_errs,
        remote.r.no_bytes,
        remote.r.no_msgs,
        remote.r.no_errs,
        remote.max_cqes,
    );

    run.rstat = Some(remote);
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbench_core::stats::T_REAL;
    use netbench_core::UStat;

    fn timed_stat(secs: u64) -> Stat {
        let mut stat = Stat {
            no_ticks: 100,
            ..Default::default()
        };
        stat.time_s[T_REAL] = 1000;
        stat.time_e[T_REAL] = 1000 + secs * 100;
        stat
    }

    #[test]
    fn one_way_bandwidth_uses_the_senders_clock() {
        let mut local = timed_stat(2);
        local.s = UStat {
            no_bytes: 2_000_000,
            no_msgs: 100,
            no_errs: 0,
        };
        let mut remote = timed_stat(2);
        remote.r = UStat {
            no_bytes: 2_000_000,
            no_msgs: 100,
            no_errs: 0,
        };
        let res = calc_results(&mut local, &mut remote);
        assert!((res.send_bw - 1_000_000.0).abs() < 1.0);
        assert!((res.recv_bw - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn latency_divides_time_by_round_trips() {
        let mut local = timed_stat(1);
        local.r.no_msgs = 500;
        local.s.no_msgs = 500;
        let mut remote = timed_stat(1);
        remote.r.no_msgs = 500;
        remote.s.no_msgs = 500;
        let res = calc_results(&mut local, &mut remote);
        // 1 second over 1000 receive completions
        assert!((res.latency - 0.001).abs() < 1e-9);
    }

    #[test]
    fn rdma_read_credits_count_for_the_passive_side() {
        // active side read 1 MB and credited rem_s on the passive side's
        // behalf; passive side reports nothing itself
        let mut local = timed_stat(2);
        local.r = UStat {
            no_bytes: 1 << 20,
            no_msgs: 256,
            no_errs: 0,
        };
        local.rem_s = local.r;
        let mut remote = timed_stat(2);
        let res = calc_results(&mut local, &mut remote);
        assert_eq!(remote.s.no_bytes, 1 << 20);
        assert!(res.send_bw > 0.0);
    }

    #[test]
    fn zero_time_produces_zero_metrics() {
        let mut local = Stat::default();
        let mut remote = Stat::default();
        let res = calc_results(&mut local, &mut remote);
        assert_eq!(res.send_bw, 0.0);
        assert_eq!(res.msg_rate, 0.0);
    }
}
