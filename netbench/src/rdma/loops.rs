//! RDMA measurement loops.
//!
//! Every loop follows the same skeleton: open the device, exchange
//! connection contexts, meet at the barrier, then issue and harvest work
//! requests until the duration alarm flips the finished flag. Completions
//! observed after the flag is set are discarded, not accounted.

use log::{debug, warn};
use netbench_core::clock;
use netbench_core::error::{Error, Result};
use verbs_sys as ffi;

use super::device::{IbDevice, Transport, NCQE, WRID_RDMA, WRID_RECV, WRID_SEND};
use crate::ctx::{barrier_failed, touch_data, Run};

/// Two-sided ping-pong flavor: send/receive or RDMA write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Sr,
    Rdma,
}

/// Atomic operation flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    FetchAdd,
    CompareSwap,
}

/// The starting value of the compare-swap verification chain.
const CSWAP_SEED: u64 = 0x0123_4567_89ab_cdef;

fn wc_status_name(status: u32) -> &'static str {
    match status {
        ffi::ibv_wc_status_IBV_WC_SUCCESS => "success",
        ffi::ibv_wc_status_IBV_WC_LOC_LEN_ERR => "local length error",
        ffi::ibv_wc_status_IBV_WC_LOC_QP_OP_ERR => "local QP operation failure",
        ffi::ibv_wc_status_IBV_WC_LOC_PROT_ERR => "local protection error",
        ffi::ibv_wc_status_IBV_WC_WR_FLUSH_ERR => "WR flush failure",
        ffi::ibv_wc_status_IBV_WC_MW_BIND_ERR => "memory window bind failure",
        ffi::ibv_wc_status_IBV_WC_BAD_RESP_ERR => "bad response",
        ffi::ibv_wc_status_IBV_WC_LOC_ACCESS_ERR => "local access failure",
        ffi::ibv_wc_status_IBV_WC_REM_INV_REQ_ERR => "remote invalid request",
        ffi::ibv_wc_status_IBV_WC_REM_ACCESS_ERR => "remote access failure",
        ffi::ibv_wc_status_IBV_WC_REM_OP_ERR => "remote operation failure",
        ffi::ibv_wc_status_IBV_WC_RETRY_EXC_ERR => "retries exceeded",
        ffi::ibv_wc_status_IBV_WC_RNR_RETRY_EXC_ERR => "RNR retry exceeded",
        ffi::ibv_wc_status_IBV_WC_REM_INV_RD_REQ_ERR => "remote invalid read request",
        ffi::ibv_wc_status_IBV_WC_REM_ABORT_ERR => "remote abort",
        ffi::ibv_wc_status_IBV_WC_FATAL_ERR => "fatal error",
        ffi::ibv_wc_status_IBV_WC_RESP_TIMEOUT_ERR => "responder timeout",
        ffi::ibv_wc_status_IBV_WC_GENERAL_ERR => "general error",
        _ => "unknown CQ error",
    }
}

fn note_cq_error(test: &str, status: u32, errs: &mut u64) {
    *errs += 1;
    warn!("{test}: completion failed: {}", wc_status_name(status));
}

/// Open a device, run `body`, then stop timing, exchange statistics, and
/// only afterwards tear the device down in release order.
fn with_device<F>(run: &mut Run, trans: Transport, swr: u32, rwr: u32, body: F) -> Result<()>
where
    F: FnOnce(&mut Run, &mut IbDevice) -> Result<()>,
{
    let mut dev = None;
    let outcome = match IbDevice::open(&mut run.req, trans, swr, rwr) {
        Ok(d) => body(run, dev.insert(d)),
        Err(e) => Err(e),
    };
    let outcome = run.conclude(outcome);
    drop(dev);
    outcome
}

fn wc_vec(n: usize) -> Vec<ffi::ibv_wc> {
    vec![ffi::ibv_wc::default(); n]
}

/// Send/receive bandwidth, sending side: prime the queue with NCQE
/// signaled sends and top it back up per harvested completion.
pub fn client_bw(run: &mut Run, trans: Transport) -> Result<()> {
    with_device(run, trans, NCQE as u32, 0, |run, dev| {
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        let first = run.left_to_send(0, NCQE);
        dev.post_send(&mut run.lstat, first)?;
        let mut sent = first as u64;
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            run.lstat.note_cq_depth(n);
            if clock::finished() {
                break;
            }
            for c in &wc[..n] {
                if c.wr_id != WRID_SEND {
                    debug!("bad WR ID {}", c.wr_id);
                } else if c.status != ffi::ibv_wc_status_IBV_WC_SUCCESS {
                    note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                }
            }
            let mut room = n;
            if run.req.no_msgs != 0 {
                if run.hit_msg_cap(run.lstat.s.no_msgs + run.lstat.s.no_errs) {
                    break;
                }
                room = run.left_to_send(sent, n);
            }
            dev.post_send(&mut run.lstat, room)?;
            sent += room as u64;
        }
        Ok(())
    })
}

/// Default server: keep NCQE receives posted, account each arrival,
/// optionally pull the data through the cache.
pub fn server_def(run: &mut Run, trans: Transport) -> Result<()> {
    with_device(run, trans, 0, NCQE as u32, |run, dev| {
        dev.init(run)?;
        dev.post_recv(NCQE)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if clock::finished() {
                break;
            }
            run.lstat.note_cq_depth(n);
            for c in &wc[..n] {
                if c.status == ffi::ibv_wc_status_IBV_WC_SUCCESS {
                    run.lstat.r.no_bytes += u64::from(run.req.msg_size);
                    run.lstat.r.no_msgs += 1;
                    if dev.access_recv() {
                        touch_data(dev.buf_ptr(), run.req.msg_size as usize);
                    }
                } else {
                    note_cq_error(&run.test_name, c.status, &mut run.lstat.r.no_errs);
                }
            }
            if run.hit_msg_cap(run.lstat.r.no_msgs + run.lstat.r.no_errs) {
                break;
            }
            dev.post_recv(n)?;
        }
        Ok(())
    })
}

/// Bidirectional bandwidth: both sides run this, NCQE sends and NCQE
/// receives in flight at once.
pub fn bi_bw(run: &mut Run, trans: Transport) -> Result<()> {
    with_device(run, trans, NCQE as u32, NCQE as u32, |run, dev| {
        dev.init(run)?;
        dev.post_recv(NCQE)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        dev.post_send(&mut run.lstat, NCQE)?;
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if clock::finished() {
                break;
            }
            run.lstat.note_cq_depth(n);
            let mut no_send = 0;
            let mut no_recv = 0;
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_SEND => {
                        if c.status != ffi::ibv_wc_status_IBV_WC_SUCCESS {
                            note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                        }
                        no_send += 1;
                    }
                    WRID_RECV => {
                        if c.status == ffi::ibv_wc_status_IBV_WC_SUCCESS {
                            run.lstat.r.no_bytes += u64::from(run.req.msg_size);
                            run.lstat.r.no_msgs += 1;
                            if dev.access_recv() {
                                touch_data(dev.buf_ptr(), run.req.msg_size as usize);
                            }
                        } else {
                            note_cq_error(&run.test_name, c.status, &mut run.lstat.r.no_errs);
                        }
                        no_recv += 1;
                    }
                    id => debug!("bad WR ID {id}"),
                }
            }
            if no_recv > 0 {
                dev.post_recv(no_recv)?;
            }
            if no_send > 0 {
                dev.post_send(&mut run.lstat, no_send)?;
            }
        }
        Ok(())
    })
}

/// Ping-pong latency, both sides. One receive and one outbound op in
/// flight; the `done` mask waits for both the outbound completion (bit 0)
/// and the inbound arrival (bit 1) before firing the next round.
pub fn pp_lat(run: &mut Run, trans: Transport, iomode: IoMode) -> Result<()> {
    with_device(run, trans, 1, 1, |run, dev| {
        dev.init(run)?;
        pp_lat_loop(run, dev, iomode)
    })
}

fn pp_fire(run: &mut Run, dev: &mut IbDevice, iomode: IoMode) -> Result<()> {
    match iomode {
        IoMode::Sr => dev.post_send(&mut run.lstat, 1),
        IoMode::Rdma => dev.post_rdma(
            &mut run.lstat,
            ffi::ibv_wr_opcode_IBV_WR_RDMA_WRITE_WITH_IMM,
            1,
        ),
    }
}

fn pp_lat_loop(run: &mut Run, dev: &mut IbDevice, iomode: IoMode) -> Result<()> {
    let mut done: u8 = 1;
    dev.post_recv(1)?;
    if !run.sync_test() {
        return Err(barrier_failed());
    }
    if run.client {
        pp_fire(run, dev, iomode)?;
        done = 0;
    }

    let mut wc = wc_vec(2);
    while !clock::finished() {
        let n = dev.poll(&mut wc)?;
        if clock::finished() {
            break;
        }
        for c in &wc[..n] {
            match c.wr_id {
                WRID_SEND | WRID_RDMA => {
                    if c.status != ffi::ibv_wc_status_IBV_WC_SUCCESS {
                        note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                    }
                    done |= 1;
                }
                WRID_RECV => {
                    if c.status == ffi::ibv_wc_status_IBV_WC_SUCCESS {
                        run.lstat.r.no_bytes += u64::from(run.req.msg_size);
                        run.lstat.r.no_msgs += 1;
                        dev.post_recv(1)?;
                    } else {
                        note_cq_error(&run.test_name, c.status, &mut run.lstat.r.no_errs);
                    }
                    done |= 2;
                }
                id => debug!("bad WR ID {id}"),
            }
        }
        if done == 3 {
            pp_fire(run, dev, iomode)?;
            done = 0;
        }
    }
    Ok(())
}

/// Single-sided write latency measured by spinning on the buffer itself.
/// Each side stamps its marker into the first and last payload byte, RDMA-
/// writes the buffer across, and busy-reads its own copy until the peer's
/// marker shows up. The CQ is drained directly, no channel events.
pub fn rdma_write_poll_lat(run: &mut Run, trans: Transport) -> Result<()> {
    with_device(run, trans, NCQE as u32, 0, |run, dev| {
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        let size = run.req.msg_size as usize;
        if size == 0 {
            return Err(Error::Config("msg_size must be at least 1".into()));
        }
        let first = dev.buf_ptr();
        let last = unsafe { first.add(size - 1) };
        let mut send = run.client;
        let loc_id: u8 = u8::from(run.client);
        let rem_id: u8 = u8::from(!run.client);
        let mut wc = wc_vec(2);

        while !clock::finished() {
            unsafe {
                std::ptr::write_volatile(first, loc_id);
                std::ptr::write_volatile(last, loc_id);
            }
            if send {
                dev.post_rdma(&mut run.lstat, ffi::ibv_wr_opcode_IBV_WR_RDMA_WRITE, 1)?;
                if clock::finished() {
                    break;
                }
                let n = dev.poll_cq_direct(&mut wc)?;
                for c in &wc[..n] {
                    if c.wr_id != WRID_RDMA {
                        debug!("bad WR ID {}", c.wr_id);
                    } else if c.status != ffi::ibv_wc_status_IBV_WC_SUCCESS {
                        note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                    }
                }
            }
            while !clock::finished() {
                let p = unsafe { std::ptr::read_volatile(first) };
                let q = unsafe { std::ptr::read_volatile(last) };
                if p == rem_id && q == rem_id {
                    break;
                }
            }
            if clock::finished() {
                break;
            }
            run.lstat.r.no_bytes += u64::from(run.req.msg_size);
            run.lstat.r.no_msgs += 1;
            send = true;
        }
        Ok(())
    })
}

/// RDMA read latency: one outstanding read, re-posted per completion. The
/// passive side never sees a completion, so the reader also credits the
/// peer's send counters.
pub fn client_rdma_read_lat(run: &mut Run, trans: Transport) -> Result<()> {
    with_device(run, trans, 1, 0, |run, dev| {
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        dev.post_rdma(&mut run.lstat, ffi::ibv_wr_opcode_IBV_WR_RDMA_READ, 1)?;
        let mut wc = wc_vec(1);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if n == 0 {
                continue;
            }
            if clock::finished() {
                break;
            }
            let c = &wc[0];
            if c.wr_id != WRID_RDMA {
                debug!("bad WR ID {}", c.wr_id);
                continue;
            }
            if c.status == ffi::ibv_wc_status_IBV_WC_SUCCESS {
                run.lstat.r.no_bytes += u64::from(run.req.msg_size);
                run.lstat.r.no_msgs += 1;
                run.lstat.rem_s.no_bytes += u64::from(run.req.msg_size);
                run.lstat.rem_s.no_msgs += 1;
            } else {
                note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
            }
            dev.post_rdma(&mut run.lstat, ffi::ibv_wr_opcode_IBV_WR_RDMA_READ, 1)?;
        }
        Ok(())
    })
}

/// RDMA read or write bandwidth with NCQE operations in flight.
pub fn client_rdma_bw(run: &mut Run, trans: Transport, opcode: ffi::ibv_wr_opcode) -> Result<()> {
    with_device(run, trans, NCQE as u32, 0, |run, dev| {
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        dev.post_rdma(&mut run.lstat, opcode, NCQE)?;
        let reads = opcode == ffi::ibv_wr_opcode_IBV_WR_RDMA_READ;
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if clock::finished() {
                break;
            }
            run.lstat.note_cq_depth(n);
            for c in &wc[..n] {
                if c.status == ffi::ibv_wc_status_IBV_WC_SUCCESS {
                    if reads {
                        run.lstat.r.no_bytes += u64::from(run.req.msg_size);
                        run.lstat.r.no_msgs += 1;
                        run.lstat.rem_s.no_bytes += u64::from(run.req.msg_size);
                        run.lstat.rem_s.no_msgs += 1;
                    }
                } else {
                    note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                }
            }
            dev.post_rdma(&mut run.lstat, opcode, n)?;
        }
        Ok(())
    })
}

/// Passive target for the single-sided tests: arm nothing, pause until the
/// duration elapses.
pub fn server_nop(run: &mut Run, trans: Transport) -> Result<()> {
    with_device(run, trans, 0, 1, |run, dev| {
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        while !clock::finished() {
            unsafe {
                libc::pause();
            }
        }
        Ok(())
    })
}

/// Resize the shared region for atomics: one u64 result slot per
/// outstanding operation, on both nodes.
fn atomic_region(run: &mut Run, dev: &mut IbDevice, slots: u32) -> Result<()> {
    let size = slots * 8;
    run.req.msg_size = size;
    run.params.local.msg_size = size;
    run.params.remote.msg_size = size;
    dev.realloc_region(size as usize)
}

/// Atomic messaging rate: keep `rd_atomic` fetch-adds or compare-swaps in
/// flight against the peer's slot zero.
pub fn client_atomic(run: &mut Run, op: AtomicOp) -> Result<()> {
    with_device(run, Transport::Rc, NCQE as u32, 0, |run, dev| {
        atomic_region(run, dev, 1)?;
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        for _ in 0..run.req.rd_atomic {
            match op {
                AtomicOp::FetchAdd => dev.post_fetch_add(&mut run.lstat, 0, 0, 0)?,
                AtomicOp::CompareSwap => dev.post_compare_swap(&mut run.lstat, 0, 0, 0, 0)?,
            }
        }
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if clock::finished() {
                break;
            }
            run.lstat.note_cq_depth(n);
            for c in &wc[..n] {
                if c.status == ffi::ibv_wc_status_IBV_WC_SUCCESS {
                    run.lstat.rem_r.no_bytes += 8;
                    run.lstat.rem_r.no_msgs += 1;
                } else {
                    note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                    continue;
                }
                match op {
                    AtomicOp::FetchAdd => dev.post_fetch_add(&mut run.lstat, 0, 0, 0)?,
                    AtomicOp::CompareSwap => dev.post_compare_swap(&mut run.lstat, 0, 0, 0, 0)?,
                }
            }
        }
        Ok(())
    })
}

/// Fetch-add with verification: each returned old value must be exactly
/// one more than the previous; a mismatch is fatal.
pub fn client_ver_fetch_add(run: &mut Run) -> Result<()> {
    with_device(run, Transport::Rc, NCQE as u32, 0, |run, dev| {
        let slots = run.req.rd_atomic;
        atomic_region(run, dev, slots)?;
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        for i in 0..slots {
            dev.post_fetch_add(&mut run.lstat, u64::from(i), i as usize * 8, 1)?;
        }
        let mut last: u64 = 0;
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if clock::finished() {
                break;
            }
            run.lstat.note_cq_depth(n);
            for c in &wc[..n] {
                if c.status != ffi::ibv_wc_status_IBV_WC_SUCCESS {
                    note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                    continue;
                }
                run.lstat.rem_r.no_bytes += 8;
                run.lstat.rem_r.no_msgs += 1;
                let slot = c.wr_id as usize;
                let res = dev.result_slot(slot);
                if res != last {
                    return Err(Error::Verify {
                        expected: last,
                        got: res,
                    });
                }
                last += 1;
                dev.post_fetch_add(&mut run.lstat, c.wr_id, slot * 8, 1)?;
            }
        }
        Ok(())
    })
}

/// Compare-swap with verification: the chain starts at `CSWAP_SEED` and
/// each swapped-in value is one more than the last, so every returned old
/// value is predictable.
pub fn client_ver_compare_swap(run: &mut Run) -> Result<()> {
    with_device(run, Transport::Rc, NCQE as u32, 0, |run, dev| {
        let slots = run.req.rd_atomic;
        atomic_region(run, dev, slots)?;
        dev.init(run)?;
        if !run.sync_test() {
            return Err(barrier_failed());
        }
        let mut cur: u64 = 0;
        let mut next: u64 = CSWAP_SEED;
        for i in 0..slots {
            dev.post_compare_swap(&mut run.lstat, u64::from(i), i as usize * 8, cur, next)?;
            cur = next;
            next = cur + 1;
        }
        let mut last: u64 = 0;
        let mut wc = wc_vec(NCQE);
        while !clock::finished() {
            let n = dev.poll(&mut wc)?;
            if clock::finished() {
                break;
            }
            run.lstat.note_cq_depth(n);
            for c in &wc[..n] {
                if c.status != ffi::ibv_wc_status_IBV_WC_SUCCESS {
                    note_cq_error(&run.test_name, c.status, &mut run.lstat.s.no_errs);
                    continue;
                }
                run.lstat.rem_r.no_bytes += 8;
                run.lstat.rem_r.no_msgs += 1;
                let slot = c.wr_id as usize;
                let res = dev.result_slot(slot);
                if res != last {
                    return Err(Error::Verify {
                        expected: last,
                        got: res,
                    });
                }
                last = if last == 0 { CSWAP_SEED } else { last + 1 };
                next = cur + 1;
                dev.post_compare_swap(&mut run.lstat, c.wr_id, slot * 8, cur, next)?;
                cur = next;
            }
        }
        Ok(())
    })
}
