//! RDMA tests: per-test entry points over the shared measurement loops.

pub mod device;
pub mod loops;

use netbench_core::error::Result;
use netbench_core::ParamId;
use verbs_sys as ffi;

use crate::ctx::Run;
use crate::report::{self, Measure};
use device::Transport;
use loops::{AtomicOp, IoMode};

const K2: u32 = 2 * 1024;
const K64: u32 = 64 * 1024;
const DEF_MTU: u32 = 2048;

/// Defaults and parameter consumption for the message-based RDMA tests.
fn ib_params_msgs(run: &mut Run, msg_size: u32, use_poll_mode: bool) -> Result<()> {
    if !run.client {
        return Ok(());
    }
    run.params.set_default(ParamId::MsgSize, msg_size);
    run.params.set_default(ParamId::MtuSize, DEF_MTU);
    run.params.mark_used(ParamId::Id);
    run.params.mark_used(ParamId::Rate);
    if use_poll_mode {
        run.params.mark_used(ParamId::PollMode);
    }
    let name = run.test_name.clone();
    run.params.validate(&name)?;
    run.refresh_req();
    Ok(())
}

/// Defaults and parameter consumption for the atomic tests. The message
/// size is derived from the outstanding-op count, not user-settable.
fn ib_params_atomics(run: &mut Run) -> Result<()> {
    if !run.client {
        return Ok(());
    }
    run.params.set_default(ParamId::MtuSize, DEF_MTU);
    run.params.mark_used(ParamId::Id);
    run.params.mark_used(ParamId::Rate);
    run.params.mark_used(ParamId::PollMode);
    run.params.mark_used(ParamId::RdAtomic);
    let name = run.test_name.clone();
    run.params.validate(&name)?;
    run.refresh_req();
    Ok(())
}

fn bw_params(run: &mut Run) {
    run.params.mark_used(ParamId::AccessRecv);
    run.params.mark_used(ParamId::NoMsgs);
}

// --- RC ---

pub fn run_client_rc_bw(run: &mut Run) -> Result<()> {
    bw_params(run);
    ib_params_msgs(run, K64, true)?;
    loops::client_bw(run, Transport::Rc)?;
    report::show_results(run, Measure::Bandwidth);
    Ok(())
}

pub fn run_server_rc_bw(run: &mut Run) -> Result<()> {
    loops::server_def(run, Transport::Rc)
}

pub fn run_client_rc_bi_bw(run: &mut Run) -> Result<()> {
    run.params.mark_used(ParamId::AccessRecv);
    ib_params_msgs(run, K64, true)?;
    loops::bi_bw(run, Transport::Rc)?;
    report::show_results(run, Measure::Bandwidth);
    Ok(())
}

pub fn run_server_rc_bi_bw(run: &mut Run) -> Result<()> {
    loops::bi_bw(run, Transport::Rc)
}

pub fn run_client_rc_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::pp_lat(run, Transport::Rc, IoMode::Sr)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_rc_lat(run: &mut Run) -> Result<()> {
    loops::pp_lat(run, Transport::Rc, IoMode::Sr)
}

pub fn run_client_rc_rdma_read_bw(run: &mut Run) -> Result<()> {
    run.params.mark_used(ParamId::RdAtomic);
    ib_params_msgs(run, K64, true)?;
    loops::client_rdma_bw(run, Transport::Rc, ffi::ibv_wr_opcode_IBV_WR_RDMA_READ)?;
    report::show_results(run, Measure::Bandwidth);
    Ok(())
}

pub fn run_server_rc_rdma_read_bw(run: &mut Run) -> Result<()> {
    loops::server_nop(run, Transport::Rc)
}

pub fn run_client_rc_rdma_read_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::client_rdma_read_lat(run, Transport::Rc)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_rc_rdma_read_lat(run: &mut Run) -> Result<()> {
    loops::server_nop(run, Transport::Rc)
}

pub fn run_client_rc_rdma_write_bw(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, K64, true)?;
    loops::client_rdma_bw(
        run,
        Transport::Rc,
        ffi::ibv_wr_opcode_IBV_WR_RDMA_WRITE_WITH_IMM,
    )?;
    report::show_results(run, Measure::Bandwidth);
    Ok(())
}

pub fn run_server_rc_rdma_write_bw(run: &mut Run) -> Result<()> {
    loops::server_def(run, Transport::Rc)
}

pub fn run_client_rc_rdma_write_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::pp_lat(run, Transport::Rc, IoMode::Rdma)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_rc_rdma_write_lat(run: &mut Run) -> Result<()> {
    loops::pp_lat(run, Transport::Rc, IoMode::Rdma)
}

pub fn run_client_rc_rdma_write_poll_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, false)?;
    loops::rdma_write_poll_lat(run, Transport::Rc)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_rc_rdma_write_poll_lat(run: &mut Run) -> Result<()> {
    loops::rdma_write_poll_lat(run, Transport::Rc)
}

pub fn run_client_rc_compare_swap_mr(run: &mut Run) -> Result<()> {
    ib_params_atomics(run)?;
    loops::client_atomic(run, AtomicOp::CompareSwap)?;
    report::show_results(run, Measure::MsgRate);
    Ok(())
}

pub fn run_server_rc_compare_swap_mr(run: &mut Run) -> Result<()> {
    loops::server_nop(run, Transport::Rc)
}

pub fn run_client_rc_fetch_add_mr(run: &mut Run) -> Result<()> {
    ib_params_atomics(run)?;
    loops::client_atomic(run, AtomicOp::FetchAdd)?;
    report::show_results(run, Measure::MsgRate);
    Ok(())
}

pub fn run_server_rc_fetch_add_mr(run: &mut Run) -> Result<()> {
    loops::server_nop(run, Transport::Rc)
}

pub fn run_client_ver_rc_compare_swap(run: &mut Run) -> Result<()> {
    ib_params_atomics(run)?;
    loops::client_ver_compare_swap(run)?;
    report::show_results(run, Measure::MsgRate);
    Ok(())
}

pub fn run_server_ver_rc_compare_swap(run: &mut Run) -> Result<()> {
    loops::server_nop(run, Transport::Rc)
}

pub fn run_client_ver_rc_fetch_add(run: &mut Run) -> Result<()> {
    ib_params_atomics(run)?;
    loops::client_ver_fetch_add(run)?;
    report::show_results(run, Measure::MsgRate);
    Ok(())
}

pub fn run_server_ver_rc_fetch_add(run: &mut Run) -> Result<()> {
    loops::server_nop(run, Transport::Rc)
}

// --- UC ---

pub fn run_client_uc_bw(run: &mut Run) -> Result<()> {
    bw_params(run);
    ib_params_msgs(run, K64, true)?;
    loops::client_bw(run, Transport::Uc)?;
    report::show_results(run, Measure::BandwidthSr);
    Ok(())
}

pub fn run_server_uc_bw(run: &mut Run) -> Result<()> {
    loops::server_def(run, Transport::Uc)
}

pub fn run_client_uc_bi_bw(run: &mut Run) -> Result<()> {
    run.params.mark_used(ParamId::AccessRecv);
    ib_params_msgs(run, K64, true)?;
    loops::bi_bw(run, Transport::Uc)?;
    report::show_results(run, Measure::BandwidthSr);
    Ok(())
}

pub fn run_server_uc_bi_bw(run: &mut Run) -> Result<()> {
    loops::bi_bw(run, Transport::Uc)
}

pub fn run_client_uc_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::pp_lat(run, Transport::Uc, IoMode::Sr)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_uc_lat(run: &mut Run) -> Result<()> {
    loops::pp_lat(run, Transport::Uc, IoMode::Sr)
}

pub fn run_client_uc_rdma_write_bw(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, K64, true)?;
    loops::client_rdma_bw(
        run,
        Transport::Uc,
        ffi::ibv_wr_opcode_IBV_WR_RDMA_WRITE_WITH_IMM,
    )?;
    report::show_results(run, Measure::BandwidthSr);
    Ok(())
}

pub fn run_server_uc_rdma_write_bw(run: &mut Run) -> Result<()> {
    loops::server_def(run, Transport::Uc)
}

pub fn run_client_uc_rdma_write_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::pp_lat(run, Transport::Uc, IoMode::Rdma)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_uc_rdma_write_lat(run: &mut Run) -> Result<()> {
    loops::pp_lat(run, Transport::Uc, IoMode::Rdma)
}

pub fn run_client_uc_rdma_write_poll_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::rdma_write_poll_lat(run, Transport::Uc)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_uc_rdma_write_poll_lat(run: &mut Run) -> Result<()> {
    loops::rdma_write_poll_lat(run, Transport::Uc)
}

// --- UD ---

pub fn run_client_ud_bw(run: &mut Run) -> Result<()> {
    bw_params(run);
    ib_params_msgs(run, K2, true)?;
    loops::client_bw(run, Transport::Ud)?;
    report::show_results(run, Measure::BandwidthSr);
    Ok(())
}

pub fn run_server_ud_bw(run: &mut Run) -> Result<()> {
    loops::server_def(run, Transport::Ud)
}

pub fn run_client_ud_bi_bw(run: &mut Run) -> Result<()> {
    run.params.mark_used(ParamId::AccessRecv);
    ib_params_msgs(run, K2, true)?;
    loops::bi_bw(run, Transport::Ud)?;
    report::show_results(run, Measure::BandwidthSr);
    Ok(())
}

pub fn run_server_ud_bi_bw(run: &mut Run) -> Result<()> {
    loops::bi_bw(run, Transport::Ud)
}

pub fn run_client_ud_lat(run: &mut Run) -> Result<()> {
    ib_params_msgs(run, 1, true)?;
    loops::pp_lat(run, Transport::Ud, IoMode::Sr)?;
    report::show_results(run, Measure::Latency);
    Ok(())
}

pub fn run_server_ud_lat(run: &mut Run) -> Result<()> {
    loops::pp_lat(run, Transport::Ud, IoMode::Sr)
}
