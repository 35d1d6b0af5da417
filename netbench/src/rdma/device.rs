//! RDMA device lifecycle.
//!
//! Resources are acquired in the order device, completion channel,
//! protection domain, memory region, completion queue, queue pair, address
//! handle, and released in reverse — with the one mandatory exception that
//! the completion queue goes down before the queue pair, because destroying
//! the QP first can hang some drivers. [`IbDevice::close`] encodes that
//! order and runs on every exit path through `Drop`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::CStr;
use std::io;
use std::ptr;

use log::debug;
use netbench_core::clock;
use netbench_core::error::{Error, Result};
use netbench_core::wire::CONN_WIRE_LEN;
use netbench_core::{ConnContext, Request, Stat};
use verbs_sys as ffi;
use verbs_sys::shim;

use crate::ctx::Run;

/// Pipeline depth of the bandwidth loops.
pub const NCQE: usize = 1024;
/// Global Routing Header prepended to every UD receive.
pub const GRH_SIZE: usize = 40;

const QKEY: u32 = 0x1111_1111;
const RETRY_CNT: u8 = 7;
const RNR_RETRY: u8 = 7;
const MIN_RNR_TIMER: u8 = 12;
const TIMEOUT: u8 = 14;

/// Work request identifiers. Completions carrying anything else are logged
/// and ignored.
pub const WRID_SEND: u64 = 1;
pub const WRID_RECV: u64 = 2;
pub const WRID_RDMA: u64 = 3;

/// Queue-pair transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Rc,
    Uc,
    Ud,
}

impl Transport {
    fn qp_type(self) -> ffi::ibv_qp_type {
        match self {
            Transport::Rc => ffi::ibv_qp_type_IBV_QPT_RC,
            Transport::Uc => ffi::ibv_qp_type_IBV_QPT_UC,
            Transport::Ud => ffi::ibv_qp_type_IBV_QPT_UD,
        }
    }
}

/// Static-rate names accepted by the `rate` parameter.
const RATES: &[(&str, ffi::ibv_rate)] = &[
    ("", ffi::ibv_rate_IBV_RATE_MAX),
    ("max", ffi::ibv_rate_IBV_RATE_MAX),
    ("1xSDR", ffi::ibv_rate_IBV_RATE_2_5_GBPS),
    ("1xDDR", ffi::ibv_rate_IBV_RATE_5_GBPS),
    ("1xQDR", ffi::ibv_rate_IBV_RATE_10_GBPS),
    ("4xSDR", ffi::ibv_rate_IBV_RATE_10_GBPS),
    ("4xDDR", ffi::ibv_rate_IBV_RATE_20_GBPS),
    ("4xQDR", ffi::ibv_rate_IBV_RATE_40_GBPS),
    ("8xSDR", ffi::ibv_rate_IBV_RATE_20_GBPS),
    ("8xDDR", ffi::ibv_rate_IBV_RATE_40_GBPS),
    ("8xQDR", ffi::ibv_rate_IBV_RATE_80_GBPS),
    ("2.5", ffi::ibv_rate_IBV_RATE_2_5_GBPS),
    ("5", ffi::ibv_rate_IBV_RATE_5_GBPS),
    ("10", ffi::ibv_rate_IBV_RATE_10_GBPS),
    ("20", ffi::ibv_rate_IBV_RATE_20_GBPS),
    ("30", ffi::ibv_rate_IBV_RATE_30_GBPS),
    ("40", ffi::ibv_rate_IBV_RATE_40_GBPS),
    ("60", ffi::ibv_rate_IBV_RATE_60_GBPS),
    ("80", ffi::ibv_rate_IBV_RATE_80_GBPS),
    ("120", ffi::ibv_rate_IBV_RATE_120_GBPS),
];

pub fn rate_from_name(name: &str) -> Option<ffi::ibv_rate> {
    RATES.iter().find(|(n, _)| *n == name).map(|(_, r)| *r)
}

pub fn mtu_from_size(mtu: u32) -> Result<ffi::ibv_mtu> {
    match mtu {
        256 => Ok(ffi::ibv_mtu_IBV_MTU_256),
        512 => Ok(ffi::ibv_mtu_IBV_MTU_512),
        1024 => Ok(ffi::ibv_mtu_IBV_MTU_1024),
        2048 => Ok(ffi::ibv_mtu_IBV_MTU_2048),
        4096 => Ok(ffi::ibv_mtu_IBV_MTU_4096),
        bad => Err(Error::Config(format!(
            "bad MTU: {bad}; must be 256/512/1024/2048/4096"
        ))),
    }
}

/// Split the identifier string `"device[:port]"`; an empty device name
/// means "first device", the port defaults to 1.
pub fn parse_device_id(id: &str) -> Result<(Option<String>, u8)> {
    let (name, port) = match id.split_once(':') {
        Some((name, port)) => {
            let port: u8 = port
                .parse()
                .map_err(|_| Error::Config(format!("bad IB port: {port}")))?;
            if port < 1 {
                return Err(Error::Config(format!(
                    "bad IB port: {port}; must be at least 1"
                )));
            }
            (name, port)
        }
        None => (id, 1),
    };
    let name = if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    };
    Ok((name, port))
}

fn modify_err(what: &'static str, errno: i32) -> Error {
    Error::io(what, io::Error::from_raw_os_error(errno))
}

/// One open RDMA endpoint: the verbs objects, the pinned buffer, and the
/// two connection contexts.
pub struct IbDevice {
    pub lcon: ConnContext,
    pub rcon: ConnContext,
    pub trans: Transport,
    pub max_inline: u32,
    pub msg_size: u32,
    poll_mode: bool,
    access_recv: bool,
    mtu: ffi::ibv_mtu,
    port: u8,
    rate: ffi::ibv_rate,

    buf: *mut u8,
    buf_len: usize,
    buf_layout: Option<Layout>,
    devlist: *mut *mut ffi::ibv_device,
    context: *mut ffi::ibv_context,
    channel: *mut ffi::ibv_comp_channel,
    pd: *mut ffi::ibv_pd,
    mr: *mut ffi::ibv_mr,
    cq: *mut ffi::ibv_cq,
    qp: *mut ffi::ibv_qp,
    ah: *mut ffi::ibv_ah,
}

impl IbDevice {
    /// Open a device per the request and drive the queue pair to INIT.
    /// Clamps `req.rd_atomic` against the device limit in place.
    pub fn open(
        req: &mut Request,
        trans: Transport,
        max_send_wr: u32,
        max_recv_wr: u32,
    ) -> Result<IbDevice> {
        let mut dev = IbDevice {
            lcon: ConnContext::default(),
            rcon: ConnContext::default(),
            trans,
            max_inline: 0,
            msg_size: req.msg_size,
            poll_mode: req.poll_mode != 0,
            access_recv: req.access_recv != 0,
            mtu: mtu_from_size(req.mtu_size)?,
            port: 0,
            rate: 0,
            buf: ptr::null_mut(),
            buf_len: 0,
            buf_layout: None,
            devlist: ptr::null_mut(),
            context: ptr::null_mut(),
            channel: ptr::null_mut(),
            pd: ptr::null_mut(),
            mr: ptr::null_mut(),
            cq: ptr::null_mut(),
            qp: ptr::null_mut(),
            ah: ptr::null_mut(),
        };
        // any failure from here drops `dev` and unwinds through close()
        dev.open_steps(req, max_send_wr, max_recv_wr)?;
        Ok(dev)
    }

    fn open_steps(&mut self, req: &mut Request, max_send_wr: u32, max_recv_wr: u32) -> Result<()> {
        let (dev_name, port) = parse_device_id(&req.id)?;
        self.port = port;
        self.rate = rate_from_name(&req.rate)
            .ok_or_else(|| Error::Config(format!("bad rate: {}", req.rate)))?;

        unsafe {
            // enumerate devices; choose by name or take the first
            let mut n = 0;
            self.devlist = ffi::ibv_get_device_list(&mut n);
            if self.devlist.is_null() || n == 0 {
                return Err(Error::sys("failed to find any RDMA devices"));
            }
            let mut device = ptr::null_mut();
            for i in 0..n as isize {
                let cand = *self.devlist.offset(i);
                match &dev_name {
                    None => {
                        device = cand;
                        break;
                    }
                    Some(want) => {
                        let name = CStr::from_ptr(ffi::ibv_get_device_name(cand));
                        if name.to_string_lossy() == want.as_str() {
                            device = cand;
                            break;
                        }
                    }
                }
            }
            if device.is_null() {
                return Err(Error::Config(format!(
                    "failed to find RDMA device {}",
                    dev_name.as_deref().unwrap_or("")
                )));
            }

            self.context = ffi::ibv_open_device(device);
            if self.context.is_null() {
                return Err(Error::sys("failed to open RDMA device"));
            }

            self.channel = ffi::ibv_create_comp_channel(self.context);
            if self.channel.is_null() {
                return Err(Error::sys("failed to create completion channel"));
            }

            self.pd = ffi::ibv_alloc_pd(self.context);
            if self.pd.is_null() {
                return Err(Error::sys("failed to allocate protection domain"));
            }

            self.alloc_region(req.msg_size as usize)?;

            self.cq = ffi::ibv_create_cq(
                self.context,
                (max_send_wr + max_recv_wr) as i32,
                ptr::null_mut(),
                self.channel,
                0,
            );
            if self.cq.is_null() {
                return Err(Error::sys("failed to create completion queue"));
            }

            let mut init_attr = ffi::ibv_qp_init_attr {
                send_cq: self.cq,
                recv_cq: self.cq,
                qp_type: self.trans.qp_type(),
                ..Default::default()
            };
            init_attr.cap.max_send_wr = max_send_wr;
            init_attr.cap.max_recv_wr = max_recv_wr;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;
            self.qp = ffi::ibv_create_qp(self.pd, &mut init_attr);
            if self.qp.is_null() {
                return Err(Error::sys("failed to create QP"));
            }

            // RESET -> INIT with transport-specific access flags
            let mut attr = ffi::ibv_qp_attr {
                qp_state: ffi::ibv_qp_state_IBV_QPS_INIT,
                pkey_index: 0,
                port_num: self.port,
                ..Default::default()
            };
            let mut mask = ffi::ibv_qp_attr_mask_IBV_QP_STATE
                | ffi::ibv_qp_attr_mask_IBV_QP_PKEY_INDEX
                | ffi::ibv_qp_attr_mask_IBV_QP_PORT;
            match self.trans {
                Transport::Ud => {
                    mask |= ffi::ibv_qp_attr_mask_IBV_QP_QKEY;
                    attr.qkey = QKEY;
                }
                Transport::Rc => {
                    mask |= ffi::ibv_qp_attr_mask_IBV_QP_ACCESS_FLAGS;
                    attr.qp_access_flags = ffi::ibv_access_flags_IBV_ACCESS_REMOTE_READ
                        | ffi::ibv_access_flags_IBV_ACCESS_REMOTE_WRITE
                        | ffi::ibv_access_flags_IBV_ACCESS_REMOTE_ATOMIC;
                }
                Transport::Uc => {
                    mask |= ffi::ibv_qp_attr_mask_IBV_QP_ACCESS_FLAGS;
                    attr.qp_access_flags = ffi::ibv_access_flags_IBV_ACCESS_REMOTE_WRITE;
                }
            }
            let rc = ffi::ibv_modify_qp(self.qp, &mut attr, mask as i32);
            if rc != 0 {
                return Err(modify_err("failed to modify QP to INIT state", rc));
            }

            // inline capability comes back from the created QP
            let mut qp_attr: ffi::ibv_qp_attr = Default::default();
            let mut qp_init: ffi::ibv_qp_init_attr = Default::default();
            let rc = ffi::ibv_query_qp(self.qp, &mut qp_attr, 0, &mut qp_init);
            if rc != 0 {
                return Err(modify_err("query QP failed", rc));
            }
            self.max_inline = qp_attr.cap.max_inline_data;

            // clamp the outstanding-atomic count to the device limit
            let mut dev_attr: ffi::ibv_device_attr = Default::default();
            let rc = ffi::ibv_query_device(self.context, &mut dev_attr);
            if rc != 0 {
                return Err(modify_err("query device failed", rc));
            }
            let max_rd_atom = dev_attr.max_qp_rd_atom.max(0) as u32;
            if req.rd_atomic == 0 || req.rd_atomic > max_rd_atom {
                debug!(
                    "clamping rd_atomic from {} to device limit {max_rd_atom}",
                    req.rd_atomic
                );
                req.rd_atomic = max_rd_atom;
            }

            let mut port_attr: ffi::ibv_port_attr = Default::default();
            let rc = shim::ibv_query_port(self.context, self.port, &mut port_attr);
            if rc != 0 {
                return Err(modify_err("query port failed", rc));
            }

            self.lcon.lid = u32::from(port_attr.lid);
            self.lcon.qpn = (*self.qp).qp_num;
            self.lcon.psn = rand::random::<u32>() & 0xff_ffff;
        }
        Ok(())
    }

    /// Allocate the page-aligned pinned buffer and register it with all
    /// four access flags. UD gets GRH headroom; a zero size still maps one
    /// byte so every test has a registered region.
    fn alloc_region(&mut self, size: usize) -> Result<()> {
        let mut len = size;
        if self.trans == Transport::Ud {
            len += GRH_SIZE;
        }
        if len == 0 {
            len = 1;
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
        let layout = Layout::from_size_align(len, page)
            .map_err(|e| Error::Config(format!("bad buffer layout: {e}")))?;

        let buf = unsafe { alloc_zeroed(layout) };
        if buf.is_null() {
            return Err(Error::sys("failed to allocate memory"));
        }

        let access = ffi::ibv_access_flags_IBV_ACCESS_LOCAL_WRITE
            | ffi::ibv_access_flags_IBV_ACCESS_REMOTE_READ
            | ffi::ibv_access_flags_IBV_ACCESS_REMOTE_WRITE
            | ffi::ibv_access_flags_IBV_ACCESS_REMOTE_ATOMIC;
        let mr = unsafe { ffi::ibv_reg_mr(self.pd, buf as *mut libc::c_void, len, access as i32) };
        if mr.is_null() {
            let e = Error::sys("failed to register memory region");
            unsafe { dealloc(buf, layout) };
            return Err(e);
        }

        self.buf = buf;
        self.buf_len = len;
        self.buf_layout = Some(layout);
        self.mr = mr;
        self.lcon.rkey = unsafe { (*mr).rkey };
        self.lcon.vaddr = buf as u64;
        Ok(())
    }

    /// Replace the region with one of `size` bytes (the atomics tests size
    /// it from the clamped rd_atomic after open).
    pub fn realloc_region(&mut self, size: usize) -> Result<()> {
        unsafe {
            if !self.mr.is_null() {
                ffi::ibv_dereg_mr(self.mr);
                self.mr = ptr::null_mut();
            }
            if let Some(layout) = self.buf_layout.take() {
                dealloc(self.buf, layout);
                self.buf = ptr::null_mut();
            }
        }
        self.alloc_region(size)
    }

    /// Exchange connection contexts over the control channel (client sends
    /// first) and drive the QP to RTS.
    pub fn init(&mut self, run: &mut Run) -> Result<()> {
        if run.client {
            run.send_request()?;
            run.ctl
                .send_mesg(&self.lcon.encode(), "connection context")?;
            let buf = run.ctl.recv_mesg(CONN_WIRE_LEN, "connection context")?;
            self.rcon = ConnContext::decode(&buf)?;
        } else {
            let buf = run.ctl.recv_mesg(CONN_WIRE_LEN, "connection context")?;
            self.rcon = ConnContext::decode(&buf)?;
            run.ctl
                .send_mesg(&self.lcon.encode(), "connection context")?;
        }
        self.prepare(run.req.rd_atomic)?;
        debug!(
            "L: lid={:04x} qpn={:06x} psn={:06x} rkey={:08x} vaddr={:010x}",
            self.lcon.lid, self.lcon.qpn, self.lcon.psn, self.lcon.rkey, self.lcon.vaddr
        );
        debug!(
            "R: lid={:04x} qpn={:06x} psn={:06x} rkey={:08x} vaddr={:010x}",
            self.rcon.lid, self.rcon.qpn, self.rcon.psn, self.rcon.rkey, self.rcon.vaddr
        );
        Ok(())
    }

    /// INIT -> RTR -> RTS with the flag set the transport requires; UD adds
    /// the address handle for the remote port.
    fn prepare(&mut self, rd_atomic: u32) -> Result<()> {
        let ah_attr = ffi::ibv_ah_attr {
            dlid: self.rcon.lid as u16,
            port_num: self.port,
            static_rate: self.rate as u8,
            ..Default::default()
        };
        let mut rtr_attr = ffi::ibv_qp_attr {
            qp_state: ffi::ibv_qp_state_IBV_QPS_RTR,
            path_mtu: self.mtu,
            dest_qp_num: self.rcon.qpn,
            rq_psn: self.rcon.psn,
            min_rnr_timer: MIN_RNR_TIMER,
            max_dest_rd_atomic: rd_atomic.min(255) as u8,
            ah_attr,
            ..Default::default()
        };
        let mut rts_attr = ffi::ibv_qp_attr {
            qp_state: ffi::ibv_qp_state_IBV_QPS_RTS,
            timeout: TIMEOUT,
            retry_cnt: RETRY_CNT,
            rnr_retry: RNR_RETRY,
            sq_psn: self.lcon.psn,
            max_rd_atomic: rd_atomic.min(255) as u8,
            ..Default::default()
        };

        let (rtr_mask, rts_mask) = match self.trans {
            Transport::Rc => (
                ffi::ibv_qp_attr_mask_IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask_IBV_QP_AV
                    | ffi::ibv_qp_attr_mask_IBV_QP_PATH_MTU
                    | ffi::ibv_qp_attr_mask_IBV_QP_DEST_QPN
                    | ffi::ibv_qp_attr_mask_IBV_QP_RQ_PSN
                    | ffi::ibv_qp_attr_mask_IBV_QP_MAX_DEST_RD_ATOMIC
                    | ffi::ibv_qp_attr_mask_IBV_QP_MIN_RNR_TIMER,
                ffi::ibv_qp_attr_mask_IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask_IBV_QP_TIMEOUT
                    | ffi::ibv_qp_attr_mask_IBV_QP_RETRY_CNT
                    | ffi::ibv_qp_attr_mask_IBV_QP_RNR_RETRY
                    | ffi::ibv_qp_attr_mask_IBV_QP_SQ_PSN
                    | ffi::ibv_qp_attr_mask_IBV_QP_MAX_QP_RD_ATOMIC,
            ),
            Transport::Uc => (
                ffi::ibv_qp_attr_mask_IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask_IBV_QP_AV
                    | ffi::ibv_qp_attr_mask_IBV_QP_PATH_MTU
                    | ffi::ibv_qp_attr_mask_IBV_QP_DEST_QPN
                    | ffi::ibv_qp_attr_mask_IBV_QP_RQ_PSN,
                ffi::ibv_qp_attr_mask_IBV_QP_STATE | ffi::ibv_qp_attr_mask_IBV_QP_SQ_PSN,
            ),
            Transport::Ud => (
                ffi::ibv_qp_attr_mask_IBV_QP_STATE,
                ffi::ibv_qp_attr_mask_IBV_QP_STATE | ffi::ibv_qp_attr_mask_IBV_QP_SQ_PSN,
            ),
        };

        unsafe {
            let rc = ffi::ibv_modify_qp(self.qp, &mut rtr_attr, rtr_mask as i32);
            if rc != 0 {
                return Err(modify_err("failed to modify QP to RTR", rc));
            }
            let rc = ffi::ibv_modify_qp(self.qp, &mut rts_attr, rts_mask as i32);
            if rc != 0 {
                return Err(modify_err("failed to modify QP to RTS", rc));
            }

            if self.trans == Transport::Ud {
                let mut ah_attr = ah_attr;
                self.ah = ffi::ibv_create_ah(self.pd, &mut ah_attr);
                if self.ah.is_null() {
                    return Err(Error::sys("failed to create address handle"));
                }
            }

            if !self.poll_mode {
                let rc = shim::ibv_req_notify_cq(self.cq, 0);
                if rc != 0 {
                    return Err(modify_err("failed to request CQ notification", rc));
                }
            }
        }
        Ok(())
    }

    /// Harvest completions. In poll mode this is one non-blocking
    /// `poll_cq`; in event mode it sleeps on the completion channel first
    /// and re-arms. An EINTR after the alarm fired yields zero completions
    /// so the loop can observe `finished` and exit.
    pub fn poll(&mut self, wc: &mut [ffi::ibv_wc]) -> Result<usize> {
        if !self.poll_mode && !clock::finished() {
            unsafe {
                let mut ecq: *mut ffi::ibv_cq = ptr::null_mut();
                let mut ectx: *mut libc::c_void = ptr::null_mut();
                if ffi::ibv_get_cq_event(self.channel, &mut ecq, &mut ectx) != 0 {
                    return self.poll_interrupted("failed to get CQ event");
                }
                if ecq != self.cq {
                    return Err(Error::Config("CQ event for unknown CQ".into()));
                }
                ffi::ibv_ack_cq_events(self.cq, 1);
                let rc = shim::ibv_req_notify_cq(self.cq, 0);
                if rc != 0 {
                    return Err(modify_err("failed to request CQ notification", rc));
                }
            }
        }
        self.poll_cq_direct(wc)
    }

    /// One raw `poll_cq`, no channel involved. The write-polling latency
    /// test measures with this so no event machinery sits on the fast path.
    pub fn poll_cq_direct(&mut self, wc: &mut [ffi::ibv_wc]) -> Result<usize> {
        let n = unsafe { shim::ibv_poll_cq(self.cq, wc.len() as i32, wc.as_mut_ptr()) };
        if n < 0 {
            return self.poll_interrupted("CQ poll failed");
        }
        Ok(n as usize)
    }

    fn poll_interrupted(&self, what: &'static str) -> Result<usize> {
        let e = io::Error::last_os_error();
        if clock::finished() && e.raw_os_error() == Some(libc::EINTR) {
            return Ok(0);
        }
        Err(Error::io(what, e))
    }

    fn send_flags_for(&self, opcode: ffi::ibv_wr_opcode) -> u32 {
        let mut flags = ffi::ibv_send_flags_IBV_SEND_SIGNALED;
        let never_inline = opcode == ffi::ibv_wr_opcode_IBV_WR_RDMA_READ
            || opcode == ffi::ibv_wr_opcode_IBV_WR_ATOMIC_FETCH_AND_ADD
            || opcode == ffi::ibv_wr_opcode_IBV_WR_ATOMIC_CMP_AND_SWP;
        if !never_inline && self.msg_size <= self.max_inline {
            flags |= ffi::ibv_send_flags_IBV_SEND_INLINE;
        }
        flags
    }

    fn post_one(&mut self, wr: &mut ffi::ibv_send_wr, what: &'static str) -> Result<bool> {
        let mut bad: *mut ffi::ibv_send_wr = ptr::null_mut();
        let rc = unsafe { shim::ibv_post_send(self.qp, wr, &mut bad) };
        if rc != 0 {
            if clock::finished() && rc == libc::EINTR {
                return Ok(false);
            }
            return Err(modify_err(what, rc));
        }
        Ok(true)
    }

    /// Post `n` signaled sends of the shared buffer.
    pub fn post_send(&mut self, stat: &mut Stat, mut n: usize) -> Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: self.buf as u64,
            length: self.msg_size,
            lkey: unsafe { (*self.mr).lkey },
        };
        let mut wr: ffi::ibv_send_wr = Default::default();
        wr.wr_id = WRID_SEND;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ffi::ibv_wr_opcode_IBV_WR_SEND;
        wr.send_flags = self.send_flags_for(wr.opcode);
        if self.trans == Transport::Ud {
            wr.wr = ffi::ibv_send_wr__bindgen_ty_2 {
                ud: ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_3 {
                    ah: self.ah,
                    remote_qpn: self.rcon.qpn,
                    remote_qkey: QKEY,
                },
            };
        }

        while n > 0 {
            if !self.post_one(&mut wr, "failed to post send")? {
                return Ok(());
            }
            stat.s.no_bytes += u64::from(self.msg_size);
            stat.s.no_msgs += 1;
            n -= 1;
        }
        Ok(())
    }

    /// Post `n` receives of the shared buffer; UD receives include GRH
    /// headroom.
    pub fn post_recv(&mut self, mut n: usize) -> Result<()> {
        let mut length = self.msg_size;
        if self.trans == Transport::Ud {
            length += GRH_SIZE as u32;
        }
        let mut sge = ffi::ibv_sge {
            addr: self.buf as u64,
            length,
            lkey: unsafe { (*self.mr).lkey },
        };
        let mut wr = ffi::ibv_recv_wr {
            wr_id: WRID_RECV,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };

        while n > 0 {
            let mut bad: *mut ffi::ibv_recv_wr = ptr::null_mut();
            let rc = unsafe { shim::ibv_post_recv(self.qp, &mut wr, &mut bad) };
            if rc != 0 {
                if clock::finished() && rc == libc::EINTR {
                    return Ok(());
                }
                return Err(modify_err("failed to post receive", rc));
            }
            n -= 1;
        }
        Ok(())
    }

    /// Post `n` RDMA reads or writes against the remote region.
    pub fn post_rdma(
        &mut self,
        stat: &mut Stat,
        opcode: ffi::ibv_wr_opcode,
        mut n: usize,
    ) -> Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: self.buf as u64,
            length: self.msg_size,
            lkey: unsafe { (*self.mr).lkey },
        };
        let mut wr: ffi::ibv_send_wr = Default::default();
        wr.wr_id = WRID_RDMA;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = self.send_flags_for(opcode);
        wr.wr = ffi::ibv_send_wr__bindgen_ty_2 {
            rdma: ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_1 {
                remote_addr: self.rcon.vaddr,
                rkey: self.rcon.rkey,
            },
        };

        let reads = opcode == ffi::ibv_wr_opcode_IBV_WR_RDMA_READ;
        while n > 0 {
            if !self.post_one(&mut wr, "failed to post RDMA operation")? {
                return Ok(());
            }
            if !reads {
                stat.s.no_bytes += u64::from(self.msg_size);
                stat.s.no_msgs += 1;
            }
            n -= 1;
        }
        Ok(())
    }

    fn post_atomic(
        &mut self,
        stat: &mut Stat,
        opcode: ffi::ibv_wr_opcode,
        wrid: u64,
        offset: usize,
        compare_add: u64,
        swap: u64,
        what: &'static str,
    ) -> Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: self.buf as u64 + offset as u64,
            length: 8,
            lkey: unsafe { (*self.mr).lkey },
        };
        let mut wr: ffi::ibv_send_wr = Default::default();
        wr.wr_id = wrid;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = ffi::ibv_send_flags_IBV_SEND_SIGNALED;
        wr.wr = ffi::ibv_send_wr__bindgen_ty_2 {
            atomic: ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_2 {
                remote_addr: self.rcon.vaddr,
                compare_add,
                swap,
                rkey: self.rcon.rkey,
            },
        };

        if self.post_one(&mut wr, what)? {
            stat.s.no_bytes += 8;
            stat.s.no_msgs += 1;
        }
        Ok(())
    }

    /// Post one fetch-add; the returned old value lands at `offset` in the
    /// local buffer.
    pub fn post_fetch_add(
        &mut self,
        stat: &mut Stat,
        wrid: u64,
        offset: usize,
        add: u64,
    ) -> Result<()> {
        self.post_atomic(
            stat,
            ffi::ibv_wr_opcode_IBV_WR_ATOMIC_FETCH_AND_ADD,
            wrid,
            offset,
            add,
            0,
            "failed to post fetch and add",
        )
    }

    /// Post one compare-swap; the returned old value lands at `offset`.
    pub fn post_compare_swap(
        &mut self,
        stat: &mut Stat,
        wrid: u64,
        offset: usize,
        compare: u64,
        swap: u64,
    ) -> Result<()> {
        self.post_atomic(
            stat,
            ffi::ibv_wr_opcode_IBV_WR_ATOMIC_CMP_AND_SWP,
            wrid,
            offset,
            compare,
            swap,
            "failed to post compare and swap",
        )
    }

    pub fn buf_ptr(&self) -> *mut u8 {
        self.buf
    }

    /// Read the `i`-th u64 result slot of the buffer (atomics).
    pub fn result_slot(&self, i: usize) -> u64 {
        debug_assert!((i + 1) * 8 <= self.buf_len);
        unsafe { ptr::read_volatile((self.buf as *const u64).add(i)) }
    }

    /// Whether receivers should pull received data through the cache.
    pub fn access_recv(&self) -> bool {
        self.access_recv
    }

    /// Tear everything down in the mandated order: AH, CQ, QP, MR, PD,
    /// channel, context, buffer, device list.
    pub fn close(&mut self) {
        unsafe {
            if !self.ah.is_null() {
                ffi::ibv_destroy_ah(self.ah);
                self.ah = ptr::null_mut();
            }
            if !self.cq.is_null() {
                ffi::ibv_destroy_cq(self.cq);
                self.cq = ptr::null_mut();
            }
            if !self.qp.is_null() {
                ffi::ibv_destroy_qp(self.qp);
                self.qp = ptr::null_mut();
            }
            if !self.mr.is_null() {
                ffi::ibv_dereg_mr(self.mr);
                self.mr = ptr::null_mut();
            }
            if !self.pd.is_null() {
                ffi::ibv_dealloc_pd(self.pd);
                self.pd = ptr::null_mut();
            }
            if !self.channel.is_null() {
                ffi::ibv_destroy_comp_channel(self.channel);
                self.channel = ptr::null_mut();
            }
            if !self.context.is_null() {
                ffi::ibv_close_device(self.context);
                self.context = ptr::null_mut();
            }
            if let Some(layout) = self.buf_layout.take() {
                dealloc(self.buf, layout);
                self.buf = ptr::null_mut();
            }
            if !self.devlist.is_null() {
                ffi::ibv_free_device_list(self.devlist);
                self.devlist = ptr::null_mut();
            }
        }
    }
}

impl Drop for IbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_mapping_accepts_the_five_sizes() {
        assert_eq!(mtu_from_size(256).unwrap(), ffi::ibv_mtu_IBV_MTU_256);
        assert_eq!(mtu_from_size(2048).unwrap(), ffi::ibv_mtu_IBV_MTU_2048);
        assert_eq!(mtu_from_size(4096).unwrap(), ffi::ibv_mtu_IBV_MTU_4096);
        assert!(mtu_from_size(1500).is_err());
        assert!(mtu_from_size(0).is_err());
    }

    #[test]
    fn rate_table_lookups() {
        assert_eq!(rate_from_name("").unwrap(), ffi::ibv_rate_IBV_RATE_MAX);
        assert_eq!(
            rate_from_name("4xQDR").unwrap(),
            ffi::ibv_rate_IBV_RATE_40_GBPS
        );
        assert_eq!(rate_from_name("10").unwrap(), ffi::ibv_rate_IBV_RATE_10_GBPS);
        assert!(rate_from_name("bogus").is_none());
    }

    #[test]
    fn device_id_parsing() {
        assert_eq!(parse_device_id("").unwrap(), (None, 1));
        assert_eq!(
            parse_device_id("mlx5_0").unwrap(),
            (Some("mlx5_0".into()), 1)
        );
        assert_eq!(
            parse_device_id("mlx5_0:2").unwrap(),
            (Some("mlx5_0".into()), 2)
        );
        assert!(parse_device_id("mlx5_0:zero").is_err());
        assert!(parse_device_id("mlx5_0:0").is_err());
    }
}
