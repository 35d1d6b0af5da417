//! Entry points that are static-inline functions in `infiniband/verbs.h` and
//! therefore absent from the generated bindings. They dispatch through the
//! per-device ops table hanging off `ibv_context`.

use std::mem::offset_of;

use crate::ibv_context;

const VERBS_ABI_IS_EXTENDED: u64 = u64::MAX;

#[inline]
unsafe fn verbs_get_ctx(ctx: *mut ibv_context) -> *mut crate::verbs_context {
    if (*ctx).abi_compat != VERBS_ABI_IS_EXTENDED as *mut _ {
        std::ptr::null_mut()
    } else {
        let offset = offset_of!(crate::verbs_context, context);
        ctx.byte_sub(offset) as *mut _
    }
}

pub unsafe fn ibv_poll_cq(cq: *mut crate::ibv_cq, num_entries: i32, wc: *mut crate::ibv_wc) -> i32 {
    let poll = (*(*cq).context).ops.poll_cq.expect("poll_cq op missing");
    poll(cq, num_entries, wc)
}

pub unsafe fn ibv_req_notify_cq(cq: *mut crate::ibv_cq, solicited_only: i32) -> i32 {
    let notify = (*(*cq).context).ops.req_notify_cq.expect("req_notify_cq op missing");
    notify(cq, solicited_only)
}

pub unsafe fn ibv_post_send(
    qp: *mut crate::ibv_qp,
    wr: *mut crate::ibv_send_wr,
    bad_wr: *mut *mut crate::ibv_send_wr,
) -> i32 {
    let post = (*(*qp).context).ops.post_send.expect("post_send op missing");
    post(qp, wr, bad_wr)
}

pub unsafe fn ibv_post_recv(
    qp: *mut crate::ibv_qp,
    wr: *mut crate::ibv_recv_wr,
    bad_wr: *mut *mut crate::ibv_recv_wr,
) -> i32 {
    let post = (*(*qp).context).ops.post_recv.expect("post_recv op missing");
    post(qp, wr, bad_wr)
}

/// `ibv_query_port` is a macro in recent verbs.h releases; extended contexts
/// route it through `verbs_context.query_port`, older ones through the compat
/// symbol.
pub unsafe fn ibv_query_port(
    context: *mut ibv_context,
    port: u8,
    port_attr: *mut crate::ibv_port_attr,
) -> i32 {
    let vctx = verbs_get_ctx(context);

    if vctx.is_null() {
        crate::ibv_query_port(context, port, port_attr as *mut _)
    } else if let Some(query_port) = (*vctx).query_port {
        query_port(context, port, port_attr, size_of::<crate::ibv_port_attr>())
    } else {
        crate::ibv_query_port(context, port, port_attr as *mut _)
    }
}
