//! The test registry.
//!
//! Position in `TESTS` is the test index carried in the request, so the
//! order below is part of the wire protocol: append only, never reorder.

use log::{debug, info};
use netbench_core::error::Result;

use crate::ctx::Run;
use crate::rdma;
use crate::socket;

pub type TestFn = fn(&mut Run) -> Result<()>;

pub struct Test {
    pub name: &'static str,
    pub client: TestFn,
    pub server: TestFn,
}

pub static TESTS: &[Test] = &[
    Test {
        name: "quit",
        client: client_quit,
        server: server_quit,
    },
    Test {
        name: "rds_bw",
        client: socket::run_client_rds_bw,
        server: socket::run_server_rds_bw,
    },
    Test {
        name: "rds_lat",
        client: socket::run_client_rds_lat,
        server: socket::run_server_rds_lat,
    },
    Test {
        name: "sdp_bw",
        client: socket::run_client_sdp_bw,
        server: socket::run_server_sdp_bw,
    },
    Test {
        name: "sdp_lat",
        client: socket::run_client_sdp_lat,
        server: socket::run_server_sdp_lat,
    },
    Test {
        name: "tcp_bw",
        client: socket::run_client_tcp_bw,
        server: socket::run_server_tcp_bw,
    },
    Test {
        name: "tcp_lat",
        client: socket::run_client_tcp_lat,
        server: socket::run_server_tcp_lat,
    },
    Test {
        name: "udp_bw",
        client: socket::run_client_udp_bw,
        server: socket::run_server_udp_bw,
    },
    Test {
        name: "udp_lat",
        client: socket::run_client_udp_lat,
        server: socket::run_server_udp_lat,
    },
    Test {
        name: "rc_bi_bw",
        client: rdma::run_client_rc_bi_bw,
        server: rdma::run_server_rc_bi_bw,
    },
    Test {
        name: "rc_bw",
        client: rdma::run_client_rc_bw,
        server: rdma::run_server_rc_bw,
    },
    Test {
        name: "rc_compare_swap_mr",
        client: rdma::run_client_rc_compare_swap_mr,
        server: rdma::run_server_rc_compare_swap_mr,
    },
    Test {
        name: "rc_fetch_add_mr",
        client: rdma::run_client_rc_fetch_add_mr,
        server: rdma::run_server_rc_fetch_add_mr,
    },
    Test {
        name: "rc_lat",
        client: rdma::run_client_rc_lat,
        server: rdma::run_server_rc_lat,
    },
    Test {
        name: "rc_rdma_read_bw",
        client: rdma::run_client_rc_rdma_read_bw,
        server: rdma::run_server_rc_rdma_read_bw,
    },
    Test {
        name: "rc_rdma_read_lat",
        client: rdma::run_client_rc_rdma_read_lat,
        server: rdma::run_server_rc_rdma_read_lat,
    },
    Test {
        name: "rc_rdma_write_bw",
        client: rdma::run_client_rc_rdma_write_bw,
        server: rdma::run_server_rc_rdma_write_bw,
    },
    Test {
        name: "rc_rdma_write_lat",
        client: rdma::run_client_rc_rdma_write_lat,
        server: rdma::run_server_rc_rdma_write_lat,
    },
    Test {
        name: "rc_rdma_write_poll_lat",
        client: rdma::run_client_rc_rdma_write_poll_lat,
        server: rdma::run_server_rc_rdma_write_poll_lat,
    },
    Test {
        name: "uc_bi_bw",
        client: rdma::run_client_uc_bi_bw,
        server: rdma::run_server_uc_bi_bw,
    },
    Test {
        name: "uc_bw",
        client: rdma::run_client_uc_bw,
        server: rdma::run_server_uc_bw,
    },
    Test {
        name: "uc_lat",
        client: rdma::run_client_uc_lat,
        server: rdma::run_server_uc_lat,
    },
    Test {
        name: "uc_rdma_write_bw",
        client: rdma::run_client_uc_rdma_write_bw,
        server: rdma::run_server_uc_rdma_write_bw,
    },
    Test {
        name: "uc_rdma_write_lat",
        client: rdma::run_client_uc_rdma_write_lat,
        server: rdma::run_server_uc_rdma_write_lat,
    },
    Test {
        name: "uc_rdma_write_poll_lat",
        client: rdma::run_client_uc_rdma_write_poll_lat,
        server: rdma::run_server_uc_rdma_write_poll_lat,
    },
    Test {
        name: "ud_bi_bw",
        client: rdma::run_client_ud_bi_bw,
        server: rdma::run_server_ud_bi_bw,
    },
    Test {
        name: "ud_bw",
        client: rdma::run_client_ud_bw,
        server: rdma::run_server_ud_bw,
    },
    Test {
        name: "ud_lat",
        client: rdma::run_client_ud_lat,
        server: rdma::run_server_ud_lat,
    },
    Test {
        name: "ver_rc_compare_swap",
        client: rdma::run_client_ver_rc_compare_swap,
        server: rdma::run_server_ver_rc_compare_swap,
    },
    Test {
        name: "ver_rc_fetch_add",
        client: rdma::run_client_ver_rc_fetch_add,
        server: rdma::run_server_ver_rc_fetch_add,
    },
];

pub fn find(name: &str) -> Option<(u16, &'static Test)> {
    TESTS
        .iter()
        .position(|t| t.name == name)
        .map(|i| (i as u16, &TESTS[i]))
}

pub fn by_index(index: u16) -> Option<&'static Test> {
    TESTS.get(usize::from(index))
}

/// Ask the server process to exit. No statistics are exchanged; the
/// barrier just keeps teardown ordered.
fn client_quit(run: &mut Run) -> Result<()> {
    let name = run.test_name.clone();
    run.params.validate(&name)?;
    run.refresh_req();
    run.send_request()?;
    run.ctl.synchronize("quit");
    info!("server asked to quit");
    std::process::exit(0);
}

/// Server side of `quit`: wait for the client to go away first so both
/// ends close down cleanly.
fn server_quit(run: &mut Run) -> Result<()> {
    run.ctl.synchronize("quit");
    let _ = run.ctl.recv_mesg(1, "quit");
    debug!("exiting on client request");
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, a) in TESTS.iter().enumerate() {
            for b in &TESTS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn find_returns_the_wire_index() {
        let (idx, test) = find("tcp_bw").unwrap();
        assert_eq!(test.name, "tcp_bw");
        assert_eq!(by_index(idx).unwrap().name, "tcp_bw");
        assert!(find("tcp_bogus").is_none());
    }

    #[test]
    fn wire_order_is_stable() {
        // the registry index rides inside the request; these positions
        // must never change
        assert_eq!(TESTS[0].name, "quit");
        assert_eq!(TESTS[1].name, "rds_bw");
        assert_eq!(TESTS[5].name, "tcp_bw");
        assert_eq!(TESTS[10].name, "rc_bw");
        assert_eq!(TESTS[29].name, "ver_rc_fetch_add");
        assert_eq!(TESTS.len(), 30);
    }

    #[test]
    fn index_out_of_range_is_rejected() {
        assert!(by_index(TESTS.len() as u16).is_none());
    }
}
