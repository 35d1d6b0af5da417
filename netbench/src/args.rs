//! Command-line arguments.
//!
//! Combined options apply to both nodes: the values land in the local and
//! remote views of the parameter table and the remote view rides to the
//! server inside the request.

use clap::{ArgAction, Parser};
use simplelog::LevelFilter;

use netbench_core::{ParamId, ParamTable, DEFAULT_CONTROL_PORT};

#[derive(Debug, Parser)]
#[command(name = "netbench")]
#[command(about = "Measure socket and RDMA performance between two nodes")]
pub struct CmdlineArgs {
    /// Increase verbosity; repeat for more detail
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Control-channel port the server listens on
    #[arg(long = "lp", value_name = "PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    pub listen_port: u16,

    /// Control-channel port the client connects to
    #[arg(long = "rp", value_name = "PORT")]
    pub remote_port: Option<u16>,

    /// Pin the data socket to this port instead of an ephemeral one
    #[arg(long = "ip", value_name = "PORT")]
    pub ip_port: Option<u32>,

    /// Print the effective value of a named parameter after each test
    #[arg(long = "op", value_name = "NAME")]
    pub print_param: Option<String>,

    /// Test duration in seconds
    #[arg(short = 't', long = "time", value_name = "SECS")]
    pub time: Option<u32>,

    /// Message size in bytes
    #[arg(short = 'M', long = "msg-size", value_name = "BYTES")]
    pub msg_size: Option<u32>,

    /// Path MTU for the RDMA transports (256/512/1024/2048/4096)
    #[arg(short = 'm', long = "mtu-size", value_name = "BYTES")]
    pub mtu_size: Option<u32>,

    /// Socket send and receive buffer size
    #[arg(short = 'B', long = "sock-buf-size", value_name = "BYTES")]
    pub sock_buf_size: Option<u32>,

    /// RDMA device to use, "device[:port]"
    #[arg(short = 'I', long = "id", value_name = "DEV")]
    pub id: Option<String>,

    /// Static rate of the link, e.g. "4xQDR" or "10"
    #[arg(short = 'r', long = "rate", value_name = "RATE")]
    pub rate: Option<String>,

    /// Spin on the completion queue instead of sleeping on events
    #[arg(short = 'P', long = "poll-mode")]
    pub poll_mode: bool,

    /// Number of outstanding RDMA reads and atomics
    #[arg(short = 'A', long = "rd-atomic", value_name = "N")]
    pub rd_atomic: Option<u32>,

    /// Stop after this many messages instead of a fixed duration
    #[arg(long = "nm", value_name = "COUNT")]
    pub no_msgs: Option<u32>,

    /// Pin the process to this CPU (1-based; 0 leaves it unpinned)
    #[arg(long = "ca", value_name = "CPU")]
    pub affinity: Option<u32>,

    /// Touch received data before accounting it
    #[arg(long = "ar")]
    pub access_recv: bool,

    /// Exchange the sending and receiving roles of the two nodes
    #[arg(short = 'f', long = "flip")]
    pub flip: bool,

    /// Connection timeout in seconds
    #[arg(long = "to", value_name = "SECS")]
    pub timeout: Option<u32>,

    /// Alternate data port
    #[arg(long = "ap", value_name = "PORT")]
    pub alt_port: Option<u32>,

    /// Seconds to wait for the server to come up
    #[arg(long = "ws", value_name = "SECS")]
    pub wait_server: Option<u32>,

    /// Server host; with no host, run as the server
    pub host: Option<String>,

    /// Tests to run, e.g. tcp_bw rc_rdma_read_lat
    pub tests: Vec<String>,
}

impl CmdlineArgs {
    /// Fold the command line into a fresh parameter table.
    pub fn param_table(&self) -> ParamTable {
        let mut t = ParamTable::new();
        let u32_opts = [
            (ParamId::Time, self.time),
            (ParamId::MsgSize, self.msg_size),
            (ParamId::MtuSize, self.mtu_size),
            (ParamId::SockBufSize, self.sock_buf_size),
            (ParamId::RdAtomic, self.rd_atomic),
            (ParamId::NoMsgs, self.no_msgs),
            (ParamId::Affinity, self.affinity),
            (ParamId::Timeout, self.timeout),
            (ParamId::Port, self.ip_port),
            (ParamId::AltPort, self.alt_port),
        ];
        for (id, value) in u32_opts {
            if let Some(v) = value {
                t.set_by_user_u32(id, v);
            }
        }
        if self.poll_mode {
            t.set_by_user_u32(ParamId::PollMode, 1);
        }
        if self.access_recv {
            t.set_by_user_u32(ParamId::AccessRecv, 1);
        }
        if self.flip {
            t.set_by_user_u32(ParamId::Flip, 1);
        }
        if let Some(id) = &self.id {
            t.set_by_user_str(ParamId::Id, id);
        }
        if let Some(rate) = &self.rate {
            t.set_by_user_str(ParamId::Rate, rate);
        }
        t
    }

    pub fn level_filter(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_invocation_parses() {
        let args =
            CmdlineArgs::parse_from(["netbench", "-t", "2", "-M", "65536", "node1", "tcp_bw"]);
        assert_eq!(args.host.as_deref(), Some("node1"));
        assert_eq!(args.tests, ["tcp_bw"]);
        let t = args.param_table();
        assert_eq!(t.local.time, 2);
        assert_eq!(t.remote.msg_size, 65536);
    }

    #[test]
    fn server_invocation_has_no_host() {
        let args = CmdlineArgs::parse_from(["netbench", "--lp", "4000"]);
        assert!(args.host.is_none());
        assert_eq!(args.listen_port, 4000);
    }

    #[test]
    fn flags_become_parameters() {
        let args = CmdlineArgs::parse_from(["netbench", "-P", "--ar", "host", "rc_bw"]);
        let t = args.param_table();
        assert_eq!(t.local.poll_mode, 1);
        assert_eq!(t.local.access_recv, 1);
        assert!(t.is_set(ParamId::PollMode));
    }

    #[test]
    fn unset_options_stay_unset() {
        let args = CmdlineArgs::parse_from(["netbench", "host", "udp_lat"]);
        let t = args.param_table();
        assert!(!t.is_set(ParamId::MsgSize));
        assert!(!t.is_set(ParamId::Rate));
    }
}
