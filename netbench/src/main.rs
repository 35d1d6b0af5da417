//! netbench — measure socket and RDMA performance between two nodes.
//!
//! One binary plays both roles: with a host argument it is the client and
//! runs the named tests; without one it is the server and answers requests
//! until killed (or told to `quit`).

mod args;
mod ctx;
mod rdma;
mod registry;
mod report;
mod socket;

use std::process;

use clap::Parser;
use log::{debug, error, info};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use netbench_core::error::{Error, Result};
use netbench_core::{clock, Control, ParamId};

use args::CmdlineArgs;
use ctx::Run;

/// Default test duration in seconds.
const DEF_TIME: u32 = 2;
/// Default connection timeout in seconds.
const DEF_TIMEOUT: u32 = 5;

fn main() {
    let args = CmdlineArgs::parse();
    let _ = TermLogger::init(
        args.level_filter(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    if let Err(e) = run(&args) {
        eprintln!("netbench: {e}");
        process::exit(1);
    }
}

fn run(args: &CmdlineArgs) -> Result<()> {
    clock::install_signal_handlers()?;
    match &args.host {
        Some(host) => client(args, host),
        None => server(args),
    }
}

fn client(args: &CmdlineArgs, host: &str) -> Result<()> {
    if args.tests.is_empty() {
        return Err(Error::Config(
            "no test specified; try: netbench <host> tcp_bw".into(),
        ));
    }
    let port = args.remote_port.unwrap_or(args.listen_port);
    let wait = args.wait_server.unwrap_or(DEF_TIMEOUT);
    let mut failed = false;

    for name in &args.tests {
        let Some((index, test)) = registry::find(name) else {
            return Err(Error::Config(format!("{name}: bad test")));
        };

        let mut params = args.param_table();
        if params.is_set(ParamId::NoMsgs) {
            params.mark_used(ParamId::Time);
        } else {
            params.set_default(ParamId::Time, DEF_TIME);
        }
        params.set_default(ParamId::Timeout, DEF_TIMEOUT);
        params.mark_used(ParamId::Affinity);

        let ctl = Control::connect(host, port, wait)?;
        let mut run = Run::client(ctl, params, name, index);
        run.set_affinity()?;

        debug!("running {name}");
        match (test.client)(&mut run) {
            Ok(()) => {
                if let Some(param) = &args.print_param {
                    match run.params.display_value(param) {
                        Some(value) => println!("    {param}  =  {value}"),
                        None => error!("{param}: no such parameter"),
                    }
                }
            }
            Err(e) => {
                error!("{name} failed: {e}");
                failed = true;
            }
        }
    }

    if failed {
        Err(Error::Config("one or more tests failed".into()))
    } else {
        Ok(())
    }
}

fn server(args: &CmdlineArgs) -> Result<()> {
    let listener = Control::listen(args.listen_port)?;
    info!("listening for requests on port {}", args.listen_port);
    loop {
        let ctl = match Control::accept(&listener) {
            Ok(ctl) => ctl,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };
        if let Err(e) = serve_one(ctl) {
            error!("{e}");
        }
    }
}

/// Handle one request on a fresh control connection, sequentially; the
/// signal handler for the duration alarm is the only other actor.
fn serve_one(mut ctl: Control) -> Result<()> {
    let req = ctl.recv_request(registry::TESTS.len() as u16)?;
    let test = registry::by_index(req.test_index).ok_or(Error::BadTest(req.test_index))?;
    debug!("received request: {}", test.name);
    let mut run = Run::server(ctl, req, test.name);
    run.set_affinity()?;
    (test.server)(&mut run)
}
