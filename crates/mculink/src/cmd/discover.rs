use std::sync::Arc;
use std::thread;

use mculink_session::Session;
use mculink_transport::TcpLink;

use crate::cmd::{parse_timeout, DiscoverArgs};
use crate::exit::{session_error, transport_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_nodes, OutputFormat};

pub fn run(args: DiscoverArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;

    let (link, chunks) =
        TcpLink::connect(&args.addr).map_err(|err| transport_error("connect failed", err))?;
    let session = Session::start(Arc::new(link), chunks)
        .map_err(|err| session_error("session start failed", err))?;

    session
        .discover()
        .map_err(|err| session_error("discovery failed", err))?;
    thread::sleep(timeout);

    let nodes = session.snapshots();
    session.shutdown();

    if nodes.is_empty() {
        eprintln!("no nodes answered within {}", args.timeout);
        return Ok(FAILURE);
    }
    print_nodes(&nodes, format);
    Ok(SUCCESS)
}
