use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use mculink_session::{Notification, Session};
use mculink_transport::TcpLink;

use crate::cmd::WatchArgs;
use crate::exit::{session_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_notification, OutputFormat};

const EVENT_POLL: Duration = Duration::from_millis(100);

pub fn run(args: WatchArgs, format: OutputFormat) -> CliResult<i32> {
    let (link, chunks) =
        TcpLink::connect(&args.addr).map_err(|err| transport_error("connect failed", err))?;
    let session = Session::start(Arc::new(link), chunks)
        .map_err(|err| session_error("session start failed", err))?;
    let events = session.subscribe();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    session
        .discover()
        .map_err(|err| session_error("discovery failed", err))?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let event = match events.recv_timeout(EVENT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // Decimation can only be requested once a node is known.
        if let (Notification::NodeDiscovered { node_id, .. }, Some(decimation)) =
            (&event, args.decimation)
        {
            if let Err(err) = session.set_decimation(*node_id, decimation) {
                return Err(session_error("set decimation failed", err));
            }
        }

        print_notification(&event, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    session.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
