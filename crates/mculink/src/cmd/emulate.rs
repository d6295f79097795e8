use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use mculink_emulator::{Emulator, EmulatorConfig};
use mculink_transport::{Link, TcpServer};

use crate::cmd::EmulateArgs;
use crate::exit::{emulator_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: EmulateArgs) -> CliResult<i32> {
    let server =
        TcpServer::bind(&args.addr).map_err(|err| transport_error("bind failed", err))?;
    info!(addr = server.local_addr(), node_id = args.node_id, "emulator listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    // One emulated node per host connection; instances stop on drop.
    let mut instances = Vec::new();
    while running.load(Ordering::SeqCst) {
        let (link, chunks) = match server.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                return Err(transport_error("accept failed", err));
            }
        };
        info!(peer = %link.peer_label(), "host connected");
        let emulator = Emulator::start(
            Arc::new(link),
            chunks,
            EmulatorConfig::demo(args.node_id),
        )
        .map_err(|err| emulator_error("emulator start failed", err))?;
        instances.push(emulator);
    }

    drop(instances);
    std::thread::sleep(Duration::from_millis(50));
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
