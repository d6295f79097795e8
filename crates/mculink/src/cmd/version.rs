use mculink_proto::FirmwareVersion;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("mculink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!(
        "mculink {} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!("wire protocol versions: {}", supported_protocols());
    println!("session engine: {}", feature_state(cfg!(feature = "session")));
    println!("device emulator: {}", feature_state(cfg!(feature = "emulator")));

    Ok(SUCCESS)
}

/// Protocol versions with a known control-byte layout.
fn supported_protocols() -> String {
    [
        FirmwareVersion::V0_7,
        FirmwareVersion::V0_8,
        FirmwareVersion::V1_0,
    ]
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join(", ")
}

fn feature_state(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
