//! OCVM compile worker (ocvm-compile-worker)
//!
//! Spawned by the compile orchestrator with its channel on fd 3. Not meant
//! to be run by hand.

use std::os::unix::io::FromRawFd;
use std::process::ExitCode;

use ocvm_runtime::ipc::Channel;
use ocvm_runtime::worker::{serve, WORKER_CHANNEL_FD};

fn main() -> ExitCode {
    env_logger::init();

    // Safety: the orchestrator installs the channel at this descriptor
    // before exec and nothing else in this process owns it
    let channel = unsafe { Channel::from_raw_fd(WORKER_CHANNEL_FD) };

    match serve(channel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Compile worker failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
