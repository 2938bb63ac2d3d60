//! Compile worker loop
//!
//! Runs inside `ocvm-compile-worker`. The worker never touches the code
//! cache: it reads bytecode from the memfd attached to each request,
//! compiles it, and hands the blob back in a memfd of its own. Placing the
//! blob in the cache is the orchestrator's job.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use ocvm_engine::{compile_bytecode, CodeTuple, CompiledModule, ContentHash};

use crate::error::IpcError;
use crate::ipc::{
    read_memfd, write_memfd, Channel, CompileOutcome, CompileRequest, CompileResult, CompiledCode, Message,
};

/// Descriptor number the channel is installed at in a worker process
pub const WORKER_CHANNEL_FD: RawFd = 3;

/// Answer compile requests until the orchestrator hangs up
pub fn serve(mut channel: Channel) -> Result<(), IpcError> {
    loop {
        let (message, mut fds) = match channel.receive() {
            Ok(received) => received,
            Err(IpcError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let Message::CompileRequest(request) = message else {
            return Err(IpcError::Unexpected(message.kind().to_string()));
        };
        if fds.len() != 1 {
            return Err(IpcError::MissingDescriptor { expected: 1, actual: fds.len() });
        }
        let bytecode = fds.remove(0);

        match compile(&request, bytecode) {
            Ok(compiled) => {
                let code = write_memfd(c"ocvm-code", &compiled.code)?;
                let reply = Message::CompiledCode(CompiledCode {
                    tuple: request.tuple,
                    code_size: compiled.code.len() as u64,
                    meta: compiled.meta,
                });
                channel.send(&reply, &[code.as_raw_fd()])?;
            }
            Err(message) => {
                log::warn!("Compile of {} failed: {}", request.tuple, message);
                let reply = Message::CompileResult(CompileResult {
                    tuple: request.tuple,
                    result: CompileOutcome::UnknownFailure,
                    cache_free_bytes: 0,
                });
                channel.send(&reply, &[])?;
            }
        }
    }
}

fn compile(request: &CompileRequest, bytecode: OwnedFd) -> Result<CompiledModule, String> {
    let bytes = read_memfd(bytecode, request.limits.max_code_bytes).map_err(|e| e.to_string())?;
    check_hash(request.tuple, &bytes)?;
    log::debug!("Compiling {} ({} bytes)", request.tuple, bytes.len());
    compile_bytecode(&bytes, &request.limits).map_err(|e| e.to_string())
}

fn check_hash(tuple: CodeTuple, bytes: &[u8]) -> Result<(), String> {
    let actual = ContentHash::of(bytes);
    if actual != tuple.code_hash {
        return Err(format!("bytecode hashes to {}", actual));
    }
    Ok(())
}
