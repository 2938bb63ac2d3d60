//! Where a single compile actually runs

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::dup2;
use ocvm_engine::{compile_bytecode, CodeTuple, CompiledModule, WasmLimits};

use crate::config::WorkerLimits;
use crate::error::{IpcError, OrchestratorError};
use crate::ipc::{read_memfd, write_memfd, Channel, CompileOutcome, CompileRequest, CompileResult, Message};
use crate::worker::WORKER_CHANNEL_FD;

/// Compiles one module; called on a dedicated job thread
pub trait CompileBackend: Send + Sync {
    /// Compile `bytecode`, already verified to hash to `tuple`
    fn compile(&self, tuple: CodeTuple, bytecode: &[u8], limits: &WasmLimits) -> Result<CompiledModule, OrchestratorError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Compiles on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessBackend;

impl CompileBackend for InProcessBackend {
    fn compile(&self, tuple: CodeTuple, bytecode: &[u8], limits: &WasmLimits) -> Result<CompiledModule, OrchestratorError> {
        compile_bytecode(bytecode, limits)
            .map_err(|e| OrchestratorError::CompileFailed { tuple, message: e.to_string() })
    }

    fn name(&self) -> &'static str {
        "thread"
    }
}

/// Runs each compile in a fresh, resource-limited worker process
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    executable: PathBuf,
    limits: WorkerLimits,
}

impl ProcessBackend {
    /// Spawn `executable` for every compile, under `limits`
    pub fn new(executable: PathBuf, limits: WorkerLimits) -> Self {
        ProcessBackend { executable, limits }
    }

    /// Worker binary
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn spawn(&self, child_end: &Channel) -> Result<Child, OrchestratorError> {
        let fd = child_end.as_raw_fd();
        let limits = self.limits.clone();
        let mut command = Command::new(&self.executable);
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::inherit());
        // Safety: the hook runs between fork and exec and only makes
        // async-signal-safe system calls
        unsafe {
            command.pre_exec(move || prepare_worker(fd, &limits));
        }
        command.spawn().map_err(|e| {
            OrchestratorError::Worker(format!("Failed to spawn {}: {}", self.executable.display(), e))
        })
    }

    fn exchange(
        &self,
        channel: &mut Channel,
        tuple: CodeTuple,
        bytecode: &[u8],
        limits: &WasmLimits,
    ) -> Result<CompiledModule, OrchestratorError> {
        let memfd = write_memfd(c"ocvm-bytecode", bytecode)?;
        let request = Message::CompileRequest(CompileRequest { tuple, limits: limits.clone() });
        channel.send(&request, &[memfd.as_raw_fd()])?;
        drop(memfd);

        let (reply, mut fds) = channel.receive()?;
        match reply {
            Message::CompiledCode(compiled) if compiled.tuple == tuple => {
                if fds.len() != 1 {
                    return Err(IpcError::MissingDescriptor { expected: 1, actual: fds.len() }.into());
                }
                let code = read_memfd(fds.remove(0), compiled.code_size)?;
                if code.len() as u64 != compiled.code_size {
                    return Err(IpcError::Unexpected(format!(
                        "code blob of {} bytes, announced {}",
                        code.len(),
                        compiled.code_size
                    ))
                    .into());
                }
                Ok(CompiledModule { code, meta: compiled.meta })
            }
            Message::CompileResult(CompileResult { tuple: failed, result: CompileOutcome::UnknownFailure, .. })
                if failed == tuple =>
            {
                Err(OrchestratorError::CompileFailed {
                    tuple,
                    message: "worker rejected the module".to_string(),
                })
            }
            other => Err(IpcError::Unexpected(other.kind().to_string()).into()),
        }
    }
}

impl CompileBackend for ProcessBackend {
    fn compile(&self, tuple: CodeTuple, bytecode: &[u8], limits: &WasmLimits) -> Result<CompiledModule, OrchestratorError> {
        let (mut channel, child_end) = Channel::pair()?;
        let mut child = self.spawn(&child_end)?;
        drop(child_end);

        let result = self.exchange(&mut channel, tuple, bytecode, limits);
        // Hanging up lets the worker exit
        drop(channel);
        let status = child
            .wait()
            .map_err(|e| OrchestratorError::Worker(format!("Failed to reap worker: {}", e)))?;

        match result {
            Err(OrchestratorError::Ipc(e)) if !status.success() => {
                Err(OrchestratorError::Worker(format!("Worker for {} died ({}): {}", tuple, status, e)))
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Runs in the forked child before exec
fn prepare_worker(fd: RawFd, limits: &WorkerLimits) -> io::Result<()> {
    if fd == WORKER_CHANNEL_FD {
        let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
        fcntl(fd, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
    } else {
        // dup2 leaves the new descriptor inheritable
        dup2(fd, WORKER_CHANNEL_FD)?;
    }

    if limits.cpu_seconds > 0 {
        lower_limit(Resource::RLIMIT_CPU, limits.cpu_seconds)?;
    }
    if limits.address_space_bytes > 0 {
        lower_limit(Resource::RLIMIT_AS, limits.address_space_bytes)?;
    }
    lower_limit(Resource::RLIMIT_CORE, limits.core_dump_bytes)?;
    Ok(())
}

fn lower_limit(resource: Resource, value: u64) -> io::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)?;
    Ok(())
}
