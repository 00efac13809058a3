//! Injector (IN): orchestrates PM, LL and PT to land the agent's shared
//! object in a running target process via a staged `dlopen` call.

use crate::diagnostics::record_error;
use crate::local_loader::{find_local_object, resolve_local_dlopen};
use crate::proc_maps::{find_free_executable_addr, find_object_base};
use crate::ptrace::{PtraceController, StopReason};
use crate::thunk::{self, ThunkPlan};
use log::info;
use nix::libc::RTLD_LAZY;
use scopeguard::defer;
use scopeject_common::error::CoreError;

/// Size of the scratch window saved and restored around the thunk,
/// matching the original's `oldcodeSize = 256`.
const SAVED_WINDOW_SIZE: usize = 256;

/// Candidate object names known to export `dlopen`: glibc >= 2.34 merged
/// `libdl` into `libc`, so both are tried in order.
const DLOPEN_HOST_CANDIDATES: &[&str] = &["libc.so.6", "libdl.so"];

fn resolve_remote_dlopen(pid: i32) -> Result<u64, CoreError> {
    let dlopen_local = resolve_local_dlopen()
        .inspect_err(|e| record_error("injector: resolve_local_dlopen failed", e))?;

    let mut last_err = None;
    for candidate in DLOPEN_HOST_CANDIDATES {
        match find_local_object(candidate) {
            Ok(local) => {
                let remote_base = find_object_base(pid, candidate)
                    .inspect_err(|e| record_error("injector: find_object_base failed", e))?;
                let slide = remote_base as i64 - local.local_base as i64;
                return Ok((dlopen_local as i64 + slide) as u64);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let err = last_err.unwrap_or_else(|| CoreError::NotFound("no dlopen host object found".into()));
    record_error("injector: no dlopen host object found", &err);
    Err(err)
}

/// Inject `agent_path` (an absolute path to a shared object) into `pid`.
/// On success returns the `dlopen` handle reported by the target. Every
/// error path restores the target's saved memory window and registers and
/// detaches before the error surfaces — the target's observable state
/// after this function returns differs from its pre-call state only in
/// the presence of the newly mapped object and `dlopen`'s side effects.
pub fn inject(pid: i32, agent_path: &str) -> Result<u64, CoreError> {
    let path_bytes = thunk::encode_path(agent_path)
        .inspect_err(|e| record_error("injector: encode_path failed", e))?;
    let dlopen_remote = resolve_remote_dlopen(pid)?;
    let scratch = find_free_executable_addr(pid)
        .inspect_err(|e| record_error("injector: find_free_executable_addr failed", e))?;

    info!(
        "injecting {agent_path} into pid {pid}: dlopen@0x{dlopen_remote:x}, scratch@0x{scratch:x}"
    );

    let pt = PtraceController::new(pid);
    pt.attach()
        .inspect_err(|e| record_error("injector: ptrace attach failed", e))?;
    defer! {
        if let Err(e) = pt.detach() {
            record_error("injector: ptrace detach failed", &e);
        }
    }

    let saved_regs = pt
        .get_regs()
        .inspect_err(|e| record_error("injector: ptrace get_regs failed", e))?;
    let saved_window = pt
        .read_mem(scratch, SAVED_WINDOW_SIZE)
        .inspect_err(|e| record_error("injector: ptrace read_mem failed", e))?;

    defer! {
        if let Err(e) = pt.write_mem(scratch, &saved_window) {
            record_error("injector: restore scratch window failed", &e);
        }
        if let Err(e) = pt.set_regs(&saved_regs) {
            record_error("injector: restore registers failed", &e);
        }
    }

    let plan = ThunkPlan::new(scratch, dlopen_remote);
    pt.write_mem(plan.path_address(), &path_bytes)
        .inspect_err(|e| record_error("injector: write agent path failed", e))?;
    pt.write_mem(plan.thunk_entry(), &thunk::thunk_bytes())
        .inspect_err(|e| record_error("injector: write thunk failed", e))?;

    let mut regs = saved_regs.clone();
    regs.set_rip(plan.thunk_entry());
    regs.set_rax(dlopen_remote);
    regs.set_rdi(plan.path_address());
    regs.set_rsi(RTLD_LAZY as u64);
    pt.set_regs(&regs)
        .inspect_err(|e| record_error("injector: set staged registers failed", e))?;

    let handle = match pt
        .cont_until_trap()
        .inspect_err(|e| record_error("injector: ptrace cont failed", e))?
    {
        StopReason::Trap => pt
            .get_regs()
            .inspect_err(|e| record_error("injector: ptrace get_regs failed", e))?
            .rax(),
        StopReason::Other(sig) => {
            let err = CoreError::ProtocolViolation(format!(
                "target stopped by signal {sig}, expected SIGTRAP"
            ));
            record_error("injector: target stopped by unexpected signal", &err);
            return Err(err);
        }
        StopReason::Exited(code) => {
            let err = CoreError::ProtocolViolation(format!(
                "target exited with code {code} before reaching the thunk's int3"
            ));
            record_error("injector: target exited before int3", &err);
            return Err(err);
        }
    };

    if handle == 0 {
        let err = CoreError::NotFound(format!(
            "dlopen({agent_path:?}) returned NULL in the target process"
        ));
        record_error("injector: dlopen returned NULL", &err);
        return Err(err);
    }

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};
    use std::time::Duration;

    fn spawn_pausing_child() -> nix::unistd::Pid {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => loop {
                nix::unistd::pause();
                std::thread::sleep(Duration::from_millis(10));
            },
            ForkResult::Parent { child } => child,
        }
    }

    #[test]
    #[ignore = "requires ptrace permissions and a real injectable .so in the sandbox"]
    fn inject_into_sleeper_reports_not_found_for_bad_path() {
        let child = spawn_pausing_child();
        defer! {
            let _ = signal::kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
        }

        let err = inject(child.as_raw(), "/does/not/exist").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
