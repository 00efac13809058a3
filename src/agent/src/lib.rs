//! The in-process agent: the shared object the injector `dlopen`s into a
//! target process. `scopeject_agent_init` is its sole exported entry point.

mod bashmem;
mod hook;
mod symbol;

use log::{error, info};
use scopeject_common::dbg::LineTable;
use std::sync::OnceLock;

static DIAGNOSTICS: OnceLock<LineTable> = OnceLock::new();

fn diagnostics() -> &'static LineTable {
    DIAGNOSTICS.get_or_init(LineTable::new)
}

fn running_inside_bash() -> bool {
    std::fs::read_link("/proc/self/exe")
        .map(|p| p.to_string_lossy().ends_with("/bash"))
        .unwrap_or(false)
}

/// Called once, immediately after this object is `dlopen`'d into the
/// target. Always returns `0`: bash remediation failures are logged and
/// otherwise non-fatal to the agent, per the error-handling policy.
#[unsafe(no_mangle)]
pub extern "C" fn scopeject_agent_init() -> i32 {
    let _ = env_logger::try_init();
    info!("scopeject agent initialised in pid {}", std::process::id());

    if running_inside_bash() {
        match bashmem::run() {
            Ok(()) => info!("bash allocator remediation installed"),
            Err(e) => {
                error!("bash allocator remediation failed: {e}");
                diagnostics().record("agent: bash_mem_fix failed", None, e.to_string());
            }
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_table_is_usable_before_any_init_call() {
        diagnostics().record("test: smoke", None, "ok".into());
        assert_eq!(diagnostics().claimed_lines(), 1);
    }
}
