//! Process-wide diagnostic sink for the injector's PM/PT/LL/IN failure
//! paths, the same `LineTable` collaborator the agent keeps for its own
//! ST/HK/BR failures (`scopeject_agent::diagnostics`). A single instance
//! is enough here: the injector is a short-lived one-shot CLI, not a
//! long-running server, so there is exactly one remote-injection attempt
//! per process to account for.

use scopeject_common::dbg::LineTable;
use scopeject_common::error::CoreError;
use std::sync::OnceLock;

static DIAGNOSTICS: OnceLock<LineTable> = OnceLock::new();

fn diagnostics() -> &'static LineTable {
    DIAGNOSTICS.get_or_init(LineTable::new)
}

/// Record a `CoreError` against a compile-time-constant key, coalescing
/// repeated occurrences of the same failure site the way every other
/// `DebugLineTable` caller does.
pub fn record_error(key: &'static str, err: &CoreError) {
    diagnostics().record(key, None, err.to_string());
}
