//! BR — Bash Remediation Orchestrator.
//!
//! Bash statically links its own `malloc`/`realloc`/`free`/`memalign` (and,
//! historically, `cfree`). The exported symbols take extra `file`, `line`,
//! `flags` bookkeeping arguments and tail-jump to internal single-purpose
//! routines that are not thread-safe — a problem once this agent's
//! background threads start allocating inside a bash process. This module
//! ties ST (find the symbol), ID (decode the tail-jump to its real target)
//! and HK (redirect that target to a glibc-backed replacement) together,
//! mirroring `run_bash_mem_fix` in the original.

use crate::hook::{self, Hook};
use crate::symbol::{is_defined_in_main_executable, lookup_in_main_executable};
use log::{error, info, warn};
use nix::libc::{c_void, RTLD_NEXT};
use scopeject_common::decoder::find_first_jmp;
use scopeject_common::error::CoreError;
use std::ffi::CString;
use std::sync::OnceLock;

const DECODE_WINDOW: usize = 50;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;

/// Snapshot of the real glibc allocator entry points, resolved once via
/// `dlsym(RTLD_NEXT, ...)` before any hook is armed. A process-wide
/// singleton: there is no reinitialisation path, matching `g_mem_fn` in
/// the original.
struct AllocatorTable {
    malloc: MallocFn,
    realloc: ReallocFn,
    free: FreeFn,
    memalign: MemalignFn,
    cfree: Option<FreeFn>,
}

static ALLOCATORS: OnceLock<AllocatorTable> = OnceLock::new();

fn resolve_next(name: &str) -> Option<*mut c_void> {
    let cname = CString::new(name).ok()?;
    // SAFETY: `RTLD_NEXT` is a read-only query into the dynamic linker's
    // own bookkeeping; `cname` is NUL-terminated and lives for the call.
    let addr = unsafe { nix::libc::dlsym(RTLD_NEXT, cname.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr)
    }
}

fn snapshot_glibc_allocators() -> Result<(), CoreError> {
    let malloc = resolve_next("malloc")
        .ok_or_else(|| CoreError::NotFound("glibc malloc not found via RTLD_NEXT".into()))?;
    let realloc = resolve_next("realloc")
        .ok_or_else(|| CoreError::NotFound("glibc realloc not found via RTLD_NEXT".into()))?;
    let free = resolve_next("free")
        .ok_or_else(|| CoreError::NotFound("glibc free not found via RTLD_NEXT".into()))?;
    let memalign = resolve_next("memalign")
        .ok_or_else(|| CoreError::NotFound("glibc memalign not found via RTLD_NEXT".into()))?;
    let cfree = resolve_next("cfree");

    // SAFETY: each address came from `dlsym` against a symbol known by
    // name to have this signature in glibc.
    let table = unsafe {
        AllocatorTable {
            malloc: std::mem::transmute::<*mut c_void, MallocFn>(malloc),
            realloc: std::mem::transmute::<*mut c_void, ReallocFn>(realloc),
            free: std::mem::transmute::<*mut c_void, FreeFn>(free),
            memalign: std::mem::transmute::<*mut c_void, MemalignFn>(memalign),
            cfree: cfree.map(|p| std::mem::transmute::<*mut c_void, FreeFn>(p)),
        }
    };

    ALLOCATORS
        .set(table)
        .map_err(|_| CoreError::AllocatorMismatch("allocator table already initialized".into()))
}

fn allocators() -> &'static AllocatorTable {
    ALLOCATORS.get().expect("snapshot_glibc_allocators must run before any replacement is called")
}

extern "C" fn replacement_malloc(bytes: usize, _file: *const i8, _line: i32, _flags: i32) -> *mut c_void {
    unsafe { (allocators().malloc)(bytes) }
}

extern "C" fn replacement_realloc(
    ptr: *mut c_void,
    n: usize,
    _file: *const i8,
    _line: i32,
    _flags: i32,
) -> *mut c_void {
    unsafe { (allocators().realloc)(ptr, n) }
}

extern "C" fn replacement_free(ptr: *mut c_void, _file: *const i8, _line: i32, _flags: i32) {
    unsafe { (allocators().free)(ptr) }
}

extern "C" fn replacement_memalign(
    alignment: usize,
    size: usize,
    _file: *const i8,
    _line: i32,
    _flags: i32,
) -> *mut c_void {
    unsafe { (allocators().memalign)(alignment, size) }
}

extern "C" fn replacement_cfree(ptr: *mut c_void, _file: *const i8, _line: i32, _flags: i32) {
    if let Some(cfree) = allocators().cfree {
        unsafe { cfree(ptr) }
    } else {
        unsafe { (allocators().free)(ptr) }
    }
}

struct AllocatorSpec {
    name: &'static str,
    replacement: usize,
    required: bool,
}

fn allocator_specs() -> [AllocatorSpec; 5] {
    [
        AllocatorSpec { name: "malloc", replacement: replacement_malloc as usize, required: true },
        AllocatorSpec { name: "realloc", replacement: replacement_realloc as usize, required: true },
        AllocatorSpec { name: "free", replacement: replacement_free as usize, required: true },
        AllocatorSpec { name: "memalign", replacement: replacement_memalign as usize, required: true },
        // Deprecated and absent from modern glibc; tolerate its absence.
        AllocatorSpec { name: "cfree", replacement: replacement_cfree as usize, required: false },
    ]
}

/// Resolve `name`'s internal (tail-jump) target inside the main executable:
/// `dlsym` finds the exported wrapper, ID decodes forward from it looking
/// for the `JMP` that hands off to the real, unexported implementation.
fn resolve_internal_target(name: &str) -> Result<usize, CoreError> {
    let addr = lookup_in_main_executable(name)?
        .ok_or_else(|| CoreError::NotFound(format!("{name} not found via dlsym")))?;

    // SAFETY: reading code already mapped executable in this process as
    // data; `DECODE_WINDOW` stays within the function body for every
    // allocator wrapper bash ships (enforced by `find_first_jmp`'s own
    // bounds checking on read failure).
    let window = unsafe { std::slice::from_raw_parts(addr as *const u8, DECODE_WINDOW) };
    let insn = find_first_jmp(window, addr as u64)?;
    insn.jmp_target()
        .map(|t| t as usize)
        .ok_or_else(|| CoreError::DecoderFailure(format!("{name}: JMP had no resolvable target")))
}

/// Run the full remediation: confirm every required allocator symbol is
/// present, decode their internal targets, prepare and arm a hook on each.
/// `cfree`'s absence is tolerated; any other allocator missing aborts
/// before any hook is prepared (no harm done to the target process).
pub fn run() -> Result<(), CoreError> {
    snapshot_glibc_allocators()?;

    let specs = allocator_specs();
    // Pre-sized so nothing in this path allocates through bash's own
    // allocator once hooks start arming — only this table's own growth
    // ever reallocates, and it is reserved for the worst case up front.
    let mut hooks: Vec<Hook> = Vec::with_capacity(specs.len());

    for spec in &specs {
        match is_defined_in_main_executable(spec.name) {
            Ok(true) => {}
            Ok(false) => {
                if spec.required {
                    return Err(CoreError::AllocatorMismatch(format!(
                        "required bash allocator symbol {} not found in main executable",
                        spec.name
                    )));
                }
                info!("optional allocator symbol {} not present; skipping", spec.name);
                continue;
            }
            Err(e) => {
                if spec.required {
                    return Err(e);
                }
                warn!("probing optional symbol {} failed: {e}", spec.name);
                continue;
            }
        }

        let internal = resolve_internal_target(spec.name)?;
        let hook = Hook::prepare(spec.name, internal, spec.replacement)?;
        hooks.push(hook);
    }

    if hooks.is_empty() {
        return Err(CoreError::AllocatorMismatch(
            "no bash allocator symbols resolved".into(),
        ));
    }

    let results = hook::arm_all(&mut hooks);
    let armed = results.iter().filter(|r| r.is_ok()).count();
    for (hook, result) in hooks.iter().zip(&results) {
        if result.is_err() {
            error!("{}", arm_failure_message(hook.name()));
        }
    }

    if armed < hooks.len() {
        // Hooks that did arm stay armed: no rollback. A partial remediation
        // is still a failure to report, per the all-or-nothing contract.
        return Err(CoreError::HookArmFailure(partial_arm_message(armed, hooks.len())));
    }

    Ok(())
}

/// Pre-formatted per-hook failure message, chosen by name rather than
/// built from the hook's error at the call site: this runs right after
/// `arm_all`, while other hooks may still be mid-patch, so it must not
/// touch the heap formatting machinery `log`'s runtime interpolation goes
/// through.
fn arm_failure_message(name: &str) -> &'static str {
    match name {
        "malloc" => "bash allocator remediation: failed to arm malloc hook",
        "realloc" => "bash allocator remediation: failed to arm realloc hook",
        "free" => "bash allocator remediation: failed to arm free hook",
        "memalign" => "bash allocator remediation: failed to arm memalign hook",
        "cfree" => "bash allocator remediation: failed to arm cfree hook",
        _ => "bash allocator remediation: failed to arm an allocator hook",
    }
}

/// Pre-formatted pass/fail summary for the tail of `run`, picked from a
/// small table of the only `(armed, total)` pairs this module can ever
/// produce (`total` is fixed at 5 allocator specs) instead of formatting
/// the counts into a `String` at runtime.
fn partial_arm_message(armed: usize, total: usize) -> &'static str {
    match (armed, total) {
        (0, _) => "bash allocator remediation: armed 0 hooks, all failed",
        (1, 5) => "bash allocator remediation: armed 1/5 hooks, continuing with a partial remediation",
        (2, 5) => "bash allocator remediation: armed 2/5 hooks, continuing with a partial remediation",
        (3, 5) => "bash allocator remediation: armed 3/5 hooks, continuing with a partial remediation",
        (4, 5) => "bash allocator remediation: armed 4/5 hooks, continuing with a partial remediation",
        _ => "bash allocator remediation: armed some but not all allocator hooks",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_specs_cover_the_expected_five_names() {
        let specs = allocator_specs();
        let names: Vec<_> = specs.iter().map(|s| s.name).collect();
        assert_eq!(names, ["malloc", "realloc", "free", "memalign", "cfree"]);
        assert!(!specs[4].required, "cfree must be optional");
        assert!(specs[..4].iter().all(|s| s.required));
    }
}
