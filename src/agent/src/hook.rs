//! HK — In-Process Hook Installer.
//!
//! Replaces the first few instructions of a function already mapped into
//! this process with a branch to a replacement, keeping a trampoline copy
//! of the displaced bytes so the original behaviour stays reachable. This
//! is the native equivalent of the original's `funchook_prepare` /
//! `funchook_install` pair — there is no `funchook` crate in this
//! ecosystem, so the patching is done directly with `mmap`/`mprotect`.
//!
//! Two branch encodings are used depending on reachability:
//! - a 5-byte `E9 rel32` when the target is within `i32` range of the
//!   instruction that follows the branch;
//! - a 13-byte `movabs r11, target; jmp r11` otherwise, since a victim
//!   function and a replacement living in this agent's own shared object
//!   can easily end up more than 2 GiB apart once ASLR has its say.
//!
//! Every hook reserves room for the worst case (13 bytes) when deciding how
//! many prologue bytes to displace, so arming never has to re-decide the
//! displaced length after the fact.

use log::{debug, warn};
use nix::sys::mman::{mprotect, MapFlags, ProtFlags};
use scopeject_common::decoder::decode_one;
use scopeject_common::error::CoreError;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

const PAGE_SIZE: usize = 4096;
/// Longest branch encoding this module ever writes (`movabs` + `jmp`).
const MAX_BRANCH_LEN: usize = 13;
/// Upper bound on how far into a function `prepare` will walk looking for
/// an instruction boundary at or past `MAX_BRANCH_LEN`.
const MAX_DISPLACED_LEN: usize = 32;
/// How many candidate pages either side of the victim `alloc_near` tries
/// before giving up on proximity and taking whatever the kernel offers.
const NEARBY_SEARCH_STEPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Prepared,
    Armed,
    Disarmed,
}

fn page_floor(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Encode a branch from the instruction that starts at `branch_at` to
/// `target`, preferring the shortest form that can reach. Returns the bytes
/// and how many of them are the "real" branch versus trailing padding (the
/// caller pads the rest up to the displaced length with `NOP`).
fn encode_branch(branch_at: usize, target: usize) -> Vec<u8> {
    let rel32_end = branch_at as i64 + 5;
    let rel = target as i64 - rel32_end;
    if let Ok(rel32) = i32::try_from(rel) {
        let mut bytes = vec![0xE9];
        bytes.extend_from_slice(&rel32.to_le_bytes());
        return bytes;
    }

    // movabs r11, target ; jmp r11
    let mut bytes = vec![0x49, 0xBB];
    bytes.extend_from_slice(&(target as u64).to_le_bytes());
    bytes.extend_from_slice(&[0x41, 0xFF, 0xE3]);
    bytes
}

/// Walk instructions starting at `victim_addr` (reading this process's own
/// memory directly — HK never touches another process) until the
/// accumulated length is at least `min_len`, capped at `MAX_DISPLACED_LEN`.
fn displaced_len_covering(victim_addr: usize, min_len: usize) -> Result<usize, CoreError> {
    // SAFETY: `victim_addr` names a function already mapped and executable
    // in this process; reading `MAX_DISPLACED_LEN` bytes from it as data
    // does not execute anything.
    let window = unsafe { std::slice::from_raw_parts(victim_addr as *const u8, MAX_DISPLACED_LEN) };

    let mut len = 0usize;
    while len < min_len {
        if len >= MAX_DISPLACED_LEN {
            return Err(CoreError::HookPrepareFailure(format!(
                "no instruction boundary at or past {min_len} bytes within {MAX_DISPLACED_LEN}-byte cap at 0x{victim_addr:x}"
            )));
        }
        let insn = decode_one(&window[len..], (victim_addr + len) as u64)?;
        len += insn.length as usize;
    }
    Ok(len)
}

/// A writable+executable page allocated, on a best-effort basis, close to
/// the victim function so the continuation branch it holds can use the
/// short `rel32` form.
struct TrampolinePage {
    addr: NonNull<c_void>,
    len: usize,
}

impl TrampolinePage {
    fn alloc_near(victim_addr: usize) -> Result<Self, CoreError> {
        let victim_page = page_floor(victim_addr);
        let len = NonZeroUsize::new(PAGE_SIZE).unwrap();
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let anon_private = MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE;

        for step in 0..NEARBY_SEARCH_STEPS {
            for sign in [1i64, -1] {
                if step == 0 && sign < 0 {
                    continue; // step 0 tried once already
                }
                let candidate = victim_page as i64 + sign * (step as i64) * PAGE_SIZE as i64;
                if candidate <= 0 {
                    continue;
                }
                let Some(hint) = NonZeroUsize::new(candidate as usize) else {
                    continue;
                };
                let flags = anon_private | MapFlags::MAP_FIXED_NOREPLACE;
                // SAFETY: anonymous mapping, no file descriptor involved.
                if let Ok(addr) = unsafe { nix::sys::mman::mmap_anonymous(Some(hint), len, prot, flags) }
                {
                    return Ok(Self { addr, len: PAGE_SIZE });
                }
            }
        }

        debug!("no page within {NEARBY_SEARCH_STEPS} pages of 0x{victim_addr:x}; falling back to a kernel-chosen address");
        // SAFETY: anonymous mapping, no hint required.
        let addr = unsafe { nix::sys::mman::mmap_anonymous(None, len, prot, anon_private) }
            .map_err(|e| CoreError::HookPrepareFailure(format!("mmap trampoline: {e}")))?;
        Ok(Self { addr, len: PAGE_SIZE })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr() as *mut u8
    }

    fn address(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);
        // SAFETY: `offset + bytes.len() <= self.len`, and this page is
        // privately owned by this `TrampolinePage`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), bytes.len());
        }
    }

    fn make_executable(&self) -> Result<(), CoreError> {
        // SAFETY: `addr` is a page-aligned mapping owned by this struct.
        unsafe {
            mprotect(self.addr, self.len, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC)
        }
        .map_err(|e| CoreError::HookPrepareFailure(format!("mprotect trampoline: {e}")))
    }
}

impl Drop for TrampolinePage {
    fn drop(&mut self) {
        // SAFETY: `addr`/`len` describe exactly the mapping `alloc_near`
        // created.
        if let Err(e) = unsafe { nix::sys::mman::munmap(self.addr, self.len) } {
            warn!("munmap trampoline page: {e}");
        }
    }
}

/// One prepared (and, once armed, installed) hook.
pub struct Hook {
    name: &'static str,
    victim: usize,
    displaced_len: usize,
    saved_prologue: Vec<u8>,
    victim_branch: Vec<u8>,
    trampoline: TrampolinePage,
    state: HookState,
}

impl Hook {
    /// Prepare (but do not yet install) a hook redirecting `victim_addr` to
    /// `replacement`. Building the trampoline and computing the branch
    /// encoding happens here; `arm` only performs the write.
    pub fn prepare(name: &'static str, victim_addr: usize, replacement: usize) -> Result<Self, CoreError> {
        let victim_branch = encode_branch(victim_addr, replacement);
        let displaced_len = displaced_len_covering(victim_addr, MAX_BRANCH_LEN)?;

        // SAFETY: see `displaced_len_covering`; same invariant applies here.
        let saved_prologue =
            unsafe { std::slice::from_raw_parts(victim_addr as *const u8, displaced_len) }.to_vec();

        let trampoline = TrampolinePage::alloc_near(victim_addr)?;
        trampoline.write(0, &saved_prologue);

        let cont_from = trampoline.address() + displaced_len;
        let cont_target = victim_addr + displaced_len;
        let cont_branch = encode_branch(cont_from, cont_target);
        trampoline.write(displaced_len, &cont_branch);
        trampoline.make_executable()?;

        debug!(
            "prepared hook {name}: victim=0x{victim_addr:x} displaced_len={displaced_len} trampoline=0x{:x}",
            trampoline.address()
        );

        Ok(Self {
            name,
            victim: victim_addr,
            displaced_len,
            saved_prologue,
            victim_branch,
            trampoline,
            state: HookState::Prepared,
        })
    }

    /// Address of the callable copy of the displaced prologue; a
    /// replacement that wants to invoke the original behaviour jumps here.
    pub fn trampoline_entry(&self) -> usize {
        self.trampoline.address()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> HookState {
        self.state
    }

    /// Overwrite the victim's displaced bytes with `bytes`, padded with
    /// `NOP` out to `self.displaced_len`, writing the trailing bytes first
    /// and the branch's first opcode byte last as a single store so no
    /// other thread ever observes a torn instruction sequence.
    fn patch_victim(&self, bytes: &[u8]) -> Result<(), CoreError> {
        assert!(bytes.len() <= self.displaced_len);
        let mut padded = bytes.to_vec();
        padded.resize(self.displaced_len, 0x90);

        let start_page = page_floor(self.victim);
        let end = self.victim + self.displaced_len;
        let span = end - start_page;
        let page_addr = NonNull::new(start_page as *mut c_void).unwrap();

        // SAFETY: `span` covers exactly the pages spanned by the write
        // below, rounded up by the caller via `start_page`/`end`.
        unsafe {
            mprotect(
                page_addr,
                span.div_ceil(PAGE_SIZE) * PAGE_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )
        }
        .map_err(|e| CoreError::HookArmFailure(format!("mprotect victim page writable: {e}")))?;

        let victim_ptr = self.victim as *mut u8;
        if padded.len() > 1 {
            // SAFETY: within the bytes just made writable above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    padded[1..].as_ptr(),
                    victim_ptr.add(1),
                    padded.len() - 1,
                );
            }
        }
        // SAFETY: a single aligned byte store; naturally atomic on x86-64.
        unsafe {
            std::ptr::write_volatile(victim_ptr, padded[0]);
        }

        // SAFETY: restoring the original protection flags for hygiene;
        // best-effort, failure here does not invalidate the write above.
        if let Err(e) = unsafe {
            mprotect(
                page_addr,
                span.div_ceil(PAGE_SIZE) * PAGE_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            )
        } {
            warn!("mprotect victim page back to r-x: {e}");
        }

        Ok(())
    }

    /// Install the branch to the replacement at the victim's address.
    pub fn arm(&mut self) -> Result<(), CoreError> {
        self.patch_victim(&self.victim_branch)?;
        self.state = HookState::Armed;
        debug!("armed hook {}", self.name);
        Ok(())
    }

    /// Restore the original displaced bytes.
    pub fn disarm(&mut self) -> Result<(), CoreError> {
        self.patch_victim(&self.saved_prologue)?;
        self.state = HookState::Disarmed;
        debug!("disarmed hook {}", self.name);
        Ok(())
    }
}

/// Arm every hook in `hooks`, reporting per-hook success. A failure arming
/// one hook does not prevent the others from being attempted — callers
/// decide whether a partial batch is acceptable.
pub fn arm_all(hooks: &mut [Hook]) -> Vec<Result<(), CoreError>> {
    hooks.iter_mut().map(Hook::arm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel32_branch_is_five_bytes_when_reachable() {
        let bytes = encode_branch(0x1000, 0x2000);
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(bytes.len(), 5);
    }

    #[test]
    fn absolute_branch_is_used_when_unreachable() {
        let bytes = encode_branch(0x1000, 0x1000_0000_0000);
        assert_eq!(bytes[0], 0x49);
        assert_eq!(bytes.len(), 13);
    }

    #[test]
    fn prepare_and_arm_a_hook_on_a_real_function() {
        extern "C" fn victim(x: i32) -> i32 {
            x + 1
        }
        extern "C" fn replacement(x: i32) -> i32 {
            x + 100
        }

        let mut hook =
            Hook::prepare("test::victim", victim as usize, replacement as usize).unwrap();
        assert_eq!(hook.state(), HookState::Prepared);

        hook.arm().unwrap();
        assert_eq!(hook.state(), HookState::Armed);

        let result = victim(1);
        assert_eq!(result, 101, "call through the patched entry point must reach the replacement");

        hook.disarm().unwrap();
        assert_eq!(hook.state(), HookState::Disarmed);
        assert_eq!(victim(1), 2, "disarm must restore the original body");
    }
}
