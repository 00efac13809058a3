//! The injection thunk: a hand-assembled x86-64 byte sequence, not
//! compiled from inline asm or taken from a host function's machine code.
//! Per the design notes this is the one place toolchain-generated code
//! must *not* be relied on — the bytes are authored here and unit-tested
//! against this crate's own instruction decoder.
//!
//! Equivalent to the original's `injectme`:
//! ```asm
//! and    $0xfffffffffffffff0, %rsp   ; enforce SysV 16-byte alignment
//! mov    %rax, %r9                   ; stash dlopen's address
//! xor    %rax, %rax
//! callq  *%r9
//! int3                               ; signal completion to the tracer
//! ```

use scopeject_common::error::CoreError;

/// `and rsp, -16` (REX.W 83 /4 ib).
const AND_RSP_ALIGN16: [u8; 4] = [0x48, 0x83, 0xE4, 0xF0];
/// `mov r9, rax` (REX.WB 89 /r).
const MOV_R9_RAX: [u8; 3] = [0x49, 0x89, 0xC1];
/// `xor rax, rax` (REX.W 31 /r).
const XOR_RAX_RAX: [u8; 3] = [0x48, 0x31, 0xC0];
/// `call r9` (REX.B FF /2).
const CALL_R9: [u8; 3] = [0x41, 0xFF, 0xD1];
/// `int3`.
const INT3: [u8; 1] = [0xCC];

pub const THUNK_SIZE: usize = AND_RSP_ALIGN16.len()
    + MOV_R9_RAX.len()
    + XOR_RAX_RAX.len()
    + CALL_R9.len()
    + INT3.len();

/// Produce the thunk's machine code. `dlopen`'s remote address is passed
/// in `%rax` by the caller (via `PTRACE_SETREGS`) before execution resumes
/// at this thunk's first byte; it is not baked into the bytes here.
pub fn thunk_bytes() -> [u8; THUNK_SIZE] {
    let mut bytes = [0u8; THUNK_SIZE];
    let mut offset = 0;

    for chunk in [
        &AND_RSP_ALIGN16[..],
        &MOV_R9_RAX[..],
        &XOR_RAX_RAX[..],
        &CALL_R9[..],
        &INT3[..],
    ] {
        bytes[offset..offset + chunk.len()].copy_from_slice(chunk);
        offset += chunk.len();
    }

    bytes
}

/// A staged injection: where the path string and thunk live in the
/// target's scratch region, and the registers needed to start execution
/// there.
#[derive(Debug, Clone)]
pub struct ThunkPlan {
    pub scratch_address: u64,
    pub path_offset: u64,
    pub thunk_offset: u64,
    pub dlopen_remote: u64,
}

impl ThunkPlan {
    /// Offset within the scratch window at which the thunk is written.
    ///
    /// The path budget is documented elsewhere as "≤224 bytes, must fit in
    /// scratch minus thunk size" against a 256-byte scratch window — which
    /// only holds together if the thunk's reserved footprint sits at the
    /// *end* of the window (offset 225) rather than at a literal offset of
    /// 32 from the start; a thunk fixed at offset 32 would cap paths at 31
    /// bytes and contradict the 224-byte ceiling outright. This places the
    /// path region first (offsets `0..225`) and the thunk after it.
    pub const THUNK_OFFSET: u64 = 225;

    /// Longest agent path `encode_path` will accept, leaving one byte in
    /// the path region for the NUL terminator.
    pub const MAX_PATH_LEN: usize = Self::THUNK_OFFSET as usize - 1;

    pub fn new(scratch_address: u64, dlopen_remote: u64) -> Self {
        Self {
            scratch_address,
            path_offset: 0,
            thunk_offset: Self::THUNK_OFFSET,
            dlopen_remote,
        }
    }

    pub fn thunk_entry(&self) -> u64 {
        self.scratch_address + self.thunk_offset
    }

    pub fn path_address(&self) -> u64 {
        self.scratch_address + self.path_offset
    }
}

/// Encode the agent path as a NUL-terminated byte string, rejecting paths
/// that would not fit ahead of the thunk at its fixed offset, or that are
/// not absolute.
pub fn encode_path(agent_path: &str) -> Result<Vec<u8>, CoreError> {
    if !agent_path.starts_with('/') {
        return Err(CoreError::ProtocolViolation(format!(
            "agent path must be absolute: {agent_path}"
        )));
    }

    if agent_path.len() > ThunkPlan::MAX_PATH_LEN {
        return Err(CoreError::ProtocolViolation(format!(
            "agent path too long to fit before the thunk: {} bytes (max {})",
            agent_path.len(),
            ThunkPlan::MAX_PATH_LEN
        )));
    }

    let mut bytes = agent_path.as_bytes().to_vec();
    bytes.push(0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopeject_common::decoder::{decode_one, InsnKind};

    #[test]
    fn thunk_decodes_as_five_well_formed_instructions() {
        let bytes = thunk_bytes();
        let mut cursor = 0usize;
        let mut count = 0;

        while cursor < bytes.len() {
            let insn = decode_one(&bytes[cursor..], cursor as u64).expect("decodable");
            assert_eq!(insn.kind, InsnKind::Other, "thunk has no JMP");
            cursor += insn.length as usize;
            count += 1;
        }

        assert_eq!(cursor, THUNK_SIZE);
        assert_eq!(count, 5);
    }

    #[test]
    fn rejects_relative_path() {
        assert!(encode_path("relative/path").is_err());
    }

    #[test]
    fn rejects_path_too_long_for_scratch_offset() {
        let long = format!("/{}", "a".repeat(300));
        assert!(encode_path(&long).is_err());
    }

    #[test]
    fn accepts_path_at_the_224_byte_ceiling() {
        let path = format!("/{}", "a".repeat(ThunkPlan::MAX_PATH_LEN - 1));
        assert_eq!(path.len(), ThunkPlan::MAX_PATH_LEN);
        assert!(encode_path(&path).is_ok());
    }

    #[test]
    fn encodes_nul_terminated_absolute_path() {
        let encoded = encode_path("/tmp/libscope.so").unwrap();
        assert_eq!(encoded.last(), Some(&0));
        assert_eq!(&encoded[..encoded.len() - 1], b"/tmp/libscope.so");
    }
}
