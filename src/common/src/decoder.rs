//! Minimal x86-64 instruction-length decoder (ID).
//!
//! Walks a buffer forward one instruction at a time, just far enough to
//! recognise the short (`0xEB`) and near (`0xE9`) relative `JMP` that
//! terminates a tail-call wrapper's prologue. The rest of the opcode space
//! is decoded only enough to compute instruction *length* so the walk can
//! skip over it; no register semantics are modelled.

use crate::error::CoreError;

/// What a decoded instruction turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// A recognised relative `JMP`, carrying its sign-extended displacement.
    JmpRel(i32),
    /// Anything else; only its length was computed.
    Other,
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInsn {
    pub address: u64,
    pub length: u8,
    pub kind: InsnKind,
}

impl DecodedInsn {
    /// For a recognised JMP, the absolute target:
    /// `address + length + sign_extend(rel)`.
    pub fn jmp_target(&self) -> Option<u64> {
        match self.kind {
            InsnKind::JmpRel(rel) => {
                Some((self.address as i64 + self.length as i64 + rel as i64) as u64)
            }
            InsnKind::Other => None,
        }
    }
}

const MAX_INSNS: usize = 15;
const MAX_DECODE_BYTES: usize = 50;

/// Prefix bytes that precede the opcode without affecting its length
/// beyond consuming one byte each.
fn is_prefix(byte: u8) -> bool {
    matches!(
        byte,
        0x66 | 0x67 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3
    )
}

fn is_rex(byte: u8) -> bool {
    (0x40..=0x4F).contains(&byte)
}

/// Length in bytes of the ModRM (+ SIB + displacement) group starting at
/// `buf[0]`, not counting the ModRM byte's own opcode-adjacent immediate.
/// Returns `(total_len, rip_relative)`.
fn modrm_len(buf: &[u8]) -> Result<usize, CoreError> {
    let modrm = *buf
        .first()
        .ok_or_else(|| CoreError::DecoderFailure("truncated modrm".into()))?;

    let md = modrm >> 6;
    let rm = modrm & 0x7;

    let mut len = 1; // the modrm byte itself
    let has_sib = md != 0b11 && rm == 0b100;

    if has_sib {
        let sib = *buf
            .get(1)
            .ok_or_else(|| CoreError::DecoderFailure("truncated sib".into()))?;
        let base = sib & 0x7;
        len += 1;

        if md == 0b00 && base == 0b101 {
            len += 4; // disp32, no base register
        }
    }

    if md == 0b11 {
        // register-direct addressing, nothing more
    } else if md == 0b00 {
        if rm == 0b101 {
            len += 4; // RIP-relative disp32
        }
        // else: disp already accounted for via SIB, or no disp at all
    } else if md == 0b01 {
        len += 1; // disp8
    } else if md == 0b10 {
        len += 4; // disp32
    }

    Ok(len)
}

/// Decode a single instruction at `addr`, reading from `buf`. `buf` must
/// contain at least the bytes of the instruction (callers pass a
/// fixed-size decode window and this returns an error if it runs off the
/// end rather than reading out of bounds).
pub fn decode_one(buf: &[u8], addr: u64) -> Result<DecodedInsn, CoreError> {
    let mut offset = 0usize;
    let mut rex_w = false;

    while let Some(&byte) = buf.get(offset) {
        if is_prefix(byte) {
            offset += 1;
            continue;
        }
        if is_rex(byte) {
            rex_w = byte & 0x08 != 0;
            offset += 1;
            continue;
        }
        break;
    }

    let opcode = *buf
        .get(offset)
        .ok_or_else(|| CoreError::DecoderFailure("truncated opcode".into()))?;
    offset += 1;

    // Short relative JMP: EB rel8
    if opcode == 0xEB {
        let rel = *buf
            .get(offset)
            .ok_or_else(|| CoreError::DecoderFailure("truncated rel8".into()))?
            as i8;
        return Ok(DecodedInsn {
            address: addr,
            length: (offset + 1) as u8,
            kind: InsnKind::JmpRel(rel as i32),
        });
    }

    // Near relative JMP: E9 rel32
    if opcode == 0xE9 {
        let bytes = buf
            .get(offset..offset + 4)
            .ok_or_else(|| CoreError::DecoderFailure("truncated rel32".into()))?;
        let rel = i32::from_le_bytes(bytes.try_into().unwrap());
        let length = offset + 4;
        return Ok(DecodedInsn {
            address: addr,
            length: length as u8,
            kind: InsnKind::JmpRel(rel),
        });
    }

    // Two-byte opcode escape (0x0F ...)
    if opcode == 0x0F {
        let op2 = *buf
            .get(offset)
            .ok_or_else(|| CoreError::DecoderFailure("truncated 0f opcode".into()))?;
        offset += 1;

        let length = match op2 {
            // Jcc rel32
            0x80..=0x8F => offset + 4,
            // ENDBR64 is F3 0F 1E FA; the F3 prefix was already consumed above,
            // 0F 1E FA has a ModRM-shaped trailing byte but no memory operand.
            0x1E => offset + 1,
            // MOVZX/MOVSX r, r/m (0F B6/B7/BE/BF)
            0xB6 | 0xB7 | 0xBE | 0xBF => offset + modrm_len(&buf[offset..])?,
            // generic two-byte ALU/mov forms with a ModRM byte
            _ => offset + modrm_len(&buf[offset..])?,
        };

        return Ok(DecodedInsn {
            address: addr,
            length: length as u8,
            kind: InsnKind::Other,
        });
    }

    let length = match opcode {
        // PUSH/POP r64
        0x50..=0x5F => offset,
        // RET, INT3, NOP, LEAVE
        0xC3 | 0xCC | 0x90 | 0xC9 => offset,
        // CALL rel32
        0xE8 => offset + 4,
        // Jcc rel8
        0x70..=0x7F => offset + 1,
        // MOV r64, imm64 (REX.W + B8..BF) or r32,imm32
        0xB8..=0xBF => offset + if rex_w { 8 } else { 4 },
        // ALU imm8 to AL / imm32 to eAX forms (no ModRM)
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C | 0xA8 => offset + 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D | 0xA9 => offset + 4,
        // TEST/XCHG/MOV r/m, r and r, r/m (ModRM, no immediate)
        0x00..=0x03
        | 0x08..=0x0B
        | 0x10..=0x13
        | 0x18..=0x1B
        | 0x20..=0x23
        | 0x28..=0x2B
        | 0x30..=0x33
        | 0x38..=0x3B
        | 0x84 | 0x85 | 0x86 | 0x87
        | 0x88 | 0x89 | 0x8A | 0x8B
        | 0x8D => offset + modrm_len(&buf[offset..])?,
        // Grp1 imm8 (ADD/SUB/AND/.../CMP r/m, imm8)
        0x83 => offset + modrm_len(&buf[offset..])? + 1,
        // Grp1 imm32
        0x81 => offset + modrm_len(&buf[offset..])? + 4,
        // Grp3 (TEST r/m, imm32 among others) and Grp5 (INC/DEC/CALL/JMP r/m, push r/m)
        0xF7 => offset + modrm_len(&buf[offset..])? + 4,
        0xF6 => offset + modrm_len(&buf[offset..])? + 1,
        0xFF | 0xFE => offset + modrm_len(&buf[offset..])?,
        // PUSH imm32 / imm8
        0x68 => offset + 4,
        0x6A => offset + 1,
        _ => {
            return Err(CoreError::DecoderFailure(format!(
                "unrecognised opcode 0x{opcode:02x} at 0x{addr:x}"
            )));
        }
    };

    Ok(DecodedInsn {
        address: addr,
        length: length as u8,
        kind: InsnKind::Other,
    })
}

/// Decode up to `MAX_INSNS` instructions starting at `addr`, reading from a
/// window of at most `MAX_DECODE_BYTES`, and return the first recognised
/// `JMP`. Mirrors `bashMemFuncsFound`'s disassembly loop in the original
/// implementation.
pub fn find_first_jmp(buf: &[u8], addr: u64) -> Result<DecodedInsn, CoreError> {
    let buf = &buf[..buf.len().min(MAX_DECODE_BYTES)];
    let mut cursor = 0usize;
    let mut cur_addr = addr;

    for _ in 0..MAX_INSNS {
        let window = buf
            .get(cursor..)
            .ok_or_else(|| CoreError::DecoderFailure("decode window exhausted".into()))?;
        let insn = decode_one(window, cur_addr)?;

        if matches!(insn.kind, InsnKind::JmpRel(_)) {
            return Ok(insn);
        }

        cursor += insn.length as usize;
        cur_addr += insn.length as u64;
    }

    Err(CoreError::DecoderFailure(format!(
        "no JMP found in first {MAX_INSNS} instructions from 0x{addr:x}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_near_jmp() {
        let bytes = [0xE9, 0x27, 0xF4, 0xFF, 0xFF];
        let insn = decode_one(&bytes, 0x400100).unwrap();
        assert_eq!(insn.length, 5);
        assert_eq!(insn.kind, InsnKind::JmpRel(-0xbd9));
        assert_eq!(insn.jmp_target(), Some(0x3ff52c));
    }

    #[test]
    fn decodes_short_jmp() {
        let bytes = [0xEB, 0xEC];
        let insn = decode_one(&bytes, 0x400100).unwrap();
        assert_eq!(insn.length, 2);
        assert_eq!(insn.jmp_target(), Some(0x4000EE));
    }

    #[test]
    fn short_jmp_rel_roundtrip() {
        for rel in -128i32..=127 {
            let bytes = [0xEB, rel as i8 as u8];
            let insn = decode_one(&bytes, 0x1000).unwrap();
            let expected = (0x1000i64 + 2 + rel as i64) as u64;
            assert_eq!(insn.jmp_target(), Some(expected));
        }
    }

    #[test]
    fn near_jmp_rel_roundtrip() {
        for rel in [i32::MIN, i32::MIN + 1, -1, 0, 1, i32::MAX - 1, i32::MAX] {
            let mut bytes = [0xE9, 0, 0, 0, 0];
            bytes[1..5].copy_from_slice(&rel.to_le_bytes());
            let insn = decode_one(&bytes, 0x1000).unwrap();
            let expected = (0x1000i64 + 5 + rel as i64) as u64;
            assert_eq!(insn.jmp_target(), Some(expected));
        }
    }

    #[test]
    fn walks_past_prologue_to_jmp() {
        // push %rbp; mov %rsp,%rbp; jmp rel8
        let mut bytes = vec![0x55, 0x48, 0x89, 0xE5];
        bytes.extend_from_slice(&[0xEB, 0x10]);
        let insn = find_first_jmp(&bytes, 0x2000).unwrap();
        assert_eq!(insn.address, 0x2004);
        assert_eq!(insn.length, 2);
    }

    #[test]
    fn no_jmp_is_decoder_failure() {
        let bytes = vec![0x90; 20];
        let err = find_first_jmp(&bytes, 0x3000).unwrap_err();
        assert!(matches!(err, CoreError::DecoderFailure(_)));
    }

    #[test]
    fn ambiguous_opcode_is_hard_failure() {
        let bytes = [0x0F, 0x05]; // syscall, not modelled
        let err = decode_one(&bytes, 0x4000).unwrap_err();
        assert!(matches!(err, CoreError::DecoderFailure(_)));
    }
}
