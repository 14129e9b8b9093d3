//! Linear-sweep instruction classifier.
//!
//! Decoding variable-length x86 is the one part of this scheme not worth
//! hand-rolling. `iced-x86` is used purely to get a correct instruction
//! length and flow-control category out of an arbitrary byte stream. Branch
//! *kind* classification still goes through our own fixed opcode table
//! (`branch::BranchKind::from_opcode`), not iced's mnemonic set, so the
//! persisted semantics stay exactly what this crate defines rather than
//! whatever iced happens to name an instruction.

use iced_x86::{Decoder, DecoderOptions, FlowControl, OpKind};

/// Facts about one decoded instruction, relative to the start of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Offset (from the start of the byte range given to the sweep) where
    /// this instruction begins.
    pub offset: usize,
    /// Length in bytes.
    pub length: usize,
    /// First opcode byte, post-prefix. For the `0F 8x` near-conditional
    /// form this is already normalized to the second byte, so callers never
    /// branch on the `0F` prefix themselves.
    pub opcode: u8,
    /// True iff this is a conditional or unconditional branch encoded with
    /// a relative (near) displacement. Excludes `CALL` and indirect/far
    /// branches.
    pub is_relative_branch: bool,
    /// The raw encoded displacement, as an unsigned value exactly as it
    /// appears in the instruction bytes (8-bit short form or 32-bit near
    /// form, zero-extended to 32 bits). Only meaningful when
    /// `is_relative_branch` is true.
    pub displacement: u32,
}

/// Decode one instruction starting at `bytes[offset..]`. Always returns a
/// length of at least 1, even for bytes iced can't decode, so a sweep over
/// unrecognized data can never stall.
pub fn decode_one(bytes: &[u8], offset: usize, bitness: u32) -> Instruction {
    let window = &bytes[offset..];
    let mut decoder = Decoder::with_ip(bitness, window, offset as u64, DecoderOptions::NONE);

    if !decoder.can_decode() {
        return Instruction { offset, length: 1, opcode: bytes[offset], is_relative_branch: false, displacement: 0 };
    }

    let instr = decoder.decode();
    let length = instr.len().max(1);

    if instr.is_invalid() {
        return Instruction { offset, length: 1, opcode: bytes[offset], is_relative_branch: false, displacement: 0 };
    }

    let opcode = first_opcode_byte(window);

    let is_near_branch = matches!(
        instr.op0_kind(),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
    );
    let is_relative_branch = is_near_branch
        && matches!(instr.flow_control(), FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch);

    let displacement = if is_relative_branch {
        raw_displacement(window, length)
    } else {
        0
    };

    Instruction { offset, length, opcode, is_relative_branch, displacement }
}

/// Skip legacy and REX prefixes to find the first true opcode byte; if that
/// byte is the two-byte escape `0x0F`, return the byte after it instead.
/// This is the "semantic opcode" the rest of the system keys off of.
fn first_opcode_byte(window: &[u8]) -> u8 {
    let mut i = 0;
    while i < window.len() {
        match window[i] {
            0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3 | 0x2e | 0x36 | 0x3e | 0x26 | 0x64 | 0x65 => i += 1,
            0x40..=0x4f => i += 1, // REX prefixes (x64 only; harmless to skip on x86)
            _ => break,
        }
    }
    if i >= window.len() {
        return window.first().copied().unwrap_or(0);
    }
    if window[i] == 0x0f && i + 1 < window.len() {
        window[i + 1]
    } else {
        window[i]
    }
}

/// Every relative branch form this scheme recognizes carries its
/// displacement as the final 1 or 4 bytes of the instruction. Short
/// conditional/`JCXZ`/short `JMP` are 2 bytes total (1-byte displacement);
/// near `JMP` (5 bytes) and near conditional (6 bytes) both end in a
/// 4-byte displacement.
fn raw_displacement(window: &[u8], length: usize) -> u32 {
    let disp_size = if length <= 2 { 1 } else { 4 };
    let start = length - disp_size;
    if start + disp_size > window.len() {
        return 0;
    }
    match disp_size {
        1 => window[start] as u32,
        _ => u32::from_le_bytes(window[start..start + 4].try_into().unwrap()),
    }
}

/// Walk `bytes` from `offset 0` to `bytes.len()`, stopping before any
/// instruction that would straddle the end of the buffer.
pub fn sweep(bytes: &[u8], bitness: u32) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let instr = decode_one(bytes, offset, bitness);
        if offset + instr.length > bytes.len() {
            break;
        }
        out.push(instr);
        offset += instr.length;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_unconditional_jump_is_relative() {
        let code = [0xeb, 0x02, 0x90, 0x90];
        let instr = decode_one(&code, 0, 64);
        assert_eq!(instr.length, 2);
        assert_eq!(instr.opcode, 0xeb);
        assert!(instr.is_relative_branch);
        assert_eq!(instr.displacement, 0x02);
    }

    #[test]
    fn short_conditional_backward_jump() {
        let code = [0x75, 0xfb];
        let instr = decode_one(&code, 0, 64);
        assert_eq!(instr.length, 2);
        assert_eq!(instr.opcode, 0x75);
        assert!(instr.is_relative_branch);
        assert_eq!(instr.displacement, 0xfb);
    }

    #[test]
    fn near_conditional_normalizes_to_second_byte() {
        let code = [0x0f, 0x8f, 0x00, 0x01, 0x00, 0x00];
        let instr = decode_one(&code, 0, 64);
        assert_eq!(instr.length, 6);
        assert_eq!(instr.opcode, 0x8f);
        assert!(instr.is_relative_branch);
        assert_eq!(instr.displacement, 0x100);
    }

    #[test]
    fn call_is_not_a_relative_branch() {
        // E8 xx xx xx xx : CALL rel32
        let code = [0xe8, 0x00, 0x00, 0x00, 0x00];
        let instr = decode_one(&code, 0, 64);
        assert!(!instr.is_relative_branch);
    }

    #[test]
    fn sweep_excludes_instruction_straddling_boundary() {
        // one short jump (2 bytes) followed by a lone 0xE9 (near jmp needs 5)
        let code = [0xeb, 0x00, 0xe9];
        let instrs = sweep(&code, 64);
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].offset, 0);
    }

    #[test]
    fn sweep_never_stalls_on_garbage() {
        let code = [0xff; 16];
        let instrs = sweep(&code, 64);
        assert!(!instrs.is_empty());
        let total: usize = instrs.iter().map(|i| i.length).sum();
        assert!(total <= code.len());
    }
}
