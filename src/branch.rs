//! Branch kinds and the pure evaluation function shared by the Builder
//! (which only needs the opcode table) and the Tracer (which needs
//! `evaluate` against live CPU flags).

use serde::{Deserialize, Serialize};

/// CPU flags relevant to branch evaluation, decoded from the flags register.
///
/// Bit positions: CF=0, PF=2, ZF=6, SF=7, OF=11.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub cf: bool,
    pub pf: bool,
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
}

impl Flags {
    pub const CF_BIT: u32 = 1 << 0;
    pub const PF_BIT: u32 = 1 << 2;
    pub const ZF_BIT: u32 = 1 << 6;
    pub const SF_BIT: u32 = 1 << 7;
    pub const OF_BIT: u32 = 1 << 11;

    /// Decode from a raw x86 EFLAGS/RFLAGS value.
    pub fn from_register(eflags: u32) -> Self {
        Flags {
            cf: eflags & Self::CF_BIT != 0,
            pf: eflags & Self::PF_BIT != 0,
            zf: eflags & Self::ZF_BIT != 0,
            sf: eflags & Self::SF_BIT != 0,
            of: eflags & Self::OF_BIT != 0,
        }
    }
}

/// Closed enumeration of branch semantics, independent of encoded form.
///
/// The numeric values are persisted in the Nanomite record's `jump_type`
/// field and must stay stable. This is the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum BranchKind {
    Jo = 0,
    Jno = 1,
    Jb = 2,
    Jnb = 3,
    Je = 4,
    Jne = 5,
    Jbe = 6,
    Ja = 7,
    Js = 8,
    Jns = 9,
    Jp = 10,
    Jnp = 11,
    Jl = 12,
    Jge = 13,
    Jle = 14,
    Jg = 15,
    Jcxz = 16,
    Jmp = 17,
    Unknown = 18,
}

impl BranchKind {
    /// Decode from a persisted `jump_type` value. Unknown numeric values
    /// fall back to `Unknown` rather than erroring. A forward-compatible
    /// reader should never crash on an enum it doesn't recognize.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => BranchKind::Jo,
            1 => BranchKind::Jno,
            2 => BranchKind::Jb,
            3 => BranchKind::Jnb,
            4 => BranchKind::Je,
            5 => BranchKind::Jne,
            6 => BranchKind::Jbe,
            7 => BranchKind::Ja,
            8 => BranchKind::Js,
            9 => BranchKind::Jns,
            10 => BranchKind::Jp,
            11 => BranchKind::Jnp,
            12 => BranchKind::Jl,
            13 => BranchKind::Jge,
            14 => BranchKind::Jle,
            15 => BranchKind::Jg,
            16 => BranchKind::Jcxz,
            17 => BranchKind::Jmp,
            _ => BranchKind::Unknown,
        }
    }

    /// Maps a first opcode byte (post-prefix; the second byte of a `0F 8x`
    /// pair has already been substituted by the caller) to a branch kind.
    /// `CALL` is never passed in here. The classifier excludes it from the
    /// relative-branch category entirely.
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode {
            0x70 | 0x80 => BranchKind::Jo,
            0x71 | 0x81 => BranchKind::Jno,
            0x72 | 0x82 => BranchKind::Jb,
            0x73 | 0x83 => BranchKind::Jnb,
            0x74 | 0x84 => BranchKind::Je,
            0x75 | 0x85 => BranchKind::Jne,
            0x76 | 0x86 => BranchKind::Jbe,
            0x77 | 0x87 => BranchKind::Ja,
            0x78 | 0x88 => BranchKind::Js,
            0x79 | 0x89 => BranchKind::Jns,
            0x7a | 0x8a => BranchKind::Jp,
            0x7b | 0x8b => BranchKind::Jnp,
            0x7c | 0x8c => BranchKind::Jl,
            0x7d | 0x8d => BranchKind::Jge,
            0x7e | 0x8e => BranchKind::Jle,
            0x7f | 0x8f => BranchKind::Jg,
            0xe3 => BranchKind::Jcxz,
            0xeb | 0xe9 => BranchKind::Jmp,
            _ => BranchKind::Unknown,
        }
    }

    /// A short-form conditional opcode in `0x70..=0x7F`, used by the decoy
    /// pass to pick a plausible kind for a pre-existing `0xCC` byte.
    pub fn from_random_short_opcode(opcode: u8) -> Self {
        debug_assert!((0x70..=0x7f).contains(&opcode));
        Self::from_opcode(opcode)
    }
}

/// Evaluate whether `kind` is taken given the current flags and the value of
/// the architectural counter register (only consulted for `Jcxz`).
///
/// Pure function of its inputs: same kind, flags, and counter value always
/// produce the same verdict.
pub fn evaluate(kind: BranchKind, flags: Flags, counter_register: u64) -> bool {
    match kind {
        BranchKind::Jo => flags.of,
        BranchKind::Jno => !flags.of,
        BranchKind::Jb => flags.cf,
        BranchKind::Jnb => !flags.cf,
        BranchKind::Je => flags.zf,
        BranchKind::Jne => !flags.zf,
        BranchKind::Jbe => flags.cf || flags.zf,
        BranchKind::Ja => !flags.cf && !flags.zf,
        BranchKind::Js => flags.sf,
        BranchKind::Jns => !flags.sf,
        BranchKind::Jp => flags.pf,
        BranchKind::Jnp => !flags.pf,
        BranchKind::Jl => flags.sf != flags.of,
        BranchKind::Jge => flags.sf == flags.of,
        BranchKind::Jle => flags.zf || flags.sf != flags.of,
        BranchKind::Jg => !flags.zf && flags.sf == flags.of,
        BranchKind::Jcxz => counter_register == 0,
        BranchKind::Jmp => true,
        BranchKind::Unknown => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn opcode_table_matches_short_and_near_forms() {
        assert_eq!(BranchKind::from_opcode(0x74), BranchKind::Je);
        assert_eq!(BranchKind::from_opcode(0x84), BranchKind::Je);
        assert_eq!(BranchKind::from_opcode(0x7f), BranchKind::Jg);
        assert_eq!(BranchKind::from_opcode(0x8f), BranchKind::Jg);
        assert_eq!(BranchKind::from_opcode(0xe3), BranchKind::Jcxz);
        assert_eq!(BranchKind::from_opcode(0xeb), BranchKind::Jmp);
        assert_eq!(BranchKind::from_opcode(0xe9), BranchKind::Jmp);
    }

    #[test]
    fn call_opcode_is_unknown() {
        // 0xE8 is relative CALL; must not map to any branch kind.
        assert_eq!(BranchKind::from_opcode(0xe8), BranchKind::Unknown);
    }

    #[test]
    fn evaluate_conditional_pairs_are_complementary() {
        let mut flags = Flags::default();
        flags.zf = true;
        assert!(evaluate(BranchKind::Je, flags, 0));
        assert!(!evaluate(BranchKind::Jne, flags, 0));
    }

    #[test]
    fn evaluate_jg_requires_not_zf_and_sf_eq_of() {
        let flags = Flags { zf: false, sf: true, of: true, ..Default::default() };
        assert!(evaluate(BranchKind::Jg, flags, 0));
        let flags_zf = Flags { zf: true, ..flags };
        assert!(!evaluate(BranchKind::Jg, flags_zf, 0));
    }

    #[test]
    fn evaluate_jcxz_uses_full_register_width() {
        assert!(evaluate(BranchKind::Jcxz, Flags::default(), 0));
        assert!(!evaluate(BranchKind::Jcxz, Flags::default(), 1));
    }

    #[test]
    fn jmp_is_always_taken_unknown_is_never() {
        assert!(evaluate(BranchKind::Jmp, Flags::default(), 42));
        assert!(!evaluate(BranchKind::Unknown, Flags::default(), 0));
    }
}
