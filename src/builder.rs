//! The Builder / Patcher.
//!
//! Operates entirely on an in-memory byte buffer (no OS dependency), so
//! the core passes are fully unit-testable without a real PE file.

use rand::Rng;
use serde::Serialize;

use crate::branch::BranchKind;
use crate::classifier;
use crate::nanomite::{NanomiteRecord, NanomiteTable};

/// A relative branch found by the real-branch pass, before it's turned into
/// a persisted [`NanomiteRecord`].
#[derive(Debug, Clone, Copy)]
struct RelativeBranch {
    /// Offset from section start.
    intra_section_offset: u32,
    opcode: u8,
    opcode_length: u32,
    displacement: u32,
}

/// Real-branch pass: sweep the section, keep only
/// instructions whose opcode maps to a known [`BranchKind`].
fn real_branch_pass(section_bytes: &[u8], bitness: u32) -> Vec<RelativeBranch> {
    classifier::sweep(section_bytes, bitness)
        .into_iter()
        .filter(|instr| instr.is_relative_branch)
        .filter(|instr| BranchKind::from_opcode(instr.opcode) != BranchKind::Unknown)
        .map(|instr| RelativeBranch {
            intra_section_offset: instr.offset as u32,
            opcode: instr.opcode,
            opcode_length: instr.length as u32,
            displacement: instr.displacement,
        })
        .collect()
}

/// Decoy pass: every pre-existing `0xCC` byte in the
/// section becomes a record describing a branch that was never really
/// there, so the table's cardinality doesn't disclose the true branch
/// count.
fn decoy_pass(section_bytes: &[u8]) -> Vec<u32> {
    section_bytes
        .iter()
        .enumerate()
        .filter(|(_, &b)| b == 0xcc)
        .map(|(offset, _)| offset as u32)
        .collect()
}

fn random_decoy_record(section_va: u32, intra_section_offset: u32, rng: &mut impl Rng) -> NanomiteRecord {
    let opcode: u8 = rng.gen_range(0x70..=0x7f);
    NanomiteRecord {
        rva: section_va + intra_section_offset,
        jump_type: BranchKind::from_random_short_opcode(opcode) as u32,
        jump_length: rng.gen_range(0x02..=0xa0u32),
        opcode_length: 2,
    }
}

/// Patch pass: overwrite the trap byte and fill the
/// rest of the original instruction's bytes with random noise. The
/// displacement is intentionally lost from the image. It survives only in
/// the Nanomite record.
fn patch_pass(section_bytes: &mut [u8], branches: &[RelativeBranch], rng: &mut impl Rng) {
    for branch in branches {
        let start = branch.intra_section_offset as usize;
        section_bytes[start] = 0xcc;
        for byte in &mut section_bytes[start + 1..start + branch.opcode_length as usize] {
            *byte = rng.gen();
        }
    }
}

/// Summary of one build pass, useful for CI assertions and human review but
/// not part of the protection scheme itself.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub section_name: String,
    pub section_virtual_address: u32,
    pub real_branches: usize,
    pub decoys: usize,
    pub total_records: usize,
}

/// Run all five passes (real-branch, decoy, patch, sort, emit) over
/// `section_bytes` in place and return the resulting table plus a report.
/// `section_va` is the section's virtual address, used to turn
/// intra-section offsets into image-relative RVAs.
pub fn build(
    section_name: &str,
    section_bytes: &mut [u8],
    section_va: u32,
    bitness: u32,
    rng: &mut impl Rng,
) -> (NanomiteTable, BuildReport) {
    let real_branches = real_branch_pass(section_bytes, bitness);
    let decoy_offsets = decoy_pass(section_bytes);

    patch_pass(section_bytes, &real_branches, rng);

    let mut records: Vec<NanomiteRecord> = real_branches
        .iter()
        .map(|b| NanomiteRecord {
            rva: section_va + b.intra_section_offset,
            jump_type: BranchKind::from_opcode(b.opcode) as u32,
            jump_length: b.displacement & 0xff,
            opcode_length: b.opcode_length,
        })
        .collect();

    for offset in &decoy_offsets {
        records.push(random_decoy_record(section_va, *offset, rng));
    }

    let report = BuildReport {
        section_name: section_name.to_string(),
        section_virtual_address: section_va,
        real_branches: real_branches.len(),
        decoys: decoy_offsets.len(),
        total_records: records.len(),
    };

    (NanomiteTable::new(records), report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn unconditional_short_jump_end_to_end() {
        let mut section = vec![0xeb, 0x02, 0x90, 0x90];
        let (table, report) = build(".nano", &mut section, 0x1000, 64, &mut rng());

        assert_eq!(report.real_branches, 1);
        assert_eq!(report.decoys, 0);
        assert_eq!(table.records.len(), 1);

        let record = table.records[0];
        assert_eq!(record.rva, 0x1000);
        assert_eq!(record.kind(), BranchKind::Jmp);
        assert_eq!(record.jump_length, 0x02);
        assert_eq!(record.opcode_length, 2);

        assert_eq!(section[0], 0xcc);
        // section[1] is randomized, but bytes 2-3 are untouched.
        assert_eq!(section[2..], [0x90, 0x90]);
    }

    #[test]
    fn conditional_backward_branch_preserves_sign() {
        let mut section = vec![0x75, 0xfb];
        let (table, _) = build(".nano", &mut section, 0x50, 64, &mut rng());
        let record = table.records[0];
        assert_eq!(record.kind(), BranchKind::Jne);
        assert_eq!(record.signed_displacement(), -5);
    }

    #[test]
    fn call_is_never_patched() {
        let mut section = vec![0xe8, 0x00, 0x00, 0x00, 0x00];
        let original = section.clone();
        let (table, report) = build(".nano", &mut section, 0x10, 64, &mut rng());
        assert_eq!(report.real_branches, 0);
        assert!(table.records.is_empty());
        assert_eq!(section, original);
    }

    #[test]
    fn pre_existing_cc_becomes_a_decoy_not_a_real_branch() {
        let mut section = vec![0x90, 0xcc, 0x90];
        let original = section.clone();
        let (table, report) = build(".nano", &mut section, 0x30, 64, &mut rng());
        assert_eq!(report.real_branches, 0);
        assert_eq!(report.decoys, 1);
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0].opcode_length, 2);
        // decoys describe bytes the Builder does not patch.
        assert_eq!(section, original);
    }

    #[test]
    fn records_are_sorted_ascending_with_no_duplicates() {
        let mut section = vec![0xeb, 0x02, 0xcc, 0x74, 0x05, 0x90];
        let (table, _) = build(".nano", &mut section, 0, 64, &mut rng());
        let rvas: Vec<u32> = table.records.iter().map(|r| r.rva).collect();
        let mut sorted = rvas.clone();
        sorted.sort();
        assert_eq!(rvas, sorted);
        let unique: std::collections::HashSet<_> = rvas.iter().collect();
        assert_eq!(unique.len(), rvas.len());
    }
}
