//! The Nanomite record and its persisted envelope.
//!
//! This is the one piece of the scheme that must be bit-identical between
//! the Builder (which writes it) and the Tracer (which reads it back from
//! the embedded resource at runtime), so the layout is handled by hand
//! with `scroll`, not left to a generic derive, mirroring the manual
//! offset bookkeeping `goblin`'s PE writer does for its own on-disk structs.

use scroll::{Pread, Pwrite, LE};

use crate::branch::BranchKind;

/// A single persisted record. Four `u32`s, little-endian, densely packed,
/// 16 bytes on the wire regardless of host pointer width (only the
/// envelope header varies by arch; see [`EnvelopeHeader`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NanomiteRecord {
    /// Offset from image base (section VA + intra-section offset).
    pub rva: u32,
    /// [`BranchKind`] as its persisted numeric value.
    pub jump_type: u32,
    /// Signed 8-bit displacement, zero-extended to 32 bits on disk; must be
    /// sign-extended from the low byte before use.
    pub jump_length: u32,
    /// Distance from the trap byte to the fall-through instruction.
    pub opcode_length: u32,
}

pub const RECORD_SIZE: usize = 16;

impl NanomiteRecord {
    pub fn kind(&self) -> BranchKind {
        BranchKind::from_u32(self.jump_type)
    }

    /// Sign-extend the stored low byte of `jump_length` to a full `i32`
    /// displacement. Backward branches are the common case that makes this
    /// matter.
    pub fn signed_displacement(&self) -> i32 {
        (self.jump_length as u8) as i8 as i32
    }

    pub fn write_to(&self, buf: &mut [u8], offset: &mut usize) -> Result<(), scroll::Error> {
        buf.gwrite_with(self.rva, offset, LE)?;
        buf.gwrite_with(self.jump_type, offset, LE)?;
        buf.gwrite_with(self.jump_length, offset, LE)?;
        buf.gwrite_with(self.opcode_length, offset, LE)?;
        Ok(())
    }

    pub fn read_from(buf: &[u8], offset: &mut usize) -> Result<Self, scroll::Error> {
        Ok(NanomiteRecord {
            rva: buf.gread_with(offset, LE)?,
            jump_type: buf.gread_with(offset, LE)?,
            jump_length: buf.gread_with(offset, LE)?,
            opcode_length: buf.gread_with(offset, LE)?,
        })
    }
}

/// Header size in bytes on *this* machine. The C original shares one struct
/// layout between the writer and the in-memory reader: a `u32 item_count`
/// followed by a pointer-sized field the reader never dereferences. On a
/// 64-bit target the pointer field pulls in 4 bytes of padding after
/// `item_count` to keep it 8-byte aligned; on 32-bit there is none. This is
/// exactly why a 32-bit Builder's output cannot be read by a 64-bit Tracer.
/// The header width itself differs.
#[cfg(target_pointer_width = "64")]
pub const ENVELOPE_HEADER_SIZE: usize = 16;
#[cfg(target_pointer_width = "32")]
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// In-memory view of the persisted table: the envelope header plus the flat,
/// `rva`-ascending array of records.
#[derive(Debug, Clone, Default)]
pub struct NanomiteTable {
    pub records: Vec<NanomiteRecord>,
}

impl NanomiteTable {
    pub fn new(mut records: Vec<NanomiteRecord>) -> Self {
        records.sort_by_key(|r| r.rva);
        NanomiteTable { records }
    }

    /// Serialize envelope + flat array. The pointer-sized padding field is
    /// written as zero. The Tracer never reads it back.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = ENVELOPE_HEADER_SIZE + self.records.len() * RECORD_SIZE;
        let mut buf = vec![0u8; total];
        let mut offset = 0usize;
        buf.gwrite_with(self.records.len() as u32, &mut offset, LE)
            .expect("fixed-size buffer sized for header");
        offset = ENVELOPE_HEADER_SIZE;
        for record in &self.records {
            record
                .write_to(&mut buf, &mut offset)
                .expect("fixed-size buffer sized for records");
        }
        buf
    }

    /// Parse a blob produced by `to_bytes` on a machine with the same
    /// pointer width. Returns `Err` if the blob is shorter than this
    /// machine's envelope header, or its length doesn't match
    /// `header + item_count * RECORD_SIZE` exactly (layout mismatch,
    /// truncation, or a cross-arch blob).
    pub fn from_bytes(blob: &[u8]) -> Result<Self, scroll::Error> {
        if blob.len() < ENVELOPE_HEADER_SIZE {
            return Err(scroll::Error::TooBig {
                size: ENVELOPE_HEADER_SIZE,
                len: blob.len(),
            });
        }
        let mut header_offset = 0usize;
        let item_count: u32 = blob.gread_with(&mut header_offset, LE)?;

        let expected_len = ENVELOPE_HEADER_SIZE + item_count as usize * RECORD_SIZE;
        if blob.len() != expected_len {
            return Err(scroll::Error::BadInput {
                size: expected_len,
                msg: "nanomite table length does not match item_count * record size",
            });
        }

        let mut offset = ENVELOPE_HEADER_SIZE;
        let mut records = Vec::with_capacity(item_count as usize);
        for _ in 0..item_count {
            records.push(NanomiteRecord::read_from(blob, &mut offset)?);
        }
        Ok(NanomiteTable { records })
    }

    /// `rva -> record` lookup, built once at load time.
    pub fn index(&self) -> std::collections::HashMap<u32, NanomiteRecord> {
        self.records.iter().map(|r| (r.rva, *r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_records() -> Vec<NanomiteRecord> {
        vec![
            NanomiteRecord { rva: 0x2000, jump_type: BranchKind::Je as u32, jump_length: 0x05, opcode_length: 2 },
            NanomiteRecord { rva: 0x1000, jump_type: BranchKind::Jmp as u32, jump_length: 0x02, opcode_length: 2 },
            NanomiteRecord { rva: 0x1050, jump_type: BranchKind::Jne as u32, jump_length: 0xfb, opcode_length: 2 },
        ]
    }

    #[test]
    fn new_sorts_by_rva_ascending() {
        let table = NanomiteTable::new(sample_records());
        let rvas: Vec<u32> = table.records.iter().map(|r| r.rva).collect();
        assert_eq!(rvas, vec![0x1000, 0x1050, 0x2000]);
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let table = NanomiteTable::new(sample_records());
        let bytes = table.to_bytes();
        let parsed = NanomiteTable::from_bytes(&bytes).expect("parses");
        assert_eq!(parsed.records, table.records);
    }

    #[test]
    fn from_bytes_rejects_truncated_blob() {
        let table = NanomiteTable::new(sample_records());
        let mut bytes = table.to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(NanomiteTable::from_bytes(&bytes).is_err());
    }

    #[test]
    fn signed_displacement_sign_extends_from_low_byte() {
        let forward = NanomiteRecord { rva: 0, jump_type: 0, jump_length: 0x7f, opcode_length: 2 };
        assert_eq!(forward.signed_displacement(), 127);
        let backward = NanomiteRecord { rva: 0, jump_type: 0, jump_length: 0x80, opcode_length: 2 };
        assert_eq!(backward.signed_displacement(), -128);
        let small_backward = NanomiteRecord { rva: 0, jump_type: 0, jump_length: 0xfb, opcode_length: 2 };
        assert_eq!(small_backward.signed_displacement(), -5);
    }

    #[test]
    fn index_maps_rva_to_record() {
        let table = NanomiteTable::new(sample_records());
        let index = table.index();
        assert_eq!(index.get(&0x1000).unwrap().kind(), BranchKind::Jmp);
        assert!(index.get(&0x9999).is_none());
    }
}
