//! Minimal instruction encoding for container bytecode bodies.
//!
//! The container never interprets instructions; it only needs enough
//! structure to walk a raw body and locate the 16-bit operands that encode
//! references to indexed entities. Each instruction is one opcode byte
//! followed by a fixed-width operand field.

use crate::error::{ContainerError, ContainerResult};
use crate::items::ItemId;

/// Reference kinds an instruction operand (or catch-block type) can encode.
///
/// Each kind has its own bounded index space inside an index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    Class,
    Method,
    Field,
    String,
    LiteralArray,
}

impl RefKind {
    pub const ALL: [RefKind; 5] = [
        RefKind::Class,
        RefKind::Method,
        RefKind::Field,
        RefKind::String,
        RefKind::LiteralArray,
    ];
}

/// Maximum number of distinct entities of one reference kind a single index
/// header may cover. Operands are 16 bits wide, so this is a hard format
/// limit.
pub const INDEX_CAPACITY: usize = 0x10000;

pub const OP_NOP: u8 = 0x00;
pub const OP_RET: u8 = 0x01;
pub const OP_LDAI: u8 = 0x02;
pub const OP_JMP: u8 = 0x03;
pub const OP_MOV: u8 = 0x04;
pub const OP_LDA_STR: u8 = 0x05;
pub const OP_LDA_TYPE: u8 = 0x06;
pub const OP_CALL: u8 = 0x07;
pub const OP_LDOBJ: u8 = 0x08;
pub const OP_STOBJ: u8 = 0x09;
pub const OP_LDA_ARR: u8 = 0x0a;

/// Encoded byte width of the instruction starting with `opcode`, including
/// the opcode byte itself.
pub fn instruction_size(opcode: u8) -> ContainerResult<usize> {
    match opcode {
        OP_NOP | OP_RET => Ok(1),
        OP_JMP | OP_MOV => Ok(3),
        OP_LDAI => Ok(5),
        OP_LDA_STR | OP_LDA_TYPE | OP_CALL | OP_LDOBJ | OP_STOBJ | OP_LDA_ARR => Ok(3),
        other => Err(ContainerError::format(format!(
            "unknown opcode 0x{other:02x}"
        ))),
    }
}

/// Reference kind of the 16-bit id operand, if the opcode carries one.
pub fn ref_operand_kind(opcode: u8) -> Option<RefKind> {
    match opcode {
        OP_LDA_STR => Some(RefKind::String),
        OP_LDA_TYPE => Some(RefKind::Class),
        OP_CALL => Some(RefKind::Method),
        OP_LDOBJ | OP_STOBJ => Some(RefKind::Field),
        OP_LDA_ARR => Some(RefKind::LiteralArray),
        _ => None,
    }
}

/// A reference-operand site located while walking a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefSite {
    /// Byte offset of the 16-bit id field within the body.
    pub id_pc: usize,
    pub kind: RefKind,
}

/// Walks `bytes` and collects every reference-operand site.
///
/// Fails on a truncated trailing instruction or an unknown opcode; bodies are
/// produced by [`BytecodeBuilder`] or validated source files, so a failure
/// here means corrupt input.
pub fn collect_ref_sites(bytes: &[u8]) -> ContainerResult<Vec<RefSite>> {
    let mut sites = Vec::new();
    let mut pc = 0usize;
    while pc < bytes.len() {
        let opcode = bytes[pc];
        let size = instruction_size(opcode)?;
        if pc + size > bytes.len() {
            return Err(ContainerError::UnexpectedEof {
                offset: pc,
                expected: size,
            });
        }
        if let Some(kind) = ref_operand_kind(opcode) {
            sites.push(RefSite {
                id_pc: pc + 1,
                kind,
            });
        }
        pc += size;
    }
    Ok(sites)
}

/// Reads the 16-bit id field at a [`RefSite`].
pub fn read_id(bytes: &[u8], site: RefSite) -> u16 {
    u16::from_le_bytes([bytes[site.id_pc], bytes[site.id_pc + 1]])
}

/// Overwrites the 16-bit id field at a [`RefSite`].
pub fn write_id(bytes: &mut [u8], site: RefSite, id: u16) {
    bytes[site.id_pc..site.id_pc + 2].copy_from_slice(&id.to_le_bytes());
}

/// Incremental builder for an instruction body.
///
/// Reference operands are emitted as ordinals into the accumulated
/// dependency list; the final serialization pass rewrites them to the local
/// indices assigned by the method's index header.
#[derive(Default)]
pub struct BytecodeBuilder {
    bytes: Vec<u8>,
    deps: Vec<ItemId>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        BytecodeBuilder::default()
    }

    /// Consumes the builder, yielding the body bytes and the index
    /// dependencies in first-reference order.
    pub fn finish(self) -> (Vec<u8>, Vec<ItemId>) {
        (self.bytes, self.deps)
    }

    pub fn emit_nop(&mut self) {
        self.bytes.push(OP_NOP);
    }

    pub fn emit_ret(&mut self) {
        self.bytes.push(OP_RET);
    }

    pub fn emit_ldai(&mut self, value: u32) {
        self.bytes.push(OP_LDAI);
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_jmp(&mut self, target: u16) {
        self.bytes.push(OP_JMP);
        self.bytes.extend_from_slice(&target.to_le_bytes());
    }

    pub fn emit_mov(&mut self, dst: u8, src: u8) {
        self.bytes.extend_from_slice(&[OP_MOV, dst, src]);
    }

    pub fn emit_lda_str(&mut self, string: ItemId) {
        self.emit_ref(OP_LDA_STR, string);
    }

    pub fn emit_lda_type(&mut self, class: ItemId) {
        self.emit_ref(OP_LDA_TYPE, class);
    }

    pub fn emit_call(&mut self, method: ItemId) {
        self.emit_ref(OP_CALL, method);
    }

    pub fn emit_ldobj(&mut self, field: ItemId) {
        self.emit_ref(OP_LDOBJ, field);
    }

    pub fn emit_stobj(&mut self, field: ItemId) {
        self.emit_ref(OP_STOBJ, field);
    }

    pub fn emit_lda_arr(&mut self, array: ItemId) {
        self.emit_ref(OP_LDA_ARR, array);
    }

    fn emit_ref(&mut self, opcode: u8, target: ItemId) {
        let ordinal = dependency_ordinal(&mut self.deps, target);
        self.bytes.push(opcode);
        self.bytes.extend_from_slice(&ordinal.to_le_bytes());
    }
}

/// Position of `target` in `deps`, appending it on first use.
///
/// Shared by the forward builder and the reader's first fix-up pass so both
/// produce identical ordinal numbering for identical reference sequences.
pub fn dependency_ordinal(deps: &mut Vec<ItemId>, target: ItemId) -> u16 {
    if let Some(position) = deps.iter().position(|&dep| dep == target) {
        return position as u16;
    }
    deps.push(target);
    (deps.len() - 1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::ItemId;

    #[test]
    fn builder_records_first_use_ordinals() {
        let a = ItemId::from_raw(10);
        let b = ItemId::from_raw(11);
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(a);
        builder.emit_call(b);
        builder.emit_lda_str(a);
        builder.emit_ret();

        let (bytes, deps) = builder.finish();
        assert_eq!(deps, vec![a, b]);

        let sites = collect_ref_sites(&bytes).unwrap();
        assert_eq!(sites.len(), 3);
        assert_eq!(read_id(&bytes, sites[0]), 0);
        assert_eq!(read_id(&bytes, sites[1]), 1);
        assert_eq!(read_id(&bytes, sites[2]), 0);
        assert_eq!(sites[0].kind, RefKind::String);
        assert_eq!(sites[1].kind, RefKind::Method);
    }

    #[test]
    fn walker_rejects_truncated_body() {
        let bytes = [OP_LDAI, 0x01];
        assert!(collect_ref_sites(&bytes).is_err());
    }

    #[test]
    fn walker_rejects_unknown_opcode() {
        let bytes = [0x7f];
        assert!(collect_ref_sites(&bytes).is_err());
    }

    #[test]
    fn write_id_patches_in_place() {
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(ItemId::from_raw(3));
        let (mut bytes, _) = builder.finish();
        let sites = collect_ref_sites(&bytes).unwrap();
        write_id(&mut bytes, sites[0], 0x1234);
        assert_eq!(read_id(&bytes, sites[0]), 0x1234);
    }
}
