//! Entity model for the container: one tagged variant per on-disk construct.
//!
//! Entities live in an arena owned by the container and reference each other
//! through [`ItemId`] handles, so mutual references (class <-> method <->
//! code, annotation <-> nested annotation) never form owning cycles.

use bitflags::bitflags;

use crate::bytecode::RefKind;
use crate::span::uleb128_size;

/// Arena handle identifying one entity inside its owning container.
///
/// Handles are assigned in creation order and double as the stable global
/// identity used by the index partitioning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u32);

impl ItemId {
    pub(crate) const fn new(index: usize) -> Self {
        ItemId(index as u32)
    }

    /// Constructs a handle from a raw arena index. Only meaningful for the
    /// container that produced the index.
    pub const fn from_raw(index: u32) -> Self {
        ItemId(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Primitive value kinds. One [`ItemKind::PrimitiveType`] instance exists per
/// kind per container; the on-disk type reference encodes the id inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTy {
    Void,
    Boolean,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl PrimitiveTy {
    pub const fn id(self) -> u32 {
        match self {
            PrimitiveTy::Void => 0,
            PrimitiveTy::Boolean => 1,
            PrimitiveTy::I8 => 2,
            PrimitiveTy::U8 => 3,
            PrimitiveTy::I16 => 4,
            PrimitiveTy::U16 => 5,
            PrimitiveTy::I32 => 6,
            PrimitiveTy::U32 => 7,
            PrimitiveTy::I64 => 8,
            PrimitiveTy::U64 => 9,
            PrimitiveTy::F32 => 10,
            PrimitiveTy::F64 => 11,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => PrimitiveTy::Void,
            1 => PrimitiveTy::Boolean,
            2 => PrimitiveTy::I8,
            3 => PrimitiveTy::U8,
            4 => PrimitiveTy::I16,
            5 => PrimitiveTy::U16,
            6 => PrimitiveTy::I32,
            7 => PrimitiveTy::U32,
            8 => PrimitiveTy::I64,
            9 => PrimitiveTy::U64,
            10 => PrimitiveTy::F32,
            11 => PrimitiveTy::F64,
            _ => return None,
        })
    }

    /// Single-character shorty code used in prototype signatures.
    pub const fn shorty_code(self) -> u8 {
        match self {
            PrimitiveTy::Void => b'V',
            PrimitiveTy::Boolean => b'Z',
            PrimitiveTy::I8 => b'B',
            PrimitiveTy::U8 => b'H',
            PrimitiveTy::I16 => b'S',
            PrimitiveTy::U16 => b'C',
            PrimitiveTy::I32 => b'I',
            PrimitiveTy::U32 => b'U',
            PrimitiveTy::I64 => b'J',
            PrimitiveTy::U64 => b'Q',
            PrimitiveTy::F32 => b'F',
            PrimitiveTy::F64 => b'D',
        }
    }
}

/// Shorty code marking a reference type in a prototype signature.
pub const SHORTY_REFERENCE: u8 = b'L';

bitflags! {
    /// Access and property flags on a class definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const ANNOTATION = 0x2000;
    }
}

bitflags! {
    /// Access and property flags on a method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
    }
}

bitflags! {
    /// Access and property flags on a field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
    }
}

// Tagged-data ids shared by method, field and class bodies.
pub const TAG_END: u8 = 0x00;
pub const TAG_CODE: u8 = 0x01;
pub const TAG_VALUE: u8 = 0x02;
pub const TAG_DEBUG_INFO: u8 = 0x05;
pub const TAG_ANNOTATION: u8 = 0x06;

// Line-number program opcodes. Operand values live in the owning debug-info
// item's constant pool, except register numbers which are inline SLEB128.
pub const LNP_END: u8 = 0x00;
pub const LNP_ADVANCE_PC: u8 = 0x01;
pub const LNP_ADVANCE_LINE: u8 = 0x02;
pub const LNP_START_LOCAL: u8 = 0x03;
pub const LNP_END_LOCAL: u8 = 0x05;
pub const LNP_SET_FILE: u8 = 0x09;
pub const LNP_SET_SOURCE_CODE: u8 = 0x0a;

// On-disk tags for scalar value payloads and annotation elements.
pub const VALUE_INTEGER: u8 = 0x00;
pub const VALUE_LONG: u8 = 0x01;
pub const VALUE_FLOAT: u8 = 0x02;
pub const VALUE_DOUBLE: u8 = 0x03;
pub const VALUE_STRING: u8 = 0x04;
pub const VALUE_METHOD: u8 = 0x05;
pub const VALUE_FIELD: u8 = 0x06;
pub const VALUE_CLASS: u8 = 0x07;
pub const VALUE_ANNOTATION: u8 = 0x08;
pub const VALUE_ARRAY: u8 = 0x09;

/// Catch-all marker in the encoded catch-block type index field.
pub const CATCH_TYPE_NONE: u16 = 0xffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringPayload {
    pub bytes: Vec<u8>,
    pub utf16_len: u32,
    pub is_ascii: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPayload {
    pub name: ItemId,
    pub super_class: Option<ItemId>,
    pub interfaces: Vec<ItemId>,
    pub flags: ClassFlags,
    pub source_file: Option<ItemId>,
    pub annotations: Vec<ItemId>,
    pub fields: Vec<ItemId>,
    pub methods: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignClassPayload {
    pub name: ItemId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPayload {
    /// Owning class; a non-owning back-reference kept for diagnostics and
    /// profile matching.
    pub class: ItemId,
    pub name: ItemId,
    pub proto: ItemId,
    pub flags: MethodFlags,
    pub code: Option<ItemId>,
    pub debug_info: Option<ItemId>,
    pub annotations: Vec<ItemId>,
    /// Entities this method's bytecode references, in first-use order.
    /// Operand ordinals index into this list until final serialization.
    pub deps: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPayload {
    pub class: ItemId,
    pub name: ItemId,
    /// A primitive-type item or a (foreign) class item.
    pub ty: ItemId,
    pub flags: FieldFlags,
    pub value: Option<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchHandler {
    /// `None` catches every type.
    pub type_ref: Option<ItemId>,
    pub handler_pc: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryBlock {
    pub start_pc: u32,
    pub length: u32,
    pub handlers: Vec<CatchHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePayload {
    pub num_vregs: u32,
    pub num_args: u32,
    pub bytes: Vec<u8>,
    pub try_blocks: Vec<TryBlock>,
    /// Full names of every method sharing this body, for diagnostics and
    /// profile matching. Not part of structural identity.
    pub covered_methods: Vec<String>,
}

/// One operand slot in a debug-info constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEntry {
    /// Reference to another entity (string or type), written as its resolved
    /// reference value.
    Item(ItemId),
    /// Plain numeric operand (pc or line advance).
    Number(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfoPayload {
    pub line_start: u32,
    pub params: Vec<ItemId>,
    pub pool: Vec<PoolEntry>,
    pub program: ItemId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineProgramPayload {
    /// Opcode stream, terminated by [`LNP_END`].
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationElement {
    pub name: ItemId,
    pub value: ItemId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationPayload {
    /// The annotation's declared type.
    pub class: ItemId,
    pub elements: Vec<AnnotationElement>,
    /// One on-disk value tag per element, in element order.
    pub tags: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarValue {
    Integer(i32),
    Long(i64),
    /// Stored as the bit pattern so `+0.0` and `-0.0` stay distinct.
    Float(u32),
    Double(u64),
    Reference(ItemId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayValuePayload {
    /// Scalar tag shared by every element.
    pub component_tag: u8,
    pub elements: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoPayload {
    pub return_type: ItemId,
    pub param_types: Vec<ItemId>,
    /// Derived signature: one code byte per type, references collapsed to
    /// [`SHORTY_REFERENCE`].
    pub shorty: Vec<u8>,
    /// Reference types in signature order.
    pub reference_types: Vec<ItemId>,
}

/// Sub-table of absolute class offsets, sorted by class name bytes.
#[derive(Debug, Clone, Default)]
pub struct ClassIndexPayload {
    pub classes: Vec<ItemId>,
    pub finalized: bool,
}

/// Global offset table for line-number programs, in descending
/// reference-count order.
#[derive(Debug, Clone, Default)]
pub struct LineProgramIndexPayload {
    pub programs: Vec<ItemId>,
    pub finalized: bool,
}

/// One bounded grouping of methods and the per-kind entities their bytecode
/// may address through compact local indices.
#[derive(Debug, Clone, Default)]
pub struct IndexHeader {
    pub methods: Vec<ItemId>,
    /// Covered entities per [`RefKind`], in assigned-index order.
    pub entries: [Vec<ItemId>; 5],
}

impl IndexHeader {
    pub fn entries(&self, kind: RefKind) -> &Vec<ItemId> {
        &self.entries[kind_slot(kind)]
    }

    pub fn entries_mut(&mut self, kind: RefKind) -> &mut Vec<ItemId> {
        &mut self.entries[kind_slot(kind)]
    }
}

pub(crate) fn kind_slot(kind: RefKind) -> usize {
    match kind {
        RefKind::Class => 0,
        RefKind::Method => 1,
        RefKind::Field => 2,
        RefKind::String => 3,
        RefKind::LiteralArray => 4,
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexSectionPayload {
    pub headers: Vec<IndexHeader>,
    pub finalized: bool,
}

/// Closed set of entity kinds the container can hold.
#[derive(Debug, Clone)]
pub enum ItemKind {
    String(StringPayload),
    Class(ClassPayload),
    ForeignClass(ForeignClassPayload),
    Method(MethodPayload),
    ForeignMethod(MethodPayload),
    Field(FieldPayload),
    ForeignField(FieldPayload),
    Code(CodePayload),
    DebugInfo(DebugInfoPayload),
    LineProgram(LineProgramPayload),
    Annotation(AnnotationPayload),
    ScalarValue(ScalarValue),
    ArrayValue(ArrayValuePayload),
    Proto(ProtoPayload),
    PrimitiveType(PrimitiveTy),
    ClassIndex(ClassIndexPayload),
    LineProgramIndex(LineProgramIndexPayload),
    IndexSection(IndexSectionPayload),
    /// Zero-size marker delimiting an emission segment. Never written as
    /// data.
    End,
}

impl ItemKind {
    /// Index space this entity belongs to when referenced from bytecode.
    pub fn ref_kind(&self) -> Option<RefKind> {
        match self {
            ItemKind::String(_) => Some(RefKind::String),
            ItemKind::Class(_) | ItemKind::ForeignClass(_) => Some(RefKind::Class),
            ItemKind::Method(_) | ItemKind::ForeignMethod(_) => Some(RefKind::Method),
            ItemKind::Field(_) | ItemKind::ForeignField(_) => Some(RefKind::Field),
            ItemKind::ArrayValue(_) => Some(RefKind::LiteralArray),
            _ => None,
        }
    }

    /// Required alignment of this entity's file offset.
    pub fn alignment(&self) -> u32 {
        match self {
            ItemKind::String(_) => 1,
            _ => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::String(_) => "string",
            ItemKind::Class(_) => "class",
            ItemKind::ForeignClass(_) => "foreign_class",
            ItemKind::Method(_) => "method",
            ItemKind::ForeignMethod(_) => "foreign_method",
            ItemKind::Field(_) => "field",
            ItemKind::ForeignField(_) => "foreign_field",
            ItemKind::Code(_) => "code",
            ItemKind::DebugInfo(_) => "debug_info",
            ItemKind::LineProgram(_) => "line_program",
            ItemKind::Annotation(_) => "annotation",
            ItemKind::ScalarValue(_) => "scalar_value",
            ItemKind::ArrayValue(_) => "array_value",
            ItemKind::Proto(_) => "proto",
            ItemKind::PrimitiveType(_) => "primitive_type",
            ItemKind::ClassIndex(_) => "class_index",
            ItemKind::LineProgramIndex(_) => "line_program_index",
            ItemKind::IndexSection(_) => "index_section",
            ItemKind::End => "end",
        }
    }

    /// Size of this entity's serialized form, computable from the payload
    /// alone. Returns `None` for bookkeeping entities whose content the
    /// index partitioning engine has not finalized yet.
    pub fn compute_size(&self) -> Option<u32> {
        Some(match self {
            ItemKind::String(payload) => {
                let tag = (payload.utf16_len << 1) | payload.is_ascii as u32;
                uleb128_size(tag) + payload.bytes.len() as u32 + 1
            }
            ItemKind::Class(payload) => {
                4 + 4
                    + uleb128_size(payload.flags.bits())
                    + 4
                    + uleb128_size(payload.interfaces.len() as u32)
                    + 4 * payload.interfaces.len() as u32
                    + uleb128_size(payload.annotations.len() as u32)
                    + 4 * payload.annotations.len() as u32
                    + uleb128_size(payload.fields.len() as u32)
                    + 4 * payload.fields.len() as u32
                    + uleb128_size(payload.methods.len() as u32)
                    + 4 * payload.methods.len() as u32
            }
            ItemKind::ForeignClass(_) => 4,
            ItemKind::Method(payload) => {
                let mut tags = payload.annotations.len() as u32;
                tags += payload.code.is_some() as u32;
                tags += payload.debug_info.is_some() as u32;
                12 + uleb128_size(payload.flags.bits()) + 5 * tags + 1
            }
            ItemKind::ForeignMethod(payload) => 12 + uleb128_size(payload.flags.bits()) + 1,
            ItemKind::Field(payload) => {
                let tags = payload.value.is_some() as u32;
                12 + uleb128_size(payload.flags.bits()) + 5 * tags + 1
            }
            ItemKind::ForeignField(payload) => 12 + uleb128_size(payload.flags.bits()) + 1,
            ItemKind::Code(payload) => {
                let mut size = uleb128_size(payload.num_vregs)
                    + uleb128_size(payload.num_args)
                    + uleb128_size(payload.bytes.len() as u32)
                    + uleb128_size(payload.try_blocks.len() as u32)
                    + payload.bytes.len() as u32;
                for block in &payload.try_blocks {
                    size += 8
                        + uleb128_size(block.handlers.len() as u32)
                        + 10 * block.handlers.len() as u32;
                }
                size
            }
            ItemKind::DebugInfo(payload) => {
                uleb128_size(payload.line_start)
                    + uleb128_size(payload.params.len() as u32)
                    + 4 * payload.params.len() as u32
                    + uleb128_size(payload.pool.len() as u32)
                    + 4 * payload.pool.len() as u32
                    + 4
            }
            ItemKind::LineProgram(payload) => payload.bytes.len() as u32,
            ItemKind::Annotation(payload) => {
                4 + uleb128_size(payload.elements.len() as u32)
                    + 9 * payload.elements.len() as u32
            }
            ItemKind::ScalarValue(value) => match value {
                ScalarValue::Integer(_) | ScalarValue::Float(_) => 5,
                ScalarValue::Long(_) | ScalarValue::Double(_) => 9,
                ScalarValue::Reference(_) => 5,
            },
            ItemKind::ArrayValue(payload) => {
                1 + uleb128_size(payload.elements.len() as u32)
                    + 4 * payload.elements.len() as u32
            }
            ItemKind::Proto(payload) => {
                uleb128_size(payload.shorty.len() as u32)
                    + payload.shorty.len() as u32
                    + 4 * payload.reference_types.len() as u32
            }
            ItemKind::PrimitiveType(_) => 0,
            ItemKind::ClassIndex(payload) => {
                if !payload.finalized {
                    return None;
                }
                4 * payload.classes.len() as u32
            }
            ItemKind::LineProgramIndex(payload) => {
                if !payload.finalized {
                    return None;
                }
                4 * payload.programs.len() as u32
            }
            ItemKind::IndexSection(payload) => {
                if !payload.finalized {
                    return None;
                }
                let mut size = 48 * payload.headers.len() as u32;
                for header in &payload.headers {
                    for entries in &header.entries {
                        size += 4 * entries.len() as u32;
                    }
                }
                size
            }
            ItemKind::End => 0,
        })
    }
}

/// One entity slot in the container arena.
#[derive(Debug, Clone)]
pub struct Item {
    pub kind: ItemKind,
    /// Cleared when deduplication collapses this entity into a survivor.
    pub needs_emission: bool,
    /// Declared in another file; carries no body and lives in the foreign
    /// region.
    pub foreign: bool,
    /// Assigned file offset. Valid only after a layout pass.
    pub offset: Option<u32>,
    /// Cached serialized size, computed once on first request.
    pub size: Option<u32>,
    /// Local slot per index header, `(header, slot)` pairs.
    pub index_slots: Vec<(u16, u16)>,
}

impl Item {
    pub fn new(kind: ItemKind) -> Self {
        let foreign = matches!(
            kind,
            ItemKind::ForeignClass(_) | ItemKind::ForeignMethod(_) | ItemKind::ForeignField(_)
        );
        let needs_emission = !kind_is_virtual(&kind);
        Item {
            kind,
            needs_emission,
            foreign,
            offset: None,
            size: None,
            index_slots: Vec::new(),
        }
    }

    /// File offset after layout; asserting before layout is a programming
    /// error, not a recoverable condition.
    pub fn expect_offset(&self) -> u32 {
        self.offset
            .unwrap_or_else(|| panic!("offset of {} item requested before layout", self.kind.name()))
    }

    /// Local index inside `header`, assigned by the partitioning engine.
    pub fn slot_in(&self, header: u16) -> Option<u16> {
        self.index_slots
            .iter()
            .find(|(h, _)| *h == header)
            .map(|(_, slot)| *slot)
    }

    pub fn set_slot(&mut self, header: u16, slot: u16) {
        debug_assert!(
            self.slot_in(header).is_none(),
            "slot already assigned in header {header}"
        );
        self.index_slots.push((header, slot));
    }
}

/// Entities that never occupy file bytes of their own.
fn kind_is_virtual(kind: &ItemKind) -> bool {
    matches!(kind, ItemKind::PrimitiveType(_) | ItemKind::End)
}
