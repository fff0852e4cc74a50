//! Container build session: entity arena, interning tables and the write
//! pipeline entry point.

use indexmap::IndexMap;
use tracing::debug;

use crate::bytecode::BytecodeBuilder;
use crate::dedup::deduplicate;
use crate::error::ContainerResult;
use crate::index_section::partition_indexes;
use crate::items::{
    AnnotationElement, AnnotationPayload, ArrayValuePayload, ClassFlags, ClassIndexPayload,
    ClassPayload, CodePayload, DebugInfoPayload, FieldFlags, FieldPayload, ForeignClassPayload,
    IndexSectionPayload, Item, ItemId, ItemKind, LNP_ADVANCE_LINE, LNP_ADVANCE_PC, LNP_END,
    LNP_END_LOCAL, LNP_SET_FILE, LNP_SET_SOURCE_CODE, LNP_START_LOCAL, LineProgramIndexPayload,
    LineProgramPayload, MethodFlags, MethodPayload, PoolEntry, PrimitiveTy, ProtoPayload,
    SHORTY_REFERENCE, ScalarValue, StringPayload, TryBlock, VALUE_ANNOTATION, VALUE_ARRAY,
    VALUE_CLASS, VALUE_DOUBLE, VALUE_FIELD, VALUE_FLOAT, VALUE_INTEGER, VALUE_LONG, VALUE_METHOD,
    VALUE_STRING,
};
use crate::layout::{Profile, compute_layout, profile_guided_relayout};
use crate::span::{SpanWriter, decode_mutf8, encode_mutf8};
use crate::writer::serialize;

/// Interning key for scalar constant values. Floating keys use the bit
/// pattern so `+0.0` and `-0.0` intern separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ValueKey {
    Integer(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Reference(ItemId),
}

/// Interning key for prototypes: the derived shorty plus the ordered
/// reference types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProtoKey {
    shorty: Vec<u8>,
    references: Vec<ItemId>,
}

/// Knobs for [`ItemContainer::write`].
#[derive(Default)]
pub struct WriteOptions {
    /// Skip structural deduplication, producing a larger but more diffable
    /// file.
    pub skip_dedup: bool,
    /// Hotness profile for the optional relayout pass.
    pub profile: Option<Profile>,
}

/// One build or read session. The container owns every entity it creates;
/// no entity outlives it.
pub struct ItemContainer {
    arena: Vec<Item>,
    /// Foreign declarations, laid out in their own contiguous region.
    pub(crate) foreign_items: Vec<ItemId>,
    /// Regular non-code entities in emission order.
    pub(crate) regular_items: Vec<ItemId>,
    /// Code bodies, always laid out after every regular entity.
    pub(crate) code_items: Vec<ItemId>,
    /// Debug entities, always laid out after every code body.
    pub(crate) debug_items: Vec<ItemId>,

    strings: IndexMap<String, ItemId>,
    class_names: IndexMap<String, ItemId>,
    values: IndexMap<ValueKey, ItemId>,
    protos: IndexMap<ProtoKey, ItemId>,
    primitives: IndexMap<u32, ItemId>,

    pub(crate) class_index_item: ItemId,
    pub(crate) line_program_index_item: ItemId,
    pub(crate) index_section_item: ItemId,
    pub(crate) end_regular: ItemId,
    pub(crate) end_code: ItemId,
    pub(crate) end_debug: ItemId,

    pub(crate) deduplicated: bool,
}

impl Default for ItemContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemContainer {
    pub fn new() -> Self {
        let mut container = ItemContainer {
            arena: Vec::new(),
            foreign_items: Vec::new(),
            regular_items: Vec::new(),
            code_items: Vec::new(),
            debug_items: Vec::new(),
            strings: IndexMap::new(),
            class_names: IndexMap::new(),
            values: IndexMap::new(),
            protos: IndexMap::new(),
            primitives: IndexMap::new(),
            class_index_item: ItemId::new(0),
            line_program_index_item: ItemId::new(0),
            index_section_item: ItemId::new(0),
            end_regular: ItemId::new(0),
            end_code: ItemId::new(0),
            end_debug: ItemId::new(0),
            deduplicated: false,
        };
        container.class_index_item =
            container.alloc(ItemKind::ClassIndex(ClassIndexPayload::default()));
        container.line_program_index_item = container.alloc(ItemKind::LineProgramIndex(
            LineProgramIndexPayload::default(),
        ));
        container.index_section_item =
            container.alloc(ItemKind::IndexSection(IndexSectionPayload::default()));
        container.end_regular = container.alloc(ItemKind::End);
        container.end_code = container.alloc(ItemKind::End);
        container.end_debug = container.alloc(ItemKind::End);
        container
    }

    pub(crate) fn alloc(&mut self, kind: ItemKind) -> ItemId {
        let id = ItemId::new(self.arena.len());
        self.arena.push(Item::new(kind));
        id
    }

    pub fn item(&self, id: ItemId) -> &Item {
        &self.arena[id.index()]
    }

    /// Iterates every entity in the arena in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &Item)> {
        self.arena
            .iter()
            .enumerate()
            .map(|(index, item)| (ItemId::new(index), item))
    }

    pub(crate) fn item_mut(&mut self, id: ItemId) -> &mut Item {
        &mut self.arena[id.index()]
    }

    pub(crate) fn arena_len(&self) -> usize {
        self.arena.len()
    }

    // ---- interned entities -------------------------------------------------

    /// Returns the unique string entity for `value`, creating it on first
    /// use.
    pub fn get_or_create_string(&mut self, value: &str) -> ItemId {
        if let Some(&id) = self.strings.get(value) {
            return id;
        }
        let (bytes, utf16_len, is_ascii) = encode_mutf8(value);
        let id = self.alloc(ItemKind::String(StringPayload {
            bytes,
            utf16_len,
            is_ascii,
        }));
        self.regular_items.push(id);
        self.strings.insert(value.to_owned(), id);
        id
    }

    /// Returns the unique class entity named `name`, creating an empty
    /// definition on first use.
    pub fn get_or_create_class(&mut self, name: &str) -> ItemId {
        if let Some(&id) = self.class_names.get(name) {
            assert!(
                matches!(self.item(id).kind, ItemKind::Class(_)),
                "class name {name:?} already registered as a foreign declaration"
            );
            return id;
        }
        let name_id = self.get_or_create_string(name);
        let id = self.alloc(ItemKind::Class(ClassPayload {
            name: name_id,
            super_class: None,
            interfaces: Vec::new(),
            flags: ClassFlags::empty(),
            source_file: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }));
        self.regular_items.push(id);
        self.class_names.insert(name.to_owned(), id);
        id
    }

    /// Returns the unique foreign-class declaration named `name`.
    pub fn get_or_create_foreign_class(&mut self, name: &str) -> ItemId {
        if let Some(&id) = self.class_names.get(name) {
            assert!(
                matches!(self.item(id).kind, ItemKind::ForeignClass(_)),
                "class name {name:?} already registered as a definition"
            );
            return id;
        }
        let name_id = self.get_or_create_string(name);
        let id = self.alloc(ItemKind::ForeignClass(ForeignClassPayload { name: name_id }));
        self.foreign_items.push(id);
        self.class_names.insert(name.to_owned(), id);
        id
    }

    /// Returns the per-container singleton entity for a primitive type.
    pub fn get_or_create_primitive_type(&mut self, ty: PrimitiveTy) -> ItemId {
        if let Some(&id) = self.primitives.get(&ty.id()) {
            return id;
        }
        let id = self.alloc(ItemKind::PrimitiveType(ty));
        self.primitives.insert(ty.id(), id);
        id
    }

    pub fn get_or_create_integer_value(&mut self, value: i32) -> ItemId {
        self.get_or_create_value(ValueKey::Integer(value), ScalarValue::Integer(value))
    }

    pub fn get_or_create_long_value(&mut self, value: i64) -> ItemId {
        self.get_or_create_value(ValueKey::Long(value), ScalarValue::Long(value))
    }

    /// Keyed by bit pattern: `+0.0` and `-0.0` are distinct constants.
    pub fn get_or_create_float_value(&mut self, value: f32) -> ItemId {
        let bits = value.to_bits();
        self.get_or_create_value(ValueKey::Float(bits), ScalarValue::Float(bits))
    }

    /// Keyed by bit pattern: `+0.0` and `-0.0` are distinct constants.
    pub fn get_or_create_double_value(&mut self, value: f64) -> ItemId {
        let bits = value.to_bits();
        self.get_or_create_value(ValueKey::Double(bits), ScalarValue::Double(bits))
    }

    /// Constant holding a reference to another entity (string, class,
    /// method, field, annotation or literal array).
    pub fn get_or_create_reference_value(&mut self, target: ItemId) -> ItemId {
        self.get_or_create_value(ValueKey::Reference(target), ScalarValue::Reference(target))
    }

    fn get_or_create_value(&mut self, key: ValueKey, value: ScalarValue) -> ItemId {
        if let Some(&id) = self.values.get(&key) {
            return id;
        }
        let id = self.alloc(ItemKind::ScalarValue(value));
        self.regular_items.push(id);
        self.values.insert(key, id);
        id
    }

    /// Returns the unique prototype for the given return and parameter
    /// types. Identity is the derived shorty plus the ordered reference
    /// types.
    pub fn get_or_create_proto(&mut self, return_type: ItemId, param_types: Vec<ItemId>) -> ItemId {
        let mut shorty = Vec::with_capacity(param_types.len() + 1);
        let mut references = Vec::new();
        for &ty in std::iter::once(&return_type).chain(param_types.iter()) {
            match &self.item(ty).kind {
                ItemKind::PrimitiveType(primitive) => shorty.push(primitive.shorty_code()),
                ItemKind::Class(_) | ItemKind::ForeignClass(_) => {
                    shorty.push(SHORTY_REFERENCE);
                    references.push(ty);
                }
                other => panic!("prototype built from non-type {} item", other.name()),
            }
        }
        let key = ProtoKey {
            shorty: shorty.clone(),
            references: references.clone(),
        };
        if let Some(&id) = self.protos.get(&key) {
            return id;
        }
        let id = self.alloc(ItemKind::Proto(ProtoPayload {
            return_type,
            param_types,
            shorty,
            reference_types: references,
        }));
        self.regular_items.push(id);
        self.protos.insert(key, id);
        id
    }

    // ---- class members -----------------------------------------------------

    /// Creates a fresh field owned by `class`. Fields are never interned;
    /// structurally equal fields in different classes stay distinct.
    pub fn add_field(
        &mut self,
        class: ItemId,
        name: ItemId,
        ty: ItemId,
        flags: FieldFlags,
    ) -> ItemId {
        let id = self.alloc(ItemKind::Field(FieldPayload {
            class,
            name,
            ty,
            flags,
            value: None,
        }));
        self.regular_items.push(id);
        self.expect_class_mut(class).fields.push(id);
        id
    }

    /// Attaches a constant value to a field. Field values are scalar
    /// entities; their serialized form starts with a self-describing tag.
    pub fn set_field_value(&mut self, field: ItemId, value: ItemId) {
        assert!(
            matches!(self.item(value).kind, ItemKind::ScalarValue(_)),
            "field value must be a scalar value item"
        );
        match &mut self.item_mut(field).kind {
            ItemKind::Field(payload) => payload.value = Some(value),
            other => panic!("set_field_value on {} item", other.name()),
        }
    }

    /// Creates a fresh method owned by `class`.
    pub fn add_method(
        &mut self,
        class: ItemId,
        name: ItemId,
        proto: ItemId,
        flags: MethodFlags,
    ) -> ItemId {
        let id = self.alloc(ItemKind::Method(MethodPayload {
            class,
            name,
            proto,
            flags,
            code: None,
            debug_info: None,
            annotations: Vec::new(),
            deps: Vec::new(),
        }));
        self.regular_items.push(id);
        self.expect_class_mut(class).methods.push(id);
        id
    }

    /// Declares a method defined in another file.
    pub fn add_foreign_method(
        &mut self,
        class: ItemId,
        name: ItemId,
        proto: ItemId,
        flags: MethodFlags,
    ) -> ItemId {
        let id = self.alloc(ItemKind::ForeignMethod(MethodPayload {
            class,
            name,
            proto,
            flags,
            code: None,
            debug_info: None,
            annotations: Vec::new(),
            deps: Vec::new(),
        }));
        self.foreign_items.push(id);
        id
    }

    /// Declares a field defined in another file.
    pub fn add_foreign_field(
        &mut self,
        class: ItemId,
        name: ItemId,
        ty: ItemId,
        flags: FieldFlags,
    ) -> ItemId {
        let id = self.alloc(ItemKind::ForeignField(FieldPayload {
            class,
            name,
            ty,
            flags,
            value: None,
        }));
        self.foreign_items.push(id);
        id
    }

    /// Attaches a freshly built code body to `method` and registers its
    /// index dependencies (operand references plus catch-block types).
    pub fn set_method_code(
        &mut self,
        method: ItemId,
        num_vregs: u32,
        num_args: u32,
        builder: BytecodeBuilder,
        try_blocks: Vec<TryBlock>,
    ) -> ItemId {
        let (bytes, mut deps) = builder.finish();
        for block in &try_blocks {
            for handler in &block.handlers {
                if let Some(type_ref) = handler.type_ref {
                    if !deps.contains(&type_ref) {
                        deps.push(type_ref);
                    }
                }
            }
        }
        let full_name = self.full_method_name(method);
        let code = self.alloc(ItemKind::Code(CodePayload {
            num_vregs,
            num_args,
            bytes,
            try_blocks,
            covered_methods: vec![full_name],
        }));
        self.code_items.push(code);
        let payload = self.expect_method_mut(method);
        payload.code = Some(code);
        payload.deps = deps;
        code
    }

    /// Creates a fresh annotation of type `class`. Element value tags are
    /// derived from the value entities.
    pub fn new_annotation(&mut self, class: ItemId, elements: Vec<(ItemId, ItemId)>) -> ItemId {
        let tags: Vec<u8> = elements
            .iter()
            .map(|&(_, value)| self.value_tag(value))
            .collect();
        let elements = elements
            .into_iter()
            .map(|(name, value)| AnnotationElement { name, value })
            .collect();
        let id = self.alloc(ItemKind::Annotation(AnnotationPayload {
            class,
            elements,
            tags,
        }));
        self.regular_items.push(id);
        id
    }

    pub fn add_class_annotation(&mut self, class: ItemId, annotation: ItemId) {
        self.expect_class_mut(class).annotations.push(annotation);
    }

    pub fn add_method_annotation(&mut self, method: ItemId, annotation: ItemId) {
        self.expect_method_mut(method).annotations.push(annotation);
    }

    pub fn set_class_super(&mut self, class: ItemId, super_class: ItemId) {
        self.expect_class_mut(class).super_class = Some(super_class);
    }

    pub fn add_class_interface(&mut self, class: ItemId, interface: ItemId) {
        self.expect_class_mut(class).interfaces.push(interface);
    }

    pub fn set_class_source_file(&mut self, class: ItemId, source_file: ItemId) {
        self.expect_class_mut(class).source_file = Some(source_file);
    }

    pub fn set_class_flags(&mut self, class: ItemId, flags: ClassFlags) {
        self.expect_class_mut(class).flags = flags;
    }

    /// Creates a literal array of interned scalar values. Arrays are
    /// homogeneous; the component tag is taken from the first element.
    pub fn new_array_value(&mut self, elements: Vec<ItemId>) -> ItemId {
        let component_tag = elements
            .first()
            .map(|&first| self.value_tag(first))
            .unwrap_or(VALUE_INTEGER);
        for &element in &elements {
            assert!(
                matches!(self.item(element).kind, ItemKind::ScalarValue(_)),
                "array element must be a scalar value"
            );
        }
        let id = self.alloc(ItemKind::ArrayValue(ArrayValuePayload {
            component_tag,
            elements,
        }));
        self.regular_items.push(id);
        id
    }

    /// Attaches debug info built from a line-number program to `method`.
    /// Creates both the program entity and the debug-info entity holding
    /// the operand pool.
    pub fn add_debug_info(
        &mut self,
        method: ItemId,
        line_start: u32,
        params: Vec<ItemId>,
        builder: LineProgramBuilder,
    ) -> ItemId {
        let (bytes, pool) = builder.finish();
        let program = self.alloc(ItemKind::LineProgram(LineProgramPayload { bytes }));
        self.debug_items.push(program);
        let debug = self.alloc(ItemKind::DebugInfo(DebugInfoPayload {
            line_start,
            params,
            pool,
            program,
        }));
        self.debug_items.push(debug);
        self.expect_method_mut(method).debug_info = Some(debug);
        debug
    }

    // ---- write pipeline ----------------------------------------------------

    /// Serializes the container into a complete file image.
    ///
    /// Runs deduplication (unless skipped), the optional profile-guided
    /// reorder, index partitioning, layout, operand rewriting and
    /// serialization, in that order.
    pub fn write(&mut self, options: &WriteOptions) -> ContainerResult<Vec<u8>> {
        if !options.skip_dedup {
            deduplicate(self);
        }
        if let Some(profile) = &options.profile {
            profile_guided_relayout(self, profile);
        }
        let partition = partition_indexes(self)?;
        let layout = compute_layout(self);
        debug!(
            file_size = layout.file_size,
            headers = partition.header_count(),
            "container laid out"
        );
        serialize(self, &partition, &layout)
    }

    // ---- shared lookups ----------------------------------------------------

    /// Decoded text of a string entity.
    pub fn string_text(&self, id: ItemId) -> String {
        match &self.item(id).kind {
            ItemKind::String(payload) => {
                decode_mutf8(&payload.bytes).expect("interned string is valid MUTF-8")
            }
            other => panic!("string_text on {} item", other.name()),
        }
    }

    /// Class or foreign class registered under `name`, if any.
    pub(crate) fn class_by_name(&self, name: &str) -> Option<ItemId> {
        self.class_names.get(name).copied()
    }

    /// Name of a class or foreign-class entity.
    pub fn class_name(&self, id: ItemId) -> String {
        match &self.item(id).kind {
            ItemKind::Class(payload) => self.string_text(payload.name),
            ItemKind::ForeignClass(payload) => self.string_text(payload.name),
            other => panic!("class_name on {} item", other.name()),
        }
    }

    /// `Class::method` diagnostic name used for code coverage tracking and
    /// profile matching.
    pub fn full_method_name(&self, method: ItemId) -> String {
        let payload = self.expect_method(method);
        format!(
            "{}::{}",
            self.class_name(payload.class),
            self.string_text(payload.name)
        )
    }

    /// On-disk value tag for an annotation element or array component.
    pub(crate) fn value_tag(&self, value: ItemId) -> u8 {
        match &self.item(value).kind {
            ItemKind::ScalarValue(scalar) => match scalar {
                ScalarValue::Integer(_) => VALUE_INTEGER,
                ScalarValue::Long(_) => VALUE_LONG,
                ScalarValue::Float(_) => VALUE_FLOAT,
                ScalarValue::Double(_) => VALUE_DOUBLE,
                ScalarValue::Reference(target) => match &self.item(*target).kind {
                    ItemKind::String(_) => VALUE_STRING,
                    ItemKind::Method(_) | ItemKind::ForeignMethod(_) => VALUE_METHOD,
                    ItemKind::Field(_) | ItemKind::ForeignField(_) => VALUE_FIELD,
                    ItemKind::Class(_) | ItemKind::ForeignClass(_) => VALUE_CLASS,
                    // Annotations and arrays are element values themselves;
                    // wrapping them in a reference scalar would make the
                    // encoded element ambiguous to decode.
                    other => panic!("reference value to unsupported {} item", other.name()),
                },
            },
            ItemKind::ArrayValue(_) => VALUE_ARRAY,
            ItemKind::Annotation(_) => VALUE_ANNOTATION,
            other => panic!("value tag of non-value {} item", other.name()),
        }
    }

    pub(crate) fn expect_class(&self, id: ItemId) -> &ClassPayload {
        match &self.item(id).kind {
            ItemKind::Class(payload) => payload,
            other => panic!("expected class item, found {}", other.name()),
        }
    }

    pub(crate) fn expect_class_mut(&mut self, id: ItemId) -> &mut ClassPayload {
        match &mut self.item_mut(id).kind {
            ItemKind::Class(payload) => payload,
            other => panic!("expected class item, found {}", other.name()),
        }
    }

    /// Accepts both regular and foreign methods.
    pub(crate) fn expect_method(&self, id: ItemId) -> &MethodPayload {
        match &self.item(id).kind {
            ItemKind::Method(payload) | ItemKind::ForeignMethod(payload) => payload,
            other => panic!("expected method item, found {}", other.name()),
        }
    }

    pub(crate) fn expect_method_mut(&mut self, id: ItemId) -> &mut MethodPayload {
        match &mut self.item_mut(id).kind {
            ItemKind::Method(payload) | ItemKind::ForeignMethod(payload) => payload,
            other => panic!("expected method item, found {}", other.name()),
        }
    }

    pub(crate) fn expect_code(&self, id: ItemId) -> &CodePayload {
        match &self.item(id).kind {
            ItemKind::Code(payload) => payload,
            other => panic!("expected code item, found {}", other.name()),
        }
    }

    pub(crate) fn expect_code_mut(&mut self, id: ItemId) -> &mut CodePayload {
        match &mut self.item_mut(id).kind {
            ItemKind::Code(payload) => payload,
            other => panic!("expected code item, found {}", other.name()),
        }
    }

    /// Cached serialized size, computing it on first request. Requesting the
    /// size of a bookkeeping entity the partitioning engine has not
    /// finalized is an internal-consistency failure.
    pub(crate) fn size_of(&mut self, id: ItemId) -> u32 {
        if let Some(size) = self.item(id).size {
            return size;
        }
        let size = self.item(id).kind.compute_size().unwrap_or_else(|| {
            panic!(
                "size of {} item requested before it was finalized",
                self.item(id).kind.name()
            )
        });
        self.item_mut(id).size = Some(size);
        size
    }

    /// Regular methods in emission order.
    pub(crate) fn emitted_methods(&self) -> Vec<ItemId> {
        self.regular_items
            .iter()
            .copied()
            .filter(|&id| {
                self.item(id).needs_emission && matches!(self.item(id).kind, ItemKind::Method(_))
            })
            .collect()
    }
}

/// Builds a line-number program opcode stream together with the operand
/// constant pool stored in the owning debug-info entity.
///
/// The reader replays serialized programs through these same primitives.
#[derive(Default)]
pub struct LineProgramBuilder {
    writer: SpanWriter,
    pool: Vec<PoolEntry>,
    ended: bool,
}

impl LineProgramBuilder {
    pub fn new() -> Self {
        LineProgramBuilder::default()
    }

    pub fn emit_advance_pc(&mut self, delta: u32) {
        self.writer.write_u8(LNP_ADVANCE_PC);
        self.pool.push(PoolEntry::Number(delta));
    }

    pub fn emit_advance_line(&mut self, delta: i32) {
        self.writer.write_u8(LNP_ADVANCE_LINE);
        self.pool.push(PoolEntry::Number(delta as u32));
    }

    pub fn emit_start_local(&mut self, register: i32, name: ItemId, ty: ItemId) {
        self.writer.write_u8(LNP_START_LOCAL);
        self.writer.write_sleb128(register as i64);
        self.pool.push(PoolEntry::Item(name));
        self.pool.push(PoolEntry::Item(ty));
    }

    pub fn emit_end_local(&mut self, register: i32) {
        self.writer.write_u8(LNP_END_LOCAL);
        self.writer.write_sleb128(register as i64);
    }

    pub fn emit_set_file(&mut self, source_file: ItemId) {
        self.writer.write_u8(LNP_SET_FILE);
        self.pool.push(PoolEntry::Item(source_file));
    }

    pub fn emit_set_source_code(&mut self, source_code: ItemId) {
        self.writer.write_u8(LNP_SET_SOURCE_CODE);
        self.pool.push(PoolEntry::Item(source_code));
    }

    pub fn emit_end(&mut self) {
        self.writer.write_u8(LNP_END);
        self.ended = true;
    }

    pub(crate) fn finish(mut self) -> (Vec<u8>, Vec<PoolEntry>) {
        if !self.ended {
            self.writer.write_u8(LNP_END);
        }
        (self.writer.into_inner(), self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::PrimitiveTy;

    #[test]
    fn strings_intern_by_content() {
        let mut container = ItemContainer::new();
        let a = container.get_or_create_string("hello");
        let b = container.get_or_create_string("hello");
        let c = container.get_or_create_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn class_names_intern_and_classes_share_name_string() {
        let mut container = ItemContainer::new();
        let a = container.get_or_create_class("LFoo;");
        let b = container.get_or_create_class("LFoo;");
        assert_eq!(a, b);
        let name = container.get_or_create_string("LFoo;");
        assert_eq!(container.expect_class(a).name, name);
    }

    #[test]
    #[should_panic(expected = "already registered as a foreign declaration")]
    fn class_name_cannot_shadow_foreign_declaration() {
        let mut container = ItemContainer::new();
        container.get_or_create_foreign_class("LShadow;");
        container.get_or_create_class("LShadow;");
    }

    #[test]
    fn signed_zero_floats_intern_separately() {
        let mut container = ItemContainer::new();
        let pos = container.get_or_create_float_value(0.0);
        let neg = container.get_or_create_float_value(-0.0);
        assert_ne!(pos, neg);
        assert_eq!(pos, container.get_or_create_float_value(0.0));

        let pos = container.get_or_create_double_value(0.0);
        let neg = container.get_or_create_double_value(-0.0);
        assert_ne!(pos, neg);
    }

    #[test]
    fn numeric_values_intern_by_content() {
        let mut container = ItemContainer::new();
        assert_eq!(
            container.get_or_create_integer_value(7),
            container.get_or_create_integer_value(7)
        );
        assert_ne!(
            container.get_or_create_integer_value(7),
            container.get_or_create_long_value(7)
        );
        assert_eq!(
            container.get_or_create_long_value(-1),
            container.get_or_create_long_value(-1)
        );
    }

    #[test]
    fn protos_intern_by_signature() {
        let mut container = ItemContainer::new();
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let i32_ty = container.get_or_create_primitive_type(PrimitiveTy::I32);
        let class = container.get_or_create_class("LArg;");

        let a = container.get_or_create_proto(void, vec![i32_ty, class]);
        let b = container.get_or_create_proto(void, vec![i32_ty, class]);
        let c = container.get_or_create_proto(void, vec![class, i32_ty]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn primitive_types_are_singletons() {
        let mut container = ItemContainer::new();
        assert_eq!(
            container.get_or_create_primitive_type(PrimitiveTy::F64),
            container.get_or_create_primitive_type(PrimitiveTy::F64)
        );
    }

    #[test]
    fn methods_are_fresh_per_call() {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LFoo;");
        let name = container.get_or_create_string("bar");
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        let a = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        let b = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        assert_ne!(a, b);
        assert_eq!(container.expect_class(class).methods, vec![a, b]);
    }

    #[test]
    fn full_method_name_joins_class_and_method() {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LFoo;");
        let name = container.get_or_create_string("bar");
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        let method = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        assert_eq!(container.full_method_name(method), "LFoo;::bar");
    }
}
