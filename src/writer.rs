//! Serialization of a laid-out container into a file image.
//!
//! The arena is never mutated here: bytecode operand ordinals are rewritten
//! to header-local slots in a scratch copy of each body, so writing the same
//! container twice produces identical bytes.

use std::collections::HashMap;

use adler32::RollingAdler32;
use tracing::trace;

use crate::bytecode::{collect_ref_sites, read_id, write_id};
use crate::container::ItemContainer;
use crate::error::ContainerResult;
use crate::index_section::PartitionResult;
use crate::items::{
    CATCH_TYPE_NONE, CodePayload, IndexSectionPayload, ItemId, ItemKind, PoolEntry,
    TAG_ANNOTATION, TAG_CODE, TAG_DEBUG_INFO, TAG_END, TAG_VALUE, ScalarValue,
};
use crate::layout::LayoutSummary;
use crate::span::SpanWriter;

pub(crate) const MAGIC: [u8; 8] = *b"abccont\0";
pub(crate) const VERSION: [u8; 4] = [0, 0, 1, 0];
/// Fixed header size; also the threshold below which an encoded type
/// reference is an inline primitive id rather than an entity offset.
pub(crate) const HEADER_SIZE: u32 = 52;
/// Byte position of the checksum field. The checksum covers every byte
/// after it.
pub(crate) const CHECKSUM_OFFSET: usize = 12;
pub(crate) const NO_TABLE: u32 = u32::MAX;

pub(crate) fn serialize(
    container: &ItemContainer,
    partition: &PartitionResult,
    layout: &LayoutSummary,
) -> ContainerResult<Vec<u8>> {
    let mut writer = SpanWriter::with_capacity(layout.file_size as usize);
    write_header(container, layout, &mut writer);

    // First emitted method per body, for operand slot resolution.
    let mut code_owner: HashMap<ItemId, ItemId> = HashMap::new();
    for method in container.emitted_methods() {
        if let Some(code) = container.expect_method(method).code {
            code_owner.entry(code).or_insert(method);
        }
    }

    let emission_order = container
        .foreign_items
        .iter()
        .copied()
        .chain([
            container.class_index_item,
            container.line_program_index_item,
            container.index_section_item,
        ])
        .chain(container.regular_items.iter().copied())
        .chain(container.code_items.iter().copied())
        .chain(container.debug_items.iter().copied());

    for id in emission_order {
        let item = container.item(id);
        if !item.needs_emission {
            continue;
        }
        let offset = item.expect_offset();
        writer.pad_to(offset as usize);
        write_item(container, partition, layout, &code_owner, id, &mut writer)?;
        debug_assert_eq!(
            writer.position() as u32,
            offset + item.size.unwrap_or(0),
            "emitted size of {} item disagrees with its computed size",
            item.kind.name()
        );
    }

    writer.pad_to(layout.file_size as usize);
    let mut bytes = writer.into_inner();
    let mut adler = RollingAdler32::new();
    adler.update_buffer(&bytes[CHECKSUM_OFFSET + 4..]);
    let checksum = adler.hash();
    bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
    trace!(checksum, size = bytes.len(), "container serialized");
    Ok(bytes)
}

fn write_header(container: &ItemContainer, layout: &LayoutSummary, writer: &mut SpanWriter) {
    let (class_count, class_index_offset) =
        match &container.item(container.class_index_item).kind {
            ItemKind::ClassIndex(payload) if !payload.classes.is_empty() => (
                payload.classes.len() as u32,
                container.item(container.class_index_item).expect_offset(),
            ),
            _ => (0, NO_TABLE),
        };
    let (program_count, program_index_offset) =
        match &container.item(container.line_program_index_item).kind {
            ItemKind::LineProgramIndex(payload) if !payload.programs.is_empty() => (
                payload.programs.len() as u32,
                container
                    .item(container.line_program_index_item)
                    .expect_offset(),
            ),
            _ => (0, NO_TABLE),
        };
    let (header_count, index_section_offset) =
        match &container.item(container.index_section_item).kind {
            ItemKind::IndexSection(payload) if !payload.headers.is_empty() => (
                payload.headers.len() as u32,
                container.item(container.index_section_item).expect_offset(),
            ),
            _ => (0, NO_TABLE),
        };

    writer.write_bytes(&MAGIC);
    writer.write_bytes(&VERSION);
    writer.write_u32(0); // checksum, patched after the body is complete
    writer.write_u32(layout.file_size);
    writer.write_u32(layout.foreign_offset);
    writer.write_u32(layout.foreign_size);
    writer.write_u32(class_count);
    writer.write_u32(class_index_offset);
    writer.write_u32(program_count);
    writer.write_u32(program_index_offset);
    writer.write_u32(header_count);
    writer.write_u32(index_section_offset);
    debug_assert_eq!(writer.position() as u32, HEADER_SIZE);
}

fn offset_of(container: &ItemContainer, id: ItemId) -> u32 {
    container.item(id).expect_offset()
}

/// Encoded type reference: inline primitive id when it fits below the
/// header, entity offset otherwise.
fn type_ref(container: &ItemContainer, id: ItemId) -> u32 {
    match &container.item(id).kind {
        ItemKind::PrimitiveType(primitive) => primitive.id(),
        _ => offset_of(container, id),
    }
}

fn write_item(
    container: &ItemContainer,
    partition: &PartitionResult,
    layout: &LayoutSummary,
    code_owner: &HashMap<ItemId, ItemId>,
    id: ItemId,
    writer: &mut SpanWriter,
) -> ContainerResult<()> {
    match &container.item(id).kind {
        ItemKind::String(payload) => {
            let tag = (payload.utf16_len << 1) | payload.is_ascii as u32;
            writer.write_uleb128(tag);
            writer.write_bytes(&payload.bytes);
            writer.write_u8(0);
        }
        ItemKind::Class(payload) => {
            writer.write_u32(offset_of(container, payload.name));
            writer.write_u32(
                payload
                    .super_class
                    .map(|super_class| type_ref(container, super_class))
                    .unwrap_or(0),
            );
            writer.write_uleb128(payload.flags.bits());
            writer.write_u32(
                payload
                    .source_file
                    .map(|source| offset_of(container, source))
                    .unwrap_or(0),
            );
            writer.write_uleb128(payload.interfaces.len() as u32);
            for &interface in &payload.interfaces {
                writer.write_u32(type_ref(container, interface));
            }
            writer.write_uleb128(payload.annotations.len() as u32);
            for &annotation in &payload.annotations {
                writer.write_u32(offset_of(container, annotation));
            }
            writer.write_uleb128(payload.fields.len() as u32);
            for &field in &payload.fields {
                writer.write_u32(offset_of(container, field));
            }
            writer.write_uleb128(payload.methods.len() as u32);
            for &method in &payload.methods {
                writer.write_u32(offset_of(container, method));
            }
        }
        ItemKind::ForeignClass(payload) => {
            writer.write_u32(offset_of(container, payload.name));
        }
        ItemKind::Method(payload) => {
            writer.write_u32(type_ref(container, payload.class));
            writer.write_u32(offset_of(container, payload.name));
            writer.write_u32(offset_of(container, payload.proto));
            writer.write_uleb128(payload.flags.bits());
            if let Some(code) = payload.code {
                writer.write_u8(TAG_CODE);
                writer.write_u32(offset_of(container, code));
            }
            if let Some(debug_info) = payload.debug_info {
                writer.write_u8(TAG_DEBUG_INFO);
                writer.write_u32(offset_of(container, debug_info));
            }
            for &annotation in &payload.annotations {
                writer.write_u8(TAG_ANNOTATION);
                writer.write_u32(offset_of(container, annotation));
            }
            writer.write_u8(TAG_END);
        }
        ItemKind::ForeignMethod(payload) => {
            writer.write_u32(type_ref(container, payload.class));
            writer.write_u32(offset_of(container, payload.name));
            writer.write_u32(offset_of(container, payload.proto));
            writer.write_uleb128(payload.flags.bits());
            writer.write_u8(TAG_END);
        }
        ItemKind::Field(payload) => {
            writer.write_u32(type_ref(container, payload.class));
            writer.write_u32(offset_of(container, payload.name));
            writer.write_u32(type_ref(container, payload.ty));
            writer.write_uleb128(payload.flags.bits());
            if let Some(value) = payload.value {
                writer.write_u8(TAG_VALUE);
                writer.write_u32(offset_of(container, value));
            }
            writer.write_u8(TAG_END);
        }
        ItemKind::ForeignField(payload) => {
            writer.write_u32(type_ref(container, payload.class));
            writer.write_u32(offset_of(container, payload.name));
            writer.write_u32(type_ref(container, payload.ty));
            writer.write_uleb128(payload.flags.bits());
            writer.write_u8(TAG_END);
        }
        ItemKind::Code(payload) => {
            let owner = code_owner.get(&id).unwrap_or_else(|| {
                panic!("code body at 0x{:x} has no owning method", offset_of(container, id))
            });
            let header = partition.method_header[owner];
            write_code(container, payload, &container.expect_method(*owner).deps, header, writer)?;
        }
        ItemKind::DebugInfo(payload) => {
            writer.write_uleb128(payload.line_start);
            writer.write_uleb128(payload.params.len() as u32);
            for &param in &payload.params {
                writer.write_u32(offset_of(container, param));
            }
            writer.write_uleb128(payload.pool.len() as u32);
            for entry in &payload.pool {
                match entry {
                    PoolEntry::Item(item) => writer.write_u32(type_ref(container, *item)),
                    PoolEntry::Number(number) => writer.write_u32(*number),
                }
            }
            writer.write_u32(partition.lnp_index[&payload.program]);
        }
        ItemKind::LineProgram(payload) => {
            writer.write_bytes(&payload.bytes);
        }
        ItemKind::Annotation(payload) => {
            writer.write_u32(type_ref(container, payload.class));
            writer.write_uleb128(payload.elements.len() as u32);
            for element in &payload.elements {
                writer.write_u32(offset_of(container, element.name));
                writer.write_u32(offset_of(container, element.value));
            }
            writer.write_bytes(&payload.tags);
        }
        ItemKind::ScalarValue(value) => {
            writer.write_u8(container.value_tag(id));
            match value {
                ScalarValue::Integer(value) => writer.write_u32(*value as u32),
                ScalarValue::Long(value) => writer.write_u64(*value as u64),
                ScalarValue::Float(bits) => writer.write_u32(*bits),
                ScalarValue::Double(bits) => writer.write_u64(*bits),
                ScalarValue::Reference(target) => {
                    writer.write_u32(offset_of(container, *target));
                }
            }
        }
        ItemKind::ArrayValue(payload) => {
            writer.write_u8(payload.component_tag);
            writer.write_uleb128(payload.elements.len() as u32);
            for &element in &payload.elements {
                writer.write_u32(offset_of(container, element));
            }
        }
        ItemKind::Proto(payload) => {
            writer.write_uleb128(payload.shorty.len() as u32);
            writer.write_bytes(&payload.shorty);
            for &reference in &payload.reference_types {
                writer.write_u32(offset_of(container, reference));
            }
        }
        ItemKind::ClassIndex(payload) => {
            for &class in &payload.classes {
                writer.write_u32(offset_of(container, class));
            }
        }
        ItemKind::LineProgramIndex(payload) => {
            for &program in &payload.programs {
                writer.write_u32(offset_of(container, program));
            }
        }
        ItemKind::IndexSection(payload) => {
            write_index_section(container, layout, payload, id, writer);
        }
        ItemKind::PrimitiveType(_) | ItemKind::End => {
            unreachable!("virtual items are never emitted")
        }
    }
    Ok(())
}

/// Emits a body with every operand ordinal rewritten to the local slot its
/// header assigned. Catch-type references are rewritten the same way.
fn write_code(
    container: &ItemContainer,
    payload: &CodePayload,
    deps: &[ItemId],
    header: u16,
    writer: &mut SpanWriter,
) -> ContainerResult<()> {
    let slot_of = |target: ItemId| -> u16 {
        container.item(target).slot_in(header).unwrap_or_else(|| {
            panic!(
                "{} item has no slot in index header {header}",
                container.item(target).kind.name()
            )
        })
    };

    let mut bytes = payload.bytes.clone();
    for site in collect_ref_sites(&payload.bytes)? {
        let ordinal = read_id(&payload.bytes, site) as usize;
        write_id(&mut bytes, site, slot_of(deps[ordinal]));
    }

    writer.write_uleb128(payload.num_vregs);
    writer.write_uleb128(payload.num_args);
    writer.write_uleb128(bytes.len() as u32);
    writer.write_uleb128(payload.try_blocks.len() as u32);
    writer.write_bytes(&bytes);
    for block in &payload.try_blocks {
        writer.write_u32(block.start_pc);
        writer.write_u32(block.length);
        writer.write_uleb128(block.handlers.len() as u32);
        for handler in &block.handlers {
            writer.write_u16(
                handler
                    .type_ref
                    .map(&slot_of)
                    .unwrap_or(CATCH_TYPE_NONE),
            );
            writer.write_u32(handler.handler_pc);
            writer.write_u32(handler.length);
        }
    }
    Ok(())
}

/// Index headers first, then the per-kind entry arrays of absolute entity
/// offsets. A header's range starts at its first method and ends where the
/// next header starts (the last reaches the end of the file).
fn write_index_section(
    container: &ItemContainer,
    layout: &LayoutSummary,
    payload: &IndexSectionPayload,
    id: ItemId,
    writer: &mut SpanWriter,
) {
    let section_offset = offset_of(container, id);
    let starts: Vec<u32> = payload
        .headers
        .iter()
        .map(|header| {
            let first = header
                .methods
                .first()
                .unwrap_or_else(|| panic!("index header covers no methods"));
            offset_of(container, *first)
        })
        .collect();

    let mut array_offset = section_offset + 48 * payload.headers.len() as u32;
    for (index, header) in payload.headers.iter().enumerate() {
        let start = if index == 0 { HEADER_SIZE } else { starts[index] };
        let end = starts.get(index + 1).copied().unwrap_or(layout.file_size);
        writer.write_u32(start);
        writer.write_u32(end);
        for entries in &header.entries {
            writer.write_u32(entries.len() as u32);
            writer.write_u32(array_offset);
            array_offset += 4 * entries.len() as u32;
        }
    }
    for header in &payload.headers {
        for entries in &header.entries {
            for &entry in entries {
                writer.write_u32(offset_of(container, entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ItemContainer, WriteOptions};

    #[test]
    fn empty_container_has_fixed_header_and_valid_checksum() {
        let mut container = ItemContainer::new();
        let bytes = container.write(&WriteOptions::default()).unwrap();

        assert_eq!(&bytes[0..8], &MAGIC);
        assert_eq!(&bytes[8..12], &VERSION);
        let file_size = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(file_size as usize, bytes.len());

        let stored = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let mut adler = RollingAdler32::new();
        adler.update_buffer(&bytes[16..]);
        assert_eq!(stored, adler.hash());

        // Absent tables are marked, not pointed at.
        let class_index = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
        assert_eq!(class_index, NO_TABLE);
    }

    #[test]
    fn writing_twice_yields_identical_bytes() {
        let mut container = ItemContainer::new();
        container.get_or_create_string("stable");
        container.get_or_create_class("LFoo;");
        let first = container.write(&WriteOptions::default()).unwrap();
        let second = container.write(&WriteOptions::default()).unwrap();
        assert_eq!(first, second);
    }
}
