//! Inverse reader: reconstructs a build session from a serialized file.
//!
//! Reading is two passes. The first materializes every entity reachable
//! from the class index, memoized by source offset so shared entities are
//! created once; code bodies keep their raw operand bytes and record a
//! fix-up entry. The second pass resolves each operand through the index
//! header covering the owning method, converts the header-local slot back
//! to a dependency-list ordinal, and patches the body in place. After both
//! passes the emission lists are sorted by source offset, so writing the
//! result reproduces the original layout.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use adler32::RollingAdler32;
use tracing::debug;

use crate::bytecode::{RefKind, collect_ref_sites, dependency_ordinal, read_id, write_id};
use crate::container::ItemContainer;
use crate::error::{ContainerError, ContainerResult};
use crate::items::{
    AnnotationElement, AnnotationPayload, ArrayValuePayload, CATCH_TYPE_NONE, CatchHandler,
    ClassFlags, CodePayload, DebugInfoPayload, FieldFlags, FieldPayload, ItemId, ItemKind,
    LNP_ADVANCE_LINE, LNP_ADVANCE_PC, LNP_END, LNP_END_LOCAL, LNP_SET_FILE, LNP_SET_SOURCE_CODE,
    LNP_START_LOCAL, LineProgramPayload, MethodFlags, MethodPayload, PoolEntry, PrimitiveTy,
    SHORTY_REFERENCE, TAG_ANNOTATION, TAG_CODE, TAG_DEBUG_INFO, TAG_END, TAG_VALUE, TryBlock,
    VALUE_ANNOTATION, VALUE_ARRAY, VALUE_CLASS, VALUE_DOUBLE, VALUE_FIELD, VALUE_FLOAT,
    VALUE_INTEGER, VALUE_LONG, VALUE_METHOD, VALUE_STRING, kind_slot,
};
use crate::span::{SpanReader, decode_mutf8};
use crate::writer::{CHECKSUM_OFFSET, HEADER_SIZE, MAGIC, NO_TABLE, VERSION};

impl ItemContainer {
    /// Reads and reconstructs a container file from disk.
    pub fn open(path: impl AsRef<Path>) -> ContainerResult<ItemContainer> {
        ItemContainer::from_bytes(&fs::read(path)?)
    }

    /// Reconstructs a container from an in-memory file image.
    pub fn from_bytes(bytes: &[u8]) -> ContainerResult<ItemContainer> {
        let header = validate_header(bytes)?;

        let mut materializer = Materializer {
            bytes,
            container: ItemContainer::new(),
            memo: HashMap::new(),
            visiting: HashSet::new(),
            headers: read_index_headers(bytes, &header)?,
            lnp_offsets: read_program_table(bytes, &header)?,
            foreign_start: header.foreign_offset,
            foreign_end: header.foreign_offset + header.foreign_size,
            pending: Vec::new(),
            code_deps: HashMap::new(),
            code_sources: HashMap::new(),
        };

        if header.class_count > 0 && header.class_index_offset != NO_TABLE {
            let mut reader = materializer.at(header.class_index_offset)?;
            let offsets: Vec<u32> = (0..header.class_count)
                .map(|_| reader.read_u32())
                .collect::<ContainerResult<_>>()?;
            for offset in offsets {
                materializer.class_at(offset)?;
            }
        }
        materializer.fix_up()?;

        let mut container = materializer.container;
        sort_by_source_offset(&mut container);
        debug!(
            classes = header.class_count,
            headers = header.index_count,
            "container file reconstructed"
        );
        Ok(container)
    }
}

struct FileHeader {
    foreign_offset: u32,
    foreign_size: u32,
    class_count: u32,
    class_index_offset: u32,
    program_count: u32,
    program_index_offset: u32,
    index_count: u32,
    index_section_offset: u32,
}

fn validate_header(bytes: &[u8]) -> ContainerResult<FileHeader> {
    if bytes.len() < HEADER_SIZE as usize {
        return Err(ContainerError::UnexpectedEof {
            offset: bytes.len(),
            expected: HEADER_SIZE as usize - bytes.len(),
        });
    }
    if bytes[0..8] != MAGIC {
        return Err(ContainerError::InvalidMagic {
            expected: MAGIC.to_vec(),
            found: bytes[0..8].to_vec(),
        });
    }
    let mut reader = SpanReader::new(bytes);
    reader.seek(8)?;
    let version = reader.read_array::<4>()?;
    if version != VERSION {
        return Err(ContainerError::UnsupportedVersion { version });
    }

    let stored = reader.read_u32()?;
    let mut adler = RollingAdler32::new();
    adler.update_buffer(&bytes[CHECKSUM_OFFSET + 4..]);
    if stored != adler.hash() {
        return Err(ContainerError::format(format!(
            "checksum mismatch: stored {stored:08x}, computed {:08x}",
            adler.hash()
        )));
    }

    let file_size = reader.read_u32()?;
    if file_size as usize != bytes.len() {
        return Err(ContainerError::format(format!(
            "declared file size {file_size} does not match actual size {}",
            bytes.len()
        )));
    }

    Ok(FileHeader {
        foreign_offset: reader.read_u32()?,
        foreign_size: reader.read_u32()?,
        class_count: reader.read_u32()?,
        class_index_offset: reader.read_u32()?,
        program_count: reader.read_u32()?,
        program_index_offset: reader.read_u32()?,
        index_count: reader.read_u32()?,
        index_section_offset: reader.read_u32()?,
    })
}

/// An index header as stored in the source file: the method offset range it
/// covers and its per-kind entry arrays of absolute entity offsets.
struct SourceHeader {
    start: u32,
    end: u32,
    entries: [Vec<u32>; 5],
}

fn read_index_headers(bytes: &[u8], header: &FileHeader) -> ContainerResult<Vec<SourceHeader>> {
    if header.index_count == 0 || header.index_section_offset == NO_TABLE {
        return Ok(Vec::new());
    }
    let mut reader = SpanReader::new(bytes);
    reader.seek(header.index_section_offset as usize)?;

    let mut headers = Vec::with_capacity(header.index_count as usize);
    for _ in 0..header.index_count {
        let start = reader.read_u32()?;
        let end = reader.read_u32()?;
        let mut entries: [Vec<u32>; 5] = Default::default();
        for slot in &mut entries {
            let count = reader.read_u32()?;
            let array_offset = reader.read_u32()?;
            let mut array_reader = SpanReader::new(bytes);
            array_reader.seek(array_offset as usize)?;
            *slot = (0..count)
                .map(|_| array_reader.read_u32())
                .collect::<ContainerResult<_>>()?;
        }
        headers.push(SourceHeader { start, end, entries });
    }
    Ok(headers)
}

fn read_program_table(bytes: &[u8], header: &FileHeader) -> ContainerResult<Vec<u32>> {
    if header.program_count == 0 || header.program_index_offset == NO_TABLE {
        return Ok(Vec::new());
    }
    let mut reader = SpanReader::new(bytes);
    reader.seek(header.program_index_offset as usize)?;
    (0..header.program_count).map(|_| reader.read_u32()).collect()
}

/// A code body waiting for its second-pass operand fix-up.
struct PendingCode {
    code: ItemId,
    method: ItemId,
    method_offset: u32,
}

/// Unpatched operand bytes and raw catch type indices of a parsed body,
/// kept so every sharing method can resolve them through its own header.
#[derive(Clone)]
struct CodeSource {
    bytes: Vec<u8>,
    raw_catch: Vec<Vec<u16>>,
}

struct Materializer<'a> {
    bytes: &'a [u8],
    container: ItemContainer,
    /// Source offset to reconstructed entity. Shared entities in the file
    /// (deduplicated bodies, interned strings) come back as one entity.
    memo: HashMap<u32, ItemId>,
    /// Offsets of value entities currently being parsed, for cycle
    /// detection.
    visiting: HashSet<u32>,
    headers: Vec<SourceHeader>,
    lnp_offsets: Vec<u32>,
    foreign_start: u32,
    foreign_end: u32,
    pending: Vec<PendingCode>,
    /// Covering header and resolved dependency list per fixed-up body.
    code_deps: HashMap<ItemId, (usize, Vec<ItemId>)>,
    code_sources: HashMap<ItemId, CodeSource>,
}

impl<'a> Materializer<'a> {
    fn at(&self, offset: u32) -> ContainerResult<SpanReader<'a>> {
        let mut reader = SpanReader::new(self.bytes);
        reader.seek(offset as usize)?;
        Ok(reader)
    }

    fn is_foreign(&self, offset: u32) -> bool {
        offset >= self.foreign_start && offset < self.foreign_end
    }

    /// Marks a value entity as in flight. Re-entering an offset before its
    /// entity is memoized means the value graph points back into itself,
    /// which no writer produces.
    fn enter(&mut self, offset: u32) -> ContainerResult<()> {
        if !self.visiting.insert(offset) {
            return Err(ContainerError::format(format!(
                "value entity at 0x{offset:x} references itself"
            )));
        }
        Ok(())
    }

    /// Memoizes `id` at `offset` and records the source offset so the final
    /// sort can restore layout order.
    fn record(&mut self, offset: u32, id: ItemId) {
        if self.container.item(id).offset.is_none() {
            self.container.item_mut(id).offset = Some(offset);
        }
        self.memo.insert(offset, id);
    }

    fn string_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        let mut reader = self.at(offset)?;
        let _tag = reader.read_uleb128()?;
        let raw = reader.read_cstring_bytes()?;
        let text = decode_mutf8(&raw)?;
        let id = self.container.get_or_create_string(&text);
        self.record(offset, id);
        Ok(id)
    }

    /// Decodes a type reference: inline primitive id below the header size,
    /// class offset otherwise.
    fn type_at(&mut self, value: u32) -> ContainerResult<ItemId> {
        if value < HEADER_SIZE {
            let primitive = PrimitiveTy::from_id(value).ok_or_else(|| {
                ContainerError::format(format!("unknown primitive type id {value}"))
            })?;
            return Ok(self.container.get_or_create_primitive_type(primitive));
        }
        self.class_at(value)
    }

    fn class_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        let mut reader = self.at(offset)?;
        let name_offset = reader.read_u32()?;
        let name = self.string_at(name_offset)?;
        let text = self.container.string_text(name);

        // A name is either a definition or a foreign declaration; a file
        // carrying both is corrupt, not a programming error.
        if let Some(existing) = self.container.class_by_name(&text) {
            let existing_foreign =
                matches!(self.container.item(existing).kind, ItemKind::ForeignClass(_));
            if existing_foreign != self.is_foreign(offset) {
                return Err(ContainerError::format(format!(
                    "class {text:?} appears both as a definition and a foreign declaration"
                )));
            }
        }

        if self.is_foreign(offset) {
            let id = self.container.get_or_create_foreign_class(&text);
            self.record(offset, id);
            return Ok(id);
        }

        // Shallow-create and memoize first; members refer back to the class.
        let id = self.container.get_or_create_class(&text);
        self.record(offset, id);

        let super_offset = reader.read_u32()?;
        if super_offset == offset {
            return Err(ContainerError::SelfInheritance { offset });
        }
        let super_class = if super_offset == 0 {
            None
        } else {
            Some(self.class_at(super_offset)?)
        };
        let flags = ClassFlags::from_bits_retain(reader.read_uleb128()?);
        let source_offset = reader.read_u32()?;
        let source_file = if source_offset == 0 {
            None
        } else {
            Some(self.string_at(source_offset)?)
        };

        let interface_offsets = self.read_offset_list(&mut reader)?;
        let annotation_offsets = self.read_offset_list(&mut reader)?;
        let field_offsets = self.read_offset_list(&mut reader)?;
        let method_offsets = self.read_offset_list(&mut reader)?;

        let interfaces = interface_offsets
            .into_iter()
            .map(|off| self.type_at(off))
            .collect::<ContainerResult<Vec<_>>>()?;
        let annotations = annotation_offsets
            .into_iter()
            .map(|off| self.annotation_at(off))
            .collect::<ContainerResult<Vec<_>>>()?;
        let fields = field_offsets
            .into_iter()
            .map(|off| self.field_at(off))
            .collect::<ContainerResult<Vec<_>>>()?;
        let methods = method_offsets
            .into_iter()
            .map(|off| self.method_at(off))
            .collect::<ContainerResult<Vec<_>>>()?;

        let payload = self.container.expect_class_mut(id);
        payload.super_class = super_class;
        payload.flags = flags;
        payload.source_file = source_file;
        payload.interfaces = interfaces;
        payload.annotations = annotations;
        payload.fields = fields;
        payload.methods = methods;
        Ok(id)
    }

    fn read_offset_list(&self, reader: &mut SpanReader<'a>) -> ContainerResult<Vec<u32>> {
        let count = reader.read_uleb128()?;
        (0..count).map(|_| reader.read_u32()).collect()
    }

    fn proto_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        self.enter(offset)?;
        let mut reader = self.at(offset)?;
        let shorty_len = reader.read_uleb128()?;
        if shorty_len == 0 {
            return Err(ContainerError::format("prototype with empty shorty"));
        }
        let shorty = reader.read_bytes(shorty_len as usize)?.to_vec();
        let mut types = Vec::with_capacity(shorty.len());
        for &code in &shorty {
            if code == SHORTY_REFERENCE {
                let reference_offset = reader.read_u32()?;
                types.push(self.class_at(reference_offset)?);
            } else {
                let primitive = primitive_from_shorty(code)?;
                types.push(self.container.get_or_create_primitive_type(primitive));
            }
        }
        let return_type = types[0];
        let params = types[1..].to_vec();
        let id = self.container.get_or_create_proto(return_type, params);
        self.record(offset, id);
        Ok(id)
    }

    fn field_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        let mut reader = self.at(offset)?;
        let class = self.class_at(reader.read_u32()?)?;
        let name = self.string_at(reader.read_u32()?)?;
        let ty = self.type_at(reader.read_u32()?)?;
        let flags = FieldFlags::from_bits_retain(reader.read_uleb128()?);

        let payload = FieldPayload {
            class,
            name,
            ty,
            flags,
            value: None,
        };
        let id = if self.is_foreign(offset) {
            let id = self.container.alloc(ItemKind::ForeignField(payload));
            self.container.foreign_items.push(id);
            id
        } else {
            let id = self.container.alloc(ItemKind::Field(payload));
            self.container.regular_items.push(id);
            id
        };
        self.record(offset, id);

        loop {
            match reader.read_u8()? {
                TAG_END => break,
                TAG_VALUE => {
                    let value_offset = reader.read_u32()?;
                    let value = self.scalar_at(value_offset)?;
                    match &mut self.container.item_mut(id).kind {
                        ItemKind::Field(payload) | ItemKind::ForeignField(payload) => {
                            payload.value = Some(value);
                        }
                        _ => unreachable!(),
                    }
                }
                other => {
                    return Err(ContainerError::format(format!(
                        "unexpected tag 0x{other:02x} in field at 0x{offset:x}"
                    )));
                }
            }
        }
        Ok(id)
    }

    fn method_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        let mut reader = self.at(offset)?;
        let class = self.class_at(reader.read_u32()?)?;
        let name = self.string_at(reader.read_u32()?)?;
        let proto = self.proto_at(reader.read_u32()?)?;
        let flags = MethodFlags::from_bits_retain(reader.read_uleb128()?);

        let payload = MethodPayload {
            class,
            name,
            proto,
            flags,
            code: None,
            debug_info: None,
            annotations: Vec::new(),
            deps: Vec::new(),
        };
        let id = if self.is_foreign(offset) {
            let id = self.container.alloc(ItemKind::ForeignMethod(payload));
            self.container.foreign_items.push(id);
            id
        } else {
            let id = self.container.alloc(ItemKind::Method(payload));
            self.container.regular_items.push(id);
            id
        };
        self.record(offset, id);

        loop {
            match reader.read_u8()? {
                TAG_END => break,
                TAG_CODE => {
                    let code_offset = reader.read_u32()?;
                    self.code_at(code_offset, id, offset)?;
                }
                TAG_DEBUG_INFO => {
                    let debug_offset = reader.read_u32()?;
                    self.debug_at(debug_offset, id)?;
                }
                TAG_ANNOTATION => {
                    let annotation_offset = reader.read_u32()?;
                    let annotation = self.annotation_at(annotation_offset)?;
                    self.container
                        .expect_method_mut(id)
                        .annotations
                        .push(annotation);
                }
                other => {
                    return Err(ContainerError::format(format!(
                        "unexpected tag 0x{other:02x} in method at 0x{offset:x}"
                    )));
                }
            }
        }
        Ok(id)
    }

    /// First pass over a code body: parse its structure, keep the operand
    /// bytes untouched and queue the fix-up.
    fn code_at(&mut self, offset: u32, method: ItemId, method_offset: u32) -> ContainerResult<()> {
        if let Some(&code) = self.memo.get(&offset) {
            // A body already seen; the fix-up pass attaches the shared deps.
            self.container.expect_method_mut(method).code = Some(code);
            self.pending.push(PendingCode {
                code,
                method,
                method_offset,
            });
            return Ok(());
        }

        let mut reader = self.at(offset)?;
        let num_vregs = reader.read_uleb128()?;
        let num_args = reader.read_uleb128()?;
        let code_size = reader.read_uleb128()?;
        let try_count = reader.read_uleb128()?;
        let bytes = reader.read_bytes(code_size as usize)?.to_vec();

        let mut try_blocks = Vec::with_capacity(try_count as usize);
        let mut raw_catch = Vec::with_capacity(try_count as usize);
        for _ in 0..try_count {
            let start_pc = reader.read_u32()?;
            let length = reader.read_u32()?;
            let handler_count = reader.read_uleb128()?;
            let mut handlers = Vec::with_capacity(handler_count as usize);
            let mut raw_row = Vec::with_capacity(handler_count as usize);
            for _ in 0..handler_count {
                raw_row.push(reader.read_u16()?);
                handlers.push(CatchHandler {
                    type_ref: None,
                    handler_pc: reader.read_u32()?,
                    length: reader.read_u32()?,
                });
            }
            try_blocks.push(TryBlock {
                start_pc,
                length,
                handlers,
            });
            raw_catch.push(raw_row);
        }

        let code = self.container.alloc(ItemKind::Code(CodePayload {
            num_vregs,
            num_args,
            bytes: bytes.clone(),
            try_blocks,
            covered_methods: Vec::new(),
        }));
        self.container.code_items.push(code);
        self.record(offset, code);
        self.container.expect_method_mut(method).code = Some(code);
        self.code_sources.insert(code, CodeSource { bytes, raw_catch });
        self.pending.push(PendingCode {
            code,
            method,
            method_offset,
        });
        Ok(())
    }

    /// Second pass: rewrite header-local operand slots back to dependency
    /// ordinals, resolve catch types and rebuild coverage names.
    ///
    /// A body shared by methods under different headers is resolved through
    /// each method's own header; headers that disagree on any operand make
    /// the file corrupt.
    fn fix_up(&mut self) -> ContainerResult<()> {
        let pending = std::mem::take(&mut self.pending);
        for entry in pending {
            let header = self.header_covering(entry.method_offset)?;
            if let Some((cached_header, cached_deps)) = self.code_deps.get(&entry.code).cloned()
            {
                if cached_header != header {
                    self.check_shared_resolution(&entry, header, &cached_deps)?;
                }
                self.container.expect_method_mut(entry.method).deps = cached_deps;
                let name = self.container.full_method_name(entry.method);
                let payload = self.container.expect_code_mut(entry.code);
                if !payload.covered_methods.contains(&name) {
                    payload.covered_methods.push(name);
                }
                continue;
            }

            let (patched, deps, resolved_catch) =
                self.resolve_body(entry.code, header, entry.method_offset)?;
            let name = self.container.full_method_name(entry.method);
            let payload = self.container.expect_code_mut(entry.code);
            payload.bytes = patched;
            for (block, row) in payload.try_blocks.iter_mut().zip(resolved_catch) {
                for (handler, type_ref) in block.handlers.iter_mut().zip(row) {
                    handler.type_ref = type_ref;
                }
            }
            payload.covered_methods.push(name);

            self.container.expect_method_mut(entry.method).deps = deps.clone();
            self.code_deps.insert(entry.code, (header, deps));
        }
        Ok(())
    }

    /// Resolves a body's operand slots through `header`: returns the
    /// ordinal-patched bytes, the dependency list and the catch types per
    /// try block, in handler order.
    fn resolve_body(
        &mut self,
        code: ItemId,
        header: usize,
        method_offset: u32,
    ) -> ContainerResult<(Vec<u8>, Vec<ItemId>, Vec<Vec<Option<ItemId>>>)> {
        let source = self.code_sources.get(&code).cloned().ok_or_else(|| {
            ContainerError::format(format!(
                "code body of method at 0x{method_offset:x} was never parsed"
            ))
        })?;

        let mut patched = source.bytes.clone();
        let mut deps: Vec<ItemId> = Vec::new();
        for site in collect_ref_sites(&source.bytes)? {
            let index = read_id(&source.bytes, site);
            let target_offset = self.entry_offset(header, site.kind, index, method_offset)?;
            let target = self.entity_at(site.kind, target_offset)?;
            write_id(&mut patched, site, dependency_ordinal(&mut deps, target));
        }

        let mut resolved_catch: Vec<Vec<Option<ItemId>>> = Vec::new();
        for row in &source.raw_catch {
            let mut resolved = Vec::with_capacity(row.len());
            for &raw in row {
                if raw == CATCH_TYPE_NONE {
                    resolved.push(None);
                    continue;
                }
                let target_offset =
                    self.entry_offset(header, RefKind::Class, raw, method_offset)?;
                let class = self.class_at(target_offset)?;
                if !deps.contains(&class) {
                    deps.push(class);
                }
                resolved.push(Some(class));
            }
            resolved_catch.push(resolved);
        }
        Ok((patched, deps, resolved_catch))
    }

    /// Re-resolves a shared body through the second method's header and
    /// requires the result to match what the first header produced.
    fn check_shared_resolution(
        &mut self,
        entry: &PendingCode,
        header: usize,
        cached_deps: &[ItemId],
    ) -> ContainerResult<()> {
        let (patched, deps, resolved_catch) =
            self.resolve_body(entry.code, header, entry.method_offset)?;
        let payload = self.container.expect_code(entry.code);
        let catch_matches = payload
            .try_blocks
            .iter()
            .zip(resolved_catch.iter())
            .all(|(block, row)| {
                block
                    .handlers
                    .iter()
                    .zip(row)
                    .all(|(handler, type_ref)| handler.type_ref == *type_ref)
            });
        if deps != cached_deps || patched != payload.bytes || !catch_matches {
            return Err(ContainerError::format(format!(
                "index headers disagree on operands of the code body shared by the method at 0x{:x}",
                entry.method_offset
            )));
        }
        Ok(())
    }

    fn header_covering(&self, method_offset: u32) -> ContainerResult<usize> {
        self.headers
            .iter()
            .position(|header| header.start <= method_offset && method_offset < header.end)
            .ok_or_else(|| {
                ContainerError::format(format!(
                    "no index header covers method at 0x{method_offset:x}"
                ))
            })
    }

    fn entry_offset(
        &self,
        header: usize,
        kind: RefKind,
        index: u16,
        method_offset: u32,
    ) -> ContainerResult<u32> {
        self.headers[header].entries[kind_slot(kind)]
            .get(index as usize)
            .copied()
            .ok_or(ContainerError::UnresolvedReference {
                kind,
                index,
                method_offset,
            })
    }

    fn entity_at(&mut self, kind: RefKind, offset: u32) -> ContainerResult<ItemId> {
        match kind {
            RefKind::Class => self.class_at(offset),
            RefKind::Method => self.method_at(offset),
            RefKind::Field => self.field_at(offset),
            RefKind::String => self.string_at(offset),
            RefKind::LiteralArray => self.array_at(offset),
        }
    }

    fn annotation_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        self.enter(offset)?;
        let mut reader = self.at(offset)?;
        let class = self.class_at(reader.read_u32()?)?;
        let count = reader.read_uleb128()?;
        let pairs: Vec<(u32, u32)> = (0..count)
            .map(|_| Ok((reader.read_u32()?, reader.read_u32()?)))
            .collect::<ContainerResult<_>>()?;
        let tags = reader.read_bytes(count as usize)?.to_vec();

        let mut elements = Vec::with_capacity(pairs.len());
        for (&(name_offset, value_offset), &tag) in pairs.iter().zip(tags.iter()) {
            let name = self.string_at(name_offset)?;
            let value = match tag {
                VALUE_ARRAY => self.array_at(value_offset)?,
                VALUE_ANNOTATION => self.annotation_at(value_offset)?,
                _ => self.scalar_at(value_offset)?,
            };
            elements.push(AnnotationElement { name, value });
        }

        let id = self.container.alloc(ItemKind::Annotation(AnnotationPayload {
            class,
            elements,
            tags,
        }));
        self.container.regular_items.push(id);
        self.record(offset, id);
        Ok(id)
    }

    fn scalar_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        self.enter(offset)?;
        let mut reader = self.at(offset)?;
        let tag = reader.read_u8()?;
        let id = match tag {
            VALUE_INTEGER => {
                let value = reader.read_u32()? as i32;
                self.container.get_or_create_integer_value(value)
            }
            VALUE_LONG => {
                let value = reader.read_u64()? as i64;
                self.container.get_or_create_long_value(value)
            }
            VALUE_FLOAT => {
                let bits = reader.read_u32()?;
                self.container.get_or_create_float_value(f32::from_bits(bits))
            }
            VALUE_DOUBLE => {
                let bits = reader.read_u64()?;
                self.container
                    .get_or_create_double_value(f64::from_bits(bits))
            }
            VALUE_STRING => {
                let target = reader.read_u32()?;
                let string = self.string_at(target)?;
                self.container.get_or_create_reference_value(string)
            }
            VALUE_METHOD => {
                let target = reader.read_u32()?;
                let method = self.method_at(target)?;
                self.container.get_or_create_reference_value(method)
            }
            VALUE_FIELD => {
                let target = reader.read_u32()?;
                let field = self.field_at(target)?;
                self.container.get_or_create_reference_value(field)
            }
            VALUE_CLASS => {
                let target = reader.read_u32()?;
                let class = self.class_at(target)?;
                self.container.get_or_create_reference_value(class)
            }
            other => {
                return Err(ContainerError::format(format!(
                    "unexpected scalar value tag 0x{other:02x} at 0x{offset:x}"
                )));
            }
        };
        self.record(offset, id);
        Ok(id)
    }

    fn array_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        self.enter(offset)?;
        let mut reader = self.at(offset)?;
        let component_tag = reader.read_u8()?;
        let count = reader.read_uleb128()?;
        let offsets: Vec<u32> = (0..count)
            .map(|_| reader.read_u32())
            .collect::<ContainerResult<_>>()?;
        let elements = offsets
            .into_iter()
            .map(|off| self.scalar_at(off))
            .collect::<ContainerResult<Vec<_>>>()?;

        let id = self
            .container
            .alloc(ItemKind::ArrayValue(ArrayValuePayload {
                component_tag,
                elements,
            }));
        self.container.regular_items.push(id);
        self.record(offset, id);
        Ok(id)
    }

    fn debug_at(&mut self, offset: u32, method: ItemId) -> ContainerResult<()> {
        if let Some(&id) = self.memo.get(&offset) {
            self.container.expect_method_mut(method).debug_info = Some(id);
            return Ok(());
        }
        let mut reader = self.at(offset)?;
        let line_start = reader.read_uleb128()?;
        let param_offsets = self.read_offset_list(&mut reader)?;
        let params = param_offsets
            .into_iter()
            .map(|off| self.string_at(off))
            .collect::<ContainerResult<Vec<_>>>()?;
        let pool_count = reader.read_uleb128()?;
        let raw_pool: Vec<u32> = (0..pool_count)
            .map(|_| reader.read_u32())
            .collect::<ContainerResult<_>>()?;
        let program_index = reader.read_u32()? as usize;
        let program_offset = self.lnp_offsets.get(program_index).copied().ok_or_else(|| {
            ContainerError::format(format!(
                "line program index {program_index} out of range ({} programs)",
                self.lnp_offsets.len()
            ))
        })?;
        let program = self.line_program_at(program_offset)?;

        let program_bytes = match &self.container.item(program).kind {
            ItemKind::LineProgram(payload) => payload.bytes.clone(),
            _ => unreachable!(),
        };
        let pool = self.typed_pool(&program_bytes, &raw_pool)?;

        let id = self.container.alloc(ItemKind::DebugInfo(DebugInfoPayload {
            line_start,
            params,
            pool,
            program,
        }));
        self.container.debug_items.push(id);
        self.record(offset, id);
        self.container.expect_method_mut(method).debug_info = Some(id);
        Ok(())
    }

    fn line_program_at(&mut self, offset: u32) -> ContainerResult<ItemId> {
        if let Some(&id) = self.memo.get(&offset) {
            return Ok(id);
        }
        let mut reader = self.at(offset)?;
        loop {
            match reader.read_u8()? {
                LNP_END => break,
                LNP_ADVANCE_PC | LNP_ADVANCE_LINE | LNP_SET_FILE | LNP_SET_SOURCE_CODE => {}
                LNP_START_LOCAL | LNP_END_LOCAL => {
                    reader.read_sleb128()?;
                }
                other => {
                    return Err(ContainerError::format(format!(
                        "unknown line program opcode 0x{other:02x} at 0x{offset:x}"
                    )));
                }
            }
        }
        let bytes = self.bytes[offset as usize..reader.position()].to_vec();

        let id = self
            .container
            .alloc(ItemKind::LineProgram(LineProgramPayload { bytes }));
        self.container.debug_items.push(id);
        self.record(offset, id);
        Ok(id)
    }

    /// Replays a program's opcode stream to recover the type of each raw
    /// pool slot: pc/line advances are plain numbers, the rest are entity
    /// references.
    fn typed_pool(&mut self, program: &[u8], raw: &[u32]) -> ContainerResult<Vec<PoolEntry>> {
        let mut reader = SpanReader::new(program);
        let mut pool = Vec::with_capacity(raw.len());
        let mut next = 0usize;
        let mut take = |next: &mut usize| -> ContainerResult<u32> {
            let value = raw.get(*next).copied().ok_or_else(|| {
                ContainerError::format("line program consumes more pool slots than stored")
            })?;
            *next += 1;
            Ok(value)
        };
        loop {
            match reader.read_u8()? {
                LNP_END => break,
                LNP_ADVANCE_PC | LNP_ADVANCE_LINE => {
                    pool.push(PoolEntry::Number(take(&mut next)?));
                }
                LNP_START_LOCAL => {
                    reader.read_sleb128()?;
                    let name = take(&mut next)?;
                    let ty = take(&mut next)?;
                    let name = self.string_at(name)?;
                    let ty = self.type_at(ty)?;
                    pool.push(PoolEntry::Item(name));
                    pool.push(PoolEntry::Item(ty));
                }
                LNP_END_LOCAL => {
                    reader.read_sleb128()?;
                }
                LNP_SET_FILE | LNP_SET_SOURCE_CODE => {
                    let target = take(&mut next)?;
                    let string = self.string_at(target)?;
                    pool.push(PoolEntry::Item(string));
                }
                other => {
                    return Err(ContainerError::format(format!(
                        "unknown line program opcode 0x{other:02x}"
                    )));
                }
            }
        }
        if next != raw.len() {
            return Err(ContainerError::format(
                "line program consumes fewer pool slots than stored",
            ));
        }
        Ok(pool)
    }
}

fn primitive_from_shorty(code: u8) -> ContainerResult<PrimitiveTy> {
    (0..12)
        .filter_map(PrimitiveTy::from_id)
        .find(|primitive| primitive.shorty_code() == code)
        .ok_or_else(|| {
            ContainerError::format(format!("unknown shorty code {:?}", code as char))
        })
}

/// Restores emission lists to source layout order so a rewrite reproduces
/// the original byte placement.
fn sort_by_source_offset(container: &mut ItemContainer) {
    let sort = |mut list: Vec<ItemId>, container: &ItemContainer| {
        list.sort_by_key(|&id| container.item(id).expect_offset());
        list
    };
    let foreign = std::mem::take(&mut container.foreign_items);
    container.foreign_items = sort(foreign, container);
    let regular = std::mem::take(&mut container.regular_items);
    container.regular_items = sort(regular, container);
    let code = std::mem::take(&mut container.code_items);
    container.code_items = sort(code, container);
    let debug = std::mem::take(&mut container.debug_items);
    container.debug_items = sort(debug, container);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeBuilder, OP_LDA_STR, OP_RET};
    use crate::container::WriteOptions;
    use crate::items::{MethodFlags, PrimitiveTy};

    fn refresh_checksum(bytes: &mut [u8]) {
        let mut adler = RollingAdler32::new();
        adler.update_buffer(&bytes[CHECKSUM_OFFSET + 4..]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&adler.hash().to_le_bytes());
    }

    fn sample_container() -> ItemContainer {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LFoo;");
        let name = container.get_or_create_string("run");
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        let method = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        let greeting = container.get_or_create_string("hello");
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(greeting);
        builder.emit_ret();
        container.set_method_code(method, 1, 0, builder, Vec::new());
        container
    }

    #[test]
    fn rejects_bad_magic() {
        let mut container = sample_container();
        let mut bytes = container.write(&WriteOptions::default()).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(
            ItemContainer::from_bytes(&bytes),
            Err(ContainerError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut container = sample_container();
        let mut bytes = container.write(&WriteOptions::default()).unwrap();
        bytes[8] = 9;
        assert!(matches!(
            ItemContainer::from_bytes(&bytes),
            Err(ContainerError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_corrupted_body() {
        let mut container = sample_container();
        let mut bytes = container.write(&WriteOptions::default()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        assert!(matches!(
            ItemContainer::from_bytes(&bytes),
            Err(ContainerError::Format(_))
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        assert!(matches!(
            ItemContainer::from_bytes(&MAGIC),
            Err(ContainerError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn detects_self_inheritance() {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LSelf;");
        container.set_class_super(class, class);
        let bytes = container.write(&WriteOptions::default()).unwrap();
        assert!(matches!(
            ItemContainer::from_bytes(&bytes),
            Err(ContainerError::SelfInheritance { .. })
        ));
    }

    #[test]
    fn rejects_self_referential_annotation_element() {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LFoo;");
        let name = container.get_or_create_string("run");
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        let method = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        let anno_class = container.get_or_create_class("LAnno;");
        let element = container.get_or_create_string("value");
        let seven = container.get_or_create_integer_value(7);
        let annotation = container.new_annotation(anno_class, vec![(element, seven)]);
        container.add_method_annotation(method, annotation);
        let mut bytes = container.write(&WriteOptions::default()).unwrap();

        // Point the element value back at the annotation itself:
        // class ref (4) + element count uleb (1) + name ref (4) = 9.
        let offset = container.item(annotation).offset.unwrap() as usize;
        bytes[offset + 9..offset + 13].copy_from_slice(&(offset as u32).to_le_bytes());
        bytes[offset + 13] = VALUE_ANNOTATION;
        refresh_checksum(&mut bytes);

        assert!(matches!(
            ItemContainer::from_bytes(&bytes),
            Err(ContainerError::Format(_))
        ));
    }

    #[test]
    fn rejects_name_that_is_both_defined_and_foreign() {
        let mut container = ItemContainer::new();
        let base = container.get_or_create_foreign_class("LBar;");
        let class = container.get_or_create_class("LFoo;");
        container.set_class_super(class, base);
        let mut bytes = container.write(&WriteOptions::default()).unwrap();

        // Rename the definition to collide with its foreign superclass.
        let name_offset = container
            .iter()
            .find_map(|(_, item)| match &item.kind {
                ItemKind::String(payload) if payload.bytes == b"LFoo;" => item.offset,
                _ => None,
            })
            .unwrap() as usize;
        bytes[name_offset + 1..name_offset + 6].copy_from_slice(b"LBar;");
        refresh_checksum(&mut bytes);

        assert!(matches!(
            ItemContainer::from_bytes(&bytes),
            Err(ContainerError::Format(_))
        ));
    }

    /// Two methods in different source headers sharing one body, with the
    /// string entry table of the second header supplied by the test.
    fn two_header_fixture(buf: &[u8], second_strings: Vec<u32>) -> (Materializer<'_>, ItemId) {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LFoo;");
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        let one = container.get_or_create_string("one");
        let two = container.get_or_create_string("two");
        let first = container.add_method(class, one, proto, MethodFlags::PUBLIC);
        let second = container.add_method(class, two, proto, MethodFlags::PUBLIC);

        let body = vec![OP_LDA_STR, 0, 0, OP_RET];
        let code = container.alloc(ItemKind::Code(CodePayload {
            num_vregs: 1,
            num_args: 0,
            bytes: body.clone(),
            try_blocks: Vec::new(),
            covered_methods: Vec::new(),
        }));
        container.code_items.push(code);
        container.expect_method_mut(first).code = Some(code);
        container.expect_method_mut(second).code = Some(code);

        let header = |start: u32, end: u32, strings: Vec<u32>| {
            let mut entries: [Vec<u32>; 5] = Default::default();
            entries[kind_slot(RefKind::String)] = strings;
            SourceHeader { start, end, entries }
        };

        let mut materializer = Materializer {
            bytes: buf,
            container,
            memo: HashMap::new(),
            visiting: HashSet::new(),
            headers: vec![header(52, 150, vec![52]), header(150, 300, second_strings)],
            lnp_offsets: Vec::new(),
            foreign_start: 0,
            foreign_end: 0,
            pending: vec![
                PendingCode {
                    code,
                    method: first,
                    method_offset: 100,
                },
                PendingCode {
                    code,
                    method: second,
                    method_offset: 200,
                },
            ],
            code_deps: HashMap::new(),
            code_sources: HashMap::new(),
        };
        materializer.code_sources.insert(
            code,
            CodeSource {
                bytes: body,
                raw_catch: Vec::new(),
            },
        );
        (materializer, code)
    }

    #[test]
    fn shared_body_across_disagreeing_headers_is_corrupt() {
        // Two string entities; the headers map slot 0 to different ones.
        let mut buf = vec![0u8; 52];
        buf.extend_from_slice(&[3, b'a', 0, 3, b'b', 0]);
        let (mut materializer, _) = two_header_fixture(&buf, vec![55]);
        assert!(matches!(
            materializer.fix_up(),
            Err(ContainerError::Format(_))
        ));
    }

    #[test]
    fn shared_body_across_agreeing_headers_resolves_once() {
        let mut buf = vec![0u8; 52];
        buf.extend_from_slice(&[3, b'a', 0, 3, b'b', 0]);
        let (mut materializer, code) = two_header_fixture(&buf, vec![52]);
        materializer.fix_up().unwrap();

        let container = materializer.container;
        assert_eq!(
            container.expect_code(code).covered_methods,
            vec!["LFoo;::one".to_owned(), "LFoo;::two".to_owned()]
        );
    }

    #[test]
    fn reconstructs_interfaces_and_class_annotations() {
        let mut container = ItemContainer::new();
        let class = container.get_or_create_class("LBar;");
        let iface = container.get_or_create_class("LIface;");
        container.add_class_interface(class, iface);
        let anno_class = container.get_or_create_class("LRuntime;");
        let name = container.get_or_create_string("visible");
        let yes = container.get_or_create_integer_value(1);
        let annotation = container.new_annotation(anno_class, vec![(name, yes)]);
        container.add_class_annotation(class, annotation);

        let bytes = container.write(&WriteOptions::default()).unwrap();
        let read = ItemContainer::from_bytes(&bytes).unwrap();

        let class = read
            .regular_items
            .iter()
            .copied()
            .find(|&id| {
                matches!(read.item(id).kind, ItemKind::Class(_)) && read.class_name(id) == "LBar;"
            })
            .unwrap();
        let payload = read.expect_class(class);
        assert_eq!(payload.interfaces.len(), 1);
        assert_eq!(read.class_name(payload.interfaces[0]), "LIface;");
        assert_eq!(payload.annotations.len(), 1);
        match &read.item(payload.annotations[0]).kind {
            ItemKind::Annotation(annotation) => {
                assert_eq!(read.class_name(annotation.class), "LRuntime;");
                assert_eq!(annotation.elements.len(), 1);
                assert_eq!(read.string_text(annotation.elements[0].name), "visible");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn reconstructs_classes_methods_and_strings() {
        let mut container = sample_container();
        let bytes = container.write(&WriteOptions::default()).unwrap();
        let read = ItemContainer::from_bytes(&bytes).unwrap();

        let class = read
            .regular_items
            .iter()
            .copied()
            .find(|&id| matches!(read.item(id).kind, ItemKind::Class(_)))
            .unwrap();
        assert_eq!(read.class_name(class), "LFoo;");
        let methods = read.expect_class(class).methods.clone();
        assert_eq!(methods.len(), 1);
        assert_eq!(read.full_method_name(methods[0]), "LFoo;::run");
        let code = read.expect_method(methods[0]).code.unwrap();
        assert_eq!(
            read.expect_code(code).covered_methods,
            vec!["LFoo;::run".to_owned()]
        );
    }
}
