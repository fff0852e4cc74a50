//! End-to-end scenarios over the full write/read pipeline.

use abc_container::{
    BytecodeBuilder, ClassFlags, FieldFlags, ItemContainer, LineProgramBuilder, MethodFlags,
    PrimitiveTy, Profile, TryBlock, WriteOptions,
};
use abc_container::items::{CatchHandler, ItemKind};
use pretty_assertions::assert_eq;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

/// Reads the MUTF-8 string entity at `offset` (tag, bytes, NUL).
fn string_at(bytes: &[u8], offset: usize) -> String {
    let mut cursor = offset;
    // Skip the uleb128 length tag.
    while bytes[cursor] & 0x80 != 0 {
        cursor += 1;
    }
    cursor += 1;
    let end = cursor + bytes[cursor..].iter().position(|&b| b == 0).unwrap();
    String::from_utf8(bytes[cursor..end].to_vec()).unwrap()
}

/// Two classes with one method each; the methods carry structurally equal
/// annotations and identical bodies, and one class declares a field without
/// a value.
fn two_class_container() -> ItemContainer {
    let mut container = ItemContainer::new();
    let foo = container.get_or_create_class("LFoo;");
    let bar = container.get_or_create_class("LBar;");
    container.set_class_flags(foo, ClassFlags::PUBLIC);
    container.set_class_flags(bar, ClassFlags::PUBLIC);

    let anno_class = container.get_or_create_class("LAnno;");
    let element_name = container.get_or_create_string("value");
    let i32_ty = container.get_or_create_primitive_type(PrimitiveTy::I32);
    let field_name = container.get_or_create_string("count");
    container.add_field(foo, field_name, i32_ty, FieldFlags::PRIVATE);

    let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
    let proto = container.get_or_create_proto(void, Vec::new());
    let run = container.get_or_create_string("run");
    for class in [foo, bar] {
        let method = container.add_method(class, run, proto, MethodFlags::PUBLIC);
        let seven = container.get_or_create_integer_value(7);
        let annotation = container.new_annotation(anno_class, vec![(element_name, seven)]);
        container.add_method_annotation(method, annotation);

        let greeting = container.get_or_create_string("hello");
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(greeting);
        builder.emit_ret();
        container.set_method_code(method, 1, 0, builder, Vec::new());
    }
    container
}

#[test]
fn empty_container_writes_deterministically() {
    let first = ItemContainer::new().write(&WriteOptions::default()).unwrap();
    let second = ItemContainer::new().write(&WriteOptions::default()).unwrap();
    assert_eq!(first, second);
    assert_eq!(read_u32(&first, 16) as usize, first.len());
}

#[test]
fn class_index_is_sorted_by_name() {
    let mut container = two_class_container();
    let bytes = container.write(&WriteOptions::default()).unwrap();

    let class_count = read_u32(&bytes, 28) as usize;
    let class_index = read_u32(&bytes, 32) as usize;
    assert_eq!(class_count, 3);

    let names: Vec<String> = (0..class_count)
        .map(|slot| {
            let class_offset = read_u32(&bytes, class_index + 4 * slot) as usize;
            let name_offset = read_u32(&bytes, class_offset) as usize;
            string_at(&bytes, name_offset)
        })
        .collect();
    assert_eq!(names, vec!["LAnno;", "LBar;", "LFoo;"]);
}

fn emitted_annotation_count(container: &ItemContainer) -> usize {
    container
        .iter()
        .filter(|(_, item)| item.needs_emission && matches!(item.kind, ItemKind::Annotation(_)))
        .count()
}

fn method_codes(container: &ItemContainer) -> Vec<abc_container::ItemId> {
    container
        .iter()
        .filter_map(|(_, item)| match &item.kind {
            ItemKind::Method(payload) => payload.code,
            _ => None,
        })
        .collect()
}

#[test]
fn equal_annotations_and_bodies_collapse_on_write() {
    let mut container = two_class_container();
    container.write(&WriteOptions::default()).unwrap();

    assert_eq!(emitted_annotation_count(&container), 1);
    let codes = method_codes(&container);
    assert_eq!(codes.len(), 2);
    assert_eq!(codes[0], codes[1]);
}

#[test]
fn shared_bodies_land_at_one_offset() {
    let mut container = two_class_container();
    let bytes = container.write(&WriteOptions::default()).unwrap();
    let read = ItemContainer::from_bytes(&bytes).unwrap();

    let codes = method_codes(&read);
    assert_eq!(codes.len(), 2);
    assert_eq!(codes[0], codes[1]);
    match &read.item(codes[0]).kind {
        ItemKind::Code(payload) => assert_eq!(payload.covered_methods.len(), 2),
        _ => unreachable!(),
    }
}

#[test]
fn fields_without_values_read_back_without_values() {
    let mut container = two_class_container();
    let bytes = container.write(&WriteOptions::default()).unwrap();
    let read = ItemContainer::from_bytes(&bytes).unwrap();

    let field = read
        .iter()
        .find_map(|(_, item)| match &item.kind {
            ItemKind::Field(payload) => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(field.value, None);
    assert_eq!(read.string_text(field.name), "count");
}

#[test]
fn skipping_dedup_keeps_duplicates() {
    let mut container = two_class_container();
    container
        .write(&WriteOptions {
            skip_dedup: true,
            profile: None,
        })
        .unwrap();
    assert_eq!(emitted_annotation_count(&container), 2);
}

/// Full feature round trip: writing, reading the result back and writing
/// again must reproduce the exact bytes.
#[test]
fn round_trip_is_byte_identical() {
    let mut container = ItemContainer::new();
    let base = container.get_or_create_foreign_class("LBase;");
    let class = container.get_or_create_class("LWorker;");
    container.set_class_super(class, base);
    container.set_class_flags(class, ClassFlags::PUBLIC | ClassFlags::FINAL);
    let source = container.get_or_create_string("worker.src");
    container.set_class_source_file(class, source);

    let i32_ty = container.get_or_create_primitive_type(PrimitiveTy::I32);
    let field_name = container.get_or_create_string("total");
    let field = container.add_field(class, field_name, i32_ty, FieldFlags::STATIC);
    let initial = container.get_or_create_integer_value(41);
    container.set_field_value(field, initial);

    let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
    let proto = container.get_or_create_proto(void, vec![i32_ty]);
    let method_name = container.get_or_create_string("step");
    let method = container.add_method(class, method_name, proto, MethodFlags::PUBLIC);

    let iface = container.get_or_create_class("LRunnable;");
    container.add_class_interface(class, iface);

    let anno_class = container.get_or_create_class("LAnno;");
    let element_name = container.get_or_create_string("limits");
    let lo = container.get_or_create_integer_value(1);
    let hi = container.get_or_create_integer_value(9);
    let limits = container.new_array_value(vec![lo, hi]);
    let annotation = container.new_annotation(anno_class, vec![(element_name, limits)]);
    container.add_method_annotation(method, annotation);
    let marker = container.new_annotation(anno_class, vec![(element_name, lo)]);
    container.add_class_annotation(class, marker);

    let greeting = container.get_or_create_string("tick");
    let mut builder = BytecodeBuilder::new();
    builder.emit_lda_str(greeting);
    builder.emit_lda_type(base);
    builder.emit_stobj(field);
    builder.emit_lda_arr(limits);
    builder.emit_ret();
    let try_blocks = vec![TryBlock {
        start_pc: 0,
        length: 6,
        handlers: vec![
            CatchHandler {
                type_ref: Some(base),
                handler_pc: 9,
                length: 1,
            },
            CatchHandler {
                type_ref: None,
                handler_pc: 10,
                length: 1,
            },
        ],
    }];
    container.set_method_code(method, 2, 1, builder, try_blocks);

    let local_name = container.get_or_create_string("i");
    let mut program = LineProgramBuilder::new();
    program.emit_set_file(source);
    program.emit_advance_line(4);
    program.emit_start_local(0, local_name, i32_ty);
    program.emit_advance_pc(3);
    program.emit_end_local(0);
    program.emit_end();
    container.add_debug_info(method, 12, vec![local_name], program);

    let first = container.write(&WriteOptions::default()).unwrap();
    let mut reread = ItemContainer::from_bytes(&first).unwrap();
    let second = reread.write(&WriteOptions::default()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn profile_moves_hot_entities_forward() {
    let mut container = ItemContainer::new();
    let cold_string = container.get_or_create_string("cold");
    let hot_string = container.get_or_create_string("hot");
    let first_class = container.get_or_create_class("LFirst;");
    let second_class = container.get_or_create_class("LSecond;");
    let class = container.get_or_create_class("LHot;");
    let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
    let proto = container.get_or_create_proto(void, Vec::new());

    let mut codes = Vec::new();
    for (name, text) in [("cold_method", "cold"), ("hot_method", "hot")] {
        let name = container.get_or_create_string(name);
        let method = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        let string = container.get_or_create_string(text);
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(string);
        builder.emit_ret();
        codes.push(container.set_method_code(method, 1, 0, builder, Vec::new()));
    }

    let profile = Profile::parse(
        "class_item:LHot;\nstring_item:hot\ncode_item:LHot;::hot_method",
    )
    .unwrap();
    container
        .write(&WriteOptions {
            skip_dedup: false,
            profile: Some(profile),
        })
        .unwrap();

    let offset = |id| container.item(id).offset.unwrap();
    // The one profiled class jumps ahead of the two unprofiled ones, which
    // keep their relative order.
    assert!(offset(class) < offset(first_class));
    assert!(offset(first_class) < offset(second_class));
    assert!(offset(hot_string) < offset(cold_string));
    assert!(offset(second_class) < offset(hot_string));
    assert!(offset(codes[1]) < offset(codes[0]));
}

/// Two methods whose combined string references exceed one header's
/// capacity must split across two index headers.
#[test]
fn oversized_reference_sets_split_headers() {
    let mut container = ItemContainer::new();
    let class = container.get_or_create_class("LBig;");
    let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
    let proto = container.get_or_create_proto(void, Vec::new());

    let mut strings = Vec::with_capacity(70_000);
    for index in 0..70_000u32 {
        strings.push(container.get_or_create_string(&format!("s{index}")));
    }

    for (name, range) in [("first", 0..40_000usize), ("second", 30_000..70_000)] {
        let name = container.get_or_create_string(name);
        let method = container.add_method(class, name, proto, MethodFlags::PUBLIC);
        let mut builder = BytecodeBuilder::new();
        for &string in &strings[range] {
            builder.emit_lda_str(string);
        }
        builder.emit_ret();
        container.set_method_code(method, 1, 0, builder, Vec::new());
    }

    let bytes = container.write(&WriteOptions::default()).unwrap();
    let header_count = read_u32(&bytes, 44);
    assert_eq!(header_count, 2);
}

#[test]
fn float_constants_intern_by_bit_pattern_across_round_trip() {
    let mut container = ItemContainer::new();
    let class = container.get_or_create_class("LConst;");
    let f64_ty = container.get_or_create_primitive_type(PrimitiveTy::F64);
    let name = container.get_or_create_string("zero");
    let field = container.add_field(class, name, f64_ty, FieldFlags::STATIC);
    let negative_zero = container.get_or_create_double_value(-0.0);
    container.set_field_value(field, negative_zero);

    let bytes = container.write(&WriteOptions::default()).unwrap();
    let mut read = ItemContainer::from_bytes(&bytes).unwrap();
    let reread_negative = read.get_or_create_double_value(-0.0);
    let reread_positive = read.get_or_create_double_value(0.0);
    // -0.0 was reconstructed from the file; interning must find it again
    // while +0.0 stays a distinct constant.
    assert!(read.item(reread_negative).offset.is_some());
    assert!(read.item(reread_positive).offset.is_none());
}
