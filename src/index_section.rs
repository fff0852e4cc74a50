//! Bounded index partitioning.
//!
//! Bytecode operands are 16 bits wide, so a single index header can address
//! at most [`INDEX_CAPACITY`] distinct entities of each reference kind. This
//! pass groups methods into headers greedily in layout order, assigns each
//! covered entity its header-local slot, and finalizes the three bookkeeping
//! tables (class index, line-program index, index section) so layout can
//! size them.
//!
//! Every ordering here is derived from container content, never from arena
//! handle values, so rebuilding an equivalent container partitions
//! identically.

use std::collections::HashMap;

use indexmap::IndexSet;
use tracing::debug;

use crate::bytecode::{INDEX_CAPACITY, RefKind};
use crate::container::ItemContainer;
use crate::error::{ContainerError, ContainerResult};
use crate::items::{IndexHeader, ItemId, ItemKind, kind_slot};

/// Lookup tables the serializer needs beyond the slots stored on items.
pub(crate) struct PartitionResult {
    /// Index header each emitted method belongs to.
    pub method_header: HashMap<ItemId, u16>,
    /// Global line-program table position per emitted program.
    pub lnp_index: HashMap<ItemId, u32>,
    headers: usize,
}

impl PartitionResult {
    pub fn header_count(&self) -> usize {
        self.headers
    }
}

/// In-progress header during the greedy grouping pass.
#[derive(Default)]
struct HeaderBuild {
    methods: Vec<ItemId>,
    entries: [IndexSet<ItemId>; 5],
}

pub(crate) fn partition_indexes(
    container: &mut ItemContainer,
) -> ContainerResult<PartitionResult> {
    for index in 0..container.arena_len() {
        container
            .item_mut(ItemId::from_raw(index as u32))
            .index_slots
            .clear();
    }

    let builds = group_methods(container)?;
    let position = emission_positions(container);
    assign_slots(container, &builds, &position);
    split_conflicting_shared_code(container, &builds);

    let method_header: HashMap<ItemId, u16> = builds
        .iter()
        .enumerate()
        .flat_map(|(header, build)| {
            build
                .methods
                .iter()
                .map(move |&method| (method, header as u16))
        })
        .collect();

    finalize_class_index(container);
    let lnp_index = finalize_line_program_index(container);
    let headers = builds.len();
    finalize_index_section(container, builds);

    debug!(headers, "index partitioning complete");
    Ok(PartitionResult {
        method_header,
        lnp_index,
        headers,
    })
}

/// Greedy grouping: walk methods in layout order and close the open header
/// whenever admitting the next method would overflow some per-kind capacity.
fn group_methods(container: &ItemContainer) -> ContainerResult<Vec<HeaderBuild>> {
    let mut builds: Vec<HeaderBuild> = Vec::new();
    let mut open = HeaderBuild::default();

    for method in container.emitted_methods() {
        let mut method_deps: [IndexSet<ItemId>; 5] = Default::default();
        for &dep in &container.expect_method(method).deps {
            let kind = container.item(dep).kind.ref_kind().unwrap_or_else(|| {
                panic!(
                    "method dependency is a non-indexable {} item",
                    container.item(dep).kind.name()
                )
            });
            method_deps[kind_slot(kind)].insert(dep);
        }

        for kind in RefKind::ALL {
            let slot = kind_slot(kind);
            if method_deps[slot].len() > INDEX_CAPACITY {
                return Err(ContainerError::CapacityExceeded {
                    kind,
                    count: method_deps[slot].len(),
                    capacity: INDEX_CAPACITY,
                });
            }
        }

        let fits = RefKind::ALL.iter().all(|&kind| {
            let slot = kind_slot(kind);
            let added = method_deps[slot]
                .iter()
                .filter(|dep| !open.entries[slot].contains(*dep))
                .count();
            open.entries[slot].len() + added <= INDEX_CAPACITY
        });
        if !fits {
            builds.push(std::mem::take(&mut open));
        }

        open.methods.push(method);
        for slot in 0..5 {
            open.entries[slot].extend(method_deps[slot].iter().copied());
        }
    }

    if !open.methods.is_empty() {
        builds.push(open);
    }
    Ok(builds)
}

/// Position of every emitted entity in final emission order, used as the
/// content-derived tiebreaker for slot assignment.
fn emission_positions(container: &ItemContainer) -> HashMap<ItemId, u32> {
    container
        .foreign_items
        .iter()
        .chain(container.regular_items.iter())
        .chain(container.code_items.iter())
        .copied()
        .enumerate()
        .map(|(position, id)| (id, position as u32))
        .collect()
}

/// Orders each header's entries and records the resulting local slots on the
/// covered items.
///
/// Classes sort by emission position so runtime class resolution walks them
/// in file order. Other kinds sort widely-shared entities first (ascending
/// count of earlier headers already covering them keeps a shared entity's
/// slot stable across consecutive headers), position-tiebroken.
fn assign_slots(
    container: &mut ItemContainer,
    builds: &[HeaderBuild],
    position: &HashMap<ItemId, u32>,
) {
    let pos = |id: ItemId| position.get(&id).copied().unwrap_or(u32::MAX);

    for (header, build) in builds.iter().enumerate() {
        for kind in RefKind::ALL {
            let slot_index = kind_slot(kind);
            let mut entries: Vec<ItemId> = build.entries[slot_index].iter().copied().collect();
            if kind == RefKind::Class {
                // Classes carry no numeric type id in this model; emission
                // position is the stable stand-in for it.
                entries.sort_by_key(|&id| pos(id));
            } else {
                entries.sort_by_key(|&id| {
                    let prior = builds[..header]
                        .iter()
                        .filter(|earlier| earlier.entries[slot_index].contains(&id))
                        .count();
                    (prior, pos(id))
                });
            }
            for (slot, id) in entries.into_iter().enumerate() {
                container.item_mut(id).set_slot(header as u16, slot as u16);
            }
        }
    }
}

/// A code body shared by methods in different headers can only be emitted
/// with one set of operand slots. When the headers disagree on any slot, the
/// body is split: the first header's methods keep the original and each
/// conflicting slot mapping gets its own copy, placed directly after the
/// original so layout locality is preserved. Re-partitioning a container
/// that was already split finds no remaining conflicts.
fn split_conflicting_shared_code(container: &mut ItemContainer, builds: &[HeaderBuild]) {
    let mut owners: HashMap<ItemId, Vec<(ItemId, u16)>> = HashMap::new();
    for (header, build) in builds.iter().enumerate() {
        for &method in &build.methods {
            if let Some(code) = container.expect_method(method).code {
                owners.entry(code).or_default().push((method, header as u16));
            }
        }
    }

    for code in container.code_items.clone() {
        let Some(owners) = owners.get(&code).cloned() else {
            continue;
        };
        if owners.len() < 2 {
            continue;
        }
        // Methods sharing a body have structurally equal dependency lists.
        let deps = container.expect_method(owners[0].0).deps.clone();
        let mapping = |container: &ItemContainer, header: u16| -> Vec<Option<u16>> {
            deps.iter()
                .map(|&dep| container.item(dep).slot_in(header))
                .collect()
        };

        let original_mapping = mapping(container, owners[0].1);
        let mut clones: Vec<(Vec<Option<u16>>, ItemId)> = Vec::new();
        let mut inserted = 0usize;
        for &(method, header) in &owners[1..] {
            let candidate = mapping(container, header);
            if candidate == original_mapping {
                continue;
            }
            let clone = match clones.iter().find(|(m, _)| *m == candidate) {
                Some(&(_, clone)) => clone,
                None => {
                    let payload = container.expect_code(code).clone();
                    let clone = container.alloc(ItemKind::Code(payload));
                    let original_pos = container
                        .code_items
                        .iter()
                        .position(|&c| c == code)
                        .unwrap_or_else(|| panic!("split of code body not in emission list"));
                    inserted += 1;
                    container
                        .code_items
                        .insert(original_pos + inserted, clone);
                    clones.push((candidate, clone));
                    clone
                }
            };
            container.expect_method_mut(method).code = Some(clone);
        }

        if !clones.is_empty() {
            rebuild_covered_methods(container, code);
            for &(_, clone) in &clones {
                rebuild_covered_methods(container, clone);
            }
            debug!(copies = clones.len(), "split shared code body across headers");
        }
    }
}

fn rebuild_covered_methods(container: &mut ItemContainer, code: ItemId) {
    let covered: Vec<String> = container
        .emitted_methods()
        .into_iter()
        .filter(|&method| container.expect_method(method).code == Some(code))
        .map(|method| container.full_method_name(method))
        .collect();
    container.expect_code_mut(code).covered_methods = covered;
}

/// Class index entries sort by name bytes so readers can binary-search by
/// name.
fn finalize_class_index(container: &mut ItemContainer) {
    let mut classes: Vec<ItemId> = container
        .regular_items
        .iter()
        .copied()
        .filter(|&id| {
            container.item(id).needs_emission
                && matches!(container.item(id).kind, ItemKind::Class(_))
        })
        .collect();
    classes.sort_by(|&a, &b| {
        let name_bytes = |id: ItemId| match &container.item(container.expect_class(id).name).kind {
            ItemKind::String(payload) => payload.bytes.clone(),
            other => panic!("class name is a {} item", other.name()),
        };
        name_bytes(a).cmp(&name_bytes(b))
    });

    let id = container.class_index_item;
    match &mut container.item_mut(id).kind {
        ItemKind::ClassIndex(payload) => {
            payload.classes = classes;
            payload.finalized = true;
        }
        _ => unreachable!(),
    }
    container.item_mut(id).size = None;
}

/// The global line-program table orders programs by descending reference
/// count so the hottest programs get the smallest indices.
fn finalize_line_program_index(container: &mut ItemContainer) -> HashMap<ItemId, u32> {
    let mut counts: HashMap<ItemId, usize> = HashMap::new();
    for &id in &container.debug_items {
        if !container.item(id).needs_emission {
            continue;
        }
        if let ItemKind::DebugInfo(payload) = &container.item(id).kind {
            *counts.entry(payload.program).or_insert(0) += 1;
        }
    }

    let mut programs: Vec<ItemId> = container
        .debug_items
        .iter()
        .copied()
        .filter(|&id| {
            container.item(id).needs_emission
                && matches!(container.item(id).kind, ItemKind::LineProgram(_))
        })
        .collect();
    let order: HashMap<ItemId, usize> = programs
        .iter()
        .copied()
        .enumerate()
        .map(|(position, id)| (id, position))
        .collect();
    programs.sort_by_key(|&id| {
        (
            usize::MAX - counts.get(&id).copied().unwrap_or(0),
            order[&id],
        )
    });

    let lnp_index: HashMap<ItemId, u32> = programs
        .iter()
        .copied()
        .enumerate()
        .map(|(index, id)| (id, index as u32))
        .collect();

    let id = container.line_program_index_item;
    match &mut container.item_mut(id).kind {
        ItemKind::LineProgramIndex(payload) => {
            payload.programs = programs;
            payload.finalized = true;
        }
        _ => unreachable!(),
    }
    container.item_mut(id).size = None;
    lnp_index
}

fn finalize_index_section(container: &mut ItemContainer, builds: Vec<HeaderBuild>) {
    let headers: Vec<IndexHeader> = builds
        .into_iter()
        .enumerate()
        .map(|(index, build)| {
            let mut header = IndexHeader {
                methods: build.methods,
                entries: Default::default(),
            };
            for slot_index in 0..5 {
                let mut entries: Vec<ItemId> = build.entries[slot_index].iter().copied().collect();
                entries.sort_by_key(|&id| {
                    container
                        .item(id)
                        .slot_in(index as u16)
                        .unwrap_or_else(|| panic!("covered entity missing its header slot"))
                });
                header.entries[slot_index] = entries;
            }
            header
        })
        .collect();

    let id = container.index_section_item;
    match &mut container.item_mut(id).kind {
        ItemKind::IndexSection(payload) => {
            payload.headers = headers;
            payload.finalized = true;
        }
        _ => unreachable!(),
    }
    container.item_mut(id).size = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;
    use crate::items::{MethodFlags, PrimitiveTy};

    fn method_named(container: &mut ItemContainer, class: &str, name: &str) -> ItemId {
        let class = container.get_or_create_class(class);
        let name = container.get_or_create_string(name);
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        container.add_method(class, name, proto, MethodFlags::PUBLIC)
    }

    #[test]
    fn single_header_covers_all_methods() {
        let mut container = ItemContainer::new();
        let first = method_named(&mut container, "LFoo;", "a");
        let second = method_named(&mut container, "LFoo;", "b");
        let hello = container.get_or_create_string("hello");
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(hello);
        builder.emit_ret();
        container.set_method_code(first, 0, 0, builder, Vec::new());

        let partition = partition_indexes(&mut container).unwrap();
        assert_eq!(partition.header_count(), 1);
        assert_eq!(partition.method_header[&first], 0);
        assert_eq!(partition.method_header[&second], 0);
        assert_eq!(container.item(hello).slot_in(0), Some(0));
    }

    #[test]
    fn class_index_sorts_by_name_bytes() {
        let mut container = ItemContainer::new();
        let foo = container.get_or_create_class("LFoo;");
        let bar = container.get_or_create_class("LBar;");

        partition_indexes(&mut container).unwrap();

        match &container.item(container.class_index_item).kind {
            ItemKind::ClassIndex(payload) => {
                assert!(payload.finalized);
                assert_eq!(payload.classes, vec![bar, foo]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn single_method_over_capacity_is_fatal() {
        let mut container = ItemContainer::new();
        let method = method_named(&mut container, "LBig;", "huge");
        let deps: Vec<ItemId> = (0..=INDEX_CAPACITY)
            .map(|index| container.get_or_create_string(&format!("s{index}")))
            .collect();
        container.expect_method_mut(method).deps = deps;

        assert!(matches!(
            partition_indexes(&mut container),
            Err(ContainerError::CapacityExceeded {
                kind: RefKind::String,
                count: 65_537,
                capacity: INDEX_CAPACITY,
            })
        ));
    }

    #[test]
    fn empty_container_partitions_to_zero_headers() {
        let mut container = ItemContainer::new();
        let partition = partition_indexes(&mut container).unwrap();
        assert_eq!(partition.header_count(), 0);
    }

    #[test]
    fn partitioning_twice_is_stable() {
        let mut container = ItemContainer::new();
        let method = method_named(&mut container, "LFoo;", "a");
        let hello = container.get_or_create_string("hello");
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(hello);
        builder.emit_ret();
        container.set_method_code(method, 0, 0, builder, Vec::new());

        partition_indexes(&mut container).unwrap();
        let first_slots = container.item(hello).index_slots.clone();
        partition_indexes(&mut container).unwrap();
        assert_eq!(container.item(hello).index_slots, first_slots);
    }
}
