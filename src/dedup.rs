//! Structural deduplication of container entities.
//!
//! Collapses byte-identical line-number programs, debug infos, code bodies
//! and annotations onto a single survivor each. Within one deduplicated kind
//! the first entity in creation order survives; later duplicates lose their
//! emission flag and every referrer is redirected to the survivor. Running
//! the pass twice is a no-op.

use std::collections::HashMap;

use tracing::debug;

use crate::container::ItemContainer;
use crate::items::{ItemId, ItemKind, PoolEntry};

/// Structural identity of a code body. Operand bytes encode ordinals into
/// the dependency list, so equal bytes only mean equal behavior when the
/// resolved dependency lists match too. Covered-method names are
/// bookkeeping, not identity.
#[derive(PartialEq, Eq, Hash)]
struct CodeKey {
    num_vregs: u32,
    num_args: u32,
    bytes: Vec<u8>,
    try_blocks: Vec<(u32, u32, Vec<(Option<ItemId>, u32, u32)>)>,
    deps: Vec<ItemId>,
}

#[derive(PartialEq, Eq, Hash)]
enum PoolKey {
    Item(ItemId),
    Number(u32),
}

#[derive(PartialEq, Eq, Hash)]
struct DebugInfoKey {
    line_start: u32,
    params: Vec<ItemId>,
    pool: Vec<PoolKey>,
    program: ItemId,
}

#[derive(PartialEq, Eq, Hash)]
struct AnnotationKey {
    class: ItemId,
    elements: Vec<(ItemId, ItemId)>,
    tags: Vec<u8>,
}

/// Redirect table from collapsed entities to their survivors.
#[derive(Default)]
struct Redirects {
    map: HashMap<ItemId, ItemId>,
}

impl Redirects {
    /// Follows redirect chains to the final survivor.
    fn resolve(&self, id: ItemId) -> ItemId {
        let mut current = id;
        while let Some(&next) = self.map.get(&current) {
            current = next;
        }
        current
    }

    fn add(&mut self, loser: ItemId, survivor: ItemId) {
        self.map.insert(loser, survivor);
    }
}

/// Runs every deduplication phase and rewrites all referrers.
pub(crate) fn deduplicate(container: &mut ItemContainer) {
    let mut redirects = Redirects::default();

    let programs = collapse_line_programs(container, &mut redirects);
    let debug_infos = collapse_debug_infos(container, &mut redirects);
    let codes = collapse_code(container, &mut redirects);
    let annotations = collapse_annotations(container, &mut redirects);

    rewrite_referrers(container, &redirects);
    container.deduplicated = true;

    debug!(
        programs,
        debug_infos, codes, annotations, "deduplication collapsed entities"
    );
}

fn collapse_line_programs(container: &mut ItemContainer, redirects: &mut Redirects) -> usize {
    let mut survivors: HashMap<Vec<u8>, ItemId> = HashMap::new();
    let mut collapsed = 0;
    for id in container.debug_items.clone() {
        if !container.item(id).needs_emission {
            continue;
        }
        let key = match &container.item(id).kind {
            ItemKind::LineProgram(payload) => payload.bytes.clone(),
            _ => continue,
        };
        match survivors.get(&key) {
            Some(&survivor) => {
                redirects.add(id, survivor);
                container.item_mut(id).needs_emission = false;
                collapsed += 1;
            }
            None => {
                survivors.insert(key, id);
            }
        }
    }
    collapsed
}

fn collapse_debug_infos(container: &mut ItemContainer, redirects: &mut Redirects) -> usize {
    let mut survivors: HashMap<DebugInfoKey, ItemId> = HashMap::new();
    let mut collapsed = 0;
    for id in container.debug_items.clone() {
        if !container.item(id).needs_emission {
            continue;
        }
        let key = match &container.item(id).kind {
            ItemKind::DebugInfo(payload) => DebugInfoKey {
                line_start: payload.line_start,
                params: payload
                    .params
                    .iter()
                    .map(|&param| redirects.resolve(param))
                    .collect(),
                pool: payload
                    .pool
                    .iter()
                    .map(|entry| match entry {
                        PoolEntry::Item(item) => PoolKey::Item(redirects.resolve(*item)),
                        PoolEntry::Number(number) => PoolKey::Number(*number),
                    })
                    .collect(),
                program: redirects.resolve(payload.program),
            },
            _ => continue,
        };
        match survivors.get(&key) {
            Some(&survivor) => {
                redirects.add(id, survivor);
                container.item_mut(id).needs_emission = false;
                collapsed += 1;
            }
            None => {
                survivors.insert(key, id);
            }
        }
    }
    collapsed
}

fn collapse_code(container: &mut ItemContainer, redirects: &mut Redirects) -> usize {
    // Dependency lists live on methods, so gather each body's resolved list
    // from its first owning method in creation order.
    let mut code_deps: HashMap<ItemId, Vec<ItemId>> = HashMap::new();
    for method in container.emitted_methods() {
        let payload = container.expect_method(method);
        if let Some(code) = payload.code {
            let deps: Vec<ItemId> = payload
                .deps
                .iter()
                .map(|&dep| redirects.resolve(dep))
                .collect();
            code_deps.entry(redirects.resolve(code)).or_insert(deps);
        }
    }

    let mut survivors: HashMap<CodeKey, ItemId> = HashMap::new();
    let mut collapsed = 0;
    for id in container.code_items.clone() {
        if !container.item(id).needs_emission {
            continue;
        }
        let payload = container.expect_code(id);
        let key = CodeKey {
            num_vregs: payload.num_vregs,
            num_args: payload.num_args,
            bytes: payload.bytes.clone(),
            try_blocks: payload
                .try_blocks
                .iter()
                .map(|block| {
                    (
                        block.start_pc,
                        block.length,
                        block
                            .handlers
                            .iter()
                            .map(|handler| {
                                (
                                    handler.type_ref.map(|ty| redirects.resolve(ty)),
                                    handler.handler_pc,
                                    handler.length,
                                )
                            })
                            .collect(),
                    )
                })
                .collect(),
            deps: code_deps.get(&id).cloned().unwrap_or_default(),
        };
        match survivors.get(&key) {
            Some(&survivor) => {
                let covered = container.expect_code(id).covered_methods.clone();
                let survivor_payload = container.expect_code_mut(survivor);
                for name in covered {
                    if !survivor_payload.covered_methods.contains(&name) {
                        survivor_payload.covered_methods.push(name);
                    }
                }
                redirects.add(id, survivor);
                container.item_mut(id).needs_emission = false;
                collapsed += 1;
            }
            None => {
                survivors.insert(key, id);
            }
        }
    }
    collapsed
}

/// Annotations may nest through reference values, so collapsing one can make
/// two enclosing annotations structurally equal. Iterate to a fixpoint.
fn collapse_annotations(container: &mut ItemContainer, redirects: &mut Redirects) -> usize {
    let mut collapsed = 0;
    loop {
        let mut survivors: HashMap<AnnotationKey, ItemId> = HashMap::new();
        let mut changed = false;
        for id in container.regular_items.clone() {
            if !container.item(id).needs_emission {
                continue;
            }
            let key = match &container.item(id).kind {
                ItemKind::Annotation(payload) => AnnotationKey {
                    class: redirects.resolve(payload.class),
                    elements: payload
                        .elements
                        .iter()
                        .map(|element| {
                            (
                                redirects.resolve(element.name),
                                resolve_value(container, redirects, element.value),
                            )
                        })
                        .collect(),
                    tags: payload.tags.clone(),
                },
                _ => continue,
            };
            match survivors.get(&key) {
                Some(&survivor) => {
                    redirects.add(id, survivor);
                    container.item_mut(id).needs_emission = false;
                    collapsed += 1;
                    changed = true;
                }
                None => {
                    survivors.insert(key, id);
                }
            }
        }
        if !changed {
            return collapsed;
        }
    }
}

/// Resolves an annotation element value for identity comparison. Interned
/// reference values are not collapsed themselves, but two of them become
/// interchangeable once their referents share a survivor; comparing through
/// the referent keeps the fixpoint honest.
fn resolve_value(container: &ItemContainer, redirects: &Redirects, value: ItemId) -> ItemId {
    let value = redirects.resolve(value);
    if let ItemKind::ScalarValue(crate::items::ScalarValue::Reference(target)) =
        &container.item(value).kind
    {
        return redirects.resolve(*target);
    }
    value
}

/// Rewrites every entity reference through the redirect table. Covers all
/// referrer positions, including kinds whose referents are never collapsed;
/// those resolve to themselves.
fn rewrite_referrers(container: &mut ItemContainer, redirects: &Redirects) {
    for index in 0..container.arena_len() {
        let id = ItemId::from_raw(index as u32);
        match &mut container.item_mut(id).kind {
            ItemKind::Class(payload) => {
                for annotation in &mut payload.annotations {
                    *annotation = redirects.resolve(*annotation);
                }
            }
            ItemKind::Method(payload) | ItemKind::ForeignMethod(payload) => {
                if let Some(code) = &mut payload.code {
                    *code = redirects.resolve(*code);
                }
                if let Some(debug_info) = &mut payload.debug_info {
                    *debug_info = redirects.resolve(*debug_info);
                }
                for annotation in &mut payload.annotations {
                    *annotation = redirects.resolve(*annotation);
                }
                for dep in &mut payload.deps {
                    *dep = redirects.resolve(*dep);
                }
            }
            ItemKind::Code(payload) => {
                for block in &mut payload.try_blocks {
                    for handler in &mut block.handlers {
                        if let Some(type_ref) = &mut handler.type_ref {
                            *type_ref = redirects.resolve(*type_ref);
                        }
                    }
                }
            }
            ItemKind::DebugInfo(payload) => {
                payload.program = redirects.resolve(payload.program);
                for entry in &mut payload.pool {
                    if let PoolEntry::Item(item) = entry {
                        *item = redirects.resolve(*item);
                    }
                }
            }
            ItemKind::Annotation(payload) => {
                for element in &mut payload.elements {
                    element.value = redirects.resolve(element.value);
                }
            }
            ItemKind::ScalarValue(crate::items::ScalarValue::Reference(target)) => {
                *target = redirects.resolve(*target);
            }
            ItemKind::ArrayValue(payload) => {
                for element in &mut payload.elements {
                    *element = redirects.resolve(*element);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;
    use crate::container::{ItemContainer, LineProgramBuilder};
    use crate::items::{MethodFlags, PrimitiveTy};

    fn simple_method(container: &mut ItemContainer, class: &str, name: &str) -> ItemId {
        let class = container.get_or_create_class(class);
        let name = container.get_or_create_string(name);
        let void = container.get_or_create_primitive_type(PrimitiveTy::Void);
        let proto = container.get_or_create_proto(void, Vec::new());
        container.add_method(class, name, proto, MethodFlags::PUBLIC)
    }

    fn body_loading(container: &mut ItemContainer, text: &str) -> BytecodeBuilder {
        let string = container.get_or_create_string(text);
        let mut builder = BytecodeBuilder::new();
        builder.emit_lda_str(string);
        builder.emit_ret();
        builder
    }

    #[test]
    fn identical_bodies_collapse_and_merge_coverage() {
        let mut container = ItemContainer::new();
        let first = simple_method(&mut container, "LFoo;", "a");
        let second = simple_method(&mut container, "LFoo;", "b");
        let builder = body_loading(&mut container, "shared");
        let code_a = container.set_method_code(first, 0, 0, builder, Vec::new());
        let builder = body_loading(&mut container, "shared");
        let code_b = container.set_method_code(second, 0, 0, builder, Vec::new());

        deduplicate(&mut container);

        assert!(container.item(code_a).needs_emission);
        assert!(!container.item(code_b).needs_emission);
        assert_eq!(container.expect_method(first).code, Some(code_a));
        assert_eq!(container.expect_method(second).code, Some(code_a));
        assert_eq!(
            container.expect_code(code_a).covered_methods,
            vec!["LFoo;::a".to_owned(), "LFoo;::b".to_owned()]
        );
    }

    #[test]
    fn equal_bytes_with_different_deps_stay_distinct() {
        let mut container = ItemContainer::new();
        let first = simple_method(&mut container, "LFoo;", "a");
        let second = simple_method(&mut container, "LFoo;", "b");
        let builder = body_loading(&mut container, "one");
        container.set_method_code(first, 0, 0, builder, Vec::new());
        let builder = body_loading(&mut container, "two");
        let code_b = container.set_method_code(second, 0, 0, builder, Vec::new());

        deduplicate(&mut container);

        assert!(container.item(code_b).needs_emission);
    }

    #[test]
    fn nested_annotations_collapse_to_fixpoint() {
        let mut container = ItemContainer::new();
        let anno_class = container.get_or_create_class("LAnno;");
        let element_name = container.get_or_create_string("value");

        let inner_a = container.new_annotation(anno_class, Vec::new());
        let inner_b = container.new_annotation(anno_class, Vec::new());
        let outer_a = container.new_annotation(anno_class, vec![(element_name, inner_a)]);
        let outer_b = container.new_annotation(anno_class, vec![(element_name, inner_b)]);

        deduplicate(&mut container);

        assert!(container.item(inner_a).needs_emission);
        assert!(!container.item(inner_b).needs_emission);
        assert!(container.item(outer_a).needs_emission);
        assert!(!container.item(outer_b).needs_emission);
    }

    #[test]
    fn dedup_is_idempotent() {
        let mut container = ItemContainer::new();
        let first = simple_method(&mut container, "LFoo;", "a");
        let second = simple_method(&mut container, "LFoo;", "b");
        let builder = body_loading(&mut container, "shared");
        let code_a = container.set_method_code(first, 0, 0, builder, Vec::new());
        let builder = body_loading(&mut container, "shared");
        container.set_method_code(second, 0, 0, builder, Vec::new());

        deduplicate(&mut container);
        let covered_after_first = container.expect_code(code_a).covered_methods.clone();
        deduplicate(&mut container);

        assert_eq!(
            container.expect_code(code_a).covered_methods,
            covered_after_first
        );
    }

    #[test]
    fn identical_line_programs_and_debug_infos_collapse() {
        let mut container = ItemContainer::new();
        let first = simple_method(&mut container, "LFoo;", "a");
        let second = simple_method(&mut container, "LFoo;", "b");

        let mut program = LineProgramBuilder::new();
        program.emit_advance_line(3);
        program.emit_end();
        let debug_a = container.add_debug_info(first, 10, Vec::new(), program);

        let mut program = LineProgramBuilder::new();
        program.emit_advance_line(3);
        program.emit_end();
        let debug_b = container.add_debug_info(second, 10, Vec::new(), program);

        deduplicate(&mut container);

        assert!(container.item(debug_a).needs_emission);
        assert!(!container.item(debug_b).needs_emission);
        assert_eq!(container.expect_method(second).debug_info, Some(debug_a));
    }
}
