//! Deterministic file layout and the optional profile-guided reorder.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::container::ItemContainer;
use crate::error::{ContainerError, ContainerResult};
use crate::items::{ItemId, ItemKind};
use crate::writer::HEADER_SIZE;

/// Region boundaries produced by a layout pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutSummary {
    pub file_size: u32,
    pub foreign_offset: u32,
    pub foreign_size: u32,
}

fn align_to(offset: u32, alignment: u32) -> u32 {
    offset.next_multiple_of(alignment)
}

/// Assigns a file offset to every emitted entity.
///
/// Layout is a pure function of container content and list order: foreign
/// region, bookkeeping tables, regular entities, code bodies, then debug
/// entities. Collapsed entities are skipped; their referrers were already
/// redirected to survivors.
pub(crate) fn compute_layout(container: &mut ItemContainer) -> LayoutSummary {
    let mut cursor = HEADER_SIZE;

    let foreign_offset = cursor;
    for id in container.foreign_items.clone() {
        cursor = place(container, id, cursor);
    }
    let foreign_size = cursor - foreign_offset;

    for id in [
        container.class_index_item,
        container.line_program_index_item,
        container.index_section_item,
    ] {
        cursor = place(container, id, cursor);
    }

    for id in container.regular_items.clone() {
        if container.item(id).needs_emission {
            cursor = place(container, id, cursor);
        }
    }
    container.item_mut(container.end_regular).offset = Some(cursor);

    for id in container.code_items.clone() {
        if container.item(id).needs_emission {
            cursor = place(container, id, cursor);
        }
    }
    container.item_mut(container.end_code).offset = Some(cursor);

    for id in container.debug_items.clone() {
        if container.item(id).needs_emission {
            cursor = place(container, id, cursor);
        }
    }
    container.item_mut(container.end_debug).offset = Some(cursor);

    LayoutSummary {
        file_size: cursor,
        foreign_offset,
        foreign_size,
    }
}

fn place(container: &mut ItemContainer, id: ItemId, cursor: u32) -> u32 {
    let offset = align_to(cursor, container.item(id).kind.alignment());
    let size = container.size_of(id);
    container.item_mut(id).offset = Some(offset);
    offset + size
}

/// Hotness sets parsed from a profile file.
///
/// Each line is `<kind>:<identifier>` with kind one of `string_item`,
/// `class_item` or `code_item`; blank lines and `#` comments are skipped.
#[derive(Debug, Default, Clone)]
pub struct Profile {
    strings: HashSet<String>,
    classes: HashSet<String>,
    methods: HashSet<String>,
}

impl Profile {
    pub fn load(path: impl AsRef<Path>) -> ContainerResult<Profile> {
        Profile::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> ContainerResult<Profile> {
        let mut profile = Profile::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (kind, identifier) = line.split_once(':').ok_or_else(|| {
                ContainerError::format(format!("malformed profile line {line:?}"))
            })?;
            let set = match kind {
                "string_item" => &mut profile.strings,
                "class_item" => &mut profile.classes,
                "code_item" => &mut profile.methods,
                other => {
                    return Err(ContainerError::format(format!(
                        "unknown profile entry kind {other:?}"
                    )));
                }
            };
            set.insert(identifier.to_owned());
        }
        Ok(profile)
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.classes.is_empty() && self.methods.is_empty()
    }
}

/// Reorders the regular and code segments by hotness rank.
///
/// Classes rank above all other regular entities, and profiled entities rank
/// above unprofiled peers of the same kind. Ties keep their prior relative
/// order, so an empty profile leaves the layout unchanged aside from the
/// classes-first grouping.
pub(crate) fn profile_guided_relayout(container: &mut ItemContainer, profile: &Profile) {
    let regular_rank = |container: &ItemContainer, id: ItemId| -> u32 {
        let item = container.item(id);
        match &item.kind {
            ItemKind::Class(_) => {
                let mut rank = 4;
                if item.needs_emission && profile.classes.contains(&container.class_name(id)) {
                    rank += 1;
                }
                rank
            }
            ItemKind::String(_) => {
                let mut rank = 2;
                if item.needs_emission && profile.strings.contains(&container.string_text(id)) {
                    rank += 1;
                }
                rank
            }
            _ => 2,
        }
    };

    let mut regular: Vec<ItemId> = container.regular_items.clone();
    regular.sort_by_cached_key(|&id| Reverse(regular_rank(container, id)));
    container.regular_items = regular;

    let code_rank = |container: &ItemContainer, id: ItemId| -> u32 {
        let item = container.item(id);
        if !item.needs_emission {
            return 0;
        }
        match &item.kind {
            ItemKind::Code(payload) => payload
                .covered_methods
                .iter()
                .any(|name| profile.methods.contains(name)) as u32,
            _ => 0,
        }
    };

    let mut code: Vec<ItemId> = container.code_items.clone();
    code.sort_by_cached_key(|&id| Reverse(code_rank(container, id)));
    container.code_items = code;

    debug!(
        strings = profile.strings.len(),
        classes = profile.classes.len(),
        methods = profile.methods.len(),
        "profile-guided reorder applied"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ItemContainer;

    #[test]
    fn profile_parses_known_kinds_and_skips_comments() {
        let profile = Profile::parse(
            "# hot entities\nstring_item:hello\nclass_item:LFoo;\ncode_item:LFoo;::bar\n\n",
        )
        .unwrap();
        assert!(profile.strings.contains("hello"));
        assert!(profile.classes.contains("LFoo;"));
        assert!(profile.methods.contains("LFoo;::bar"));
    }

    #[test]
    fn profile_rejects_unknown_kind_and_missing_separator() {
        assert!(Profile::parse("field_item:x").is_err());
        assert!(Profile::parse("just text").is_err());
    }

    #[test]
    fn relayout_moves_profiled_string_ahead_of_peers() {
        let mut container = ItemContainer::new();
        let cold = container.get_or_create_string("cold");
        let hot = container.get_or_create_string("hot");
        let profile = Profile::parse("string_item:hot").unwrap();

        profile_guided_relayout(&mut container, &profile);

        let regular = &container.regular_items;
        let cold_pos = regular.iter().position(|&id| id == cold).unwrap();
        let hot_pos = regular.iter().position(|&id| id == hot).unwrap();
        assert!(hot_pos < cold_pos);
    }

    #[test]
    fn relayout_groups_classes_before_strings() {
        let mut container = ItemContainer::new();
        let string = container.get_or_create_string("s");
        let class = container.get_or_create_class("LFoo;");

        profile_guided_relayout(&mut container, &Profile::default());

        let regular = &container.regular_items;
        let class_pos = regular.iter().position(|&id| id == class).unwrap();
        let string_pos = regular.iter().position(|&id| id == string).unwrap();
        assert!(class_pos < string_pos);
    }

    #[test]
    fn empty_profile_is_empty() {
        assert!(Profile::parse("").unwrap().is_empty());
    }
}
