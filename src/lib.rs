//! Binary container engine for bytecode programs.
//!
//! A build session assembles an entity graph (classes, methods, fields,
//! strings, constants, code bodies, debug info) through interning
//! constructors, then [`ItemContainer::write`] deduplicates it, partitions
//! bytecode references into bounded index headers, lays every entity out
//! deterministically and serializes the result with an embedded checksum.
//! [`ItemContainer::from_bytes`] is the inverse: it reconstructs an
//! equivalent build session from a file, rewriting header-local bytecode
//! operands back into position-independent form.

pub mod bytecode;
pub mod container;
mod dedup;
pub mod error;
mod index_section;
pub mod items;
mod layout;
mod reader;
pub mod span;
mod writer;

pub use bytecode::{BytecodeBuilder, INDEX_CAPACITY, RefKind};
pub use container::{ItemContainer, LineProgramBuilder, WriteOptions};
pub use error::{ContainerError, ContainerResult};
pub use items::{
    CatchHandler, ClassFlags, FieldFlags, ItemId, MethodFlags, PrimitiveTy, TryBlock,
};
pub use layout::Profile;
