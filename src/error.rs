use std::io;

use thiserror::Error;

use crate::bytecode::RefKind;

/// Result alias for operations that may produce a [`ContainerError`].
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while building, writing or reading a container file.
///
/// Corrupt-input conditions are always recoverable at the API boundary: the
/// open/build/write entry point returns the error and the container is left
/// untouched. Programmer errors (querying an offset before layout ran,
/// registering two entities under one identity key) are not represented here;
/// they abort via assertions since continuing would corrupt the output.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Wrapper around [`io::Error`] for profile-file loading.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The file did not start with the expected magic bytes.
    #[error("invalid magic bytes: expected {expected:02x?}, found {found:02x?}")]
    InvalidMagic { expected: Vec<u8>, found: Vec<u8> },

    /// The stream terminated before enough bytes could be read.
    #[error("unexpected end of file at byte {offset}, expected {expected} more")]
    UnexpectedEof { offset: usize, expected: usize },

    /// The file declared a version outside the supported range.
    #[error("unsupported container version: {version:02x?}")]
    UnsupportedVersion { version: [u8; 4] },

    /// A bytecode operand could not be resolved through the source file's
    /// index headers.
    #[error("unresolved {kind:?} operand {index} in method at offset 0x{method_offset:x}")]
    UnresolvedReference {
        kind: RefKind,
        index: u16,
        method_offset: u32,
    },

    /// A class declares itself as its own superclass.
    #[error("class at offset 0x{offset:x} inherits from itself")]
    SelfInheritance { offset: u32 },

    /// A single method needs more distinct entities of one reference kind
    /// than fit in one index header. Fatal for the current build.
    #[error("method needs {count} {kind:?} entries, index header capacity is {capacity}")]
    CapacityExceeded {
        kind: RefKind,
        count: usize,
        capacity: usize,
    },

    /// Any other format violation detected while decoding the file.
    #[error("format error: {0}")]
    Format(String),
}

impl ContainerError {
    /// Creates a new [`ContainerError::Format`] with the provided message.
    pub fn format(message: impl Into<String>) -> Self {
        ContainerError::Format(message.into())
    }
}
