use alloc::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `elf_dlmem` library.
///
/// Every variant except [`Error::AlreadyRelocated`] and [`Error::NotLoaded`]
/// leaves a diagnostic behind that can be fetched with
/// [`Linker::last_error`](crate::Linker::last_error).
#[derive(Debug)]
pub enum Error {
    /// A caller supplied flag, buffer or handle was rejected before any
    /// resource was allocated.
    InvalidArgument {
        /// A descriptive message about the rejected argument.
        msg: Cow<'static, str>,
    },

    /// Reserving address space or placing a segment into it failed.
    Mmap {
        /// A descriptive message about the memory mapping error.
        msg: Cow<'static, str>,
    },

    /// Changing the protection of an already mapped range failed.
    Mprotect {
        /// A descriptive message about the protection error.
        msg: Cow<'static, str>,
    },

    /// The object has already been relocated, so it can no longer be rebased.
    ///
    /// No diagnostic is recorded for this error.
    AlreadyRelocated,

    /// A lookup-only open found no matching object.
    ///
    /// No diagnostic is recorded for this error.
    NotLoaded,

    /// An error occurred while applying relocations or running initializers.
    Relocation {
        /// A descriptive message about the relocation error.
        msg: Cow<'static, str>,
    },

    /// A symbol lookup found no definition in the object.
    SymbolNotFound {
        /// The object and symbol that were looked up.
        msg: Cow<'static, str>,
    },

    /// An error occurred while parsing the dynamic section.
    ParseDynamic {
        /// A descriptive message about the dynamic section parsing error.
        msg: Cow<'static, str>,
    },

    /// An error occurred while parsing the ELF header.
    ParseEhdr {
        /// A descriptive message about the ELF header parsing error.
        msg: Cow<'static, str>,
    },

    /// An error occurred while parsing program headers.
    ParsePhdr {
        /// A descriptive message about the program header parsing error.
        msg: Cow<'static, str>,
    },

    /// An error occurred in a user-defined callback or handler.
    Custom {
        /// A descriptive message about the custom error.
        msg: Cow<'static, str>,
    },
}

impl Error {
    /// Whether a failure of this kind is recorded as the last diagnostic.
    #[inline]
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::AlreadyRelocated | Error::NotLoaded)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidArgument { msg } => write!(f, "Invalid argument: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
            Error::Mprotect { msg } => write!(f, "Memory protection error: {msg}"),
            Error::AlreadyRelocated => write!(f, "object already relocated"),
            Error::NotLoaded => write!(f, "object not loaded"),
            Error::Relocation { msg } => write!(f, "Relocation error: {msg}"),
            Error::SymbolNotFound { msg } => write!(f, "Symbol lookup error: {msg}"),
            Error::ParseDynamic { msg } => write!(f, "Dynamic section parsing error: {msg}"),
            Error::ParseEhdr { msg } => write!(f, "ELF header parsing error: {msg}"),
            Error::ParsePhdr { msg } => write!(f, "Program header parsing error: {msg}"),
            Error::Custom { msg } => write!(f, "Custom error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an invalid-argument error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn invalid_argument(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidArgument { msg: msg.into() }
}

/// Creates a memory mapping error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn mmap_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

/// Creates a protection change error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn mprotect_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mprotect { msg: msg.into() }
}

/// Creates a relocation error with the specified message.
///
/// This is a convenience function for creating `Error::Relocation` variants.
///
/// # Arguments
/// * `msg` - The error message.
///
/// # Returns
/// An `Error::Relocation` variant with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Relocation { msg: msg.into() }
}

/// Creates a symbol lookup error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn symbol_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::SymbolNotFound { msg: msg.into() }
}

/// Creates a dynamic section parsing error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn parse_dynamic_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseDynamic { msg: msg.into() }
}

/// Creates an ELF header parsing error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn parse_ehdr_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseEhdr { msg: msg.into() }
}

/// Creates a program header parsing error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn parse_phdr_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParsePhdr { msg: msg.into() }
}

/// Creates a custom error with the specified message.
///
/// Callbacks such as the symbol resolver can use this to report their own
/// failures through the loader.
#[cold]
#[inline(never)]
pub fn custom_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Custom { msg: msg.into() }
}

/// A type alias for `Result`s returned by `elf_dlmem` functions.
pub type Result<T> = core::result::Result<T, Error>;
