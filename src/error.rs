//! Error types for every layer of the shim.
//!
//! Start-up errors ([`ConfigError`], [`ReservationError`], [`SettingsError`]) are
//! fatal and surface to whoever loads the shim. [`RouteError`] is what the steady
//! state allocation path can produce; each variant carries the `errno` the
//! intercepted primitive reports to the target program.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::config::{AllocKind, PageSize};

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ReservationResult<T> = Result<T, ReservationError>;
pub type RouteResult<T> = Result<T, RouteError>;

/// The configuration text could not be turned into a valid set of rules.
///
/// Line numbers are 1-based and count the header row, so they point at the
/// exact line of the file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("line {line}: unknown region type `{token}` (expected `brk` or `mmap`)")]
    UnknownKind { line: usize, token: String },

    #[error("line {line}: unsupported page size `{token}` (expected one of 4KB, 64KB, 2MB, 1GB)")]
    UnknownPageSize { line: usize, token: String },

    #[error("line {line}: invalid offset `{token}`")]
    InvalidOffset { line: usize, token: String },

    #[error("line {line}: empty or inverted range [{start:#x}, {end:#x})")]
    EmptyOrInvertedRange { line: usize, start: usize, end: usize },

    #[error("{kind} rules on lines {first} and {second} overlap")]
    OverlappingRanges {
        kind: AllocKind,
        first: usize,
        second: usize,
    },

    #[error("missing header row `type,page_size,start_offset,end_offset`")]
    MissingHeader,

    #[error("line {line}: malformed row: {source}")]
    MalformedRow { line: usize, source: csv::Error },

    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),
}

/// A validated rule could not be backed by memory at start-up.
#[derive(Error, Debug)]
pub enum ReservationError {
    #[error(
        "rule on line {line}: {page_size} pages unavailable for {length} bytes ({free_pages} free in the pool): {source}",
        free_pages = .free_pages.map_or_else(|| "unknown".to_string(), |n| n.to_string())
    )]
    PageSizeUnavailable {
        line: usize,
        page_size: PageSize,
        length: usize,
        free_pages: Option<usize>,
        source: io::Error,
    },

    #[error("cannot reserve {length} bytes of address space: {source}")]
    AddressSpaceExhausted { length: usize, source: io::Error },

    #[error(
        "rule on line {line}: range [{start:#x}, {end:#x}) is not a non-empty multiple of its {page_size} page size"
    )]
    MisalignedRange {
        line: usize,
        page_size: PageSize,
        start: usize,
        end: usize,
    },
}

/// Failure of a single intercepted call. Never fatal to the shim, except
/// [`RouteError::Aliasing`] which signals a broken internal invariant.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    #[error("cannot shrink the heap by {requested} bytes, only {available} in use")]
    InvalidShrink { requested: usize, available: usize },

    #[error("out of memory: {0}")]
    OutOfMemory(Errno),

    #[error("address range {addr:#x}+{len:#x} is already in use")]
    AddressInUse { addr: usize, len: usize },

    #[error("extent table of region {region:#x} is full")]
    TableFull { region: usize },

    #[error("invalid argument")]
    InvalidArgument,

    #[error("aliasing detected: {addr:#x}+{len:#x} overlaps a live mapping")]
    Aliasing { addr: usize, len: usize },

    #[error("fallback allocator failed: {0}")]
    Fallback(Errno),

    #[error("system call failed: {0}")]
    Os(Errno),
}

impl RouteError {
    /// The `errno` value the replaced primitive would set for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            RouteError::InvalidShrink { .. } => Errno::ENOMEM,
            RouteError::OutOfMemory(errno)
            | RouteError::Fallback(errno)
            | RouteError::Os(errno) => *errno,
            RouteError::AddressInUse { .. } => Errno::EEXIST,
            RouteError::TableFull { .. } => Errno::ENOMEM,
            RouteError::InvalidArgument => Errno::EINVAL,
            RouteError::Aliasing { .. } => Errno::EFAULT,
        }
    }
}

/// The shim's environment settings are missing or unreadable.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value `{value}`")]
    Invalid { name: &'static str, value: String },
}

/// Everything that can stop the shim from starting.
#[derive(Error, Debug)]
pub enum ShimError {
    #[error("hpalloc settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("hpalloc configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("hpalloc reservation: {0}")]
    Reservation(#[from] ReservationError),

    #[error("hpalloc is already installed in this process")]
    AlreadyInstalled,

    #[cfg(feature = "seccomp")]
    #[error("hpalloc seccomp filter: {0}")]
    Seccomp(#[from] libseccomp::error::SeccompError),

    #[cfg(feature = "seccomp")]
    #[error("hpalloc seccomp supervisor: {0}")]
    Supervisor(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_errors_map_to_errno() {
        let shrink = RouteError::InvalidShrink {
            requested: 10,
            available: 5,
        };
        assert_eq!(shrink.errno(), Errno::ENOMEM);
        assert_eq!(
            RouteError::AddressInUse { addr: 0, len: 1 }.errno(),
            Errno::EEXIST
        );
        assert_eq!(RouteError::InvalidArgument.errno(), Errno::EINVAL);
        assert_eq!(RouteError::Fallback(Errno::EACCES).errno(), Errno::EACCES);
    }

    #[test]
    fn reservation_error_names_the_rule() {
        let err = ReservationError::PageSizeUnavailable {
            line: 3,
            page_size: PageSize::Huge2M,
            length: 4 << 20,
            free_pages: Some(1),
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 3"));
        assert!(msg.contains("2MB"));
        assert!(msg.contains("1 free"));
    }
}
