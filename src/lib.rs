//! Huge page placement for unmodified programs.
//!
//! `hpalloc` sits between a program and the kernel's memory primitives and
//! routes heap growth (`brk`/`sbrk`) and private anonymous mappings (`mmap`)
//! to regions backed by the page size a rule table asks for:
//!
//! ```text
//! type,page_size,start_offset,end_offset
//! brk,2MB,0,1GB
//! mmap,1GB,0,4GB
//! mmap,2MB,5GB,6GB
//! ```
//!
//! Process layout with the shim loaded:
//!
//! ```text
//! +-------------------------+
//! |          Stack          |
//! +-------------------------+
//! |                         |
//! |   mmap regions          |  -> one per `mmap` rule, reserved at start-up
//! |                         |
//! +-------------------------+
//! |                         |
//! |   Heap arena            |  -> `brk` rules at their offsets, fallback
//! |                         |     pages in between and above
//! +-------------------------+
//! |   Program break (real)  |
//! +-------------------------+
//! ```
//!
//! Start-up goes [`parser`] → [`reserve`] → [`router`]; [`context`] ties them
//! together and [`intercept`] adapts the router to the C primitives. With the
//! `preload` feature the `cdylib` exports those primitives itself; with
//! `seccomp` it can also take over the system calls behind them.

pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod heap;
pub mod hugetlb;
pub mod intercept;
pub mod kernel;
pub mod parser;
pub mod region;
pub mod request;
pub mod reserve;
pub mod router;
pub mod settings;
pub mod utils;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

mod extents;

#[cfg(feature = "preload")]
mod preload;

#[cfg(feature = "seccomp")]
mod seccomp;

pub use config::{AllocKind, ConfigModel, PageSize, PlacementRule};
pub use context::{ShimContext, bootstrap, bootstrap_with};
pub use error::{ConfigError, ReservationError, RouteError, SettingsError, ShimError};
pub use fallback::{FallbackAllocator, SystemFallback};
pub use intercept::Interceptor;
pub use kernel::{Kernel, PlatformMemory};
pub use request::{AllocationRequest, MapFlags, RemapFlags};
pub use reserve::{ReserveOptions, RoutingTable, reserve};
pub use router::{FallbackReason, PolicyEvent, Router, RouterStats};
pub use settings::{HeapSpill, HookMode, ShimSettings, UnavailablePolicy};
