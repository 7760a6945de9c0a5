//! Transient descriptions of intercepted calls.

use bitflags::bitflags;
use libc::c_int;

use crate::config::AllocKind;

bitflags! {
    /// The `mmap` flags the router cares about, plus whether the call was
    /// file backed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const PRIVATE = 1 << 0;
        const SHARED = 1 << 1;
        const FIXED = 1 << 2;
        const FIXED_NOREPLACE = 1 << 3;
        const HUGETLB = 1 << 4;
        const GROWSDOWN = 1 << 5;
        const STACK = 1 << 6;
        const NORESERVE = 1 << 7;
        const FILE = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RemapFlags: u32 {
        const MAYMOVE = 1 << 0;
        const FIXED = 1 << 1;
        const DONTUNMAP = 1 << 2;
    }
}

impl MapFlags {
    /// Flags that can never be served from a private huge page region.
    pub const INCOMPATIBLE: MapFlags = MapFlags::SHARED
        .union(MapFlags::HUGETLB)
        .union(MapFlags::GROWSDOWN)
        .union(MapFlags::STACK)
        .union(MapFlags::FILE);

    /// Decodes raw `mmap(2)` flags. `fd != -1` without `MAP_ANONYMOUS` marks
    /// the request as file backed.
    pub fn from_raw(flags: c_int, fd: c_int) -> Self {
        let mut out = MapFlags::empty();

        let table = [
            (libc::MAP_PRIVATE, MapFlags::PRIVATE),
            (libc::MAP_SHARED, MapFlags::SHARED),
            (libc::MAP_FIXED, MapFlags::FIXED),
            (libc::MAP_FIXED_NOREPLACE, MapFlags::FIXED_NOREPLACE),
            (libc::MAP_HUGETLB, MapFlags::HUGETLB),
            (libc::MAP_GROWSDOWN, MapFlags::GROWSDOWN),
            (libc::MAP_STACK, MapFlags::STACK),
            (libc::MAP_NORESERVE, MapFlags::NORESERVE),
        ];
        for (raw, flag) in table {
            if flags & raw == raw {
                out |= flag;
            }
        }

        // MAP_SHARED_VALIDATE is MAP_SHARED | MAP_PRIVATE.
        if flags & libc::MAP_SHARED_VALIDATE == libc::MAP_SHARED_VALIDATE {
            out.remove(MapFlags::PRIVATE);
            out |= MapFlags::SHARED;
        }

        if flags & libc::MAP_ANONYMOUS == 0 || fd != -1 {
            out |= MapFlags::FILE;
        }

        out
    }

    /// Whether the caller insists on a specific address.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.intersects(MapFlags::FIXED | MapFlags::FIXED_NOREPLACE)
    }
}

impl RemapFlags {
    pub fn from_raw(flags: c_int) -> Self {
        let mut out = RemapFlags::empty();
        if flags & libc::MREMAP_MAYMOVE != 0 {
            out |= RemapFlags::MAYMOVE;
        }
        if flags & libc::MREMAP_FIXED != 0 {
            out |= RemapFlags::FIXED;
        }
        if flags & libc::MREMAP_DONTUNMAP != 0 {
            out |= RemapFlags::DONTUNMAP;
        }
        out
    }
}

/// One intercepted allocation. Built by the interception layer, consumed by
/// the router, never stored.
///
/// For [`AllocKind::HeapGrowth`] `size` is the growth delta. The raw `prot`,
/// `fd` and `offset` are kept so a delegated mapping reaches the fallback
/// exactly as the program issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub kind: AllocKind,
    pub size: usize,
    pub hint_address: Option<usize>,
    pub flags: MapFlags,
    pub raw_flags: c_int,
    pub prot: c_int,
    pub fd: c_int,
    pub offset: i64,
}

impl AllocationRequest {
    /// A plain `mmap(NULL, size, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0)`.
    pub fn anonymous(size: usize) -> Self {
        Self::from_mmap(
            0,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    }

    pub fn heap_growth(delta: usize) -> Self {
        Self {
            kind: AllocKind::HeapGrowth,
            size: delta,
            hint_address: None,
            flags: MapFlags::PRIVATE,
            raw_flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            prot: libc::PROT_READ | libc::PROT_WRITE,
            fd: -1,
            offset: 0,
        }
    }

    /// Describes an `mmap(2)` call.
    pub fn from_mmap(
        addr: usize,
        len: usize,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: i64,
    ) -> Self {
        Self {
            kind: AllocKind::AnonymousMapping,
            size: len,
            hint_address: (addr != 0).then_some(addr),
            flags: MapFlags::from_raw(flags, fd),
            raw_flags: flags,
            prot,
            fd,
            offset,
        }
    }

    /// `MAP_FIXED_NOREPLACE` at `addr`: fails if anything is mapped there.
    pub fn with_fixed_address(mut self, addr: usize) -> Self {
        self.hint_address = Some(addr);
        self.flags |= MapFlags::FIXED_NOREPLACE;
        self.raw_flags |= libc::MAP_FIXED_NOREPLACE;
        self
    }

    /// `MAP_FIXED` at `addr`: whatever is mapped there is replaced.
    pub fn with_fixed_replace(mut self, addr: usize) -> Self {
        self.hint_address = Some(addr);
        self.flags |= MapFlags::FIXED;
        self.raw_flags |= libc::MAP_FIXED;
        self
    }
}
