//! HugeTLB pool probing through sysfs.
//!
//! ```text
//! /sys/kernel/mm/hugepages/
//! ├── hugepages-1048576kB/{nr_hugepages,free_hugepages,...}
//! └── hugepages-2048kB/{nr_hugepages,free_hugepages,...}
//! ```
//!
//! Used to explain a failed reservation and by launchers to check the pool
//! before starting a program.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{ConfigModel, PageSize};

const SYSFS_HUGEPAGES: &str = "/sys/kernel/mm/hugepages";

/// View of a hugepages sysfs directory.
#[derive(Debug, Clone)]
pub struct HugeTlb {
    root: PathBuf,
}

/// Pages a configuration needs against what the pool has free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolShortfall {
    pub page_size: PageSize,
    pub needed: usize,
    pub free: usize,
}

impl HugeTlb {
    pub fn system() -> Self {
        Self::with_root(SYSFS_HUGEPAGES)
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn pool_dir(&self, page_size: PageSize) -> PathBuf {
        self.root
            .join(format!("hugepages-{}kB", page_size.bytes() >> 10))
    }

    fn read_counter(&self, page_size: PageSize, leaf: &str) -> io::Result<usize> {
        let raw = fs::read_to_string(self.pool_dir(page_size).join(leaf))?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Huge page sizes the kernel exposes a pool for, ascending.
    pub fn supported_sizes(&self) -> io::Result<Vec<PageSize>> {
        let mut sizes = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let kb = name
                .to_str()
                .and_then(|n| n.strip_prefix("hugepages-"))
                .and_then(|n| n.strip_suffix("kB"))
                .and_then(|n| n.parse::<usize>().ok());

            if let Some(page_size) = kb.and_then(|kb| PageSize::from_bytes(kb << 10)) {
                sizes.push(page_size);
            }
        }

        sizes.sort();
        Ok(sizes)
    }

    pub fn total_pages(&self, page_size: PageSize) -> io::Result<usize> {
        self.read_counter(page_size, "nr_hugepages")
    }

    pub fn free_pages(&self, page_size: PageSize) -> io::Result<usize> {
        self.read_counter(page_size, "free_hugepages")
    }

    /// Page sizes for which `model` needs more pages than the pool has free.
    /// A size the kernel doesn't support at all counts as zero free pages.
    pub fn shortfalls(&self, model: &ConfigModel) -> Vec<PoolShortfall> {
        PageSize::ALL
            .into_iter()
            .filter(|p| p.is_huge())
            .filter_map(|page_size| {
                let needed = model.pages_needed(page_size);
                let free = self.free_pages(page_size).unwrap_or(0);
                (needed > free).then_some(PoolShortfall {
                    page_size,
                    needed,
                    free,
                })
            })
            .collect()
    }
}
