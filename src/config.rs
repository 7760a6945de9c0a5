//! In-memory representation of the placement rules.
//!
//! A rule pairs an offset interval with the page size that has to back any
//! allocation landing in it:
//!
//! ```text
//!  logical offset   0          1GB                 3GB        4GB
//!                   +-----------+-------------------+----------+
//!  brk rules        |    2MB    |    (fallback)     |   1GB    |  ...
//!                   +-----------+-------------------+----------+
//! ```
//!
//! For [`AllocKind::HeapGrowth`] the offset is measured from the start of the
//! heap. For [`AllocKind::AnonymousMapping`] it is a budget counter: the rule
//! serves mappings while the bytes it handed out stay inside its interval.

use std::fmt;
use std::ops::Range;

use crate::utils::{size_from_str, size_to_str};

/// The intercepted primitive a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// `brk`/`sbrk` heap growth.
    HeapGrowth,
    /// Private anonymous `mmap`.
    AnonymousMapping,
}

impl AllocKind {
    /// Token used in the configuration file.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocKind::HeapGrowth => "brk",
            AllocKind::AnonymousMapping => "mmap",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "brk" => Some(AllocKind::HeapGrowth),
            "mmap" => Some(AllocKind::AnonymousMapping),
            _ => None,
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page sizes a region can be backed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageSize {
    Base4K,
    Huge64K,
    Huge2M,
    Huge1G,
}

impl PageSize {
    pub const ALL: [PageSize; 4] = [
        PageSize::Base4K,
        PageSize::Huge64K,
        PageSize::Huge2M,
        PageSize::Huge1G,
    ];

    #[inline]
    pub const fn bytes(&self) -> usize {
        match self {
            PageSize::Base4K => 4 << 10,
            PageSize::Huge64K => 64 << 10,
            PageSize::Huge2M => 2 << 20,
            PageSize::Huge1G => 1 << 30,
        }
    }

    /// log2 of the page size, which is what `MAP_HUGE_SHIFT` encodes.
    #[inline]
    pub const fn shift(&self) -> u32 {
        self.bytes().trailing_zeros()
    }

    /// Whether the page size needs the HugeTLB pool.
    #[inline]
    pub const fn is_huge(&self) -> bool {
        !matches!(self, PageSize::Base4K)
    }

    pub fn from_bytes(bytes: usize) -> Option<Self> {
        PageSize::ALL.into_iter().find(|p| p.bytes() == bytes)
    }

    pub fn from_token(token: &str) -> Option<Self> {
        size_from_str(token).and_then(PageSize::from_bytes)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&size_to_str(self.bytes()))
    }
}

/// One configuration line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRule {
    pub kind: AllocKind,
    pub page_size: PageSize,
    /// Half open `[start_offset, end_offset)` interval in bytes.
    pub range: Range<usize>,
    /// Line of the configuration file the rule was read from, `0` when the
    /// rule was built programmatically.
    pub line: usize,
}

impl PlacementRule {
    pub fn new(kind: AllocKind, page_size: PageSize, range: Range<usize>) -> Self {
        Self {
            kind,
            page_size,
            range,
            line: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.end <= self.range.start
    }

    #[inline]
    pub fn overlaps(&self, other: &PlacementRule) -> bool {
        self.kind == other.kind
            && self.range.start < other.range.end
            && other.range.start < self.range.end
    }
}

/// Ordered list of rules as produced by [`crate::parser::parse`].
///
/// Equality ignores the line numbers, so a model serialized with
/// [`ConfigModel::to_csv`] and parsed again compares equal to the model it came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigModel {
    rules: Vec<PlacementRule>,
}

impl ConfigModel {
    pub const HEADER: &'static str = "type,page_size,start_offset,end_offset";

    /// Builds a model from already validated rules.
    pub(crate) fn from_rules(rules: Vec<PlacementRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PlacementRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules of `kind` sorted by ascending `start_offset`.
    pub fn rules_of(&self, kind: AllocKind) -> Vec<&PlacementRule> {
        let mut rules: Vec<&PlacementRule> =
            self.rules.iter().filter(|r| r.kind == kind).collect();
        rules.sort_by_key(|r| r.range.start);
        rules
    }

    /// Number of pages of `page_size` the rules need, i.e. what the launcher
    /// has to make available in the HugeTLB pool.
    pub fn pages_needed(&self, page_size: PageSize) -> usize {
        self.rules
            .iter()
            .filter(|r| r.page_size == page_size)
            .map(|r| r.len() / page_size.bytes())
            .sum()
    }

    /// Serializes the model back to the configuration format.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(Self::HEADER);
        out.push('\n');

        for rule in &self.rules {
            out.push_str(&format!(
                "{},{},{},{}\n",
                rule.kind,
                rule.page_size,
                size_to_str(rule.range.start),
                size_to_str(rule.range.end)
            ));
        }

        out
    }
}

impl PartialEq for ConfigModel {
    fn eq(&self, other: &Self) -> bool {
        self.rules.len() == other.rules.len()
            && self.rules.iter().zip(&other.rules).all(|(a, b)| {
                a.kind == b.kind && a.page_size == b.page_size && a.range == b.range
            })
    }
}

impl Eq for ConfigModel {}
