//! This file contains all the helper functions for the shim.
//! Alignment arithmetic and the size notation used by rule tables.

/// Rounds `to_be_aligned` up to the next multiple of `alignment`.
///
/// This is used to align region lengths and arena bases to a page size. `alignment`
/// has to be a power of two since every page size we support is one.
#[inline]
pub const fn align_up(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Rounds `to_be_aligned` down to the previous multiple of `alignment`.
#[inline]
pub const fn align_down(to_be_aligned: usize, alignment: usize) -> usize {
    to_be_aligned & !(alignment - 1)
}

#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Parses a human readable size such as `64KB`, `2mb`, `5GB` or a plain byte count.
///
/// Returns `None` for anything that is not a non-negative integer followed by an
/// optional `B`, `KB`, `MB`, `GB` or `TB` suffix, or that overflows `usize`.
pub fn size_from_str(s: &str) -> Option<usize> {
    let s = s.trim();
    let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits == 0 {
        return None;
    }

    let value: usize = s[..digits].parse().ok()?;
    let shift = match s[digits..].trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" => 10,
        "M" | "MB" => 20,
        "G" | "GB" => 30,
        "T" | "TB" => 40,
        _ => return None,
    };

    value.checked_mul(1usize << shift)
}

/// Formats `size` with the largest unit that divides it exactly, so that
/// `size_from_str(&size_to_str(n)) == Some(n)` always holds.
pub fn size_to_str(size: usize) -> String {
    const UNITS: [(u32, &str); 4] = [(40, "TB"), (30, "GB"), (20, "MB"), (10, "KB")];

    if size == 0 {
        return "0".to_string();
    }

    for (shift, unit) in UNITS {
        if is_aligned(size, 1 << shift) {
            return format!("{}{}", size >> shift, unit);
        }
    }

    format!("{}B", size)
}
