use std::fmt;
use std::ops::{Bound, Range, RangeBounds};

/// Clip a range to the given upper-bound.
/// Return `None` if a bound cannot be expressed as a half-open `usize` range.
#[inline]
fn clip_range(r: impl RangeBounds<usize>, upper: usize) -> Option<Range<usize>> {
    let start = match r.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.checked_add(1)?,
        Bound::Unbounded => 0,
    };
    let end = match r.end_bound() {
        Bound::Included(&e) => e.checked_add(1)?,
        Bound::Excluded(&e) => e,
        Bound::Unbounded => upper,
    };

    Some(start..end)
}

/// A caller-owned span of memory, described by its base address and length.
///
/// This is only a descriptor: it never owns, frees, or dereferences the
/// memory it names. Transfers access the memory only through a registration
/// covering the region, and the caller keeps the memory alive and unaliased
/// while such transfers are outstanding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    addr: usize,
    len: usize,
}

impl MemoryRegion {
    /// Describe `len` bytes starting at `addr`.
    #[inline]
    pub fn new(addr: *mut u8, len: usize) -> Self {
        Self {
            addr: addr as usize,
            len,
        }
    }

    /// Describe the memory of a byte slice.
    #[inline]
    pub fn from_slice(buf: &mut [u8]) -> Self {
        Self::new(buf.as_mut_ptr(), buf.len())
    }

    /// Get the starting address of the memory region.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Get the length of the memory region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `other` lies entirely within this region.
    #[inline]
    pub fn contains(&self, other: &MemoryRegion) -> bool {
        let (Some(end), Some(limit)) = (
            other.addr.checked_add(other.len),
            self.addr.checked_add(self.len),
        ) else {
            return false;
        };
        other.addr >= self.addr && end <= limit
    }

    /// Get a sub-region from an offset and a length.
    /// Return `None` if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        if offset <= self.len && len <= self.len - offset {
            Some(Self {
                addr: self.addr + offset,
                len,
            })
        } else {
            None
        }
    }

    /// Get a sub-region from a range.
    /// Return `None` if the range is out of bounds.
    pub fn slice_by_range(&self, range: impl RangeBounds<usize>) -> Option<Self> {
        let r = clip_range(range, self.len)?;
        if r.start > r.end {
            return None;
        }
        self.slice(r.start, r.len())
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}
