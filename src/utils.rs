//! Utility helpers for page size, alignment and range resolution.

use std::ops::{Bound, Range, RangeBounds};

use crate::errors::{MmapBufferError, Result};

/// Get the system page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "windows")] {
            windows_page_size()
        } else {
            unix_page_size()
        }
    }
}

#[cfg(target_os = "windows")]
fn windows_page_size() -> usize {
    use std::mem::MaybeUninit;
    #[allow(non_snake_case)]
    #[repr(C)]
    struct SYSTEM_INFO {
        wProcessorArchitecture: u16,
        wReserved: u16,
        dwPageSize: u32,
        lpMinimumApplicationAddress: *mut core::ffi::c_void,
        lpMaximumApplicationAddress: *mut core::ffi::c_void,
        dwActiveProcessorMask: usize,
        dwNumberOfProcessors: u32,
        dwProcessorType: u32,
        dwAllocationGranularity: u32,
        wProcessorLevel: u16,
        wProcessorRevision: u16,
    }
    extern "system" {
        fn GetSystemInfo(lpSystemInfo: *mut SYSTEM_INFO);
    }
    let mut sysinfo = MaybeUninit::<SYSTEM_INFO>::uninit();
    unsafe {
        GetSystemInfo(sysinfo.as_mut_ptr());
        let s = sysinfo.assume_init();
        s.dwPageSize as usize
    }
}

#[cfg(not(target_os = "windows"))]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unix_page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE is safe to call.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        4096
    } else {
        page_size as usize
    }
}

/// Align a value up to the nearest multiple of `alignment`, or `None` on overflow.
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    if alignment == 0 {
        return Some(value);
    }
    if alignment.is_power_of_two() {
        let mask = alignment - 1;
        value.checked_add(mask).map(|v| v & !mask)
    } else {
        value.div_ceil(alignment).checked_mul(alignment)
    }
}

/// Page-aligned mapping size for `capacity` elements of `stride` bytes.
///
/// A capacity of zero still yields one page; callers that want no mapping
/// at all must not ask for one.
///
/// # Errors
///
/// Returns `MmapBufferError::CapacityOverflow` if the size does not fit in
/// `isize` once rounded to a page.
pub fn mapped_bytes_for(capacity: usize, stride: usize) -> Result<usize> {
    let overflow = || MmapBufferError::CapacityOverflow { capacity, stride };
    let raw = capacity.max(1).checked_mul(stride).ok_or_else(overflow)?;
    let aligned = align_up(raw, page_size()).ok_or_else(overflow)?;
    if aligned > isize::MAX as usize {
        return Err(overflow());
    }
    Ok(aligned)
}

/// Growth target when `required` elements must fit into a region that
/// currently holds `capacity`: at least double, never less than required.
#[must_use]
pub fn grown_capacity(capacity: usize, required: usize) -> usize {
    required.max(capacity.saturating_mul(2))
}

/// Element count after replacing `removed` of `len` elements with `inserted`.
///
/// # Errors
///
/// Returns `MmapBufferError::CapacityOverflow` if the count does not fit in
/// `usize`.
pub fn replaced_len(len: usize, removed: usize, inserted: usize, stride: usize) -> Result<usize> {
    len.checked_sub(removed)
        .and_then(|kept| kept.checked_add(inserted))
        .ok_or(MmapBufferError::CapacityOverflow {
            capacity: usize::MAX,
            stride,
        })
}

/// Resolve any range expression against a sequence of length `len`.
///
/// # Panics
///
/// Panics if the range is inverted or extends past `len`.
#[track_caller]
pub fn resolve_range<R: RangeBounds<usize>>(range: R, len: usize) -> Range<usize> {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.checked_add(1).expect("range start overflow"),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e.checked_add(1).expect("range end overflow"),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    };
    assert!(start <= end, "range start {start} is greater than end {end}");
    assert!(end <= len, "range end {end} out of range for length {len}");
    start..end
}
