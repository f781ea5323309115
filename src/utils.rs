/// Convert a string to a null-terminated UTF-16 vector suitable for Windows API calls.
pub fn to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Read a null-terminated UTF-16 string, stopping at `max` code units.
///
/// # Safety
/// `ptr` must be null or point to readable memory up to the terminator or `max`.
pub unsafe fn from_utf16_ptr(ptr: *const u16, max: usize) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    while len < max && unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    let units = unsafe { std::slice::from_raw_parts(ptr, len) };
    Some(String::from_utf16_lossy(units))
}
