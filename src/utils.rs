//! Small helpers shared across the crate.

use std::ffi::OsString;

use rand::RngCore;

/// Default chunk size for bulk file copies and zeroing loops.
///
/// One mebibyte balances syscall overhead against cache pollution on the
/// storage devices this crate targets.
pub fn file_buffer_default_size() -> usize {
    1024 * 1024
}

/// Rounds `size` up to the next multiple of the system page size.
pub fn round_up_to_page_size(size: u64) -> u64 {
    let page = page_size::get() as u64;
    (size + page - 1) & !(page - 1)
}

/// Returns a random leafname of 32 hex characters.
///
/// Used wherever an entry must be renamed or created under a name no
/// concurrent user will guess: unlink emulation, parking unremoveable
/// entries during tree removal, and the `AlwaysNew` directory swap.
pub(crate) fn random_leafname() -> OsString {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut name = String::with_capacity(32);
    for b in bytes {
        name.push_str(&format!("{b:02x}"));
    }
    OsString::from(name)
}

/// True if every byte of `buf` is zero.
///
/// The sparse copy engine uses this on aligned sub-blocks to decide which
/// writes can be elided to preserve holes.
pub(crate) fn is_all_zero(buf: &[u8]) -> bool {
    // Word-at-a-time via the slice comparison fast path.
    const ZEROES: [u8; 1024] = [0u8; 1024];
    let mut chunks = buf.chunks_exact(ZEROES.len());
    if !chunks.all(|c| c == ZEROES) {
        return false;
    }
    chunks.remainder().iter().all(|&b| b == 0)
}
