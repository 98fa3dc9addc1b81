//! # Platform Hooks
//!
//! OS-specific helpers with portable fallbacks:
//! - page cache eviction hint after serving a record
//! - process file descriptor limit (caps the reader pool)

use std::fs::File;

/// Ask the OS to drop `[offset, offset + len)` of `file` from the page cache.
///
/// Payloads are usually read once per conversation turn; keeping them cached
/// only pins memory. Best effort: errors are ignored.
#[cfg(target_os = "linux")]
pub fn drop_page_cache(file: &File, offset: u64, len: u64) {
    use std::os::unix::io::AsRawFd;

    let (Ok(offset), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len)) else {
        return;
    };
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), offset, len, libc::POSIX_FADV_DONTNEED);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn drop_page_cache(_file: &File, _offset: u64, _len: u64) {}

/// Get system file descriptor limit
#[cfg(unix)]
pub fn fd_limit() -> u64 {
    use std::io::{BufRead, BufReader};

    // Try /proc/self/limits first (Linux)
    if let Ok(file) = File::open("/proc/self/limits") {
        let reader = BufReader::new(file);
        for line in reader.lines().map_while(Result::ok) {
            if line.starts_with("Max open files") {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 4 {
                    if let Ok(limit) = parts[3].parse::<u64>() {
                        return limit;
                    }
                }
            }
        }
    }

    // Fallback to getrlimit
    // SAFETY: rlimit is plain data and getrlimit only writes into it.
    unsafe {
        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
            return rlim.rlim_cur as u64;
        }
    }

    1024
}

#[cfg(not(unix))]
pub fn fd_limit() -> u64 {
    8192
}
