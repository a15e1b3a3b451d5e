//! Platform helpers.

use nix::time::{clock_gettime, ClockId};

/// Maximum length of a process name on Linux, excluding the trailing NUL byte.
#[cfg(target_os = "linux")]
const MAX_PROCESS_NAME_LEN: usize = 15;

/// Returns the current reading of the monotonic clock, in nanoseconds.
///
/// The monotonic clock is system-wide, so readings taken in a worker can be compared against readings taken in the
/// master to judge how stale a heartbeat is, regardless of wall-clock adjustments.
pub fn monotonic_time_nanos() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64).saturating_mul(1_000_000_000) + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Sets the name of the current process, as shown by tools such as `ps` and `top`.
///
/// This is best-effort: the name is truncated to what the platform allows, and platforms without support are ignored.
/// Returns `true` if the name was set.
pub fn set_process_title(title: &str) -> bool {
    set_process_title_inner(title)
}

#[cfg(target_os = "linux")]
fn set_process_title_inner(title: &str) -> bool {
    use std::ffi::CString;

    let mut end = title.len().min(MAX_PROCESS_NAME_LEN);
    while !title.is_char_boundary(end) {
        end -= 1;
    }

    let Ok(name) = CString::new(&title[..end]) else {
        return false;
    };

    // SAFETY: `name` is a valid NUL-terminated string that outlives the call, which is all `PR_SET_NAME` requires.
    unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) == 0 }
}

#[cfg(not(target_os = "linux"))]
fn set_process_title_inner(_title: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let first = monotonic_time_nanos();
        let second = monotonic_time_nanos();
        assert!(first > 0);
        assert!(second >= first);
    }

    #[test]
    fn process_title_rejects_interior_nul() {
        assert!(!set_process_title("bad\0title"));
    }
}
