//! Process memory querying.
//!
//! Workers report their resident set size (RSS) to the master with every heartbeat, and memory-based reload strategies
//! compare it against a limit. On Linux, the RSS is read from `/proc/<pid>/statm`, which is cheap to read and accurate
//! enough for both purposes. Other platforms report no value.

/// A source of resident memory readings.
pub trait MemoryProbe {
    /// Returns the resident set size of the current process, in bytes, if it can be determined.
    fn resident_set_size(&mut self) -> Option<u64>;
}

impl<F> MemoryProbe for F
where
    F: FnMut() -> Option<u64>,
{
    fn resident_set_size(&mut self) -> Option<u64> {
        self()
    }
}

/// A memory probe for a process.
pub struct Querier {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    page_size: u64,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pid: Option<u32>,
}

impl Querier {
    /// Creates a new `Querier` for the current process.
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
            pid: None,
        }
    }

    /// Creates a new `Querier` for the given process.
    pub fn for_process(pid: u32) -> Self {
        Self {
            page_size: page_size(),
            pid: Some(pid),
        }
    }
}

impl Default for Querier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for Querier {
    #[cfg(target_os = "linux")]
    fn resident_set_size(&mut self) -> Option<u64> {
        use std::{fs::File, io::Read as _};

        // statm is a single line of seven space-delimited page counts, which comfortably fits in a small stack buffer.
        let mut buf = [0u8; 256];
        let mut file = match self.pid {
            Some(pid) => File::open(format!("/proc/{}/statm", pid)),
            None => File::open("/proc/self/statm"),
        }
        .ok()?;
        let n = file.read(&mut buf).ok()?;
        if n == 0 || n == buf.len() {
            return None;
        }

        parse_statm_rss_pages(&buf[..n]).map(|pages| pages.saturating_mul(self.page_size))
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_set_size(&mut self) -> Option<u64> {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_statm_rss_pages(raw: &[u8]) -> Option<u64> {
    // Resident set size is the second field.
    let field = raw.split(|b| *b == b' ').nth(1)?;
    std::str::from_utf8(field).ok()?.trim().parse::<u64>().ok()
}

fn page_size() -> u64 {
    // SAFETY: `sysconf` has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        0
    } else {
        page_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_second_statm_field() {
        assert_eq!(parse_statm_rss_pages(b"10546 2598 1825 1 0 1003 0\n"), Some(2598));
        assert_eq!(parse_statm_rss_pages(b"10546"), None);
        assert_eq!(parse_statm_rss_pages(b"10546 abc 1825"), None);
    }

    #[test]
    fn closures_are_probes() {
        let mut readings = vec![Some(30u64), None, Some(10)];
        let mut probe = move || readings.pop().flatten();
        assert_eq!(probe.resident_set_size(), Some(10));
        assert_eq!(probe.resident_set_size(), None);
        assert_eq!(probe.resident_set_size(), Some(30));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_process_has_resident_memory() {
        let mut querier = Querier::new();
        assert!(querier.resident_set_size().unwrap_or(0) > 0);

        let mut querier = Querier::for_process(std::process::id());
        assert!(querier.resident_set_size().unwrap_or(0) > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_process_has_no_reading() {
        let mut querier = Querier::for_process(u32::MAX);
        assert_eq!(querier.resident_set_size(), None);
    }
}
