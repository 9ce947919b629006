//! Container log access.
//!
//! Detached containers write stdout and stderr to
//! `{root}/container/{name}/container.log`; interactive containers write
//! to the terminal and leave no log.

use capsule_common::config::Layout;
use capsule_common::error::{CapsuleError, Result};

/// Reads the whole log of `name`.
///
/// Returns an empty string if the container never wrote a log.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(layout: &Layout, name: &str) -> Result<String> {
    let path = layout.log_path(name);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CapsuleError::io(path, e)),
    }
}

/// Returns the last `count` lines of `content`, keeping line endings.
#[must_use]
pub fn tail(content: &str, count: usize) -> &str {
    if count == 0 {
        return "";
    }
    let trimmed = content.strip_suffix('\n').unwrap_or(content);
    match trimmed.rmatch_indices('\n').nth(count - 1) {
        Some((index, _)) => &content[index + 1..],
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        assert!(read_logs(&layout, "never-ran").expect("read").is_empty());
    }

    #[test]
    fn log_is_read_per_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        for (name, line) in [("a", "from a\n"), ("b", "from b\n")] {
            std::fs::create_dir_all(layout.container_dir(name)).expect("mkdir");
            std::fs::write(layout.log_path(name), line).expect("write");
        }
        assert_eq!(read_logs(&layout, "a").expect("a"), "from a\n");
        assert_eq!(read_logs(&layout, "b").expect("b"), "from b\n");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.container_dir("bin")).expect("mkdir");
        std::fs::write(layout.log_path("bin"), b"ok \xff\n").expect("write");
        assert_eq!(read_logs(&layout, "bin").expect("read"), "ok \u{fffd}\n");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let log = "one\ntwo\nthree\n";
        assert_eq!(tail(log, 2), "two\nthree\n");
        assert_eq!(tail(log, 3), log);
        assert_eq!(tail(log, 10), log);
        assert_eq!(tail(log, 0), "");
        assert_eq!(tail("a\nb", 1), "b");
    }
}
