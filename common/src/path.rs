//! Path conventions.
//!
//! Database entries and CLI arguments carry paths as strings, so the crate
//! needs a few string-level rules: one canonical separator, no redundant
//! separator runs, and a way to tell local paths from `host:path` remote
//! syntax (which this tool recognizes only to reject — remote transport is
//! a different layer).

/// Converts foreign separators to this platform's separator. Idempotent.
pub fn normalize_separators(path: &str) -> String {
    let (foreign, native) = if std::path::MAIN_SEPARATOR == '/' {
        ('\\', '/')
    } else {
        ('/', '\\')
    };
    path.replace(foreign, &native.to_string())
}

/// Index at which separator cleanup should start: past a `//` network-root
/// prefix or a `X:` drive prefix, so those keep their shape.
pub fn default_cleanup_start(path: &str) -> usize {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'/' || bytes[0] == b'\\') && bytes[1] == bytes[0] {
        return 2;
    }
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return 2;
    }
    0
}

/// Collapses runs of separators into one, starting at byte index `start`.
/// Everything before `start` is preserved verbatim.
pub fn cleaned_path(path: &str, start: usize) -> String {
    let mut start = start.min(path.len());
    while !path.is_char_boundary(start) {
        start -= 1;
    }
    let mut result = String::with_capacity(path.len());
    result.push_str(&path[..start]);
    let mut previous_was_separator = false;
    for c in path[start..].chars() {
        let is_separator = c == '/' || c == '\\';
        if is_separator && previous_was_separator {
            continue;
        }
        previous_was_separator = is_separator;
        result.push(c);
    }
    result
}

/// True for rooted paths: `/...`, a drive prefix `X:...`, or a `//` root.
pub fn is_absolute_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.first() == Some(&b'/') || bytes.first() == Some(&b'\\') {
        return true;
    }
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// False when the path uses `[user@]host:path` remote syntax. A single
/// alphabetic character before the colon reads as a drive prefix, not a
/// host.
pub fn is_local_path(path: &str) -> bool {
    lazy_static! {
        static ref REMOTE: regex::Regex = regex::Regex::new(
            r"^(?:(?P<user>[^@/]+)@)?(?P<host>\[[^\]]+\]|[^:/\[\]]{2,}):(?P<path>.*)$"
        )
        .expect("remote path pattern");
    }
    !REMOTE.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_normalization_is_idempotent() {
        let once = normalize_separators(r"a\b/c\d");
        let twice = normalize_separators(&once);
        assert_eq!(once, twice);
        if std::path::MAIN_SEPARATOR == '/' {
            assert_eq!(once, "a/b/c/d");
        }
    }

    #[test]
    fn cleanup_collapses_runs_after_start() {
        assert_eq!(cleaned_path("a//b///c", 0), "a/b/c");
        assert_eq!(cleaned_path("//server//share//x", 2), "//server/share/x");
        assert_eq!(cleaned_path("abc", 10), "abc");
        assert_eq!(cleaned_path(r"a\\b", 0), r"a\b");
    }

    #[test]
    fn cleanup_start_skips_roots() {
        assert_eq!(default_cleanup_start("//server/share"), 2);
        assert_eq!(default_cleanup_start("C:/tmp"), 2);
        assert_eq!(default_cleanup_start("/usr/bin"), 0);
        assert_eq!(default_cleanup_start("rel/path"), 0);
    }

    #[test]
    fn absolute_path_detection() {
        assert!(is_absolute_path("/usr/bin"));
        assert!(is_absolute_path("//server/share"));
        assert!(is_absolute_path("C:/tmp"));
        assert!(is_absolute_path(r"\\server\share"));
        assert!(!is_absolute_path("relative/path"));
        assert!(!is_absolute_path(""));
    }

    #[test]
    fn local_path_detection() {
        assert!(is_local_path("/usr/bin"));
        assert!(is_local_path("relative/path"));
        assert!(is_local_path("C:/tmp"));
        assert!(!is_local_path("host:/path/to/file"));
        assert!(!is_local_path("user@host:/path"));
        assert!(!is_local_path("[2001:db8::1]:/path"));
    }
}
