//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expand a leading `~` to `$HOME`. Other paths pass through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    let Some(rest) = path.strip_prefix('~') else {
        return Cow::Borrowed(path);
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return Cow::Borrowed(path);
    }
    match std::env::var("HOME") {
        Ok(home) => Cow::Owned(format!("{home}{rest}")),
        Err(_) => Cow::Borrowed(path),
    }
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// First eight characters of an id, for log lines.
pub fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_other_paths() {
        assert_eq!(expand_tilde("/srv/data"), "/srv/data");
        assert_eq!(expand_tilde("~user/x"), "~user/x");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
