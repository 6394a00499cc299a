//! Grab-bag helpers with no better home.

/// Replace a leading `~` with the value of `$HOME`.
///
/// Only the bare `~` and `~/...` forms are expanded. `~user` and tildes
/// anywhere else in the path pass through untouched, as does everything
/// when `$HOME` is unset.
pub fn expand_tilde(path: &str) -> String {
    let Some(rest) = path.strip_prefix('~') else {
        return path.to_string();
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return path.to_string();
    }
    match std::env::var("HOME") {
        Ok(home) => format!("{home}{rest}"),
        Err(_) => path.to_string(),
    }
}

/// Milliseconds since the Unix epoch; 0 if the clock reads before 1970.
pub fn now_ms() -> u64 {
    std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}

/// Squash a string onto one line and cap it at `max` characters, for log
/// output. Runs of whitespace (including newlines) become single spaces;
/// anything cut is replaced by a `...` tail.
pub fn truncate_str(s: &str, max: usize) -> String {
    let mut flat = String::with_capacity(s.len().min(max + 3));
    for word in s.split_whitespace() {
        if !flat.is_empty() {
            flat.push(' ');
        }
        flat.push_str(word);
    }
    if flat.chars().count() <= max {
        return flat;
    }
    let mut capped: String = flat.chars().take(max.saturating_sub(3)).collect();
    capped.push_str("...");
    capped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expansion() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_tilde("~"), "/home/tester");
        assert_eq!(expand_tilde("~/x"), "/home/tester/x");
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert_eq!(expand_tilde("~other/x"), "~other/x");
        assert_eq!(expand_tilde("rel/~x"), "rel/~x");
    }

    #[test]
    fn truncation_collapses_whitespace() {
        assert_eq!(truncate_str("a  b\nc", 10), "a b c");
        assert_eq!(truncate_str("abcdefghij", 5), "ab...");
        assert_eq!(truncate_str("", 5), "");
    }

    #[test]
    fn now_ms_is_past_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
