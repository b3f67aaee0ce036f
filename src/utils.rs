//! Small helpers shared across the daemon and the CLI.

use std::env;
use std::path::PathBuf;

/// `$XDG_STATE_HOME/dusk`, falling back to `~/.local/state/dusk`.
pub fn state_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join("dusk"));
    }
    let home = env::var_os("HOME").filter(|v| !v.is_empty())?;
    Some(PathBuf::from(home).join(".local/state/dusk"))
}

/// Default directory for saved screenshots.
pub fn screenshots_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_PICTURES_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join("Screenshots");
    }
    if let Some(home) = env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join("Pictures/Screenshots");
    }
    env::temp_dir()
}

/// Strips any path components, leaving the executable name.
///
/// Inhibit callers routinely pass their full argv[0].
pub fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Removes one layer of shell quoting, if present.
pub fn unshell_quote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Human-readable name for a wl_output transform value.
pub fn transform_name(transform: wayland_client::protocol::wl_output::Transform) -> &'static str {
    use wayland_client::protocol::wl_output::Transform;
    match transform {
        Transform::Normal => "normal",
        Transform::_90 => "90",
        Transform::_180 => "180",
        Transform::_270 => "270",
        Transform::Flipped => "flipped",
        Transform::Flipped90 => "flipped-90",
        Transform::Flipped180 => "flipped-180",
        Transform::Flipped270 => "flipped-270",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_paths() {
        assert_eq!(basename("/usr/bin/mpv"), "mpv");
        assert_eq!(basename("firefox"), "firefox");
        assert_eq!(basename("a/b/c"), "c");
    }

    #[test]
    fn unshell_quote_strips_matching_quotes() {
        assert_eq!(unshell_quote("'cookie'"), "cookie");
        assert_eq!(unshell_quote("\"host\""), "host");
        assert_eq!(unshell_quote("plain"), "plain");
        assert_eq!(unshell_quote("'unbalanced\""), "'unbalanced\"");
        assert_eq!(unshell_quote("'"), "'");
        assert_eq!(unshell_quote("''"), "");
        assert_eq!(unshell_quote("\"\""), "");
        assert_eq!(
            unshell_quote("'authcookie=077058d3bc81&portal=PANGP_GW_01-N&user=john.doe@example.com'"),
            "authcookie=077058d3bc81&portal=PANGP_GW_01-N&user=john.doe@example.com"
        );
    }
}
