//! Table name validation.
//!
//! Table names become directory names, so anything path-hostile is
//! rejected before it can touch the filesystem.

use crate::error::{EngineError, EngineResult};

const FORBIDDEN: &[char] = &[
    '/', '\\', ':', '*', '?', '"', '\'', '<', '>', '|', '%', '~', '+', '(', ')', ',',
];

/// Checks a table name for use as a directory name. Dots are allowed in the
/// middle of a name but not at either end, and never doubled.
pub fn check_table_name(name: &str, max_len: usize) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::non_critical("invalid table name: empty"));
    }
    if name.len() > max_len {
        return Err(EngineError::NonCritical(format!(
            "invalid table name: longer than {} bytes [name={}]",
            max_len, name
        )));
    }

    let mut prev_dot = false;
    let last = name.chars().count() - 1;
    for (i, c) in name.chars().enumerate() {
        if c.is_control() || FORBIDDEN.contains(&c) {
            return Err(EngineError::NonCritical(format!(
                "invalid table name: illegal character {:?} [name={}]",
                c, name
            )));
        }
        if c == '.' {
            if i == 0 || i == last || prev_dot {
                return Err(EngineError::NonCritical(format!(
                    "invalid table name: misplaced dot [name={}]",
                    name
                )));
            }
            prev_dot = true;
        } else {
            prev_dot = false;
        }
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err(EngineError::NonCritical(format!(
            "invalid table name: leading or trailing space [name={}]",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        for name in ["plug", "cpu_metrics", "Trades2024", "a.b.c", "x"] {
            assert!(check_table_name(name, 127).is_ok(), "rejected {:?}", name);
        }
    }

    #[test]
    fn test_rejects_path_hostile_names() {
        for name in [
            "", ".", "..", ".hidden", "trailing.", "a..b", "a/b", "a\\b", "a:b", "a*b", "a?b",
            " padded", "padded ", "nul\u{0}name",
        ] {
            assert!(check_table_name(name, 127).is_err(), "accepted {:?}", name);
        }
    }

    #[test]
    fn test_rejects_over_long_name() {
        let name = "t".repeat(128);
        assert!(check_table_name(&name, 127).is_err());
        assert!(check_table_name(&name[..127], 127).is_ok());
    }
}
