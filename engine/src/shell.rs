//! Shell-safety validation and escaping
//!
//! Every user-controlled string that is ever interpolated into a remote
//! shell command (database names, filenames, storage paths, proxy config
//! filenames) must pass validation here before interpolation. Escaping is
//! applied on top of validation, never instead of it: reject first, then
//! still escape.

use crate::errors::EngineError;

/// Prefix required for temporary file paths the engine writes on a server.
const SAFE_TMP_PREFIX: &str = "/tmp/";

/// Returns true if the value contains any shell metacharacter that could
/// break out of a command: command substitution, backticks, separators,
/// redirects, newlines or null bytes.
pub fn contains_shell_metacharacters(value: &str) -> bool {
    if value.contains("$(") || value.contains('`') {
        return true;
    }
    value
        .chars()
        .any(|c| matches!(c, ';' | '|' | '&' | '>' | '<' | '\n' | '\r' | '\0'))
}

/// Validate a user-controlled path or name before it may be interpolated
/// into a shell command. Rejects shell metacharacters outright and then
/// only accepts a conservative allow-list: letters, digits, `/`, `.`, `_`,
/// `-` and spaces.
pub fn validate_shell_safe_path(value: &str, field_label: &str) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(EngineError::validation(field_label, "value must not be empty"));
    }

    if contains_shell_metacharacters(value) {
        return Err(EngineError::validation(
            field_label,
            "value contains forbidden shell characters",
        ));
    }

    let allowed = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ' '));
    if !allowed {
        return Err(EngineError::validation(
            field_label,
            "value contains characters outside the allowed set",
        ));
    }

    Ok(())
}

/// Returns true if the value is a safe temp-file path: anchored under the
/// fixed safe prefix, no `..` segment (including percent-encoded `%2e%2e`),
/// no null byte, and nonzero content after the prefix.
pub fn is_safe_tmp_path(path: &str) -> bool {
    if !path.starts_with(SAFE_TMP_PREFIX) || path.len() <= SAFE_TMP_PREFIX.len() {
        return false;
    }
    if path.contains('\0') {
        return false;
    }
    // Fold percent-encoded dots before the traversal check so that
    // `%2e%2e`, `.%2e` and `%2e.` are all caught.
    let decoded = path.to_ascii_lowercase().replace("%2e", ".");
    !decoded.contains("..")
}

/// POSIX single-quote escaping: the value is wrapped in single quotes and
/// every embedded single quote closes the string, inserts an escaped quote
/// and reopens it (`it's` becomes `'it'\''s'`).
pub fn escape_shell_argument(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_injection_attempts() {
        let cases = [
            "test$(whoami)",
            "test; rm -rf /",
            "test | cat /etc/passwd",
            "test`whoami`",
            "test & whoami",
            "test > /tmp/x",
            "test < /etc/passwd",
            "test\nwhoami",
            "test\0null",
        ];
        for case in cases {
            assert!(
                validate_shell_safe_path(case, "test").is_err(),
                "expected rejection for {case:?}"
            );
        }
    }

    #[test]
    fn test_accepts_plain_values() {
        let cases = ["postgres", "my_database", "db-prod", "/var/www/app", "/tmp/uploads"];
        for case in cases {
            assert!(
                validate_shell_safe_path(case, "test").is_ok(),
                "expected acceptance for {case:?}"
            );
        }
    }

    #[test]
    fn test_rejects_empty_value() {
        assert!(validate_shell_safe_path("", "test").is_err());
    }

    #[test]
    fn test_safe_tmp_path() {
        assert!(is_safe_tmp_path("/tmp/x"));
        assert!(is_safe_tmp_path("/tmp/very/deeply/nested/path/to/file.sql"));

        assert!(!is_safe_tmp_path("/tmp/../etc/passwd"));
        assert!(!is_safe_tmp_path("/tmp/%2e%2e/etc/passwd"));
        assert!(!is_safe_tmp_path("/tmp/%2E%2E/etc/passwd"));
        assert!(!is_safe_tmp_path("/tmp/a\0b"));
        assert!(!is_safe_tmp_path("/tmp"));
        assert!(!is_safe_tmp_path("/tmp/"));
        assert!(!is_safe_tmp_path(""));
        assert!(!is_safe_tmp_path("/var/tmp/x"));
    }

    #[test]
    fn test_escape_shell_argument() {
        assert_eq!(escape_shell_argument("test'db"), "'test'\\''db'");
        assert_eq!(escape_shell_argument("plain"), "'plain'");
        assert_eq!(escape_shell_argument(""), "''");
    }
}
