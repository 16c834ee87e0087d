//! Deployment sources and git ref resolution

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::EngineError;
use crate::remote::executor::RemoteExecutor;
use crate::remote::server::Server;
use crate::shell::escape_shell_argument;

/// What a deployment starts from: a git ref to build, or a prebuilt image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Source {
    Git { repository: Url, reference: String },
    Image { reference: String },
}

/// A source after resolution against the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// 40-character lowercase hex commit sha.
    Commit(String),
    Image(String),
}

/// Matches a 40-hex-character token immediately followed by optional
/// spaces and a tab, as produced by `git ls-remote`. The token must not
/// be preceded by another hex digit, so a longer hex run never yields a
/// truncated sha. Case-insensitive so unusual remotes are tolerated; the
/// result is normalized to lowercase.
fn sha_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?im)(?:^|[^0-9a-f])([0-9a-f]{40})[ ]*\t").expect("static regex must compile")
    })
}

/// Extract the commit sha from `git ls-remote` output.
///
/// The output is line-oriented `<sha><TAB><ref>`, but may be preceded by
/// warning or redirect notices on the same or earlier lines; the first
/// hex-40 token followed by a tab wins.
pub fn extract_commit_sha(ls_remote_output: &str) -> Result<String, EngineError> {
    sha_pattern()
        .captures(ls_remote_output)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .ok_or_else(|| {
            EngineError::SourceResolution("no commit sha found in ls-remote output".to_string())
        })
}

impl Source {
    /// The remote command that lists the refs for a git source.
    pub fn ls_remote_command(repository: &Url, reference: &str) -> String {
        format!(
            "git ls-remote {} {}",
            escape_shell_argument(repository.as_str()),
            escape_shell_argument(reference)
        )
    }

    /// Resolve the source on a server. Git refs run `ls-remote` through the
    /// executor; image references resolve to themselves.
    pub async fn resolve(
        &self,
        executor: &dyn RemoteExecutor,
        server: &Server,
        timeout: Duration,
    ) -> Result<ResolvedSource, EngineError> {
        match self {
            Source::Image { reference } => Ok(ResolvedSource::Image(reference.clone())),
            Source::Git {
                repository,
                reference,
            } => {
                let command = Self::ls_remote_command(repository, reference);
                let output = executor.run(server, &command, timeout).await?;
                if !output.success() {
                    return Err(EngineError::SourceResolution(format!(
                        "ls-remote failed for {}: {}",
                        repository,
                        output.stderr.trim()
                    )));
                }
                extract_commit_sha(&output.stdout).map(ResolvedSource::Commit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_sha_after_warning_lines() {
        let output = "warning: redirecting to https://x/\n\
                      196d3df7665359a8c8fa3329a6bcde0267e550bf\trefs/heads/master";
        assert_eq!(
            extract_commit_sha(output).unwrap(),
            "196d3df7665359a8c8fa3329a6bcde0267e550bf"
        );
    }

    #[test]
    fn test_extracts_sha_with_warning_on_same_line() {
        let output =
            "warning: foo 196D3DF7665359A8C8FA3329A6BCDE0267E550BF\trefs/heads/main\n";
        assert_eq!(
            extract_commit_sha(output).unwrap(),
            "196d3df7665359a8c8fa3329a6bcde0267e550bf"
        );
    }

    #[test]
    fn test_no_sha_is_an_error() {
        let output = "warning: nothing to see here\nfatal: repository not found\n";
        assert!(matches!(
            extract_commit_sha(output),
            Err(EngineError::SourceResolution(_))
        ));
    }

    #[test]
    fn test_longer_hex_run_is_not_truncated_to_a_sha() {
        // 41 hex characters before the tab: not a commit sha at all.
        let output = "a196d3df7665359a8c8fa3329a6bcde0267e550bf\trefs/heads/master";
        assert!(extract_commit_sha(output).is_err());
    }

    #[test]
    fn test_hex_40_without_tab_does_not_match() {
        // A sha-like token not followed by a tab is not a ref line.
        let output = "196d3df7665359a8c8fa3329a6bcde0267e550bf refs/heads/master";
        assert!(extract_commit_sha(output).is_err());
    }

    #[test]
    fn test_ls_remote_command_escapes_arguments() {
        let url = Url::parse("https://git.example.com/acme/shop.git").unwrap();
        let command = Source::ls_remote_command(&url, "main");
        assert_eq!(
            command,
            "git ls-remote 'https://git.example.com/acme/shop.git' 'main'"
        );
    }
}
