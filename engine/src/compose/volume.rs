//! Docker volume string parsing and injection validation

use serde_yaml::Value;

use crate::errors::EngineError;
use crate::shell::contains_shell_metacharacters;

/// The parsed pieces of a short-syntax volume string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParts {
    pub source: String,
    pub target: String,
    pub mode: Option<String>,
}

/// Access-mode flags recognized as a trailing `:mode` segment.
const VOLUME_MODES: &[&str] = &["ro", "rw", "z", "Z", "cached", "delegated", "consistent"];

fn is_mode_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.split(',').all(|part| VOLUME_MODES.contains(&part))
}

/// Colon positions that act as separators. A colon that is part of a
/// Windows drive-letter prefix (`C:\...` or `C:/...`) is not a separator.
fn separator_positions(spec: &str) -> Vec<usize> {
    let bytes = spec.as_bytes();
    let mut positions = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b':' {
            continue;
        }
        let is_drive_prefix = i == 1
            && bytes[0].is_ascii_alphabetic()
            && matches!(bytes.get(2), Some(b'\\') | Some(b'/'));
        if !is_drive_prefix {
            positions.push(i);
        }
    }
    positions
}

/// Split a short-syntax volume string into source, target and optional
/// mode. The split happens on the LAST separator colon, so a Windows host
/// path keeps its drive letter: `C:\host\path:/container` yields
/// source `C:\host\path`, target `/container`.
pub fn parse_docker_volume_string(spec: &str) -> Result<VolumeParts, EngineError> {
    let mut separators = separator_positions(spec);
    if separators.is_empty() {
        return Err(EngineError::Deployment(format!(
            "volume '{}' has no target separator",
            spec
        )));
    }

    // A trailing `:ro`-style segment is a mode, not the target.
    let mut mode = None;
    let mut end = spec.len();
    if separators.len() >= 2 {
        let last = *separators.last().unwrap_or(&0);
        let tail = &spec[last + 1..];
        if is_mode_segment(tail) {
            mode = Some(tail.to_string());
            separators.pop();
            end = last;
        }
    }

    let split = *separators.last().unwrap_or(&0);
    let source = &spec[..split];
    let target = &spec[split + 1..end];

    if source.is_empty() || target.is_empty() {
        return Err(EngineError::Deployment(format!(
            "volume '{}' is missing a source or target",
            spec
        )));
    }

    Ok(VolumeParts {
        source: source.to_string(),
        target: target.to_string(),
        mode,
    })
}

/// Reject a volume string whose segments contain shell metacharacters.
/// Windows paths with backslashes are fine; command substitution,
/// separators and redirects are not.
pub fn validate_volume_string_for_injection(spec: &str) -> Result<(), EngineError> {
    let parts = parse_docker_volume_string(spec)?;
    for (label, segment) in [
        ("volume source", Some(parts.source.as_str())),
        ("volume target", Some(parts.target.as_str())),
        ("volume mode", parts.mode.as_deref()),
    ] {
        if let Some(segment) = segment {
            if contains_shell_metacharacters(segment) {
                return Err(EngineError::validation(
                    label,
                    format!("'{}' contains forbidden shell characters", segment),
                ));
            }
        }
    }
    Ok(())
}

/// Walk every volume entry of a compose document (short and long syntax)
/// and fail if any segment would be unsafe to interpolate into a shell
/// command.
pub fn validate_docker_compose_for_injection(yaml_text: &str) -> Result<(), EngineError> {
    let value: Value = serde_yaml::from_str(yaml_text)?;

    let Some(services) = value.get("services").and_then(Value::as_mapping) else {
        return Ok(());
    };

    for (_, service) in services {
        let Some(volumes) = service.get("volumes").and_then(Value::as_sequence) else {
            continue;
        };
        for volume in volumes {
            match volume {
                Value::String(spec) => validate_volume_string_for_injection(spec)?,
                Value::Mapping(mapping) => {
                    for key in ["source", "target"] {
                        if let Some(segment) = mapping.get(Value::from(key)).and_then(Value::as_str)
                        {
                            if contains_shell_metacharacters(segment) {
                                return Err(EngineError::validation(
                                    format!("volume {}", key),
                                    format!("'{}' contains forbidden shell characters", segment),
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}
