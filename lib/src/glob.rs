//! The tiny glob dialect used by `clears_artifact_provides` (spec §4.5,
//! §9 open question).
//!
//! This is deliberately not backed by a general-purpose glob crate: the
//! language is one rule (`*` matches a run of non-`.` characters, unless
//! the whole pattern ends in `.*`, in which case that trailing star is
//! unrestricted) with no escaping, so translating it to a `regex` is
//! both simpler and more auditable than pulling in `globset`.

use regex::Regex;

use crate::error::EngineError;

/// Compile one `clears_artifact_provides` pattern into a matcher.
///
/// An empty pattern is rejected per spec §9: the source's behaviour for
/// it is unspecified, so implementers are told to reject rather than
/// guess.
pub fn compile(pattern: &str) -> Result<Regex, EngineError> {
    if pattern.is_empty() {
        return Err(EngineError::ParseError(
            "clears_artifact_provides: empty pattern is not allowed".into(),
        ));
    }
    let trailing_dot_star = pattern.ends_with(".*");
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for (i, c) in chars.iter().enumerate() {
        if *c == '*' {
            let is_last = i + 1 == chars.len();
            if is_last && trailing_dot_star {
                re.push_str(".*");
            } else {
                re.push_str("[^.]*");
            }
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| EngineError::ParseError(format!("invalid glob {pattern:?}: {e}")))
}

/// True if `key` matches `pattern` under the dialect above.
pub fn matches(pattern: &str, key: &str) -> Result<bool, EngineError> {
    Ok(compile(pattern)?.is_match(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_non_dot_run() {
        assert!(matches("rootfs-image*", "rootfs-imagefoo").unwrap());
        assert!(!matches("rootfs-image*", "rootfs-image.version").unwrap());
    }

    #[test]
    fn trailing_dot_star_is_unrestricted() {
        assert!(matches("rootfs-image.*", "rootfs-image.version").unwrap());
        assert!(matches("rootfs-image.*", "rootfs-image.checksum.extra").unwrap());
        assert!(!matches("rootfs-image.*", "other-image.version").unwrap());
    }

    #[test]
    fn empty_pattern_rejected() {
        assert!(compile("").is_err());
    }

    #[test]
    fn exact_match_with_no_wildcard() {
        assert!(matches("artifact_name", "artifact_name").unwrap());
        assert!(!matches("artifact_name", "artifact_name_extra").unwrap());
    }
}
