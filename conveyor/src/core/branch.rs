//! Branch-name validation.
//!
//! Every branch name passes through [`validate_branch_name`] before it is
//! interpolated into a `git` argument list.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BranchNameError {
    #[error("branch name is empty")]
    Empty,
    #[error("branch name '{0}' starts with '-'")]
    LeadingDash(String),
    #[error("branch name '{0}' contains '..'")]
    DotDot(String),
    #[error("branch name '{name}' contains disallowed character {ch:?}")]
    InvalidChar { name: String, ch: char },
    #[error("branch name '{0}' has an empty path component")]
    EmptyComponent(String),
    #[error("branch name '{0}' ends with '.lock' or '.'")]
    BadSuffix(String),
}

pub fn validate_branch_name(name: &str) -> Result<(), BranchNameError> {
    if name.is_empty() {
        return Err(BranchNameError::Empty);
    }
    if name.starts_with('-') {
        return Err(BranchNameError::LeadingDash(name.to_string()));
    }
    if name.contains("..") {
        return Err(BranchNameError::DotDot(name.to_string()));
    }
    if let Some(ch) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/')))
    {
        return Err(BranchNameError::InvalidChar {
            name: name.to_string(),
            ch,
        });
    }
    if name.split('/').any(str::is_empty) {
        return Err(BranchNameError::EmptyComponent(name.to_string()));
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return Err(BranchNameError::BadSuffix(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_branches() {
        for name in ["main", "feature/add-login", "auto/issue-42-abc123", "v1.2_rc"] {
            assert_eq!(validate_branch_name(name), Ok(()), "{name}");
        }
    }

    #[test]
    fn rejects_option_injection() {
        assert!(matches!(
            validate_branch_name("--upload-pack=/tmp/evil"),
            Err(BranchNameError::LeadingDash(_))
        ));
    }

    #[test]
    fn rejects_range_syntax_and_empty() {
        assert!(matches!(
            validate_branch_name("main..feature"),
            Err(BranchNameError::DotDot(_))
        ));
        assert_eq!(validate_branch_name(""), Err(BranchNameError::Empty));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for name in ["a;rm -rf", "x$(id)", "a|b", "a&b", "`id`", "a b", "a>b"] {
            assert!(validate_branch_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn rejects_malformed_components() {
        assert!(validate_branch_name("feature/").is_err());
        assert!(validate_branch_name("/feature").is_err());
        assert!(validate_branch_name("a//b").is_err());
        assert!(validate_branch_name("topic.lock").is_err());
    }
}
