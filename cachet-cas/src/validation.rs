//! Input validation for CAS operations

use std::path::{Component, Path};

use crate::errors::{CasError, Result};

/// Number of path components below the content root:
/// `<algorithm>/<xx>/<yy>/<rest>`.
pub const CONTENT_PATH_DEPTH: usize = 4;

/// Validate object size against an optional upper bound
pub fn validate_object_size(size: u64, max: Option<u64>) -> Result<()> {
    match max {
        Some(max) if size > max => Err(CasError::ObjectTooLarge { size, max }),
        _ => Ok(()),
    }
}

/// Split a path relative to the content root into its plain components.
///
/// Returns `None` for anything that is not exactly
/// [`CONTENT_PATH_DEPTH`] normal, non-hidden, UTF-8 components; this keeps
/// temp files and stray entries from being mistaken for blobs.
pub fn content_components(relative: &Path) -> Option<Vec<&str>> {
    let mut parts = Vec::with_capacity(CONTENT_PATH_DEPTH);
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                let name = name.to_str()?;
                if name.is_empty() || name.starts_with('.') || name.contains('\0') {
                    return None;
                }
                parts.push(name);
            }
            _ => return None,
        }
        if parts.len() > CONTENT_PATH_DEPTH {
            return None;
        }
    }
    (parts.len() == CONTENT_PATH_DEPTH).then_some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_object_size() {
        assert!(validate_object_size(1024, None).is_ok());
        assert!(validate_object_size(1024, Some(1024)).is_ok());
        assert!(matches!(
            validate_object_size(1025, Some(1024)),
            Err(CasError::ObjectTooLarge { size: 1025, max: 1024 })
        ));
    }

    #[test]
    fn test_content_components() {
        let ok = PathBuf::from("blake3/ab/cd/ef01");
        assert_eq!(
            content_components(&ok),
            Some(vec!["blake3", "ab", "cd", "ef01"])
        );

        assert!(content_components(&PathBuf::from("blake3/ab/cd")).is_none());
        assert!(content_components(&PathBuf::from("blake3/ab/cd/ef/gh")).is_none());
        assert!(content_components(&PathBuf::from("../ab/cd/ef")).is_none());
        assert!(content_components(&PathBuf::from("/blake3/ab/cd/ef")).is_none());
        assert!(content_components(&PathBuf::from("blake3/ab/cd/.hidden")).is_none());
    }
}
