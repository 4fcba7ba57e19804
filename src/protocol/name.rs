//! Bounded memory-region names.

use crate::error::{Error, Result};

/// Maximum length of a memory name in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Human-readable name of a memory region.
///
/// Names are non-empty, at most [`MAX_NAME_LEN`] bytes of UTF-8 and contain
/// no NUL byte. Overlong input is rejected rather than truncated.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct MemName(String);

impl MemName {
    /// Validate and wrap a name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::check(&name)?;
        Ok(Self(name))
    }

    #[cfg(test)]
    pub(crate) fn new_unchecked(name: String) -> Self {
        Self(name)
    }

    /// Re-check a name that arrived through deserialization.
    pub(crate) fn validate(&self) -> Result<()> {
        Self::check(&self.0)
    }

    fn check(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidName("name is empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong {
                len: name.len(),
                max: MAX_NAME_LEN,
            });
        }
        if name.contains('\0') {
            return Err(Error::InvalidName(format!("{name:?} contains NUL")));
        }
        Ok(())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for MemName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_at_limit_accepted() {
        let name = "x".repeat(MAX_NAME_LEN);
        assert_eq!(MemName::new(name.clone()).unwrap().as_str(), name);
    }

    #[test]
    fn test_overlong_name_rejected() {
        let err = MemName::new("x".repeat(MAX_NAME_LEN + 1)).unwrap_err();
        assert!(matches!(
            err,
            Error::NameTooLong {
                len: 257,
                max: MAX_NAME_LEN
            }
        ));
    }

    #[test]
    fn test_multibyte_length_counts_bytes() {
        // 52 * 5 bytes = 260 > 256, but only 104 chars
        let err = MemName::new("é€".repeat(52)).unwrap_err();
        assert!(matches!(err, Error::NameTooLong { .. }));
    }

    #[test]
    fn test_empty_and_nul_rejected() {
        assert!(matches!(MemName::new(""), Err(Error::InvalidName(_))));
        assert!(matches!(MemName::new("a\0b"), Err(Error::InvalidName(_))));
    }
}
