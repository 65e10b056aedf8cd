//! Protected-file policy.

use std::collections::BTreeSet;

use crate::error::ControllerError;

/// Filename the board runs at power-up.
pub const BOOT_SCRIPT: &str = "boot.py";

/// Filenames destructive operations refuse to touch without an override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedFiles {
    names: BTreeSet<String>,
}

impl Default for ProtectedFiles {
    fn default() -> Self {
        Self::new([BOOT_SCRIPT])
    }
}

impl ProtectedFiles {
    /// Build a set from filenames.
    #[must_use]
    pub fn new<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| normalize(n.as_ref()).to_string())
                .collect(),
        }
    }

    /// Whether `name` is in the set. A leading `/` is ignored.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(normalize(name))
    }

    /// Whether a destructive operation on `name` may proceed.
    #[must_use]
    pub fn is_allowed(&self, name: &str, allow_override: bool) -> bool {
        allow_override || !self.contains(name)
    }

    /// Like [`Self::is_allowed`], as a typed rejection.
    ///
    /// # Errors
    /// Returns `ProtectedFile` when `name` is protected and not overridden.
    pub fn check(&self, name: &str, allow_override: bool) -> Result<(), ControllerError> {
        if self.is_allowed(name, allow_override) {
            Ok(())
        } else {
            Err(ControllerError::ProtectedFile(name.to_string()))
        }
    }

    /// Iterate protected names.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

fn normalize(name: &str) -> &str {
    name.trim_start_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_script_protected_by_default() {
        let policy = ProtectedFiles::default();
        assert!(!policy.is_allowed("boot.py", false));
        assert!(!policy.is_allowed("/boot.py", false));
        assert!(policy.is_allowed("boot.py", true));
        assert!(policy.is_allowed("main.py", false));
    }

    #[test]
    fn check_reports_name() {
        let policy = ProtectedFiles::new(["main.py", "boot.py"]);
        match policy.check("main.py", false) {
            Err(ControllerError::ProtectedFile(name)) => assert_eq!(name, "main.py"),
            other => panic!("unexpected {other:?}"),
        }
        tokio_test::assert_ok!(policy.check("lib/main.py", false));
        tokio_test::assert_ok!(policy.check("main.py", true));
    }

    #[test]
    fn empty_set_allows_everything() {
        let policy = ProtectedFiles::new(Vec::<String>::new());
        assert!(policy.is_allowed("boot.py", false));
        assert_eq!(policy.iter().count(), 0);
    }
}
