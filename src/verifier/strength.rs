//! Password strength policy, consulted only when a password is set or changed.

use crate::error::AuthError;

/// Pluggable password strength check.
pub trait PasswordStrengthChecker: Send + Sync + 'static {
    /// Accept or reject `password`.
    fn check(&self, password: &str) -> Result<(), AuthError>;
}

/// Rejects passwords shorter than a minimum number of characters.
#[derive(Debug, Clone, Copy)]
pub struct MinLengthChecker {
    min_length: usize,
}

impl MinLengthChecker {
    /// Create a checker requiring at least `min_length` characters.
    #[must_use]
    pub fn new(min_length: usize) -> Self {
        Self { min_length }
    }
}

impl PasswordStrengthChecker for MinLengthChecker {
    fn check(&self, password: &str) -> Result<(), AuthError> {
        if password.chars().count() < self.min_length {
            return Err(AuthError::WeakPassword);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_characters_not_bytes() {
        let checker = MinLengthChecker::new(4);
        assert!(checker.check("äöüß").is_ok());
        assert_eq!(checker.check("abc"), Err(AuthError::WeakPassword));
    }

    #[test]
    fn zero_disables_the_check() {
        assert!(MinLengthChecker::new(0).check("").is_ok());
    }
}
