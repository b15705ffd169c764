//! Secret wrapper for sensitive values
//!
//! Account tokens here are session cookies lifted from a real browser
//! login, so leaking one in a log line leaks the whole account. The
//! wrapper redacts Debug and Display, wipes the value on drop, and
//! makes every read an explicit `expose` call at the point of use.

use std::fmt;
use zeroize::Zeroize;

pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Read the inner value. Callers must not copy it somewhere the
    /// redaction does not reach.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Read a secret from an environment variable, the way per-account
    /// tokens are configured. Unset and empty both count as absent.
    pub fn from_env(var: &str) -> Option<Self> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Some(Self(value)),
            _ => None,
        }
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
