//! Path exemptions (`skip_auth_regex`).

use regex::Regex;

use crate::{Error, Result};

/// Compiled path-exemption patterns plus the header-stripping policy for
/// exempted requests.
#[derive(Debug, Clone, Default)]
pub struct PathBypass {
    patterns: Vec<Regex>,
    strip_headers: bool,
}

impl PathBypass {
    /// Compile every pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first pattern that fails to compile.
    pub fn compile<S: AsRef<str>>(patterns: &[S], strip_headers: bool) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(p).map_err(|e| Error::Config(format!("Invalid skip_auth_regex '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            strip_headers,
        })
    }

    /// Returns `true` if `path` matches any exemption.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }

    /// Whether identity headers must be stripped from exempted requests.
    #[must_use]
    pub fn strip_headers(&self) -> bool {
        self.strip_headers
    }
}
