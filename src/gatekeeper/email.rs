//! Email allow-list applied to established identities.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::{Error, Result};

/// Allows an email by domain or by exact address.
#[derive(Debug, Clone, Default)]
pub struct EmailValidator {
    allow_all: bool,
    domains: Vec<String>,
    addresses: HashSet<String>,
}

impl EmailValidator {
    /// Build from `email_domains` entries and an optional address file.
    ///
    /// `*` allows any email. A domain matches exactly or, when written with a
    /// leading `.`, also any subdomain.
    ///
    /// # Errors
    ///
    /// Returns an error if the address file cannot be read.
    pub fn new<S: AsRef<str>>(domains: &[S], emails_file: Option<&Path>) -> Result<Self> {
        let mut validator = Self::default();
        for domain in domains {
            let domain = domain.as_ref().trim().to_ascii_lowercase();
            if domain == "*" {
                validator.allow_all = true;
            } else if !domain.is_empty() {
                validator.domains.push(domain);
            }
        }

        if let Some(path) = emails_file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Failed to read authenticated emails file {}: {e}", path.display()))
            })?;
            validator.addresses = content
                .lines()
                .map(|l| l.trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .collect();
            info!(path = %path.display(), count = validator.addresses.len(), "Loaded authenticated emails");
        }

        Ok(validator)
    }

    /// Returns `true` if `email` is allowed.
    #[must_use]
    pub fn is_allowed(&self, email: &str) -> bool {
        if self.allow_all {
            return true;
        }
        let email = email.trim().to_ascii_lowercase();
        if self.addresses.contains(&email) {
            return true;
        }
        let Some((_, domain)) = email.rsplit_once('@') else {
            return false;
        };
        self.domains.iter().any(|allowed| match allowed.strip_prefix('.') {
            Some(suffix) => domain == suffix || domain.ends_with(allowed.as_str()),
            None => domain == allowed,
        })
    }
}
