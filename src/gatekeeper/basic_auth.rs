//! Basic-auth credential checks against an htpasswd file.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::{Error, Result};

/// Checks a username/password pair.
pub trait BasicAuthValidator: Send + Sync + 'static {
    /// Returns `true` if the credentials are valid.
    fn validate(&self, user: &str, password: &str) -> bool;
}

#[derive(Debug, Clone)]
enum PasswordHash {
    /// `{SHA}` + base64(SHA-1(password))
    Sha1(String),
    /// `$2a$`, `$2b$` or `$2y$` bcrypt hash
    Bcrypt(String),
}

impl PasswordHash {
    fn parse(hash: &str) -> Option<Self> {
        if let Some(digest) = hash.strip_prefix("{SHA}") {
            return Some(Self::Sha1(digest.to_string()));
        }
        if ["$2a$", "$2b$", "$2y$"].iter().any(|p| hash.starts_with(p)) {
            return Some(Self::Bcrypt(hash.to_string()));
        }
        None
    }

    fn matches(&self, password: &str) -> bool {
        match self {
            Self::Sha1(expected) => {
                let actual = STANDARD.encode(&Sha1::digest(password.as_bytes())[..]);
                bool::from(actual.as_bytes().ct_eq(expected.as_bytes()))
            }
            Self::Bcrypt(hash) => bcrypt::verify(password, hash).unwrap_or(false),
        }
    }
}

/// Users loaded from an htpasswd file.
///
/// Only `{SHA}` and bcrypt entries are supported; other schemes are skipped
/// with a warning at load time.
#[derive(Debug, Clone, Default)]
pub struct HtpasswdFile {
    users: HashMap<String, PasswordHash>,
}

impl HtpasswdFile {
    /// Load and parse `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read htpasswd file {}: {e}", path.display())))?;
        let file = Self::parse(&content);
        info!(path = %path.display(), users = file.len(), "Loaded htpasswd file");
        Ok(file)
    }

    /// Parse htpasswd content (`user:hash` per line).
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, hash)) = line.split_once(':') else {
                warn!(line = lineno + 1, "Malformed htpasswd entry skipped");
                continue;
            };
            match PasswordHash::parse(hash) {
                Some(hash) => {
                    users.insert(user.to_string(), hash);
                }
                None => warn!(user = %user, "Unsupported htpasswd hash scheme, entry skipped"),
            }
        }
        Self { users }
    }

    /// Number of usable entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns `true` if no entry is usable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl BasicAuthValidator for HtpasswdFile {
    fn validate(&self, user: &str, password: &str) -> bool {
        self.users.get(user).is_some_and(|hash| hash.matches(password))
    }
}

/// Decode an `Authorization: Basic` value into `(user, password)`.
#[must_use]
pub fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // "password" hashed with {SHA}
    const SHA_ENTRY: &str = "alice:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=";

    #[test]
    fn sha1_entries_validate() {
        let file = HtpasswdFile::parse(SHA_ENTRY);
        assert!(file.validate("alice", "password"));
        assert!(!file.validate("alice", "Password"));
        assert!(!file.validate("bob", "password"));
    }

    #[test]
    fn bcrypt_entries_validate() {
        let hash = bcrypt::hash("s3cret", 4).unwrap();
        let file = HtpasswdFile::parse(&format!("# comment\n\nbob:{hash}\n"));
        assert_eq!(file.len(), 1);
        assert!(file.validate("bob", "s3cret"));
        assert!(!file.validate("bob", "wrong"));
    }

    #[test]
    fn unsupported_and_malformed_entries_are_skipped() {
        let file = HtpasswdFile::parse("carol:$apr1$abc$def\nnocolon\n");
        assert!(file.is_empty());
    }

    #[test]
    fn parses_basic_header() {
        let value = format!("Basic {}", STANDARD.encode("alice:pa:ss"));
        assert_eq!(
            parse_basic_credentials(&value),
            Some(("alice".to_string(), "pa:ss".to_string()))
        );
        assert_eq!(parse_basic_credentials("Bearer abc"), None);
        assert_eq!(parse_basic_credentials("Basic !!!"), None);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("htpasswd");
        std::fs::write(&path, SHA_ENTRY).unwrap();
        assert!(HtpasswdFile::load(&path).unwrap().validate("alice", "password"));
        assert!(HtpasswdFile::load(&dir.path().join("missing")).is_err());
    }
}
