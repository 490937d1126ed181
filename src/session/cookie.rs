//! Cookie reading, writing and chunking.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, header};
use chrono::{DateTime, Utc};

use crate::config::CookieConfig;

/// Browsers cap a cookie (name, value and attributes) at about 4 KiB.
pub const MAX_COOKIE_LEN: usize = 4000;

/// Most chunk slots a session may occupy. Higher indices sent by a client
/// are ignored.
pub const MAX_CHUNKS: usize = 16;

/// Attributes shared by every cookie the proxy sets.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    /// Base name; chunks and the CSRF cookie derive from it
    pub name: String,
    /// `Domain` attribute
    pub domain: Option<String>,
    /// `Path` attribute
    pub path: String,
    /// `Secure` attribute
    pub secure: bool,
    /// `HttpOnly` attribute
    pub http_only: bool,
    /// `SameSite` attribute
    pub same_site: Option<String>,
    /// `Max-Age` for session cookies
    pub expire: Duration,
}

impl CookieSettings {
    /// Settings from configuration.
    #[must_use]
    pub fn from_config(config: &CookieConfig) -> Self {
        Self {
            name: config.name.clone(),
            domain: config.domain.clone(),
            path: config.path.clone(),
            secure: config.secure,
            http_only: config.http_only,
            same_site: config.same_site.clone(),
            expire: config.expire,
        }
    }

    /// Name of chunk `index` (`_oauth2_proxy`, `_oauth2_proxy_1`, ...).
    #[must_use]
    pub fn chunk_name(&self, index: usize) -> String {
        if index == 0 {
            self.name.clone()
        } else {
            format!("{}_{index}", self.name)
        }
    }

    /// Name of the CSRF cookie used during login.
    #[must_use]
    pub fn csrf_name(&self) -> String {
        format!("{}_csrf", self.name)
    }

    /// A cookie set for the session lifetime.
    #[must_use]
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) -> SetCookie {
        self.set_for(name, value, self.expire)
    }

    /// A cookie set for `max_age`.
    #[must_use]
    pub fn set_for(&self, name: impl Into<String>, value: impl Into<String>, max_age: Duration) -> SetCookie {
        SetCookie {
            name: name.into(),
            value: value.into(),
            max_age: Some(max_age),
            settings: self.clone(),
        }
    }

    /// A cookie that removes `name` from the browser.
    #[must_use]
    pub fn expire(&self, name: impl Into<String>) -> SetCookie {
        SetCookie {
            name: name.into(),
            value: String::new(),
            max_age: None,
            settings: self.clone(),
        }
    }
}

/// One `Set-Cookie` instruction.
#[derive(Debug, Clone)]
pub struct SetCookie {
    name: String,
    value: String,
    /// `None` expires the cookie
    max_age: Option<Duration>,
    settings: CookieSettings,
}

impl SetCookie {
    /// Cookie name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cookie value (empty for removals).
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns `true` if this instruction removes the cookie.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.max_age.is_none()
    }

    /// Render as a `Set-Cookie` header value.
    #[must_use]
    pub fn to_header_string(&self) -> String {
        let s = &self.settings;
        let mut out = format!("{}={}; Path={}", self.name, self.value, s.path);

        if let Some(ref domain) = s.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }

        match self.max_age {
            Some(age) => {
                let expires = chrono::Duration::from_std(age)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                out.push_str(&format!("; Max-Age={}; Expires={}", age.as_secs(), http_date(expires)));
            }
            None => out.push_str("; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT"),
        }

        if s.http_only {
            out.push_str("; HttpOnly");
        }
        if s.secure {
            out.push_str("; Secure");
        }
        if let Some(ref same_site) = s.same_site {
            let same_site = match same_site.to_ascii_lowercase().as_str() {
                "strict" => "Strict",
                "none" => "None",
                _ => "Lax",
            };
            out.push_str("; SameSite=");
            out.push_str(same_site);
        }
        out
    }
}

fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Cookies sent with a request, in header order.
#[derive(Debug, Clone, Default)]
pub struct RequestCookies {
    pairs: Vec<(String, String)>,
}

impl RequestCookies {
    /// Parse every `Cookie` header. Malformed pairs are skipped.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let pairs = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_string(), value.trim().trim_matches('"').to_string()))
            })
            .collect();
        Self { pairs }
    }

    /// Build from explicit pairs.
    #[must_use]
    pub fn from_pairs<N: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (N, V)>) -> Self {
        Self {
            pairs: pairs.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }

    /// First value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if a cookie called `name` was sent.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All cookie names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(n, _)| n.as_str())
    }

    /// What a browser would send next after applying `mutations`.
    #[must_use]
    pub fn apply(&self, mutations: &CookieMutations) -> Self {
        let mut pairs = self.pairs.clone();
        for cookie in mutations.iter() {
            pairs.retain(|(n, _)| n != cookie.name());
            if !cookie.is_removal() {
                pairs.push((cookie.name().to_string(), cookie.value().to_string()));
            }
        }
        Self { pairs }
    }
}

/// Cookie changes to send with the response.
#[derive(Debug, Clone, Default)]
pub struct CookieMutations {
    cookies: Vec<SetCookie>,
    by_name: HashMap<String, usize>,
}

impl CookieMutations {
    /// No changes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a cookie; a later instruction for the same name replaces an
    /// earlier one in place.
    pub fn push(&mut self, cookie: SetCookie) {
        match self.by_name.get(&cookie.name) {
            Some(&i) => self.cookies[i] = cookie,
            None => {
                self.by_name.insert(cookie.name.clone(), self.cookies.len());
                self.cookies.push(cookie);
            }
        }
    }

    /// Merge `other` into `self`.
    pub fn extend(&mut self, other: CookieMutations) {
        for cookie in other.cookies {
            self.push(cookie);
        }
    }

    /// Queued instructions.
    pub fn iter(&self) -> impl Iterator<Item = &SetCookie> {
        self.cookies.iter()
    }

    /// Instruction for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SetCookie> {
        self.by_name.get(name).map(|&i| &self.cookies[i])
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Append a `Set-Cookie` header per instruction.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for cookie in &self.cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie.to_header_string()) {
                headers.append(header::SET_COOKIE, value);
            }
        }
    }
}

/// Split `value` into pieces of at most `max_len` bytes.
///
/// `value` is base64 (ASCII), so byte offsets are character boundaries.
#[must_use]
pub fn split_chunks(value: &str, max_len: usize) -> Vec<&str> {
    if value.is_empty() || max_len == 0 {
        return vec![value];
    }
    let mut chunks = Vec::with_capacity(value.len().div_ceil(max_len));
    let mut rest = value;
    while !rest.is_empty() {
        let at = rest.len().min(max_len);
        let at = (0..=at).rev().find(|i| rest.is_char_boundary(*i)).unwrap_or(rest.len());
        let (head, tail) = rest.split_at(at);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Highest chunk index present for `settings.name`, including gaps.
/// Indices at or beyond [`MAX_CHUNKS`] are not chunk slots.
#[must_use]
pub fn max_chunk_index(cookies: &RequestCookies, settings: &CookieSettings) -> Option<usize> {
    let prefix = format!("{}_", settings.name);
    let suffixed = cookies
        .names()
        .filter_map(|n| n.strip_prefix(&prefix)?.parse::<usize>().ok())
        .filter(|i| (1..MAX_CHUNKS).contains(i))
        .max();

    match (cookies.contains(&settings.name), suffixed) {
        (_, Some(i)) => Some(i),
        (true, None) => Some(0),
        (false, None) => None,
    }
}

/// Reassemble chunks in index order.
///
/// Returns `Ok(None)` when no chunk is present and `Err(index)` naming the
/// first missing index when the sequence has a gap.
pub fn join_chunks(cookies: &RequestCookies, settings: &CookieSettings) -> Result<Option<String>, usize> {
    let Some(max) = max_chunk_index(cookies, settings) else {
        return Ok(None);
    };

    let mut joined = String::new();
    for i in 0..=max {
        let part = cookies.get(&settings.chunk_name(i)).ok_or(i)?;
        joined.push_str(part);
    }
    Ok(Some(joined))
}
