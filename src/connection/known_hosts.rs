//! known_hosts parsing and host key verification
//!
//! Supports the OpenSSH format:
//!
//! ```text
//! # comment
//! win01.example.com,10.0.0.5 ssh-ed25519 AAAA...
//! [win02.example.com]:2222 ssh-ed25519 AAAA...
//! *.corp.example.com,!bad.corp.example.com ssh-rsa AAAA...
//! |1|<salt>|<hmac-sha1> ecdsa-sha2-nistp256 AAAA...
//! @revoked * ssh-rsa AAAA...
//! ```
//!
//! A line that is structurally broken (missing fields, bad base64, broken
//! hashed pattern) fails the whole file, as does a supported key type whose
//! key data does not decode. Lines with other key types are skipped.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use russh::keys::key::PublicKey;
use sha1::Sha1;
use std::path::Path;
use tracing::{debug, trace, warn};

use super::{ConnectionError, ConnectionResult};

type HmacSha1 = Hmac<Sha1>;

/// Key types russh can verify
const SUPPORTED_KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "rsa-sha2-256",
    "rsa-sha2-512",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

/// Marker on a known_hosts line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    None,
    Revoked,
}

/// A parsed known_hosts entry
#[derive(Debug, Clone)]
struct KnownHostEntry {
    marker: Marker,
    patterns: Vec<HostPattern>,
    key: PublicKey,
}

/// One comma-separated host pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Plain { pattern: String, negated: bool },
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

/// Result of checking a server key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key matches a known_hosts entry
    Verified,
    /// No entry exists for the host
    Unknown,
    /// An entry exists for the host but with a different key
    Mismatch,
    /// The key is marked `@revoked`
    Revoked,
}

/// Parsed contents of a known_hosts file
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Load and parse a known_hosts file. A missing file is an error.
    pub fn load(path: &Path) -> ConnectionResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectionError::InvalidConfig(format!(
                "cannot read known_hosts file {}: {}",
                path.display(),
                e
            ))
        })?;

        let known = Self::parse(&content).map_err(|e| match e {
            ConnectionError::InvalidConfig(msg) => {
                ConnectionError::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        debug!(
            path = %path.display(),
            entry_count = %known.entries.len(),
            "Loaded known_hosts entries"
        );
        Ok(known)
    }

    /// Parse known_hosts content
    pub fn parse(content: &str) -> ConnectionResult<Self> {
        let mut entries = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(entry) = parse_line(line).map_err(|msg| {
                ConnectionError::InvalidConfig(format!("line {}: {}", idx + 1, msg))
            })? {
                entries.push(entry);
            }
        }

        Ok(Self { entries })
    }

    /// Number of usable entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no usable entries were found
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify a server key for `host:port`
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let lookup = lookup_name(host, port);
        let fingerprint = key.fingerprint();
        let mut host_known = false;

        for entry in self.entries.iter().filter(|e| matches_host(&e.patterns, &lookup)) {
            let same_key = entry.key.fingerprint() == fingerprint;
            match entry.marker {
                Marker::Revoked if same_key => {
                    warn!(host = %lookup, "Server key is marked @revoked in known_hosts");
                    return HostKeyStatus::Revoked;
                }
                Marker::Revoked => {}
                Marker::None if same_key => return HostKeyStatus::Verified,
                Marker::None => host_known = true,
            }
        }

        if host_known {
            HostKeyStatus::Mismatch
        } else {
            HostKeyStatus::Unknown
        }
    }
}

/// Name looked up in known_hosts: `host` for port 22, else `[host]:port`
fn lookup_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn parse_line(line: &str) -> Result<Option<KnownHostEntry>, String> {
    let mut fields = line.split_whitespace();

    let mut first = fields.next().ok_or("empty entry")?;
    let marker = match first {
        "@revoked" => {
            first = fields.next().ok_or("missing host patterns after marker")?;
            Marker::Revoked
        }
        "@cert-authority" => {
            trace!("Skipping @cert-authority entry");
            return Ok(None);
        }
        m if m.starts_with('@') => return Err(format!("unknown marker {}", m)),
        _ => Marker::None,
    };

    let key_type = fields.next().ok_or("missing key type")?;
    let key_data = fields.next().ok_or("missing key data")?;

    let patterns = first
        .split(',')
        .map(parse_pattern)
        .collect::<Result<Vec<_>, _>>()?;

    let key_bytes = BASE64_STANDARD
        .decode(key_data)
        .map_err(|e| format!("invalid base64 key data: {}", e))?;

    let key = match russh::keys::key::parse_public_key(&key_bytes, None) {
        Ok(k) => k,
        Err(e) if SUPPORTED_KEY_TYPES.contains(&key_type) => {
            return Err(format!("invalid {} key data: {}", key_type, e));
        }
        Err(e) => {
            debug!(key_type = %key_type, error = %e, "Unsupported key type, skipping entry");
            return Ok(None);
        }
    };

    Ok(Some(KnownHostEntry {
        marker,
        patterns,
        key,
    }))
}

fn parse_pattern(raw: &str) -> Result<HostPattern, String> {
    if let Some(hashed) = raw.strip_prefix("|1|") {
        let (salt, hash) = hashed
            .split_once('|')
            .ok_or_else(|| format!("malformed hashed host {}", raw))?;
        let salt = BASE64_STANDARD
            .decode(salt)
            .map_err(|e| format!("invalid hashed host salt: {}", e))?;
        let hash = BASE64_STANDARD
            .decode(hash)
            .map_err(|e| format!("invalid hashed host digest: {}", e))?;
        return Ok(HostPattern::Hashed { salt, hash });
    }

    if raw.starts_with('|') {
        return Err(format!("unsupported hashed host format {}", raw));
    }

    let (pattern, negated) = match raw.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    if pattern.is_empty() {
        return Err("empty host pattern".to_string());
    }

    Ok(HostPattern::Plain {
        pattern: pattern.to_string(),
        negated,
    })
}

/// A negated match vetoes the entry; otherwise any positive match wins.
fn matches_host(patterns: &[HostPattern], lookup: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern {
            HostPattern::Plain { pattern, negated } => {
                if wildcard_match(pattern, lookup) {
                    if *negated {
                        return false;
                    }
                    matched = true;
                }
            }
            HostPattern::Hashed { salt, hash } => {
                if hashed_match(salt, hash, lookup) {
                    matched = true;
                }
            }
        }
    }
    matched
}

fn hashed_match(salt: &[u8], hash: &[u8], lookup: &str) -> bool {
    let Ok(mut mac) = HmacSha1::new_from_slice(salt) else {
        return false;
    };
    mac.update(lookup.as_bytes());
    mac.verify_slice(hash).is_ok()
}

/// `*` and `?` wildcard matching, case-insensitive like OpenSSH
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p).copied() {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
