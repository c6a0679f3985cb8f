//! Input validation utilities

use once_cell::sync::Lazy;
use regex::Regex;

/// Key sizes the RSA generator and the signing backend both accept
pub const SUPPORTED_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];

/// Regex for a single DNS label
static DNS_LABEL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap());

/// Regex for reverse proxy site names (used as file names)
static SITE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").unwrap());

/// Validate a DNS-name shaped domain
///
/// A leading `*.` label is accepted so the main wildcard identity can be renewed.
pub fn validate_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    let host = domain.strip_prefix("*.").unwrap_or(domain);
    !host.is_empty() && host.split('.').all(|label| DNS_LABEL_REGEX.is_match(label))
}

/// Validate a reverse proxy site name
pub fn validate_site_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 128 && SITE_NAME_REGEX.is_match(name)
}

/// Validate an RSA key size
pub fn validate_key_size(bits: u32) -> bool {
    SUPPORTED_KEY_SIZES.contains(&bits)
}

/// Turn a domain into something safe to use in a file name
///
/// Wildcards become `_wildcard`, anything outside `[A-Za-z0-9.-]` becomes `_`.
pub fn file_stem_for_domain(domain: &str) -> String {
    let domain = match domain.strip_prefix("*.") {
        Some(rest) => format!("_wildcard.{}", rest),
        None => domain.to_string(),
    };

    domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
