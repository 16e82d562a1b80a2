//! `Endpoint=...;AccessKey=...` connection string parsing.

use std::collections::HashMap;
use std::fmt;

use crate::types::{Error, Result};

const PROPERTY_SEPARATOR: char = ';';
const KEY_VALUE_SEPARATOR: char = '=';
const ENDPOINT_PROPERTY: &str = "endpoint";
const ACCESS_KEY_PROPERTY: &str = "accesskey";

/// Endpoint and shared secret parsed from a connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    endpoint: String,
    secret: String,
}

impl ConnectionDescriptor {
    /// Parse a `;`-delimited `key=value` connection string.
    ///
    /// Keys are case-insensitive and values are trimmed. The endpoint loses
    /// any trailing `/`. Properties other than `endpoint` and `accesskey`
    /// are accepted and ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let properties: Vec<&str> = raw
            .split(PROPERTY_SEPARATOR)
            .filter(|p| !p.is_empty())
            .collect();
        if properties.len() < 2 {
            return Err(missing_required());
        }

        let mut dict: HashMap<String, String> = HashMap::with_capacity(properties.len());
        for property in properties {
            let (key, value) = property
                .split_once(KEY_VALUE_SEPARATOR)
                .ok_or_else(|| {
                    Error::MalformedConnectionString(format!(
                        "property '{}' has no '{KEY_VALUE_SEPARATOR}' separator",
                        property.trim()
                    ))
                })?;
            // Full Unicode folding, so non-ASCII keys that differ only in case collide.
            let key = key.trim().to_lowercase();
            if dict.contains_key(&key) {
                return Err(Error::DuplicateProperty(key));
            }
            dict.insert(key, value.trim().to_string());
        }

        let endpoint = dict
            .remove(ENDPOINT_PROPERTY)
            .map(|e| e.trim_end_matches('/').to_string());
        let secret = dict.remove(ACCESS_KEY_PROPERTY);
        match (endpoint, secret) {
            (Some(endpoint), Some(secret)) if !endpoint.is_empty() && !secret.is_empty() => {
                Ok(Self { endpoint, secret })
            }
            _ => Err(missing_required()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn missing_required() -> Error {
    Error::MalformedConnectionString(format!(
        "missing required properties {ENDPOINT_PROPERTY} and {ACCESS_KEY_PROPERTY}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_and_key() {
        let d = ConnectionDescriptor::parse("Endpoint=https://example.com;AccessKey=abc123").unwrap();
        assert_eq!(d.endpoint(), "https://example.com");
        assert_eq!(d.secret(), "abc123");
    }

    #[test]
    fn keys_are_case_insensitive_and_values_trimmed() {
        let d = ConnectionDescriptor::parse(" ENDPOINT = https://example.com ; accessKEY= k=v ;")
            .unwrap();
        assert_eq!(d.endpoint(), "https://example.com");
        // Only the first '=' separates key from value.
        assert_eq!(d.secret(), "k=v");
    }

    #[test]
    fn strips_trailing_slashes_from_endpoint() {
        let d = ConnectionDescriptor::parse("endpoint=https://example.com///;accesskey=k").unwrap();
        assert_eq!(d.endpoint(), "https://example.com");
    }

    #[test]
    fn ignores_unknown_properties() {
        let d = ConnectionDescriptor::parse(
            "Endpoint=https://x.service.signalr.net;AccessKey=k;Version=1.0;",
        )
        .unwrap();
        assert_eq!(d.endpoint(), "https://x.service.signalr.net");
    }

    #[test]
    fn rejects_duplicate_property() {
        let err = ConnectionDescriptor::parse("endpoint=a;endpoint=b;accesskey=k").unwrap_err();
        assert!(matches!(err, Error::DuplicateProperty(ref k) if k == "endpoint"));
    }

    #[test]
    fn duplicate_detection_ignores_case() {
        let err = ConnectionDescriptor::parse("Endpoint=a;ENDPOINT=b;accesskey=k").unwrap_err();
        assert!(matches!(err, Error::DuplicateProperty(_)));
    }

    #[test]
    fn duplicate_detection_folds_non_ascii_keys() {
        let err = ConnectionDescriptor::parse("Endpoint=https://a;AccessKey=k;Région=1;RÉGION=2")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateProperty(ref key) if key == "région"), "{err:?}");
    }

    #[test]
    fn rejects_missing_access_key() {
        let err = ConnectionDescriptor::parse("endpoint=a").unwrap_err();
        assert!(matches!(err, Error::MalformedConnectionString(_)));

        let err = ConnectionDescriptor::parse("endpoint=a;version=1").unwrap_err();
        assert!(matches!(err, Error::MalformedConnectionString(_)));
    }

    #[test]
    fn rejects_property_without_separator() {
        let err = ConnectionDescriptor::parse("endpoint=a;accesskey").unwrap_err();
        assert!(matches!(err, Error::MalformedConnectionString(_)));
    }

    #[test]
    fn rejects_empty_values() {
        assert!(ConnectionDescriptor::parse("endpoint=;accesskey=k").is_err());
        assert!(ConnectionDescriptor::parse("endpoint=/;accesskey=k").is_err());
        assert!(ConnectionDescriptor::parse("endpoint=a;accesskey= ").is_err());
        assert!(ConnectionDescriptor::parse("").is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let d = ConnectionDescriptor::parse("endpoint=https://a;accesskey=hunter2").unwrap();
        assert!(!format!("{d:?}").contains("hunter2"));
    }
}
