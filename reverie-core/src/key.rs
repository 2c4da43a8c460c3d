//! Deterministic cache key derivation.
//!
//! A request contributes a namespace plus a set of named fields. Fields are
//! sorted by name, length-prefixed, hashed with SHA-256 and truncated to a
//! 128-bit hex key. Values that equal a known default are dropped before
//! hashing so "unset" and "explicitly default" requests share one key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Number of hex characters in a [`CacheKey`] (128 bits).
pub const CACHE_KEY_LEN: usize = 32;

/// Opaque fixed-length cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a key from its hex form. Returns `None` for anything that is not
    /// exactly [`CACHE_KEY_LEN`] lowercase hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        let valid = s.len() == CACHE_KEY_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid cache key: {value}"))
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Canonical field set contributed by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    namespace: &'static str,
    fields: BTreeMap<&'static str, String>,
    /// Fields whose values compare case-insensitively.
    folded: BTreeSet<&'static str>,
}

impl KeyFields {
    pub fn new(namespace: &'static str) -> Self {
        Self {
            namespace,
            fields: BTreeMap::new(),
            folded: BTreeSet::new(),
        }
    }

    /// Free text. Surrounding whitespace never changes the generated output.
    pub fn text(mut self, name: &'static str, value: &str) -> Self {
        self.fields.insert(name, value.trim().to_string());
        self
    }

    /// Case-insensitive label; `None` and empty strings are omitted.
    pub fn label(mut self, name: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.fields.insert(name, v.to_lowercase());
            self.folded.insert(name);
        }
        self
    }

    /// Case-sensitive identifier; `None` is omitted.
    pub fn ident(mut self, name: &'static str, value: Option<&str>) -> Self {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.fields.insert(name, v.to_string());
        }
        self
    }

    /// Number rendered at [`canonical_number`] precision; omitted when equal
    /// to `default`.
    pub fn number(mut self, name: &'static str, value: Option<f32>, default: f32) -> Self {
        let rendered = render_number(value.unwrap_or(default));
        if rendered != render_number(default) {
            self.fields.insert(name, rendered);
        }
        self
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Whether `value` is the same setting as the stored `name` field.
    fn matches(&self, name: &str, value: &str) -> bool {
        let Some(stored) = self.get(name) else {
            return false;
        };
        if self.folded.contains(name) {
            stored.eq_ignore_ascii_case(value.trim())
        } else {
            stored == value.trim()
        }
    }

    /// Field map as stored in provenance metadata.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

/// Round to the two decimals keys distinguish. Requests store numbers in
/// this form so the provider sees exactly the value the key was derived from.
pub fn canonical_number(value: f32) -> f32 {
    let rounded = (value * 100.0).round() / 100.0;
    // -0.0 and 0.0 must agree
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn render_number(value: f32) -> String {
    format!("{:.2}", canonical_number(value))
}

/// Anything that can be turned into a canonical field set.
pub trait CacheKeySource {
    fn key_fields(&self) -> KeyFields;
}

/// Turns a request into a [`CacheKey`]. Must be pure.
pub trait KeyDeriver<R: ?Sized>: Send + Sync {
    fn derive(&self, request: &R) -> CacheKey;
}

/// Default deriver: sorted, length-prefixed fields hashed with SHA-256.
///
/// `with_default` registers a field value that is equivalent to leaving the
/// field unset, e.g. the generator's default voice.
#[derive(Debug, Clone)]
pub struct CanonicalKeyDeriver {
    schema_version: u32,
    defaults: HashMap<&'static str, String>,
}

impl Default for CanonicalKeyDeriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalKeyDeriver {
    pub fn new() -> Self {
        Self {
            schema_version: 1,
            defaults: HashMap::new(),
        }
    }

    /// Bumping the schema version invalidates every previously derived key.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_default(mut self, field: &'static str, value: impl Into<String>) -> Self {
        self.defaults.insert(field, value.into());
        self
    }

    /// Canonical byte encoding fed to the hash.
    pub fn canonical_bytes(&self, fields: &KeyFields) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        push_part(&mut out, "v", &self.schema_version.to_string());
        push_part(&mut out, "ns", fields.namespace);
        for (name, value) in &fields.fields {
            if self
                .defaults
                .get(name)
                .is_some_and(|d| fields.matches(name, d))
            {
                continue;
            }
            push_part(&mut out, name, value);
        }
        out
    }

    pub fn derive_fields(&self, fields: &KeyFields) -> CacheKey {
        let digest = Sha256::digest(self.canonical_bytes(fields));
        let mut hex = hex::encode(digest);
        hex.truncate(CACHE_KEY_LEN);
        CacheKey(hex)
    }
}

fn push_part(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(format!("{}:{}={}:", name.len(), name, value.len()).as_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(b';');
}

impl<R: CacheKeySource + ?Sized> KeyDeriver<R> for CanonicalKeyDeriver {
    fn derive(&self, request: &R) -> CacheKey {
        self.derive_fields(&request.key_fields())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Whitespace around free text never changes the key.
        #[test]
        fn prop_text_trim_is_canonical(text in "[a-zA-Z ]{1,40}", pad in " {0,3}") {
            let deriver = CanonicalKeyDeriver::new();
            let a = KeyFields::new("speech").text("text", &text);
            let b = KeyFields::new("speech").text("text", &format!("{pad}{text}{pad}"));
            prop_assert_eq!(deriver.derive_fields(&a), deriver.derive_fields(&b));
        }

        /// Labels are case-insensitive.
        #[test]
        fn prop_label_case_is_canonical(label in "[a-z]{1,12}") {
            let deriver = CanonicalKeyDeriver::new();
            let a = KeyFields::new("p").label("sport", Some(&label));
            let b = KeyFields::new("p").label("sport", Some(&label.to_uppercase()));
            prop_assert_eq!(deriver.derive_fields(&a), deriver.derive_fields(&b));
        }

        /// Distinct speeds at the rendered precision give distinct keys.
        #[test]
        fn prop_distinct_speeds_distinct_keys(a in 50u32..200, b in 50u32..200) {
            prop_assume!(a != b);
            let deriver = CanonicalKeyDeriver::new();
            let ka = deriver.derive_fields(&KeyFields::new("s").number("speed", Some(a as f32 / 100.0), 1.0));
            let kb = deriver.derive_fields(&KeyFields::new("s").number("speed", Some(b as f32 / 100.0), 1.0));
            prop_assert_ne!(ka, kb);
        }
    }
}
