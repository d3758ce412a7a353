//! DHT record validation.
//!
//! Records are checked with a [`RecordValidator`] in two places: on
//! inbound `PUT_VALUE` requests when the node runs Kademlia in server
//! mode, and on the result set of a `get_value` lookup before a
//! single record is selected.
//!
//! The default [`PermissiveValidator`] accepts every record and
//! selects the first one. Records are not signed; anything stronger
//! is plugged in per namespace through [`NamespacedValidator`].

use std::collections::HashMap;
use std::sync::Arc;

use otternet_types::{OtternetError, Result};

// ---------------------------------------------------------------------------
// RecordValidator
// ---------------------------------------------------------------------------

/// Validates DHT records and picks the best of several candidates.
pub trait RecordValidator: Send + Sync {
    /// Checks a single record.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if the record must be rejected.
    fn validate(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Returns the index of the preferred value in `values`.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if `values` is empty or no
    /// value is acceptable.
    fn select(&self, key: &str, values: &[Vec<u8>]) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// PermissiveValidator
// ---------------------------------------------------------------------------

/// Accepts every record; selects index 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissiveValidator;

impl RecordValidator for PermissiveValidator {
    fn validate(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn select(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        if values.is_empty() {
            return Err(OtternetError::DhtError {
                reason: format!("no values to select from for {key}"),
            });
        }
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// NamespacedValidator
// ---------------------------------------------------------------------------

/// Routes keys of the form `/<namespace>/<rest>` to a per-namespace
/// validator. Keys outside any registered namespace are rejected.
#[derive(Clone, Default)]
pub struct NamespacedValidator {
    namespaces: HashMap<String, Arc<dyn RecordValidator>>,
}

impl std::fmt::Debug for NamespacedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.namespaces.keys().collect();
        names.sort();
        f.debug_struct("NamespacedValidator")
            .field("namespaces", &names)
            .finish()
    }
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `validator` for keys under `/<namespace>/`.
    pub fn with_namespace(
        mut self,
        namespace: impl Into<String>,
        validator: Arc<dyn RecordValidator>,
    ) -> Self {
        self.namespaces.insert(namespace.into(), validator);
        self
    }

    fn route(&self, key: &str) -> Result<&Arc<dyn RecordValidator>> {
        let namespace = split_namespace(key).ok_or_else(|| OtternetError::DhtError {
            reason: format!("record key {key} is not namespaced"),
        })?;
        self.namespaces
            .get(namespace)
            .ok_or_else(|| OtternetError::DhtError {
                reason: format!("no validator registered for namespace {namespace}"),
            })
    }
}

impl RecordValidator for NamespacedValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<()> {
        self.route(key)?.validate(key, value)
    }

    fn select(&self, key: &str, values: &[Vec<u8>]) -> Result<usize> {
        self.route(key)?.select(key, values)
    }
}

/// Returns `ns` for a key of the form `/ns/rest`.
fn split_namespace(key: &str) -> Option<&str> {
    let rest = key.strip_prefix('/')?;
    let (namespace, tail) = rest.split_once('/')?;
    if namespace.is_empty() || tail.is_empty() {
        return None;
    }
    Some(namespace)
}

/// Namespaced key: `key` becomes `/<namespace>/<key>`.
pub fn namespaced_key(namespace: &str, key: &str) -> String {
    format!("/{namespace}/{key}")
}

/// Default validator for `namespace`: permissive inside it, reject
/// outside it.
pub fn default_validator(namespace: &str) -> Arc<dyn RecordValidator> {
    Arc::new(NamespacedValidator::new().with_namespace(namespace, Arc::new(PermissiveValidator)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;

    impl RecordValidator for RejectAll {
        fn validate(&self, key: &str, _value: &[u8]) -> Result<()> {
            Err(OtternetError::DhtError {
                reason: format!("rejected {key}"),
            })
        }

        fn select(&self, key: &str, _values: &[Vec<u8>]) -> Result<usize> {
            Err(OtternetError::DhtError {
                reason: format!("rejected {key}"),
            })
        }
    }

    #[test]
    fn permissive_accepts_and_picks_first() {
        let v = PermissiveValidator;
        assert!(v.validate("/orcanet/k", b"anything").is_ok());
        assert_eq!(v.select("/orcanet/k", &[b"a".to_vec(), b"b".to_vec()]).unwrap(), 0);
        assert!(v.select("/orcanet/k", &[]).is_err());
    }

    #[test]
    fn namespaced_routes_by_prefix() {
        let v = NamespacedValidator::new()
            .with_namespace("orcanet", Arc::new(PermissiveValidator))
            .with_namespace("locked", Arc::new(RejectAll));

        assert!(v.validate("/orcanet/k", b"x").is_ok());
        assert!(v.validate("/locked/k", b"x").is_err());
        assert!(v.validate("/other/k", b"x").is_err());
        assert!(v.validate("orcanet/k", b"x").is_err());
        assert!(v.validate("/orcanet/", b"x").is_err());
    }

    #[test]
    fn namespaced_key_format() {
        assert_eq!(namespaced_key("orcanet", "k"), "/orcanet/k");
        assert_eq!(split_namespace("/orcanet/a/b"), Some("orcanet"));
    }

    #[test]
    fn default_validator_accepts_only_its_namespace() {
        let v = default_validator("orcanet");
        assert!(v.validate("/orcanet/file", b"1").is_ok());
        assert!(v.validate("/ipns/file", b"1").is_err());
    }
}
