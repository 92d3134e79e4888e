//! Record validation and best-record selection, keyed by key namespace.
//!
//! A key `/<namespace>/<rest>` is checked by the validator registered for
//! `<namespace>`. Keys without a namespace are accepted as is.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::common::DhtRecord;
use crate::{Error, Result};

/// Checks that a value is acceptable for a key.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

impl<F> Validator for F
where
    F: Fn(&[u8], &[u8]) -> Result<()> + Send + Sync + 'static,
{
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self(key, value)
    }
}

/// Picks the best of several values found for a key, returning its index.
pub trait Selector: Send + Sync + 'static {
    fn select(&self, key: &[u8], values: &[Bytes]) -> Result<usize>;
}

impl<F> Selector for F
where
    F: Fn(&[u8], &[Bytes]) -> Result<usize> + Send + Sync + 'static,
{
    fn select(&self, key: &[u8], values: &[Bytes]) -> Result<usize> {
        self(key, values)
    }
}

/// Namespace of `key`, or `None` if the key has fewer than three `/` separated parts.
fn namespace(key: &[u8]) -> Option<String> {
    let key = String::from_utf8_lossy(key);
    let parts: Vec<&str> = key.split('/').collect();

    if parts.len() < 3 {
        return None;
    }

    Some(parts[1].to_string())
}

#[derive(Clone)]
pub struct Validators {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl Validators {
    /// No validators at all: any namespaced key is rejected.
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    pub fn insert(&mut self, namespace: &str, validator: impl Validator) {
        self.validators
            .insert(namespace.to_string(), Arc::new(validator));
    }

    /// Validate `record` against the validator of its key's namespace.
    pub fn verify_record(&self, record: &DhtRecord) -> Result<()> {
        let Some(namespace) = namespace(record.key()) else {
            return Ok(());
        };

        match self.validators.get(&namespace) {
            Some(validator) => validator.validate(record.key(), record.value()),
            None => Err(Error::InvalidRecord(format!(
                "no validator available for key type \"{namespace}\""
            ))),
        }
    }
}

impl Default for Validators {
    /// The built-in validators.
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut validators = Self::empty();

        #[cfg(feature = "pk")]
        validators.insert("pk", pk::PublicKeyValidator);

        validators
    }
}

impl Debug for Validators {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.validators.keys()).finish()
    }
}

#[derive(Clone)]
pub struct Selectors {
    selectors: HashMap<String, Arc<dyn Selector>>,
}

impl Selectors {
    pub fn empty() -> Self {
        Self {
            selectors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, namespace: &str, selector: impl Selector) {
        self.selectors
            .insert(namespace.to_string(), Arc::new(selector));
    }

    /// Index of the best of `values` for `key`.
    pub fn best_record(&self, key: &[u8], values: &[Bytes]) -> Result<usize> {
        if values.is_empty() {
            return Err(Error::InvalidRecord("no records given".to_string()));
        }

        let Some(namespace) = namespace(key) else {
            return Ok(0);
        };

        let selector = self.selectors.get(&namespace).ok_or_else(|| {
            Error::InvalidRecord(format!("no selector available for key type \"{namespace}\""))
        })?;

        let index = selector.select(key, values)?;

        if index >= values.len() {
            return Err(Error::InvalidRecord(format!(
                "selector returned index {index} out of {} records",
                values.len()
            )));
        }

        Ok(index)
    }
}

impl Default for Selectors {
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut selectors = Self::empty();

        #[cfg(feature = "pk")]
        selectors.insert("pk", pk::PublicKeySelector);

        selectors
    }
}

impl Debug for Selectors {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.selectors.keys()).finish()
    }
}

#[cfg(feature = "pk")]
mod pk {
    use bytes::Bytes;
    use ed25519_dalek::VerifyingKey;

    use crate::common::PeerId;
    use crate::{Error, Result};

    const PREFIX: &[u8] = b"/pk/";

    /// `/pk/<peer id>` records hold the ed25519 public key the peer id was derived from.
    pub struct PublicKeyValidator;

    impl super::Validator for PublicKeyValidator {
        fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
            let Some(key_hash) = key.strip_prefix(PREFIX) else {
                return Err(Error::InvalidRecord(
                    "key was not prefixed with /pk/".to_string(),
                ));
            };

            let public_key: [u8; 32] = value.try_into().map_err(|_| Error::InvalidPublicKey)?;
            VerifyingKey::from_bytes(&public_key).map_err(|_| Error::InvalidPublicKey)?;

            if PeerId::from_public_key(value).as_bytes() != key_hash {
                return Err(Error::InvalidRecord(
                    "public key does not match storage key".to_string(),
                ));
            }

            Ok(())
        }
    }

    /// Every valid `/pk/` record for a key is the same key.
    pub struct PublicKeySelector;

    impl super::Selector for PublicKeySelector {
        fn select(&self, _key: &[u8], _values: &[Bytes]) -> Result<usize> {
            Ok(0)
        }
    }
}
