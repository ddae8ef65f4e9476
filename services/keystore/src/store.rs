// Copyright (C) 2024 Nicola Dardanis <nicdard@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{collections::BTreeMap, fmt, str::FromStr};

use common::{
    pkcs12::{self, KeyBag},
    Certificate, PrivateKeyDer,
};
use secrecy::{ExposeSecret, SecretString};

use crate::config::ConfigError;

/// The container format a keystore is serialized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    /// PKCS#12 (RFC 7292), the platform default.
    #[default]
    Pkcs12,
}

impl StoreType {
    pub fn name(&self) -> &'static str {
        match self {
            StoreType::Pkcs12 => "PKCS12",
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StoreType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PKCS12" | "P12" | "PFX" => Ok(StoreType::Pkcs12),
            _ => Err(ConfigError::UnknownStoreType(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("keystore alias cannot be blank")]
    BlankAlias,
    #[error("the certificate chain of `{0}` is empty")]
    EmptyChain(String),
    #[error("the {0} keystore holds no key entry")]
    Empty(StoreType),
    #[error("could not encode the {0} keystore")]
    Encoding(StoreType, #[source] common::Error),
    #[error("could not read the {0} keystore")]
    Decoding(StoreType, #[source] common::Error),
}

/// A private key with its certificate chain, leaf first.
#[derive(Debug)]
pub struct KeyEntry {
    private_key: PrivateKeyDer,
    key_password: SecretString,
    certificate_chain: Vec<Certificate>,
}

impl KeyEntry {
    pub fn private_key(&self) -> &PrivateKeyDer {
        &self.private_key
    }

    pub fn key_password(&self) -> &SecretString {
        &self.key_password
    }

    pub fn certificate_chain(&self) -> &[Certificate] {
        &self.certificate_chain
    }
}

/// An in-memory, password protected map from alias to key entry.
#[derive(Debug)]
pub struct KeyMaterialStore {
    store_type: StoreType,
    password: SecretString,
    entries: BTreeMap<String, KeyEntry>,
}

impl KeyMaterialStore {
    /// Create an empty store protected by `password`.
    pub fn new(store_type: StoreType, password: SecretString) -> Self {
        KeyMaterialStore {
            store_type,
            password,
            entries: BTreeMap::new(),
        }
    }

    /// Read a serialized store, decrypting every key entry with `key_password`.
    pub fn load(
        store_type: StoreType,
        bytes: &[u8],
        password: SecretString,
        key_password: &SecretString,
    ) -> Result<Self, StoreError> {
        let decoding = |e| StoreError::Decoding(store_type, e);
        let contents = match store_type {
            StoreType::Pkcs12 => pkcs12::decode(bytes, password.expose_secret()).map_err(decoding)?,
        };
        let mut store = KeyMaterialStore::new(store_type, password);
        for key in &contents.keys {
            let private_key = key
                .decrypt(key_password.expose_secret())
                .map_err(decoding)?;
            store.set_key_entry(
                key.alias(),
                private_key,
                key_password.clone(),
                contents.certificate_chain(key),
            )?;
        }
        log::debug!("Loaded `{}` key entries", store.len());
        Ok(store)
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    /// Insert a key entry, replacing any entry already stored under `alias`.
    pub fn set_key_entry(
        &mut self,
        alias: &str,
        private_key: PrivateKeyDer,
        key_password: SecretString,
        certificate_chain: Vec<Certificate>,
    ) -> Result<(), StoreError> {
        if alias.trim().is_empty() {
            return Err(StoreError::BlankAlias);
        }
        if certificate_chain.is_empty() {
            return Err(StoreError::EmptyChain(alias.to_string()));
        }
        self.entries.insert(
            alias.to_string(),
            KeyEntry {
                private_key,
                key_password,
                certificate_chain,
            },
        );
        Ok(())
    }

    pub fn key_entry(&self, alias: &str) -> Option<&KeyEntry> {
        self.entries.get(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &KeyEntry)> {
        self.entries.iter().map(|(alias, entry)| (alias.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the store into its container format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        if self.is_empty() {
            return Err(StoreError::Empty(self.store_type));
        }
        match self.store_type {
            StoreType::Pkcs12 => self.to_pkcs12(),
        }
    }

    /// Each key bag is sealed with its entry's key password. The certificates and
    /// the integrity MAC use the store password.
    fn to_pkcs12(&self) -> Result<Vec<u8>, StoreError> {
        let bags: Vec<KeyBag<'_>> = self
            .entries
            .iter()
            .map(|(alias, entry)| KeyBag {
                alias,
                private_key: &entry.private_key,
                key_password: entry.key_password.expose_secret(),
                certificate_chain: &entry.certificate_chain,
            })
            .collect();
        pkcs12::encode(&bags, self.password.expose_secret())
            .map_err(|e| StoreError::Encoding(self.store_type, e))
    }
}

#[cfg(test)]
mod tests {

    use common::{
        create_self_signed_certificate, find_signature_algorithm_identifier, subject_for_host,
        KeyPair,
    };
    use time::{Duration, OffsetDateTime};

    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    fn certified_key() -> (PrivateKeyDer, Certificate) {
        let key_pair = KeyPair::generate(1024).unwrap();
        let now = OffsetDateTime::now_utc();
        let certificate = create_self_signed_certificate(
            &subject_for_host("store.test").unwrap(),
            "SHA256withRSA",
            &find_signature_algorithm_identifier("SHA256withRSA").unwrap(),
            &key_pair,
            now,
            now + Duration::DAY,
        )
        .unwrap();
        (key_pair.private_key_der().unwrap(), certificate)
    }

    #[test]
    fn parse_store_types() {
        assert_eq!("pkcs12".parse::<StoreType>().unwrap(), StoreType::Pkcs12);
        assert_eq!(" PFX ".parse::<StoreType>().unwrap(), StoreType::Pkcs12);
        assert!(matches!(
            "JKS".parse::<StoreType>(),
            Err(ConfigError::UnknownStoreType(_))
        ));
        assert_eq!(StoreType::default().to_string(), "PKCS12");
    }

    #[test]
    fn set_key_entry_validates_input() {
        let (private_key, _) = certified_key();
        let mut store = KeyMaterialStore::new(StoreType::Pkcs12, secret("store"));
        assert!(matches!(
            store.set_key_entry(" ", private_key.clone(), secret("key"), vec![]),
            Err(StoreError::BlankAlias)
        ));
        assert!(matches!(
            store.set_key_entry("alias", private_key, secret("key"), vec![]),
            Err(StoreError::EmptyChain(_))
        ));
        assert!(store.is_empty());
        assert!(matches!(store.to_bytes(), Err(StoreError::Empty(_))));
    }

    #[test]
    fn pkcs12_round_trip() {
        let (private_key, certificate) = certified_key();
        let mut store = KeyMaterialStore::new(StoreType::Pkcs12, secret("store-secret"));
        store
            .set_key_entry(
                "signing",
                private_key.clone(),
                secret("key-secret"),
                vec![certificate.clone()],
            )
            .unwrap();
        assert_eq!(store.aliases().collect::<Vec<_>>(), vec!["signing"]);

        let der = store.to_bytes().unwrap();
        let loaded = KeyMaterialStore::load(
            StoreType::Pkcs12,
            &der,
            secret("store-secret"),
            &secret("key-secret"),
        )
        .unwrap();
        let entry = loaded.key_entry("signing").unwrap();
        assert_eq!(entry.certificate_chain(), &[certificate]);
        assert_eq!(entry.private_key().as_bytes(), private_key.as_bytes());
        assert!(matches!(
            KeyMaterialStore::load(
                StoreType::Pkcs12,
                &der,
                secret("wrong"),
                &secret("key-secret")
            ),
            Err(StoreError::Decoding(
                StoreType::Pkcs12,
                common::Error::IncorrectPassword(_)
            ))
        ));
    }

    #[test]
    fn key_entry_needs_its_own_password() {
        let (private_key, certificate) = certified_key();
        let mut store = KeyMaterialStore::new(StoreType::Pkcs12, secret("store-secret"));
        store
            .set_key_entry("signing", private_key, secret("key-secret"), vec![certificate])
            .unwrap();
        let der = store.to_bytes().unwrap();

        assert!(matches!(
            KeyMaterialStore::load(
                StoreType::Pkcs12,
                &der,
                secret("store-secret"),
                &secret("store-secret")
            ),
            Err(StoreError::Decoding(
                StoreType::Pkcs12,
                common::Error::IncorrectPassword(_)
            ))
        ));
    }

    #[test]
    fn every_entry_is_serialized() {
        let (first_key, first_certificate) = certified_key();
        let (second_key, second_certificate) = certified_key();
        let mut store = KeyMaterialStore::new(StoreType::Pkcs12, secret("store"));
        store
            .set_key_entry("one", first_key, secret("key"), vec![first_certificate])
            .unwrap();
        store
            .set_key_entry("two", second_key, secret("key"), vec![second_certificate.clone()])
            .unwrap();

        let der = store.to_bytes().unwrap();
        let loaded =
            KeyMaterialStore::load(StoreType::Pkcs12, &der, secret("store"), &secret("key"))
                .unwrap();
        assert_eq!(loaded.aliases().collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(
            loaded.key_entry("two").unwrap().certificate_chain(),
            &[second_certificate]
        );
    }
}
