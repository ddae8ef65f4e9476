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

//! Generate a password protected keystore holding a fresh RSA key pair and its
//! self-signed certificate.

use std::{fmt, sync::Arc};

use common::{
    create_self_signed_certificate, find_signature_algorithm_identifier, subject_for_host,
    Certificate, KeyPair,
};
use time::{Duration, OffsetDateTime};

use crate::{
    config::{ConfigError, GenerationConfig},
    report::{Event, LogReporter, Reporter},
    store::{KeyMaterialStore, StoreError},
    writer::{KeystoreWriter, WriteError},
};

pub mod config;
pub mod report;
pub mod store;
pub mod writer;

/// Host name used in the certificate subject when the local one cannot be read.
const FALLBACK_HOST_NAME: &str = "localhost";

/// The step a generation run was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStage {
    Validating,
    KeyGeneration,
    CertificateForging,
    Storing,
}

impl fmt::Display for GenerationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GenerationStage::Validating => "validating the configuration",
            GenerationStage::KeyGeneration => "generating the key pair",
            GenerationStage::CertificateForging => "creating the certificate",
            GenerationStage::Storing => "storing the keystore",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationCause {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Crypto(#[from] common::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// The only error returned by [`KeystoreGenerator::generate`].
#[derive(Debug, thiserror::Error)]
#[error("Could not create keystore while {stage}")]
pub struct GenerationError {
    stage: GenerationStage,
    #[source]
    cause: GenerationCause,
}

impl GenerationError {
    fn new(stage: GenerationStage, cause: impl Into<GenerationCause>) -> Self {
        GenerationError {
            stage,
            cause: cause.into(),
        }
    }

    pub fn stage(&self) -> GenerationStage {
        self.stage
    }

    pub fn cause(&self) -> &GenerationCause {
        &self.cause
    }
}

/// What a successful run wrote.
#[derive(Debug, Clone)]
pub struct GeneratedKeystore {
    pub alias: String,
    pub destination: String,
    pub certificate: Certificate,
}

#[derive(Debug)]
pub enum Generation {
    /// The destination already holds a keystore and generation was not forced.
    Skipped,
    Stored(GeneratedKeystore),
}

/// Creates a keystore from a [`GenerationConfig`] and hands it to a [`KeystoreWriter`].
pub struct KeystoreGenerator {
    config: GenerationConfig,
    writer: Box<dyn KeystoreWriter>,
    reporter: Arc<dyn Reporter>,
    host_name: Option<String>,
}

impl KeystoreGenerator {
    pub fn new(config: GenerationConfig, writer: Box<dyn KeystoreWriter>) -> Self {
        KeystoreGenerator {
            config,
            writer,
            reporter: Arc::new(LogReporter),
            host_name: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Use `host_name` in the certificate subject instead of the local host name.
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generation is forced or nothing has been written to the destination yet.
    ///
    /// A writer that has never stored anything, such as a fresh
    /// [`MemoryKeystoreWriter`](writer::MemoryKeystoreWriter), always reports a missing
    /// destination, so the first call returns `true` even when generation is not forced.
    pub fn should_generate(&self) -> bool {
        config::should_generate(&self.config) || !self.writer.exists()
    }

    /// Run [`generate`](Self::generate) only when [`should_generate`](Self::should_generate) holds.
    pub fn generate_if_needed(&self) -> Result<Generation, GenerationError> {
        if self.should_generate() {
            self.generate().map(Generation::Stored)
        } else {
            log::debug!(
                "Keystore `{}` already exists, skipping generation",
                self.writer.destination()
            );
            Ok(Generation::Skipped)
        }
    }

    pub fn generate(&self) -> Result<GeneratedKeystore, GenerationError> {
        use GenerationStage::*;

        log::debug!("Validating keystore configuration");
        let config = config::resolve(&self.config, self.reporter.as_ref())
            .map_err(|e| GenerationError::new(Validating, e))?;
        let mut store =
            KeyMaterialStore::new(config.store_type(), config.store_password().clone());

        let key_pair = KeyPair::generate(config.key_size())
            .map_err(|e| GenerationError::new(KeyGeneration, e))?;
        log::debug!("Generated a `{}` bits RSA key pair", config.key_size());

        let certificate = self
            .create_certificate(
                &key_pair,
                config.signature_algorithm(),
                config.expiration_period(),
            )
            .map_err(|e| GenerationError::new(CertificateForging, e))?;
        log::debug!("Created self-signed certificate");

        let private_key = key_pair
            .private_key_der()
            .map_err(|e| GenerationError::new(Storing, e))?;
        store
            .set_key_entry(
                config.alias(),
                private_key,
                config.key_password().clone(),
                vec![certificate.clone()],
            )
            .map_err(|e| GenerationError::new(Storing, e))?;
        let entry = store
            .key_entry(config.alias())
            .ok_or_else(|| GenerationError::new(Storing, WriteError::MissingEntry))?;
        self.writer
            .store(&store, &certificate, entry.private_key())
            .map_err(|e| GenerationError::new(Storing, e))?;

        let alias = store
            .aliases()
            .next()
            .ok_or_else(|| {
                GenerationError::new(Storing, StoreError::Empty(store.store_type()))
            })?
            .to_string();
        let destination = self.writer.destination();
        log::debug!("Stored keystore `{}`", destination);
        self.reporter.report(&Event::Created {
            destination: destination.clone(),
            alias: alias.clone(),
        });
        Ok(GeneratedKeystore {
            alias,
            destination,
            certificate,
        })
    }

    /// Certificate valid from one second ago for `period`, issued to the host.
    fn create_certificate(
        &self,
        key_pair: &KeyPair,
        signature_algorithm: &str,
        period: Duration,
    ) -> Result<Certificate, common::Error> {
        let identifier = find_signature_algorithm_identifier(signature_algorithm)?;
        let subject = subject_for_host(&self.host_name())?;
        let now = OffsetDateTime::now_utc();
        let not_before = now.replace_nanosecond(0).unwrap_or(now) - Duration::SECOND;
        let not_after = not_before.checked_add(period).ok_or_else(|| {
            common::Error::InvalidValidity(format!(
                "`{}` plus `{}` is out of range",
                not_before, period
            ))
        })?;
        create_self_signed_certificate(
            &subject,
            signature_algorithm,
            &identifier,
            key_pair,
            not_before,
            not_after,
        )
    }

    fn host_name(&self) -> String {
        match &self.host_name {
            Some(host_name) => host_name.clone(),
            None => local_host_name(),
        }
    }
}

/// The name of the local host, or `localhost` when it cannot be read.
pub fn local_host_name() -> String {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_HOST_NAME.to_string())
}

#[cfg(test)]
mod tests {

    use std::error::Error;

    use secrecy::SecretString;

    use super::*;
    use crate::{report::CollectingReporter, writer::MemoryKeystoreWriter};

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> GenerationConfig {
        GenerationConfig {
            store_password: SecretString::new("store-secret".to_string()),
            key_password: SecretString::new("key-secret".to_string()),
            key_size: 1024,
            expiration_period: Duration::days(365),
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn generate_into_memory() {
        setup();
        let writer = MemoryKeystoreWriter::new();
        let reporter = Arc::new(CollectingReporter::new());
        let generator = KeystoreGenerator::new(config(), Box::new(writer.clone()))
            .with_reporter(reporter.clone())
            .with_host_name("idp.example.org");

        let generated = generator.generate().unwrap();
        assert_eq!(generated.alias, config::DEFAULT_ALIAS);
        assert_eq!(generated.destination, "memory");
        assert!(writer.contents().is_some());
        assert_eq!(
            reporter.events().last(),
            Some(&Event::Created {
                destination: "memory".to_string(),
                alias: config::DEFAULT_ALIAS.to_string(),
            })
        );
        let parsed = generated.certificate.parse().unwrap();
        assert_eq!(parsed.subject().to_string(), "CN=idp.example.org");
    }

    #[test]
    fn validity_starts_one_second_ago() {
        let generator = KeystoreGenerator::new(config(), Box::new(MemoryKeystoreWriter::new()));
        let before = OffsetDateTime::now_utc().unix_timestamp();
        let generated = generator.generate().unwrap();
        let after = OffsetDateTime::now_utc().unix_timestamp();

        let parsed = generated.certificate.parse().unwrap();
        let not_before = parsed.validity().not_before.timestamp();
        assert!(not_before >= before - 1 && not_before <= after - 1);
        assert_eq!(
            parsed.validity().not_after.timestamp() - not_before,
            Duration::days(365).whole_seconds()
        );
    }

    #[test]
    fn failures_carry_their_stage() {
        let generator = KeystoreGenerator::new(
            GenerationConfig {
                key_password: SecretString::new(String::new()),
                ..config()
            },
            Box::new(MemoryKeystoreWriter::new()),
        );
        let error = generator.generate().unwrap_err();
        assert_eq!(error.stage(), GenerationStage::Validating);
        assert!(matches!(error.cause(), GenerationCause::Config(_)));
        assert!(error.source().is_some());
        assert_eq!(
            error.to_string(),
            "Could not create keystore while validating the configuration"
        );

        let generator = KeystoreGenerator::new(
            GenerationConfig {
                signature_algorithm: "MD5withRSA".to_string(),
                ..config()
            },
            Box::new(MemoryKeystoreWriter::new()),
        );
        let error = generator.generate().unwrap_err();
        assert_eq!(error.stage(), GenerationStage::CertificateForging);
        assert!(matches!(
            error.cause(),
            GenerationCause::Crypto(common::Error::UnsupportedSignatureAlgorithm(_))
        ));
    }

    #[test]
    fn out_of_range_period_is_rejected() {
        let generator = KeystoreGenerator::new(
            GenerationConfig {
                expiration_period: Duration::days(365 * 10_000),
                ..config()
            },
            Box::new(MemoryKeystoreWriter::new()),
        );
        let error = generator.generate().unwrap_err();
        assert_eq!(error.stage(), GenerationStage::CertificateForging);
    }

    #[test]
    fn generate_if_needed_skips_existing_keystores() {
        let writer = MemoryKeystoreWriter::new();
        let generator = KeystoreGenerator::new(config(), Box::new(writer.clone()));
        assert!(!config::should_generate(generator.config()));
        assert!(!writer.exists());
        assert!(generator.should_generate());
        assert!(matches!(
            generator.generate_if_needed().unwrap(),
            Generation::Stored(_)
        ));
        assert!(!generator.should_generate());
        assert!(matches!(
            generator.generate_if_needed().unwrap(),
            Generation::Skipped
        ));

        let forced = KeystoreGenerator::new(
            GenerationConfig {
                force_generation: true,
                ..config()
            },
            Box::new(writer),
        );
        assert!(forced.should_generate());
    }

    #[test]
    fn local_host_name_is_never_blank() {
        assert!(!local_host_name().trim().is_empty());
    }
}
