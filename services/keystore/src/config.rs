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
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use time::Duration;

use crate::{
    report::{Event, Reporter},
    store::StoreType,
};

/// Alias used when none is configured: the name of the generator itself.
pub const DEFAULT_ALIAS: &str = "KeystoreGenerator";
pub const DEFAULT_KEY_SIZE: usize = 2048;
pub const MIN_KEY_SIZE: usize = 512;
pub const MAX_KEY_SIZE: usize = common::crypto::MAX_KEY_SIZE;
pub const DEFAULT_SIGNATURE_ALGORITHM: &str = "SHA256withRSA";
/// Twenty years.
pub const DEFAULT_EXPIRATION_PERIOD: Duration = Duration::days(20 * 365);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{0}` cannot be blank")]
    Blank(&'static str),
    #[error("unknown keystore type `{0}`")]
    UnknownStoreType(String),
    #[error("a key size of {0} bits is below the minimum of {MIN_KEY_SIZE} bits")]
    KeySizeTooSmall(usize),
    #[error("a key size of {0} bits is above the maximum of {MAX_KEY_SIZE} bits")]
    KeySizeTooLarge(usize),
    #[error("invalid period `{0}`: {1}")]
    InvalidPeriod(String, String),
}

/// What the generator is asked to produce. Blank `alias` and `store_type` are defaulted by [`resolve`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub alias: String,
    pub store_type: String,
    pub store_password: SecretString,
    pub key_password: SecretString,
    pub key_size: usize,
    pub signature_algorithm: String,
    #[serde(with = "period")]
    pub expiration_period: Duration,
    pub force_generation: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            alias: String::new(),
            store_type: String::new(),
            store_password: SecretString::new(String::new()),
            key_password: SecretString::new(String::new()),
            key_size: DEFAULT_KEY_SIZE,
            signature_algorithm: DEFAULT_SIGNATURE_ALGORITHM.to_string(),
            expiration_period: DEFAULT_EXPIRATION_PERIOD,
            force_generation: false,
        }
    }
}

/// A configuration that passed [`resolve`]: every required value is present.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    alias: String,
    store_type: StoreType,
    store_password: SecretString,
    key_password: SecretString,
    key_size: usize,
    signature_algorithm: String,
    expiration_period: Duration,
}

impl ResolvedConfig {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn store_password(&self) -> &SecretString {
        &self.store_password
    }

    pub fn key_password(&self) -> &SecretString {
        &self.key_password
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn signature_algorithm(&self) -> &str {
        &self.signature_algorithm
    }

    pub fn expiration_period(&self) -> Duration {
        self.expiration_period
    }
}

/// Whether generation was explicitly requested.
pub fn should_generate(config: &GenerationConfig) -> bool {
    config.force_generation
}

/// Fill in the alias and store type when blank, reporting each default, then check that
/// every required value is present.
pub fn resolve(
    config: &GenerationConfig,
    reporter: &dyn Reporter,
) -> Result<ResolvedConfig, ConfigError> {
    let alias = if is_blank(&config.alias) {
        reporter.report(&Event::DefaultedAlias(DEFAULT_ALIAS.to_string()));
        DEFAULT_ALIAS.to_string()
    } else {
        config.alias.clone()
    };
    let store_type = if is_blank(&config.store_type) {
        let store_type = StoreType::default();
        reporter.report(&Event::DefaultedStoreType(store_type.to_string()));
        store_type
    } else {
        config.store_type.parse()?
    };

    assert_not_blank("alias", &alias)?;
    assert_not_blank("key_password", config.key_password.expose_secret())?;
    assert_not_blank("store_password", config.store_password.expose_secret())?;
    if config.key_size < MIN_KEY_SIZE {
        return Err(ConfigError::KeySizeTooSmall(config.key_size));
    }
    if config.key_size > MAX_KEY_SIZE {
        return Err(ConfigError::KeySizeTooLarge(config.key_size));
    }

    Ok(ResolvedConfig {
        alias,
        store_type,
        store_password: config.store_password.clone(),
        key_password: config.key_password.clone(),
        key_size: config.key_size,
        signature_algorithm: config.signature_algorithm.clone(),
        expiration_period: config.expiration_period,
    })
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn assert_not_blank(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if is_blank(value) {
        Err(ConfigError::Blank(field))
    } else {
        Ok(())
    }
}

/// Where the finished keystore goes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    File {
        path: PathBuf,
        /// Suffix for the companion certificate and key file names.
        #[serde(default)]
        certificate_name_to_append: Option<String>,
        #[serde(default = "default_companion_files")]
        companion_files: bool,
    },
    Memory,
}

fn default_companion_files() -> bool {
    true
}

/// The settings read by the `main` binary.
#[derive(Debug, Deserialize)]
pub struct KeystoreSettings {
    #[serde(default)]
    pub generation: GenerationConfig,
    pub destination: Destination,
}

impl KeystoreSettings {
    /// Prefix of the environment variables overriding the configuration file,
    /// e.g. `KEYSTORE_GENERATION__KEY_SIZE=4096`.
    pub const ENV_PREFIX: &'static str = "KEYSTORE_";

    /// Load the settings from a TOML file, overridden by the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(Self::ENV_PREFIX).split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }
}

/// Signed ISO-8601 durations made of weeks, days, hours, minutes and seconds, e.g. `P365D`,
/// `PT12H` or `-P1D`. Years and months are rejected as they have no fixed length.
pub mod period {
    use serde::{Deserialize, Deserializer};
    use time::Duration;

    use super::ConfigError;

    pub fn parse(input: &str) -> Result<Duration, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPeriod(input.to_string(), reason.into());
        let text = input.trim().to_ascii_uppercase();
        let (negative, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(&text)),
        };
        let body = body
            .strip_prefix('P')
            .ok_or_else(|| invalid("expected a `P` designator"))?;

        let mut total = Duration::ZERO;
        let mut in_time = false;
        let mut components = 0;
        let mut time_components = 0;
        let mut number = String::new();
        for c in body.chars() {
            match c {
                '0'..='9' => number.push(c),
                'T' if !in_time && number.is_empty() => in_time = true,
                _ => {
                    if number.is_empty() {
                        return Err(invalid("designator without a value"));
                    }
                    let value: i64 = number.parse().map_err(|_| invalid("value out of range"))?;
                    number.clear();
                    let unit = match (in_time, c) {
                        (false, 'W') => Duration::WEEK,
                        (false, 'D') => Duration::DAY,
                        (false, 'Y') | (false, 'M') => {
                            return Err(invalid("years and months have no fixed length"))
                        }
                        (true, 'H') => Duration::HOUR,
                        (true, 'M') => Duration::MINUTE,
                        (true, 'S') => Duration::SECOND,
                        _ => return Err(invalid("unexpected designator")),
                    };
                    let seconds = unit
                        .whole_seconds()
                        .checked_mul(value)
                        .ok_or_else(|| invalid("value out of range"))?;
                    total = total
                        .checked_add(Duration::seconds(seconds))
                        .ok_or_else(|| invalid("value out of range"))?;
                    components += 1;
                    if in_time {
                        time_components += 1;
                    }
                }
            }
        }
        if !number.is_empty() {
            return Err(invalid("value without a designator"));
        }
        if components == 0 || (in_time && time_components == 0) {
            return Err(invalid("no components"));
        }
        Ok(if negative { -total } else { total })
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }
}
