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
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use common::{Certificate, PrivateKeyDer};
use secrecy::ExposeSecret;
use tempfile::{NamedTempFile, TempPath};

use crate::{
    config::Destination,
    store::{KeyMaterialStore, StoreError},
};

/// Prefix of the companion certificate and key files written next to a keystore file.
pub const CERTIFICATES_PREFIX: &str = "signing-cert";

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not write `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encrypt the private key")]
    KeyEncryption(#[source] common::Error),
    #[error("the keystore does not hold the certificate to write")]
    MissingEntry,
    #[error("the in-memory keystore sink is poisoned")]
    Poisoned,
}

/// Persists a finished keystore. Implementations only do the physical write.
pub trait KeystoreWriter {
    /// Identifies where the keystore is written, for diagnostics.
    fn destination(&self) -> String;

    /// Whether the destination already holds a keystore. A destination that was never
    /// written to reports `false`, so a fresh writer always lets generation run.
    fn exists(&self) -> bool {
        false
    }

    fn store(
        &self,
        store: &KeyMaterialStore,
        certificate: &Certificate,
        private_key: &PrivateKeyDer,
    ) -> Result<(), WriteError>;
}

/// Build the writer for a configured destination.
pub fn writer_for(destination: &Destination) -> Box<dyn KeystoreWriter> {
    match destination {
        Destination::File {
            path,
            certificate_name_to_append,
            companion_files,
        } => {
            let writer = FileKeystoreWriter::new(path)
                .with_certificate_name(certificate_name_to_append.clone());
            if *companion_files {
                Box::new(writer)
            } else {
                Box::new(writer.without_companion_files())
            }
        }
        Destination::Memory => Box::new(MemoryKeystoreWriter::new()),
    }
}

/// Write the keystore to a file, with the certificate (DER and PEM) and the encrypted
/// private key next to it.
///
/// Every file is first written to a temporary file in the target directory. Once all of
/// them are complete they are renamed into place, companions first and the keystore last.
/// If a rename fails, the files already installed are rolled back to what they replaced.
#[derive(Debug, Clone)]
pub struct FileKeystoreWriter {
    path: PathBuf,
    certificate_name_to_append: Option<String>,
    companion_files: bool,
}

impl FileKeystoreWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileKeystoreWriter {
            path: path.into(),
            certificate_name_to_append: None,
            companion_files: true,
        }
    }

    pub fn with_certificate_name(mut self, name: Option<String>) -> Self {
        self.certificate_name_to_append = name;
        self
    }

    pub fn without_companion_files(mut self) -> Self {
        self.companion_files = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn output_directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn certificate_name(&self) -> String {
        match self.certificate_name_to_append.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("{}-{}", CERTIFICATES_PREFIX, name),
            _ => CERTIFICATES_PREFIX.to_string(),
        }
    }

    /// The DER encoded certificate.
    pub fn binary_certificate_path(&self) -> PathBuf {
        self.output_directory()
            .join(format!("{}.crt", self.certificate_name()))
    }

    /// The PEM encoded certificate.
    pub fn pem_certificate_path(&self) -> PathBuf {
        self.output_directory()
            .join(format!("{}.pem", self.certificate_name()))
    }

    /// The private key, encrypted with the key password.
    pub fn private_key_path(&self) -> PathBuf {
        self.output_directory()
            .join(format!("{}.key", self.certificate_name()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `contents` to a temporary file in `directory`.
fn stage(directory: &Path, contents: &[u8]) -> Result<NamedTempFile, WriteError> {
    let mut file = NamedTempFile::new_in(directory).map_err(io_error(directory))?;
    file.write_all(contents).map_err(io_error(file.path()))?;
    file.as_file().sync_all().map_err(io_error(file.path()))?;
    Ok(file)
}

/// A file renamed into place, with the file it replaced.
struct Installed {
    target: PathBuf,
    backup: Option<TempPath>,
}

impl Installed {
    fn roll_back(self) {
        let restored = match self.backup {
            Some(backup) => backup.persist(&self.target).map_err(|e| e.error),
            None => fs::remove_file(&self.target),
        };
        match restored {
            Ok(()) => log::debug!("Rolled back `{}`", self.target.display()),
            Err(e) => log::warn!("Could not roll back `{}`: {}", self.target.display(), e),
        }
    }
}

/// Rename `file` onto `target`, moving any existing file aside first.
fn install(file: NamedTempFile, target: &Path, directory: &Path) -> Result<Installed, WriteError> {
    let backup = if target.is_file() {
        let backup = NamedTempFile::new_in(directory)
            .map_err(io_error(directory))?
            .into_temp_path();
        fs::rename(target, &backup).map_err(io_error(target))?;
        Some(backup)
    } else {
        None
    };
    match file.persist(target) {
        Ok(_) => Ok(Installed {
            target: target.to_path_buf(),
            backup,
        }),
        Err(e) => {
            if let Some(backup) = backup {
                Installed {
                    target: target.to_path_buf(),
                    backup: Some(backup),
                }
                .roll_back();
            }
            Err(WriteError::Io {
                path: target.to_path_buf(),
                source: e.error,
            })
        }
    }
}

impl KeystoreWriter for FileKeystoreWriter {
    fn destination(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn store(
        &self,
        store: &KeyMaterialStore,
        certificate: &Certificate,
        private_key: &PrivateKeyDer,
    ) -> Result<(), WriteError> {
        let directory = self.output_directory();
        fs::create_dir_all(&directory).map_err(io_error(&directory))?;

        let mut staged = Vec::new();
        if self.companion_files {
            let (_, entry) = store
                .entries()
                .find(|(_, entry)| entry.certificate_chain().first() == Some(certificate))
                .ok_or(WriteError::MissingEntry)?;
            let key_pem = private_key
                .to_encrypted_pem(entry.key_password().expose_secret())
                .map_err(WriteError::KeyEncryption)?;
            staged.push((
                stage(&directory, certificate.der())?,
                self.binary_certificate_path(),
            ));
            staged.push((
                stage(&directory, certificate.pem().as_bytes())?,
                self.pem_certificate_path(),
            ));
            staged.push((stage(&directory, key_pem.as_bytes())?, self.private_key_path()));
        }
        // Last, so that `exists` only holds once everything is in place.
        staged.push((stage(&directory, &store.to_bytes()?)?, self.path.clone()));

        let mut installed: Vec<Installed> = Vec::with_capacity(staged.len());
        for (file, target) in staged {
            match install(file, &target, &directory) {
                Ok(done) => {
                    log::debug!("Wrote `{}`", target.display());
                    installed.push(done);
                }
                Err(e) => {
                    for done in installed.into_iter().rev() {
                        done.roll_back();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Write the keystore into a shared in-memory buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeystoreWriter {
    sink: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryKeystoreWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The serialized keystore, once written.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.sink.lock().ok().and_then(|sink| sink.clone())
    }
}

impl KeystoreWriter for MemoryKeystoreWriter {
    fn destination(&self) -> String {
        "memory".to_string()
    }

    fn exists(&self) -> bool {
        self.contents().is_some()
    }

    fn store(
        &self,
        store: &KeyMaterialStore,
        _certificate: &Certificate,
        _private_key: &PrivateKeyDer,
    ) -> Result<(), WriteError> {
        let bytes = store.to_bytes()?;
        let mut sink = self.sink.lock().map_err(|_| WriteError::Poisoned)?;
        *sink = Some(bytes);
        Ok(())
    }
}
