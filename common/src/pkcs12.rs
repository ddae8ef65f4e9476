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

//! PKCS#12 (RFC 7292) encoding of password protected key stores.
//!
//! Every private key travels in a `pkcs8ShroudedKeyBag` encrypted under its own key
//! password. The certificates sit in a PBES2 `EncryptedData` under the store password,
//! which also keys the HMAC-SHA256 integrity MAC over the whole store.

use der::{
    asn1::{Any, BmpString, ObjectIdentifier, OctetString, SetOfVec},
    Decode, Encode, Sequence,
};
use hmac::{Hmac, Mac};
use pkcs8::{
    pkcs5::{pbes2, EncryptionScheme},
    EncryptedPrivateKeyInfo, PrivateKeyInfo,
};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::{Attribute, Attributes};
use zeroize::Zeroizing;

use crate::{
    certificate::Certificate,
    crypto::{Error, PrivateKeyDer},
};

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_ENCRYPTED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.6");
const ID_SHROUDED_KEY_BAG: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.2");
const ID_CERT_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.3");
const ID_X509_CERTIFICATE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.22.1");
const ID_FRIENDLY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.20");
const ID_LOCAL_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.21");
const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

const PFX_VERSION: u8 = 3;
const ENCRYPTED_DATA_VERSION: u8 = 0;
/// PBKDF2 and MAC iteration count.
pub const ITERATIONS: u32 = 10_000;
const SALT_LENGTH: usize = 16;

/// Diversifier of the RFC 7292 appendix B key derivation for MAC keys.
const MAC_KEY_ID: u8 = 3;
/// SHA-256 block size, the `v` of the appendix B derivation.
const SHA256_BLOCK_SIZE: usize = 64;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Sequence)]
struct Pfx {
    version: u8,
    auth_safe: ContentInfo,
    #[asn1(optional = "true")]
    mac_data: Option<MacData>,
}

#[derive(Clone, Debug, Sequence)]
struct ContentInfo {
    content_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    content: Option<Any>,
}

#[derive(Clone, Debug, Sequence)]
struct MacData {
    mac: DigestInfo,
    mac_salt: OctetString,
    #[asn1(default = "default_mac_iterations")]
    iterations: u32,
}

fn default_mac_iterations() -> u32 {
    1
}

#[derive(Clone, Debug, Sequence)]
struct DigestInfo {
    digest_algorithm: AlgorithmIdentifierOwned,
    digest: OctetString,
}

#[derive(Clone, Debug, Sequence)]
struct EncryptedData {
    version: u8,
    encrypted_content_info: EncryptedContentInfo,
}

#[derive(Clone, Debug, Sequence)]
struct EncryptedContentInfo {
    content_type: ObjectIdentifier,
    content_encryption_algorithm: AlgorithmIdentifierOwned,
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    encrypted_content: Option<OctetString>,
}

#[derive(Clone, Debug, Sequence)]
struct SafeBag {
    bag_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    bag_value: Any,
    #[asn1(optional = "true")]
    bag_attributes: Option<Attributes>,
}

#[derive(Clone, Debug, Sequence)]
struct CertBag {
    cert_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    cert_value: OctetString,
}

/// A private key entry to encode.
pub struct KeyBag<'a> {
    pub alias: &'a str,
    pub private_key: &'a PrivateKeyDer,
    pub key_password: &'a str,
    /// Leaf first.
    pub certificate_chain: &'a [Certificate],
}

/// A private key read back from a store. It stays encrypted until [`StoredKey::decrypt`].
#[derive(Debug, Clone)]
pub struct StoredKey {
    alias: String,
    local_key_id: Option<Vec<u8>>,
    encrypted: Vec<u8>,
}

impl StoredKey {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Decrypt the key with the password it was stored under.
    pub fn decrypt(&self, key_password: &str) -> Result<PrivateKeyDer, Error> {
        let info = EncryptedPrivateKeyInfo::try_from(self.encrypted.as_slice())
            .map_err(|e| Error::Pkcs12(e.to_string()))?;
        let document = info
            .decrypt(key_password.as_bytes())
            .map_err(|_| Error::IncorrectPassword(format!("key entry `{}`", self.alias)))?;
        Ok(PrivateKeyDer::from(document.as_bytes().to_vec()))
    }
}

#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub alias: Option<String>,
    local_key_id: Option<Vec<u8>>,
    pub certificate: Certificate,
}

/// Everything a store holds once its MAC has been checked.
#[derive(Debug, Clone, Default)]
pub struct Pkcs12Contents {
    pub keys: Vec<StoredKey>,
    pub certificates: Vec<StoredCertificate>,
}

impl Pkcs12Contents {
    /// The certificate paired with `key` through its local key id, followed by every
    /// certificate that is not paired with any key.
    pub fn certificate_chain(&self, key: &StoredKey) -> Vec<Certificate> {
        let leaf = self
            .certificates
            .iter()
            .filter(|stored| {
                stored.local_key_id.is_some() && stored.local_key_id == key.local_key_id
            });
        let issuers = self
            .certificates
            .iter()
            .filter(|stored| stored.local_key_id.is_none());
        leaf.chain(issuers)
            .map(|stored| stored.certificate.clone())
            .collect()
    }
}

/// Encode `entries` into a PKCS#12 store protected by `store_password`.
pub fn encode(entries: &[KeyBag<'_>], store_password: &str) -> Result<Vec<u8>, Error> {
    let mut key_bags = Vec::with_capacity(entries.len());
    let mut cert_bags = Vec::new();
    for entry in entries {
        let (leaf, issuers) = entry.certificate_chain.split_first().ok_or_else(|| {
            Error::Pkcs12(format!("the certificate chain of `{}` is empty", entry.alias))
        })?;
        let local_key_id = Sha1::digest(leaf.der()).to_vec();
        let attributes = bag_attributes(entry.alias, &local_key_id)?;

        key_bags.push(shrouded_key_bag(entry, attributes.clone())?);
        cert_bags.push(cert_bag(leaf, Some(attributes))?);
        for issuer in issuers {
            cert_bags.push(cert_bag(issuer, None)?);
        }
    }
    log::debug!(
        "Encoding `{}` key and `{}` certificate bags",
        key_bags.len(),
        cert_bags.len()
    );

    let authenticated_safe = vec![
        encrypted_content_info(&cert_bags.to_der()?, store_password)?,
        data_content_info(key_bags.to_der()?)?,
    ];
    let auth_safe_content = authenticated_safe.to_der()?;

    let mac_salt: [u8; SALT_LENGTH] = rand::thread_rng().gen();
    let mac = hmac_sha256(store_password, &mac_salt, ITERATIONS, &auth_safe_content)?;
    let pfx = Pfx {
        version: PFX_VERSION,
        auth_safe: data_content_info(auth_safe_content)?,
        mac_data: Some(MacData {
            mac: DigestInfo {
                digest_algorithm: AlgorithmIdentifierOwned {
                    oid: ID_SHA256,
                    parameters: Some(Any::null()),
                },
                digest: OctetString::new(mac)?,
            },
            mac_salt: OctetString::new(mac_salt.to_vec())?,
            iterations: ITERATIONS,
        }),
    };
    Ok(pfx.to_der()?)
}

/// Check the MAC of a PKCS#12 store with `store_password` and read its bags.
/// Private keys are returned still encrypted.
pub fn decode(der: &[u8], store_password: &str) -> Result<Pkcs12Contents, Error> {
    let pfx = Pfx::from_der(der).map_err(|e| Error::Pkcs12(e.to_string()))?;
    if pfx.version != PFX_VERSION {
        return Err(Error::Pkcs12(format!("unsupported version `{}`", pfx.version)));
    }
    let auth_safe_content = data_content(&pfx.auth_safe)?;
    let mac_data = pfx
        .mac_data
        .ok_or_else(|| Error::Pkcs12("the store has no integrity MAC".to_string()))?;
    verify_mac(&mac_data, store_password, &auth_safe_content)?;

    let authenticated_safe = Vec::<ContentInfo>::from_der(&auth_safe_content)
        .map_err(|e| Error::Pkcs12(e.to_string()))?;
    let mut contents = Pkcs12Contents::default();
    for content_info in &authenticated_safe {
        let safe_contents = if content_info.content_type == ID_DATA {
            data_content(content_info)?
        } else if content_info.content_type == ID_ENCRYPTED_DATA {
            decrypt_content(content_info, store_password)?
        } else {
            return Err(Error::Pkcs12(format!(
                "unsupported content type `{}`",
                content_info.content_type
            )));
        };
        let bags = Vec::<SafeBag>::from_der(&safe_contents)
            .map_err(|e| Error::Pkcs12(e.to_string()))?;
        for bag in bags {
            read_bag(bag, &mut contents)?;
        }
    }
    Ok(contents)
}

fn read_bag(bag: SafeBag, contents: &mut Pkcs12Contents) -> Result<(), Error> {
    let (alias, local_key_id) = read_attributes(bag.bag_attributes.as_ref())?;
    if bag.bag_id == ID_SHROUDED_KEY_BAG {
        let alias = alias.ok_or_else(|| Error::Pkcs12("key bag without a name".to_string()))?;
        contents.keys.push(StoredKey {
            alias,
            local_key_id,
            encrypted: bag.bag_value.to_der()?,
        });
    } else if bag.bag_id == ID_CERT_BAG {
        let cert_bag = decode_any::<CertBag>(&bag.bag_value)?;
        if cert_bag.cert_id != ID_X509_CERTIFICATE {
            return Err(Error::Pkcs12(format!(
                "unsupported certificate type `{}`",
                cert_bag.cert_id
            )));
        }
        contents.certificates.push(StoredCertificate {
            alias,
            local_key_id,
            certificate: Certificate::from_der(cert_bag.cert_value.into_bytes())?,
        });
    } else {
        log::debug!("Ignoring bag of type `{}`", bag.bag_id);
    }
    Ok(())
}

fn bag_attributes(alias: &str, local_key_id: &[u8]) -> Result<Attributes, Error> {
    let friendly_name = Attribute {
        oid: ID_FRIENDLY_NAME,
        values: SetOfVec::try_from(vec![Any::encode_from(&BmpString::from_utf8(alias)?)?])?,
    };
    let local_key_id = Attribute {
        oid: ID_LOCAL_KEY_ID,
        values: SetOfVec::try_from(vec![Any::encode_from(&OctetString::new(local_key_id)?)?])?,
    };
    Ok(SetOfVec::try_from(vec![friendly_name, local_key_id])?)
}

type BagAttributes = (Option<String>, Option<Vec<u8>>);

fn read_attributes(attributes: Option<&Attributes>) -> Result<BagAttributes, Error> {
    let mut alias = None;
    let mut local_key_id = None;
    for attribute in attributes.into_iter().flat_map(|attributes| attributes.iter()) {
        let Some(value) = attribute.values.get(0) else {
            continue;
        };
        if attribute.oid == ID_FRIENDLY_NAME {
            alias = Some(value.decode_as::<BmpString>()?.to_string());
        } else if attribute.oid == ID_LOCAL_KEY_ID {
            local_key_id = Some(value.decode_as::<OctetString>()?.into_bytes());
        }
    }
    Ok((alias, local_key_id))
}

fn shrouded_key_bag(entry: &KeyBag<'_>, attributes: Attributes) -> Result<SafeBag, Error> {
    let info = PrivateKeyInfo::try_from(entry.private_key.as_bytes())
        .map_err(|e| Error::KeyEncoding(e.to_string()))?;
    let (salt, iv) = salt_and_iv();
    let parameters = pbes2::Parameters::pbkdf2_sha256_aes256cbc(ITERATIONS, &salt, &iv)
        .map_err(|e| Error::Pkcs12(e.to_string()))?;
    let encrypted = info
        .encrypt_with_params(parameters, entry.key_password.as_bytes())
        .map_err(|e| Error::KeyEncoding(e.to_string()))?;
    Ok(SafeBag {
        bag_id: ID_SHROUDED_KEY_BAG,
        bag_value: Any::from_der(encrypted.as_bytes())?,
        bag_attributes: Some(attributes),
    })
}

fn cert_bag(certificate: &Certificate, attributes: Option<Attributes>) -> Result<SafeBag, Error> {
    let bag = CertBag {
        cert_id: ID_X509_CERTIFICATE,
        cert_value: OctetString::new(certificate.der())?,
    };
    Ok(SafeBag {
        bag_id: ID_CERT_BAG,
        bag_value: Any::encode_from(&bag)?,
        bag_attributes: attributes,
    })
}

fn data_content_info(content: Vec<u8>) -> Result<ContentInfo, Error> {
    Ok(ContentInfo {
        content_type: ID_DATA,
        content: Some(Any::encode_from(&OctetString::new(content)?)?),
    })
}

fn data_content(content_info: &ContentInfo) -> Result<Vec<u8>, Error> {
    if content_info.content_type != ID_DATA {
        return Err(Error::Pkcs12(format!(
            "expected data content, found `{}`",
            content_info.content_type
        )));
    }
    let content = content_info
        .content
        .as_ref()
        .ok_or_else(|| Error::Pkcs12("data content is missing".to_string()))?;
    Ok(content.decode_as::<OctetString>()?.into_bytes())
}

fn encrypted_content_info(plaintext: &[u8], password: &str) -> Result<ContentInfo, Error> {
    let (salt, iv) = salt_and_iv();
    let parameters = pbes2::Parameters::pbkdf2_sha256_aes256cbc(ITERATIONS, &salt, &iv)
        .map_err(|e| Error::Pkcs12(e.to_string()))?;
    let ciphertext = parameters
        .encrypt(password.as_bytes(), plaintext)
        .map_err(|e| Error::Pkcs12(e.to_string()))?;
    let algorithm = EncryptionScheme::from(parameters).to_der()?;
    let encrypted_data = EncryptedData {
        version: ENCRYPTED_DATA_VERSION,
        encrypted_content_info: EncryptedContentInfo {
            content_type: ID_DATA,
            content_encryption_algorithm: AlgorithmIdentifierOwned::from_der(&algorithm)?,
            encrypted_content: Some(OctetString::new(ciphertext)?),
        },
    };
    Ok(ContentInfo {
        content_type: ID_ENCRYPTED_DATA,
        content: Some(Any::encode_from(&encrypted_data)?),
    })
}

fn decrypt_content(content_info: &ContentInfo, password: &str) -> Result<Vec<u8>, Error> {
    let content = content_info
        .content
        .as_ref()
        .ok_or_else(|| Error::Pkcs12("encrypted content is missing".to_string()))?;
    let encrypted = decode_any::<EncryptedData>(content)?.encrypted_content_info;
    let ciphertext = encrypted
        .encrypted_content
        .ok_or_else(|| Error::Pkcs12("encrypted content is missing".to_string()))?;
    let algorithm = encrypted.content_encryption_algorithm.to_der()?;
    let scheme = EncryptionScheme::from_der(&algorithm).map_err(|e| Error::Pkcs12(e.to_string()))?;
    scheme
        .decrypt(password.as_bytes(), ciphertext.as_bytes())
        .map_err(|_| Error::IncorrectPassword("keystore".to_string()))
}

fn decode_any<T>(value: &Any) -> Result<T, Error>
where
    T: for<'a> Decode<'a>,
{
    T::from_der(&value.to_der()?).map_err(|e| Error::Pkcs12(e.to_string()))
}

fn salt_and_iv() -> ([u8; SALT_LENGTH], [u8; 16]) {
    let mut rng = rand::thread_rng();
    (rng.gen(), rng.gen())
}

fn verify_mac(mac_data: &MacData, password: &str, content: &[u8]) -> Result<(), Error> {
    let algorithm = &mac_data.mac.digest_algorithm.oid;
    if *algorithm != ID_SHA256 {
        return Err(Error::Pkcs12(format!("unsupported MAC digest `{}`", algorithm)));
    }
    let mut mac = mac_for(password, mac_data.mac_salt.as_bytes(), mac_data.iterations)?;
    mac.update(content);
    mac.verify_slice(mac_data.mac.digest.as_bytes())
        .map_err(|_| Error::IncorrectPassword("keystore".to_string()))
}

fn hmac_sha256(
    password: &str,
    salt: &[u8],
    iterations: u32,
    content: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut mac = mac_for(password, salt, iterations)?;
    mac.update(content);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_for(password: &str, salt: &[u8], iterations: u32) -> Result<HmacSha256, Error> {
    let key = derive_mac_key(password, salt, iterations)?;
    <HmacSha256 as Mac>::new_from_slice(&key).map_err(|e| Error::Pkcs12(e.to_string()))
}

/// RFC 7292 appendix B.2 key derivation, for a key as long as one SHA-256 output.
fn derive_mac_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    // The password is a null terminated BMPString.
    let mut password = Zeroizing::new(BmpString::from_utf8(password)?.into_bytes().into_vec());
    password.extend_from_slice(&[0, 0]);

    let mut input = Zeroizing::new(Vec::new());
    input.extend_from_slice(&fill_blocks(salt));
    input.extend_from_slice(&fill_blocks(&password));

    let mut digest = Sha256::new()
        .chain_update([MAC_KEY_ID; SHA256_BLOCK_SIZE])
        .chain_update(input.as_slice())
        .finalize();
    for _ in 1..iterations {
        digest = Sha256::digest(digest);
    }
    Ok(Zeroizing::new(digest.to_vec()))
}

/// Repeat `bytes` up to the next multiple of the block size.
fn fill_blocks(bytes: &[u8]) -> Zeroizing<Vec<u8>> {
    let length = bytes.len().div_ceil(SHA256_BLOCK_SIZE) * SHA256_BLOCK_SIZE;
    Zeroizing::new(bytes.iter().cycle().take(length).copied().collect())
}
