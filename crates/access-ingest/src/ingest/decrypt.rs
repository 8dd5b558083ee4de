//! Decryption of the encoded `userid` query parameter.
//!
//! The client encrypts the user id with the RSA public key (PKCS#1 v1.5),
//! base64-encodes the ciphertext, then url-safe base64-encodes that text for
//! the query string. Decoding runs the same layers in reverse.

use std::path::Path;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

use crate::errors::{DecryptionError, IngestError, IngestResult};

/// Trailing `=` is often stripped from the outer layer, so padding is
/// optional on decode.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Holds the private key for the lifetime of a run.
pub struct FieldDecryptor {
    key: RsaPrivateKey,
}

impl FieldDecryptor {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Parse an unencrypted PEM private key. Both `BEGIN PRIVATE KEY`
    /// (PKCS#8) and `BEGIN RSA PRIVATE KEY` (PKCS#1) are accepted.
    pub fn from_pem(pem: &str) -> IngestResult<Self> {
        let key = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(pkcs8_err) => RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                IngestError::Key(format!(
                    "not a PKCS#8 ({pkcs8_err}) or PKCS#1 ({pkcs1_err}) RSA key"
                ))
            })?,
        };
        Ok(Self::new(key))
    }

    pub fn from_pem_file(path: &Path) -> IngestResult<Self> {
        let pem = std::fs::read_to_string(path)?;
        let decryptor = Self::from_pem(&pem)?;
        tracing::debug!(
            "loaded {}-bit RSA key from {}",
            decryptor.key.size() * 8,
            path.display()
        );
        Ok(decryptor)
    }

    /// Decode and decrypt one encoded field value.
    pub fn decrypt(&self, encoded: &str) -> Result<String, DecryptionError> {
        let outer = URL_SAFE_LENIENT
            .decode(encoded.trim_end_matches('='))
            .map_err(DecryptionError::OuterBase64)?;
        let inner: Vec<u8> = outer
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let ciphertext = STANDARD_LENIENT
            .decode(inner)
            .map_err(DecryptionError::InnerBase64)?;
        let plaintext = self.key.decrypt(Pkcs1v15Encrypt, &ciphertext)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

impl std::fmt::Debug for FieldDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDecryptor")
            .field("key_bits", &(self.key.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Key and encoder shared by tests in this crate.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::OnceLock;

    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;
    use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

    use super::FieldDecryptor;

    pub(crate) fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test key")
        })
    }

    pub(crate) fn test_decryptor() -> FieldDecryptor {
        FieldDecryptor::new(test_key().clone())
    }

    /// Encrypt and encode `plaintext` the way the client does.
    pub(crate) fn encode_bytes(plaintext: &[u8]) -> String {
        let public = RsaPublicKey::from(test_key());
        let ciphertext = public
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext)
            .expect("encrypt");
        URL_SAFE_NO_PAD.encode(STANDARD.encode(ciphertext))
    }

    pub(crate) fn encode_field(plaintext: &str) -> String {
        encode_bytes(plaintext.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    use super::testing::{encode_bytes, encode_field, test_decryptor, test_key};
    use super::*;

    #[test]
    fn decrypt_round_trip() {
        let decryptor = test_decryptor();
        let encoded = encode_field("user-1234@example.com");
        assert_eq!(decryptor.decrypt(&encoded).unwrap(), "user-1234@example.com");
    }

    #[test]
    fn decrypt_accepts_padded_outer_layer() {
        let decryptor = test_decryptor();
        let public = rsa::RsaPublicKey::from(test_key());
        let ciphertext = public
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, b"padded")
            .unwrap();
        let encoded = URL_SAFE.encode(STANDARD.encode(ciphertext));
        assert_eq!(decryptor.decrypt(&encoded).unwrap(), "padded");
        // A surplus `=` as appended by older tooling is tolerated too.
        assert_eq!(decryptor.decrypt(&format!("{encoded}=")).unwrap(), "padded");
    }

    #[test]
    fn decrypt_garbage_base64() {
        let err = test_decryptor().decrypt("not*base64!").unwrap_err();
        assert!(matches!(err, DecryptionError::OuterBase64(_)), "{err}");
    }

    #[test]
    fn decrypt_inner_layer_not_base64() {
        // Valid outer layer wrapping bytes that are not base64 text.
        let encoded = URL_SAFE.encode([0xffu8, 0x00, 0x7f]);
        let err = test_decryptor().decrypt(&encoded).unwrap_err();
        assert!(matches!(err, DecryptionError::InnerBase64(_)), "{err}");
    }

    #[test]
    fn decrypt_wrong_ciphertext_size() {
        let encoded = URL_SAFE.encode(STANDARD.encode(b"short"));
        let err = test_decryptor().decrypt(&encoded).unwrap_err();
        assert!(matches!(err, DecryptionError::Rsa(_)), "{err}");
    }

    #[test]
    fn decrypt_non_utf8_plaintext() {
        let encoded = encode_bytes(&[0xff, 0xfe, 0xfd]);
        let err = test_decryptor().decrypt(&encoded).unwrap_err();
        assert!(matches!(err, DecryptionError::Utf8(_)), "{err}");
    }

    #[test]
    fn from_pem_accepts_pkcs8() {
        let pem = test_key().to_pkcs8_pem(LineEnding::LF).unwrap();
        let decryptor = FieldDecryptor::from_pem(&pem).unwrap();
        let encoded = encode_field("from-pem");
        assert_eq!(decryptor.decrypt(&encoded).unwrap(), "from-pem");
    }

    #[test]
    fn from_pem_file_reads_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extension_rsa");
        let pem = test_key().to_pkcs8_pem(LineEnding::LF).unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();
        let decryptor = FieldDecryptor::from_pem_file(&path).unwrap();
        assert_eq!(decryptor.decrypt(&encode_field("on-disk")).unwrap(), "on-disk");
    }

    #[test]
    fn from_pem_rejects_non_key() {
        let err = FieldDecryptor::from_pem("-----BEGIN NOTHING-----\n").unwrap_err();
        assert!(matches!(err, IngestError::Key(_)));
    }
}
