//! Canonical text forms of typed preference values and the text encoding of ciphertext.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::cipher::{CryptoError, EntityCipher};

/// Decrypted text does not parse as the requested type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("not a valid {expected}: {reason}")]
pub struct FormatError {
    pub expected: &'static str,
    pub reason: String,
}

/// A scalar preference type with a canonical text form.
pub trait PrefValue: Sized {
    /// Type name reported in mismatch errors.
    const KIND: &'static str;

    fn encode(&self) -> String;

    fn decode(text: &str) -> Result<Self, FormatError>;
}

impl PrefValue for String {
    const KIND: &'static str = "string";

    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(text: &str) -> Result<Self, FormatError> {
        Ok(text.to_string())
    }
}

impl PrefValue for bool {
    const KIND: &'static str = "boolean";

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(text: &str) -> Result<Self, FormatError> {
        if text.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if text.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(FormatError {
                expected: Self::KIND,
                reason: "expected `true` or `false`".to_string(),
            })
        }
    }
}

macro_rules! numeric_pref_value {
    ($ty:ty, $kind:literal) => {
        impl PrefValue for $ty {
            const KIND: &'static str = $kind;

            fn encode(&self) -> String {
                self.to_string()
            }

            fn decode(text: &str) -> Result<Self, FormatError> {
                text.trim().parse::<$ty>().map_err(|e| FormatError {
                    expected: Self::KIND,
                    reason: e.to_string(),
                })
            }
        }
    };
}

numeric_pref_value!(i32, "int");
numeric_pref_value!(i64, "long");
numeric_pref_value!(f32, "float");

pub fn encode_ciphertext(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Line breaks are ignored so wrapped base64 from other writers still decodes.
pub fn decode_ciphertext(text: &str) -> Result<Vec<u8>, CryptoError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| CryptoError::Malformed(format!("base64: {e}")))
}

/// Encrypt encoded text for storage. Empty text is stored as-is without a cipher call.
pub fn seal_text(cipher: &dyn EntityCipher, plaintext: &str) -> Result<String, CryptoError> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    let sealed = cipher.encrypt(plaintext.as_bytes())?;
    Ok(encode_ciphertext(&sealed))
}

/// Inverse of [`seal_text`].
pub fn open_text(cipher: &dyn EntityCipher, stored: &str) -> Result<String, CryptoError> {
    if stored.is_empty() {
        return Ok(String::new());
    }
    let plaintext = cipher.decrypt(&decode_ciphertext(stored)?)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Malformed(format!("utf-8: {e}")))
}
