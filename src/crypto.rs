//! # Value Cipher
//!
//! Authenticated encryption of individual scalar values with AES-256-GCM.
//!
//! ## Algorithm
//!
//! - **Cipher**: AES-256-GCM with a 256-bit (32 byte) nonce
//! - **Key size**: 256 bits (32 bytes), held in a [`DataKey`] that is zeroed on drop
//! - **Authentication**: 16-byte GCM tag, with the value's tree path as additional data
//!
//! ## Envelope Format
//!
//! ```text
//! ENC[AES256_GCM,data:<b64>,iv:<b64>,tag:<b64>,type:<str|int|float|bool|bytes>]
//! ```
//!
//! The `type` field records how the plaintext is restored on decryption.
//! An empty string is never encrypted and decrypts to itself.

use crate::error::{CipherError, Result, SopsError};
use crate::tree::Value;
use aes_gcm::{
    aead::{consts::U32, Aead, KeyInit, OsRng, Payload},
    aes::Aes256,
    AesGcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32; // 256 bits
pub const NONCE_SIZE: usize = 32; // 256 bits
pub const TAG_SIZE: usize = 16;

const ENVELOPE_PREFIX: &str = "ENC[AES256_GCM,";

type ValueAead = AesGcm<Aes256, U32>;

/// The per-document symmetric key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_SIZE],
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

impl DataKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Create a key from existing bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SopsError::InvalidKeyFormat);
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Encrypt a scalar into an envelope string, binding it to `aad`.
    ///
    /// A `nonce` is only supplied when re-encrypting a value that did not
    /// change since it was decrypted; otherwise a fresh one is drawn.
    pub fn encrypt_value(&self, value: &Value, aad: &str, nonce: Option<&[u8]>) -> Result<String> {
        let (plaintext, type_tag) = match value {
            Value::String(s) => (s.as_bytes().to_vec(), "str"),
            Value::Int(i) => (i.to_string().into_bytes(), "int"),
            Value::Float(f) => (format_float(*f).into_bytes(), "float"),
            Value::Bool(b) => (format_bool(*b).as_bytes().to_vec(), "bool"),
            Value::Bytes(b) => (b.clone(), "bytes"),
            other => return Err(CipherError::Unencryptable(other.kind()).into()),
        };
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce_bytes = match nonce {
            Some(n) if n.len() == NONCE_SIZE => n.to_vec(),
            Some(n) => return Err(CipherError::Nonce(n.len()).into()),
            None => {
                let mut n = vec![0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut n);
                n
            }
        };

        let cipher = self.cipher()?;
        let mut sealed = cipher
            .encrypt(
                Nonce::<U32>::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CipherError::Authentication)?;
        let tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{ENVELOPE_PREFIX}data:{},iv:{},tag:{},type:{}]",
            STANDARD.encode(&sealed),
            STANDARD.encode(&nonce_bytes),
            STANDARD.encode(&tag),
            type_tag
        ))
    }

    /// Decrypt an envelope produced by [`DataKey::encrypt_value`], returning
    /// the typed value and the nonce it was sealed with.
    pub fn decrypt_value(&self, envelope: &str, aad: &str) -> Result<(Value, Vec<u8>)> {
        if envelope.is_empty() {
            return Ok((Value::String(String::new()), Vec::new()));
        }
        let parts = Envelope::parse(envelope)?;
        let data = decode_field("data", parts.data)?;
        let nonce = decode_field("iv", parts.iv)?;
        let tag = decode_field("tag", parts.tag)?;
        if nonce.len() != NONCE_SIZE {
            return Err(CipherError::Nonce(nonce.len()).into());
        }

        let mut sealed = data;
        sealed.extend_from_slice(&tag);
        let cipher = self.cipher()?;
        let plaintext = cipher
            .decrypt(
                Nonce::<U32>::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CipherError::Authentication)?;

        let value = parse_plaintext(parts.type_tag, plaintext)?;
        Ok((value, nonce))
    }

    fn cipher(&self) -> Result<ValueAead> {
        ValueAead::new_from_slice(&self.key).map_err(|_| SopsError::InvalidKeyFormat)
    }
}

/// Check whether a string looks like a value envelope.
pub fn is_envelope(s: &str) -> bool {
    s.starts_with(ENVELOPE_PREFIX) && s.ends_with(']')
}

/// Render a float the shortest way that round-trips, without exponent.
pub fn format_float(f: f64) -> String {
    f.to_string()
}

pub fn format_bool(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

struct Envelope<'a> {
    data: &'a str,
    iv: &'a str,
    tag: &'a str,
    type_tag: &'a str,
}

impl<'a> Envelope<'a> {
    fn parse(s: &'a str) -> Result<Self> {
        let malformed = || SopsError::from(CipherError::Malformed(s.to_string()));
        let body = s
            .strip_prefix(ENVELOPE_PREFIX)
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(malformed)?;

        let mut fields = body.splitn(4, ',');
        let mut next = |name: &str| -> Result<&'a str> {
            fields
                .next()
                .and_then(|f| f.strip_prefix(name))
                .and_then(|f| f.strip_prefix(':'))
                .filter(|f| !f.is_empty())
                .ok_or_else(malformed)
        };
        Ok(Self {
            data: next("data")?,
            iv: next("iv")?,
            tag: next("tag")?,
            type_tag: next("type")?,
        })
    }
}

fn decode_field(field: &'static str, encoded: &str) -> Result<Vec<u8>> {
    STANDARD.decode(encoded).map_err(|e| {
        CipherError::Base64 {
            field,
            message: e.to_string(),
        }
        .into()
    })
}

fn parse_plaintext(type_tag: &str, plaintext: Vec<u8>) -> Result<Value> {
    if type_tag == "bytes" {
        return Ok(Value::Bytes(plaintext));
    }
    let text = String::from_utf8(plaintext).map_err(|e| CipherError::Parse {
        kind: "utf-8 text",
        value: String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })?;
    let value = match type_tag {
        "str" => Value::String(text),
        "int" => Value::Int(text.parse().map_err(|_| CipherError::Parse {
            kind: "int",
            value: text.clone(),
        })?),
        "float" => Value::Float(text.parse().map_err(|_| CipherError::Parse {
            kind: "float",
            value: text.clone(),
        })?),
        "bool" => Value::Bool(parse_bool(&text).ok_or_else(|| CipherError::Parse {
            kind: "bool",
            value: text.clone(),
        })?),
        other => return Err(CipherError::UnknownType(other.to_string()).into()),
    };
    Ok(value)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
