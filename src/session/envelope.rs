//! Outer envelope shared by session tokens and OIDC codes.
//!
//! Without a key the payload is raw DEFLATE plus unpadded base64url. With the
//! process RSA key installed it becomes a compact JWE
//! (`RSA1_5` key wrap, `A128GCM` content encryption, `DEF` compression).

use super::codec::CodecError;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use anyhow::{Context, Result, anyhow};
use base64ct::{Base64UrlUnpadded, Encoding};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use rand::{RngCore, rngs::OsRng};
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey, pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
};
use serde::Deserialize;
use std::{
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

const JWE_HEADER: &str = r#"{"alg":"RSA1_5","enc":"A128GCM","zip":"DEF"}"#;
const CEK_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MAX_INFLATED: u64 = 1 << 20;

#[derive(Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    #[serde(default)]
    zip: Option<String>,
}

#[derive(Clone, Default)]
pub struct Envelope {
    key: Option<Arc<KeyPair>>,
}

struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

impl Envelope {
    /// Envelope that only compresses.
    #[must_use]
    pub fn plain() -> Self {
        Self { key: None }
    }

    #[must_use]
    pub fn with_key(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self {
            key: Some(Arc::new(KeyPair { private, public })),
        }
    }

    /// Load a PKCS#1 or PKCS#8 private key, PEM or DER.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or holds no RSA private key.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read RSA key {}", path.display()))?;
        Ok(Self::with_key(parse_private_key(&raw)?))
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    #[must_use]
    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.key.as_ref().map(|pair| &pair.private)
    }

    #[must_use]
    pub fn public_key(&self) -> Option<&RsaPublicKey> {
        self.key.as_ref().map(|pair| &pair.public)
    }

    /// # Errors
    /// Returns an error if compression or encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CodecError> {
        let compressed = deflate(plaintext)?;
        match &self.key {
            None => Ok(Base64UrlUnpadded::encode_string(&compressed)),
            Some(pair) => seal_jwe(&pair.public, &compressed),
        }
    }

    /// # Errors
    /// Returns an error if the input is not valid for this envelope.
    pub fn open(&self, wire: &str) -> Result<Vec<u8>, CodecError> {
        match &self.key {
            None => {
                let compressed = Base64UrlUnpadded::decode_vec(wire.trim())
                    .map_err(|err| CodecError::Base64(err.to_string()))?;
                inflate(&compressed)
            }
            Some(pair) => open_jwe(&pair.private, wire.trim()),
        }
    }
}

fn parse_private_key(raw: &[u8]) -> Result<RsaPrivateKey> {
    if let Ok(pem) = std::str::from_utf8(raw) {
        let pem = pem.trim();
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(key);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            return Ok(key);
        }
    }
    RsaPrivateKey::from_pkcs8_der(raw)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(raw))
        .map_err(|err| anyhow!("not an RSA private key: {err}"))
}

fn deflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(input)
        .map_err(|err| CodecError::Deflate(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| CodecError::Deflate(err.to_string()))
}

fn inflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut output = Vec::new();
    DeflateDecoder::new(input)
        .take(MAX_INFLATED + 1)
        .read_to_end(&mut output)
        .map_err(|err| CodecError::Deflate(err.to_string()))?;
    if output.len() as u64 > MAX_INFLATED {
        return Err(CodecError::Deflate(format!(
            "inflated payload exceeds {MAX_INFLATED} bytes"
        )));
    }
    Ok(output)
}

fn seal_jwe(public: &RsaPublicKey, compressed: &[u8]) -> Result<String, CodecError> {
    let mut cek = [0u8; CEK_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut cek);
    OsRng.fill_bytes(&mut iv);

    let encrypted_key = public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, &cek)
        .map_err(|err| CodecError::Encrypt(err.to_string()))?;

    let protected = Base64UrlUnpadded::encode_string(JWE_HEADER.as_bytes());
    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|err| CodecError::Encrypt(err.to_string()))?;
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: compressed,
                aad: protected.as_bytes(),
            },
        )
        .map_err(|err| CodecError::Encrypt(err.to_string()))?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(format!(
        "{protected}.{}.{}.{}.{}",
        Base64UrlUnpadded::encode_string(&encrypted_key),
        Base64UrlUnpadded::encode_string(&iv),
        Base64UrlUnpadded::encode_string(ciphertext),
        Base64UrlUnpadded::encode_string(tag),
    ))
}

fn open_jwe(private: &RsaPrivateKey, wire: &str) -> Result<Vec<u8>, CodecError> {
    let parts: Vec<&str> = wire.split('.').collect();
    let [protected, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(CodecError::Malformed(format!(
            "expected 5 JWE segments, got {}",
            parts.len()
        )));
    };

    let decode = |segment: &str| {
        Base64UrlUnpadded::decode_vec(segment).map_err(|err| CodecError::Base64(err.to_string()))
    };

    let header: JweHeader = serde_json::from_slice(&decode(protected)?)
        .map_err(|err| CodecError::Malformed(err.to_string()))?;
    if header.alg != "RSA1_5" || header.enc != "A128GCM" {
        return Err(CodecError::Malformed(format!(
            "unsupported JWE algorithm {}/{}",
            header.alg, header.enc
        )));
    }

    let cek = private
        .decrypt(Pkcs1v15Encrypt, &decode(encrypted_key)?)
        .map_err(|err| CodecError::Decrypt(err.to_string()))?;
    let iv = decode(iv)?;
    if iv.len() != IV_LEN {
        return Err(CodecError::Malformed("bad IV length".to_string()));
    }

    let mut sealed = decode(ciphertext)?;
    sealed.extend_from_slice(&decode(tag)?);

    let cipher =
        Aes128Gcm::new_from_slice(&cek).map_err(|err| CodecError::Decrypt(err.to_string()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: protected.as_bytes(),
            },
        )
        .map_err(|err| CodecError::Decrypt(err.to_string()))?;

    match header.zip.as_deref() {
        Some("DEF") => inflate(&plaintext),
        None => Ok(plaintext),
        Some(other) => Err(CodecError::Malformed(format!("unsupported zip {other}"))),
    }
}
