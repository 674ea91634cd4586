use super::OidcError;
use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::{RsaPublicKey, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    #[must_use]
    pub fn from_public_key(public_key: &RsaPublicKey) -> Self {
        Self {
            keys: vec![Jwk::from_public_key(public_key)],
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    pub kid: String,
    pub n: String,
    pub e: String,
}

impl Jwk {
    #[must_use]
    pub fn from_public_key(public_key: &RsaPublicKey) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            kid: key_id(public_key),
            n: Base64UrlUnpadded::encode_string(&public_key.n().to_bytes_be()),
            e: Base64UrlUnpadded::encode_string(&public_key.e().to_bytes_be()),
        }
    }

    /// # Errors
    /// Returns an error if the modulus or exponent are not valid base64url or
    /// do not form an RSA key.
    #[cfg(test)]
    pub fn to_public_key(&self) -> Result<RsaPublicKey, OidcError> {
        if self.kty != "RSA" {
            return Err(OidcError::Malformed(format!("unsupported kty {}", self.kty)));
        }
        let decode = |value: &str| {
            Base64UrlUnpadded::decode_vec(value)
                .map(|bytes| rsa::BigUint::from_bytes_be(&bytes))
                .map_err(|err| OidcError::Malformed(err.to_string()))
        };
        RsaPublicKey::new(decode(&self.n)?, decode(&self.e)?)
            .map_err(|err| OidcError::Malformed(err.to_string()))
    }
}

/// Stable key id: base64url of the first 8 bytes of SHA-256 over the modulus.
#[must_use]
pub fn key_id(public_key: &RsaPublicKey) -> String {
    let digest = Sha256::digest(public_key.n().to_bytes_be());
    Base64UrlUnpadded::encode_string(&digest[..8])
}
