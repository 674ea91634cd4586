//! RS256 ID tokens.

use super::{OidcError, jwks::key_id};
use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature, SigningKey},
    signature::{SignatureEncoding, Signer},
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

#[cfg(test)]
use super::jwks::Jwks;
#[cfg(test)]
use rsa::{pkcs1v15::VerifyingKey, signature::Verifier};
#[cfg(test)]
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, OidcError> {
    Ok(Base64UrlUnpadded::encode_string(&serde_json::to_vec(value)?))
}

#[cfg(test)]
fn b64d_json<T: DeserializeOwned>(segment: &str) -> Result<T, OidcError> {
    let bytes = Base64UrlUnpadded::decode_vec(segment)
        .map_err(|err| OidcError::Malformed(err.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Sign `claims` with the gateway key; `kid` matches the JWKS entry.
///
/// # Errors
/// Returns an error if the header or claims cannot be encoded.
pub fn sign_id_token(private_key: &RsaPrivateKey, claims: &IdTokenClaims) -> Result<String, OidcError> {
    let header = Header {
        alg: "RS256".to_string(),
        typ: "JWT".to_string(),
        kid: key_id(&RsaPublicKey::from(private_key)),
    };
    let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature: Signature = signing_key.sign(signing_input.as_bytes());

    Ok(format!(
        "{signing_input}.{}",
        Base64UrlUnpadded::encode_string(&signature.to_vec())
    ))
}

/// Verify an ID token against `jwks` the way a relying party does, checking
/// issuer, audience and expiry.
///
/// # Errors
/// Returns an error on a malformed token, unknown `kid`, bad signature or a
/// failed claim check.
#[cfg(test)]
pub fn verify_id_token(
    token: &str,
    jwks: &Jwks,
    issuer: &str,
    audience: &str,
    now: i64,
) -> Result<IdTokenClaims, OidcError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(OidcError::Malformed("expected 3 JWT segments".to_string()));
    };

    let header: Header = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(OidcError::Malformed(format!("unsupported alg {}", header.alg)));
    }
    let jwk = jwks
        .find_by_kid(&header.kid)
        .ok_or_else(|| OidcError::Malformed(format!("unknown kid {}", header.kid)))?;

    let verifying_key = VerifyingKey::<Sha256>::new(jwk.to_public_key()?);
    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64)
        .map_err(|err| OidcError::Malformed(err.to_string()))?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| OidcError::InvalidSignature)?;
    verifying_key
        .verify(format!("{header_b64}.{claims_b64}").as_bytes(), &signature)
        .map_err(|_| OidcError::InvalidSignature)?;

    let claims: IdTokenClaims = b64d_json(claims_b64)?;
    if claims.iss != issuer || claims.aud != audience {
        return Err(OidcError::InvalidClaims);
    }
    if claims.exp <= now {
        return Err(OidcError::Expired);
    }
    Ok(claims)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::test_envelope;

    const NOW: i64 = 1_700_000_000;

    fn claims() -> IdTokenClaims {
        IdTokenClaims {
            iss: "https://gw.example".to_string(),
            sub: "alice-id".to_string(),
            aud: "cid".to_string(),
            exp: NOW + 7200,
            iat: NOW,
        }
    }

    #[test]
    fn signed_token_verifies_under_jwks() {
        let envelope = test_envelope();
        let token = sign_id_token(envelope.private_key().unwrap(), &claims()).unwrap();
        let jwks = Jwks::from_public_key(envelope.public_key().unwrap());
        let verified = verify_id_token(&token, &jwks, "https://gw.example", "cid", NOW).unwrap();
        assert_eq!(verified, claims());
    }

    #[test]
    fn claim_checks() {
        let envelope = test_envelope();
        let token = sign_id_token(envelope.private_key().unwrap(), &claims()).unwrap();
        let jwks = Jwks::from_public_key(envelope.public_key().unwrap());
        assert!(matches!(
            verify_id_token(&token, &jwks, "https://gw.example", "other", NOW),
            Err(OidcError::InvalidClaims)
        ));
        assert!(matches!(
            verify_id_token(&token, &jwks, "https://gw.example", "cid", NOW + 7200),
            Err(OidcError::Expired)
        ));
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let envelope = test_envelope();
        let token = sign_id_token(envelope.private_key().unwrap(), &claims()).unwrap();
        let mut forged = claims();
        forged.sub = "mallory".to_string();
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], b64e_json(&forged).unwrap(), parts[2]);
        let jwks = Jwks::from_public_key(envelope.public_key().unwrap());
        assert!(matches!(
            verify_id_token(&tampered, &jwks, "https://gw.example", "cid", NOW),
            Err(OidcError::InvalidSignature)
        ));
    }
}
