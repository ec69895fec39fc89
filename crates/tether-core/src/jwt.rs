//! Identity assertion presented to the relay when opening the websocket.
//!
//! An EdDSA JWT whose issuer is the client's did:key
//! (`did:key:z` + base58btc(0xed 0x01 ‖ ed25519 public key)).
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

const JWT_DELIMITER: char = '.';
const DID_KEY_PREFIX: &str = "did:key:";
const MULTIBASE_BASE58BTC: char = 'z';
const MULTICODEC_ED25519_HEADER: [u8; 2] = [0xed, 0x01];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    pub alg: String,
    pub typ: String,
}

impl Default for JwtHeader {
    fn default() -> Self {
        Self {
            alg: "EdDSA".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

/// `did:key` identifier for an Ed25519 public key.
pub fn encode_iss(public_key: &VerifyingKey) -> String {
    let mut multicodec = Vec::with_capacity(2 + 32);
    multicodec.extend_from_slice(&MULTICODEC_ED25519_HEADER);
    multicodec.extend_from_slice(public_key.as_bytes());
    format!(
        "{DID_KEY_PREFIX}{MULTIBASE_BASE58BTC}{}",
        bs58::encode(multicodec).into_string()
    )
}

pub fn decode_iss(iss: &str) -> Result<VerifyingKey, ProtocolError> {
    let encoded = iss
        .strip_prefix(DID_KEY_PREFIX)
        .and_then(|rest| rest.strip_prefix(MULTIBASE_BASE58BTC))
        .ok_or_else(|| ProtocolError::MissingOrInvalid(format!("issuer {iss}")))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| ProtocolError::MissingOrInvalid(format!("issuer encoding: {e}")))?;

    let key = bytes
        .strip_prefix(&MULTICODEC_ED25519_HEADER[..])
        .ok_or_else(|| ProtocolError::MissingOrInvalid("issuer is not an ed25519 key".into()))?;
    let key: [u8; 32] = key
        .try_into()
        .map_err(|_| ProtocolError::MissingOrInvalid("issuer key length".into()))?;
    VerifyingKey::from_bytes(&key)
        .map_err(|e| ProtocolError::Crypto(format!("invalid issuer key: {e}")))
}

/// Sign an identity assertion for `aud`, valid `ttl` seconds from `iat`.
pub fn sign_jwt(
    signing_key: &SigningKey,
    sub: &str,
    aud: &str,
    ttl: u64,
    iat: u64,
) -> Result<String, ProtocolError> {
    let claims = IdentityClaims {
        iss: encode_iss(&signing_key.verifying_key()),
        sub: sub.to_string(),
        aud: aud.to_string(),
        iat,
        exp: iat + ttl,
    };
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&JwtHeader::default())?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let data = format!("{header}{JWT_DELIMITER}{payload}");

    let signature = signing_key.sign(data.as_bytes());
    Ok(format!(
        "{data}{JWT_DELIMITER}{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Check the signature against the issuer key and return the claims.
pub fn verify_jwt(token: &str) -> Result<IdentityClaims, ProtocolError> {
    let mut parts = token.split(JWT_DELIMITER);
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::MissingOrInvalid("jwt: expected three segments".into()));
    };

    let decode = |segment: &str| {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|e| ProtocolError::Decode(format!("jwt segment: {e}")))
    };

    let header: JwtHeader = serde_json::from_slice(&decode(header)?)?;
    if header.alg != "EdDSA" {
        return Err(ProtocolError::MissingOrInvalid(format!("jwt alg {}", header.alg)));
    }
    let claims: IdentityClaims = serde_json::from_slice(&decode(payload)?)?;
    let key = decode_iss(&claims.iss)?;

    let signature = Signature::from_slice(&decode(signature)?)
        .map_err(|e| ProtocolError::Crypto(format!("jwt signature: {e}")))?;
    let data = &token[..token.rfind(JWT_DELIMITER).unwrap_or(0)];
    key.verify(data.as_bytes(), &signature)
        .map_err(|_| ProtocolError::Unauthorized("jwt signature mismatch".into()))?;
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    #[test]
    fn did_key_roundtrip() {
        let iss = encode_iss(&key().verifying_key());
        assert!(iss.starts_with("did:key:z6Mk"));
        assert_eq!(decode_iss(&iss).unwrap(), key().verifying_key());
    }

    #[test]
    fn signed_token_verifies() {
        let token = sign_jwt(&key(), "ab", "wss://relay.example", 86_400, 1_700_000_000).unwrap();
        let claims = verify_jwt(&token).unwrap();
        assert_eq!(claims.aud, "wss://relay.example");
        assert_eq!(claims.exp, 1_700_086_400);
        assert_eq!(claims.iss, encode_iss(&key().verifying_key()));
    }

    #[test]
    fn tampered_claims_rejected() {
        let token = sign_jwt(&key(), "ab", "aud", 60, 1).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = IdentityClaims {
            iss: encode_iss(&key().verifying_key()),
            sub: "ab".into(),
            aud: "elsewhere".into(),
            iat: 1,
            exp: 61,
        };
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap()),
            parts[2]
        );
        assert!(matches!(
            verify_jwt(&forged),
            Err(ProtocolError::Unauthorized(_))
        ));
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(verify_jwt("a.b").is_err());
        assert!(verify_jwt("a.b.c.d").is_err());
        assert!(decode_iss("did:web:example.com").is_err());
    }
}
