//! Wire envelope: `type(1) [senderPublicKey(32)] iv(12) ciphertext+tag`.
//!
//! Sealed with ChaCha20-Poly1305 (IETF, 12-byte nonce) and carried as
//! base64 text inside relay messages.
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

pub const IV_LENGTH: usize = 12;
pub const KEY_LENGTH: usize = 32;
const TAG_LENGTH: usize = 16;

/// Envelope discriminant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnvelopeType {
    /// Symmetric key already shared through the topic.
    #[default]
    Type0,
    /// Carries the sender public key so the receiver can derive the key.
    Type1,
}

impl EnvelopeType {
    pub const fn as_byte(&self) -> u8 {
        match self {
            EnvelopeType::Type0 => 0,
            EnvelopeType::Type1 => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(EnvelopeType::Type0),
            1 => Ok(EnvelopeType::Type1),
            other => Err(ProtocolError::Decode(format!("unknown envelope type {other}"))),
        }
    }
}

/// A sealed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Type0 {
        iv: [u8; IV_LENGTH],
        sealed: Vec<u8>,
    },
    Type1 {
        sender_public_key: [u8; KEY_LENGTH],
        iv: [u8; IV_LENGTH],
        sealed: Vec<u8>,
    },
}

impl Envelope {
    /// Seal `plaintext` with a fresh random iv.
    pub fn seal(
        key: &[u8; KEY_LENGTH],
        plaintext: &[u8],
        sender_public_key: Option<[u8; KEY_LENGTH]>,
    ) -> Result<Self, ProtocolError> {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);
        Self::seal_with_iv(key, iv, plaintext, sender_public_key)
    }

    /// Sealing is type 1 when a sender key is given, type 0 otherwise.
    pub fn seal_with_iv(
        key: &[u8; KEY_LENGTH],
        iv: [u8; IV_LENGTH],
        plaintext: &[u8],
        sender_public_key: Option<[u8; KEY_LENGTH]>,
    ) -> Result<Self, ProtocolError> {
        let cipher = ChaCha20Poly1305::new(&(*key).into());
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| ProtocolError::Crypto(format!("encryption failed: {e}")))?;

        Ok(match sender_public_key {
            Some(sender_public_key) => Envelope::Type1 {
                sender_public_key,
                iv,
                sealed,
            },
            None => Envelope::Type0 { iv, sealed },
        })
    }

    /// Decrypt. Authentication failures are decode errors.
    pub fn open(&self, key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, ProtocolError> {
        let (iv, sealed) = match self {
            Envelope::Type0 { iv, sealed } => (iv, sealed),
            Envelope::Type1 { iv, sealed, .. } => (iv, sealed),
        };
        let cipher = ChaCha20Poly1305::new(&(*key).into());
        cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|_| ProtocolError::Decode("envelope authentication failed".into()))
    }

    pub fn kind(&self) -> EnvelopeType {
        match self {
            Envelope::Type0 { .. } => EnvelopeType::Type0,
            Envelope::Type1 { .. } => EnvelopeType::Type1,
        }
    }

    pub fn sender_public_key(&self) -> Option<&[u8; KEY_LENGTH]> {
        match self {
            Envelope::Type0 { .. } => None,
            Envelope::Type1 {
                sender_public_key, ..
            } => Some(sender_public_key),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.kind().as_byte());
        match self {
            Envelope::Type0 { iv, sealed } => {
                out.extend_from_slice(iv);
                out.extend_from_slice(sealed);
            }
            Envelope::Type1 {
                sender_public_key,
                iv,
                sealed,
            } => {
                out.extend_from_slice(sender_public_key);
                out.extend_from_slice(iv);
                out.extend_from_slice(sealed);
            }
        }
        out
    }

    /// Parse the binary layout. The type byte is read first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&type_byte, rest) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::Decode("empty envelope".into()))?;

        match EnvelopeType::from_byte(type_byte)? {
            EnvelopeType::Type0 => {
                let (iv, sealed) = split_iv(rest)?;
                Ok(Envelope::Type0 { iv, sealed })
            }
            EnvelopeType::Type1 => {
                if rest.len() < KEY_LENGTH {
                    return Err(ProtocolError::Decode(
                        "type 1 envelope missing sender public key".into(),
                    ));
                }
                let (key, rest) = rest.split_at(KEY_LENGTH);
                let mut sender_public_key = [0u8; KEY_LENGTH];
                sender_public_key.copy_from_slice(key);
                let (iv, sealed) = split_iv(rest)?;
                Ok(Envelope::Type1 {
                    sender_public_key,
                    iv,
                    sealed,
                })
            }
        }
    }

    /// Base64 (standard alphabet, padded).
    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Accepts standard or URL-safe base64, padded or not.
    pub fn decode(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = decode_base64(encoded.trim())?;
        Self::from_bytes(&bytes)
    }
}

fn split_iv(rest: &[u8]) -> Result<([u8; IV_LENGTH], Vec<u8>), ProtocolError> {
    if rest.len() < IV_LENGTH + TAG_LENGTH {
        return Err(ProtocolError::Decode(format!(
            "envelope too short: {} bytes after header",
            rest.len()
        )));
    }
    let (iv_bytes, sealed) = rest.split_at(IV_LENGTH);
    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(iv_bytes);
    Ok((iv, sealed.to_vec()))
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, ProtocolError> {
    [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(encoded).ok())
        .ok_or_else(|| ProtocolError::Decode("envelope is not valid base64".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn type0_layout() {
        let env = Envelope::seal_with_iv(&KEY, [1u8; 12], b"hello", None).unwrap();
        let bytes = env.to_bytes();
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..13], &[1u8; 12]);
        // plaintext + 16-byte tag
        assert_eq!(bytes.len(), 1 + 12 + 5 + 16);
    }

    #[test]
    fn type1_carries_sender_key() {
        let env = Envelope::seal_with_iv(&KEY, [2u8; 12], b"hi", Some([9u8; 32])).unwrap();
        let bytes = env.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..33], &[9u8; 32]);

        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind(), EnvelopeType::Type1);
        assert_eq!(parsed.sender_public_key(), Some(&[9u8; 32]));
        assert_eq!(parsed.open(&KEY).unwrap(), b"hi");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let env = Envelope::seal(&KEY, b"secret", None).unwrap();
        let err = env.open(&[8u8; 32]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let env = Envelope::seal(&KEY, b"secret", None).unwrap();
        let mut bytes = env.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = Envelope::from_bytes(&bytes).unwrap();
        assert!(tampered.open(&KEY).is_err());
    }

    #[test]
    fn decoder_accepts_url_safe_alphabet() {
        let env = Envelope::seal(&KEY, b"url safe please", None).unwrap();
        let url_safe = URL_SAFE_NO_PAD.encode(env.to_bytes());
        assert_eq!(Envelope::decode(&url_safe).unwrap(), env);
        assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn rejects_short_and_unknown() {
        assert!(Envelope::from_bytes(&[]).is_err());
        assert!(Envelope::from_bytes(&[0u8; 10]).is_err());
        assert!(Envelope::from_bytes(&[2u8; 64]).is_err());
        assert!(Envelope::from_bytes(&[1u8; 20]).is_err());
        assert!(Envelope::decode("%%%").is_err());
    }
}
