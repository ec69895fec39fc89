//! Key agreement, envelope encoding and the relay identity assertion.
//!
//! Key material lives in the [`KeyChain`]: private keys under their public
//! key, symmetric keys under their topic, the Ed25519 identity seed under
//! [`CLIENT_SEED`].
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::envelope::{Envelope, EnvelopeType, KEY_LENGTH};
use crate::jwt;
use crate::keychain::KeyChain;
use crate::types::{now_secs, Topic};
use crate::ProtocolError;

/// KeyChain tag of the identity seed.
pub const CLIENT_SEED: &str = "client_ed25519_seed";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    pub kind: EnvelopeType,
    /// Type 1 only: our key pair, used to derive the key with the receiver.
    pub sender_public_key: Option<String>,
    pub receiver_public_key: Option<String>,
}

impl EncodeOptions {
    pub fn type1(sender_public_key: &str, receiver_public_key: &str) -> Self {
        Self {
            kind: EnvelopeType::Type1,
            sender_public_key: Some(sender_public_key.to_string()),
            receiver_public_key: Some(receiver_public_key.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Our public key, needed to open type 1 envelopes.
    pub receiver_public_key: Option<String>,
}

/// Hex sha256, used for topics and message hashes.
pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn decode_key(hex_key: &str) -> Result<[u8; KEY_LENGTH], ProtocolError> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| ProtocolError::MissingOrInvalid(format!("key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::MissingOrInvalid("key must be 32 bytes".into()))
}

fn random_bytes() -> [u8; 32] {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// x25519 then HKDF-SHA256 (no salt, empty info).
pub fn derive_sym_key(
    private_key: &[u8; KEY_LENGTH],
    peer_public_key: &[u8; KEY_LENGTH],
) -> Result<[u8; KEY_LENGTH], ProtocolError> {
    let secret = StaticSecret::from(*private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public_key));
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; KEY_LENGTH];
    hkdf.expand(&[], &mut key)
        .map_err(|e| ProtocolError::Crypto(format!("hkdf expand failed: {e}")))?;
    Ok(key)
}

pub struct Crypto {
    keychain: KeyChain,
}

impl Crypto {
    pub fn new(keychain: KeyChain) -> Self {
        Self { keychain }
    }

    pub fn keychain(&self) -> &KeyChain {
        &self.keychain
    }

    pub fn keychain_mut(&mut self) -> &mut KeyChain {
        &mut self.keychain
    }

    pub fn has_keys(&self, tag: &str) -> bool {
        self.keychain.has(tag)
    }

    /// New x25519 key pair. The private half stays in the keychain.
    pub fn generate_key_pair(&mut self) -> String {
        use chacha20poly1305::aead::rand_core::OsRng;
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = hex::encode(PublicKey::from(&secret).as_bytes());
        self.keychain
            .set(public_key.clone(), hex::encode(secret.to_bytes()));
        public_key
    }

    /// Derive the key shared with `peer_public_key` and store it under its topic.
    pub fn generate_shared_key(
        &mut self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<&str>,
    ) -> Result<Topic, ProtocolError> {
        let private_key = self.private_key(self_public_key)?;
        let sym_key = derive_sym_key(&private_key, &decode_key(peer_public_key)?)?;
        self.set_sym_key(&hex::encode(sym_key), override_topic)
    }

    /// Store a symmetric key. Topic is sha256(key) unless overridden.
    pub fn set_sym_key(
        &mut self,
        sym_key: &str,
        override_topic: Option<&str>,
    ) -> Result<Topic, ProtocolError> {
        let key = decode_key(sym_key)?;
        let topic = override_topic
            .map(str::to_string)
            .unwrap_or_else(|| hash_hex(&key));
        self.keychain.set(topic.clone(), sym_key);
        Ok(topic)
    }

    /// Fresh random symmetric key, returned hex-encoded.
    pub fn random_sym_key() -> String {
        hex::encode(random_bytes())
    }

    pub fn delete_key_pair(&mut self, public_key: &str) {
        self.keychain.del(public_key);
    }

    pub fn delete_sym_key(&mut self, topic: &str) {
        self.keychain.del(topic);
    }

    pub fn get_sym_key(&self, topic: &str) -> Result<String, ProtocolError> {
        Ok(self.keychain.get(topic)?.to_string())
    }

    fn private_key(&self, public_key: &str) -> Result<[u8; KEY_LENGTH], ProtocolError> {
        decode_key(self.keychain.get(public_key)?)
    }

    fn topic_key(&self, topic: &str) -> Result<[u8; KEY_LENGTH], ProtocolError> {
        decode_key(self.keychain.get(topic)?)
    }

    /// Seal `message` for `topic`.
    pub fn encode(
        &self,
        topic: &str,
        message: &str,
        opts: &EncodeOptions,
    ) -> Result<String, ProtocolError> {
        let envelope = match opts.kind {
            EnvelopeType::Type0 => Envelope::seal(&self.topic_key(topic)?, message.as_bytes(), None)?,
            EnvelopeType::Type1 => {
                let (Some(sender), Some(receiver)) =
                    (&opts.sender_public_key, &opts.receiver_public_key)
                else {
                    return Err(ProtocolError::MissingOrInvalid(
                        "type 1 envelope requires sender and receiver public keys".into(),
                    ));
                };
                let key = derive_sym_key(&self.private_key(sender)?, &decode_key(receiver)?)?;
                Envelope::seal(&key, message.as_bytes(), Some(decode_key(sender)?))?
            }
        };
        Ok(envelope.encode())
    }

    /// Open an envelope received on `topic`. Failures are logged, never raised.
    pub fn decode(&self, topic: &str, encoded: &str, opts: &DecodeOptions) -> Option<String> {
        match self.try_decode(topic, encoded, opts) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::error!(%topic, "failed to decode message: {e}");
                None
            }
        }
    }

    pub fn try_decode(
        &self,
        topic: &str,
        encoded: &str,
        opts: &DecodeOptions,
    ) -> Result<String, ProtocolError> {
        let envelope = Envelope::decode(encoded)?;
        let key = match &envelope {
            Envelope::Type0 { .. } => self.topic_key(topic)?,
            Envelope::Type1 {
                sender_public_key, ..
            } => {
                let receiver = opts.receiver_public_key.as_deref().ok_or_else(|| {
                    ProtocolError::MissingOrInvalid("type 1 envelope without receiver key".into())
                })?;
                derive_sym_key(&self.private_key(receiver)?, sender_public_key)?
            }
        };
        let plaintext = envelope.open(&key)?;
        String::from_utf8(plaintext)
            .map_err(|e| ProtocolError::Decode(format!("payload is not utf-8: {e}")))
    }

    /// Envelope type of an encoded message, without opening it.
    pub fn payload_type(encoded: &str) -> Result<EnvelopeType, ProtocolError> {
        Ok(Envelope::decode(encoded)?.kind())
    }

    fn identity_key(&mut self) -> Result<SigningKey, ProtocolError> {
        if !self.keychain.has(CLIENT_SEED) {
            self.keychain.set(CLIENT_SEED, hex::encode(random_bytes()));
        }
        let seed = decode_key(self.keychain.get(CLIENT_SEED)?)?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// did:key of this client, created with the seed on first use.
    pub fn client_id(&mut self) -> Result<String, ProtocolError> {
        Ok(jwt::encode_iss(&self.identity_key()?.verifying_key()))
    }

    /// Signed token authenticating this client to the relay at `aud`.
    pub fn sign_identity_assertion(&mut self, aud: &str, ttl: u64) -> Result<String, ProtocolError> {
        let key = self.identity_key()?;
        let sub = hex::encode(random_bytes());
        jwt::sign_jwt(&key, &sub, aud, ttl, now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> Crypto {
        Crypto::new(KeyChain::new(""))
    }

    #[test]
    fn shared_key_matches_on_both_sides() {
        let mut a = crypto();
        let mut b = crypto();
        let a_pub = a.generate_key_pair();
        let b_pub = b.generate_key_pair();

        let topic_a = a.generate_shared_key(&a_pub, &b_pub, None).unwrap();
        let topic_b = b.generate_shared_key(&b_pub, &a_pub, None).unwrap();
        assert_eq!(topic_a, topic_b);
        assert_eq!(topic_a.len(), 64);
        assert_eq!(
            a.get_sym_key(&topic_a).unwrap(),
            b.get_sym_key(&topic_b).unwrap()
        );
    }

    #[test]
    fn topic_is_hash_of_sym_key() {
        let mut c = crypto();
        let key = Crypto::random_sym_key();
        let topic = c.set_sym_key(&key, None).unwrap();
        assert_eq!(topic, hash_hex(&hex::decode(&key).unwrap()));

        let overridden = c.set_sym_key(&key, Some("custom")).unwrap();
        assert_eq!(overridden, "custom");
    }

    #[test]
    fn type0_roundtrip_between_peers() {
        let mut a = crypto();
        let mut b = crypto();
        let key = Crypto::random_sym_key();
        let topic = a.set_sym_key(&key, None).unwrap();
        b.set_sym_key(&key, None).unwrap();

        let encoded = a
            .encode(&topic, r#"{"id":1}"#, &EncodeOptions::default())
            .unwrap();
        assert_eq!(
            b.decode(&topic, &encoded, &DecodeOptions::default()).as_deref(),
            Some(r#"{"id":1}"#)
        );
    }

    #[test]
    fn type1_derives_key_lazily() {
        let mut a = crypto();
        let mut b = crypto();
        let a_pub = a.generate_key_pair();
        let b_pub = b.generate_key_pair();

        let encoded = a
            .encode("t", "hello", &EncodeOptions::type1(&a_pub, &b_pub))
            .unwrap();
        assert_eq!(Crypto::payload_type(&encoded).unwrap(), EnvelopeType::Type1);

        let opts = DecodeOptions {
            receiver_public_key: Some(b_pub),
        };
        assert_eq!(b.decode("t", &encoded, &opts).as_deref(), Some("hello"));
    }

    #[test]
    fn decode_without_key_is_none() {
        let mut a = crypto();
        let topic = a.set_sym_key(&Crypto::random_sym_key(), None).unwrap();
        let encoded = a.encode(&topic, "x", &EncodeOptions::default()).unwrap();

        let b = crypto();
        assert!(b.decode(&topic, &encoded, &DecodeOptions::default()).is_none());
        assert!(matches!(
            b.try_decode(&topic, &encoded, &DecodeOptions::default()),
            Err(ProtocolError::NoMatchingKey(_))
        ));
    }

    #[test]
    fn encode_unknown_topic_fails() {
        let c = crypto();
        assert!(c.encode("nope", "x", &EncodeOptions::default()).is_err());
    }

    #[test]
    fn client_id_is_stable() {
        let mut c = crypto();
        let first = c.client_id().unwrap();
        assert_eq!(c.client_id().unwrap(), first);
        assert!(c.has_keys(CLIENT_SEED));

        let token = c.sign_identity_assertion("wss://relay", 3600).unwrap();
        let claims = jwt::verify_jwt(&token).unwrap();
        assert_eq!(claims.iss, first);
        assert_eq!(claims.sub.len(), 64);
    }

    #[test]
    fn deleted_keys_are_gone() {
        let mut c = crypto();
        let public_key = c.generate_key_pair();
        assert!(c.has_keys(&public_key));
        c.delete_key_pair(&public_key);
        assert!(!c.has_keys(&public_key));
    }
}
