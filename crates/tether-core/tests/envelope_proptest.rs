use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use proptest::prelude::*;
use tether_core::crypto::{DecodeOptions, EncodeOptions};
use tether_core::{Crypto, Envelope, EnvelopeType, KeyChain};

fn crypto() -> Crypto {
    Crypto::new(KeyChain::new(""))
}

proptest! {
    /// Whatever is sealed under a topic key opens under it again.
    #[test]
    fn type0_roundtrip(message in ".{0,2000}") {
        let mut a = crypto();
        let key = Crypto::random_sym_key();
        let topic = a.set_sym_key(&key, None).unwrap();

        let encoded = a.encode(&topic, &message, &EncodeOptions::default()).unwrap();
        prop_assert_eq!(Crypto::payload_type(&encoded).unwrap(), EnvelopeType::Type0);
        let decoded = a.try_decode(&topic, &encoded, &DecodeOptions::default()).unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// A type 1 envelope opens with nothing but the receiver's own key pair.
    #[test]
    fn type1_opens_on_the_receiver(message in ".{0,500}") {
        let mut sender = crypto();
        let mut receiver = crypto();
        let sender_pub = sender.generate_key_pair();
        let receiver_pub = receiver.generate_key_pair();

        let encoded = sender
            .encode("any", &message, &EncodeOptions::type1(&sender_pub, &receiver_pub))
            .unwrap();
        let opts = DecodeOptions {
            receiver_public_key: Some(receiver_pub),
        };
        let decoded = receiver.try_decode("any", &encoded, &opts).unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// Both sides of a key agreement land on the same topic.
    #[test]
    fn derived_topics_agree(_round in 0..16u8) {
        let mut a = crypto();
        let mut b = crypto();
        let a_pub = a.generate_key_pair();
        let b_pub = b.generate_key_pair();

        let topic_a = a.generate_shared_key(&a_pub, &b_pub, None).unwrap();
        let topic_b = b.generate_shared_key(&b_pub, &a_pub, None).unwrap();
        prop_assert_eq!(&topic_a, &topic_b);
        prop_assert_eq!(a.get_sym_key(&topic_a).unwrap(), b.get_sym_key(&topic_b).unwrap());
    }

    /// Any flipped ciphertext byte fails authentication.
    #[test]
    fn tampering_is_detected(message in ".{1,200}", flip in any::<prop::sample::Index>()) {
        let key = [7u8; 32];
        let envelope = Envelope::seal(&key, message.as_bytes(), None).unwrap();
        let mut bytes = envelope.to_bytes();
        // Skip the type byte so the layout still parses.
        let at = 1 + flip.index(bytes.len() - 1);
        bytes[at] ^= 0x01;

        let tampered = Envelope::from_bytes(&bytes).unwrap();
        prop_assert!(tampered.open(&key).is_err());
    }

    /// Decoding accepts URL-safe unpadded base64 as well.
    #[test]
    fn lenient_base64(message in ".{0,300}") {
        let key = [3u8; 32];
        let envelope = Envelope::seal(&key, message.as_bytes(), None).unwrap();
        let url_safe = URL_SAFE_NO_PAD.encode(envelope.to_bytes());
        let parsed = Envelope::decode(&url_safe).unwrap();
        prop_assert_eq!(parsed.open(&key).unwrap(), message.into_bytes());
    }

    /// Garbage never panics the decoder.
    #[test]
    fn garbage_is_rejected_cleanly(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = Envelope::from_bytes(&bytes);
    }
}

#[test]
fn short_envelope_is_a_decode_error() {
    // type byte plus an iv, no tag
    let bytes = [0u8; 13];
    assert!(Envelope::from_bytes(&bytes).is_err());
}

#[test]
fn unknown_type_byte_is_rejected() {
    let mut bytes = vec![2u8];
    bytes.extend_from_slice(&[0u8; 40]);
    assert!(Envelope::from_bytes(&bytes).is_err());
}
