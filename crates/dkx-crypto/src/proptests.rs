
#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use crate::codec;
    use crate::error::CryptoError;
    use crate::handshake::{DeviceHandshake, ServerHandshake};
    use crate::keys::{KeyPair, Signature};
    use ed25519_dalek::SigningKey;

    fn key_pair_from_seed(seed: &[u8; 32]) -> KeyPair {
        let signing_key = SigningKey::from_bytes(seed);
        let mut pair = KeyPair::new();
        pair.import(
            &signing_key.verifying_key().to_bytes(),
            &signing_key.to_keypair_bytes(),
        )
        .unwrap();
        pair
    }

    proptest! {
        #[test]
        fn test_codec_round_trip(data in any::<Vec<u8>>()) {
            let text = codec::encode(&data);
            prop_assert_eq!(text.len(), codec::encoded_len(data.len()));
            prop_assert_eq!(codec::decode(&text).unwrap(), data);
        }

        #[test]
        fn test_codec_rejects_unaligned_input(text in "[A-Za-z0-9+/]{1,64}") {
            prop_assume!(text.len() % 4 != 0);
            prop_assert!(codec::decode(&text).is_err());
        }

        #[test]
        fn test_sign_verify_round_trip(
            seed in any::<[u8; 32]>(),
            message in proptest::collection::vec(any::<u8>(), 1..512)
        ) {
            let pair = key_pair_from_seed(&seed);
            let signature = pair.sign(&message).unwrap();
            prop_assert!(pair.verify(&message, &signature).is_ok());
        }

        #[test]
        fn test_signature_bound_to_message(
            seed in any::<[u8; 32]>(),
            m1 in proptest::collection::vec(any::<u8>(), 1..128),
            m2 in proptest::collection::vec(any::<u8>(), 1..128)
        ) {
            prop_assume!(m1 != m2);
            let pair = key_pair_from_seed(&seed);
            let signature = pair.sign(&m1).unwrap();
            prop_assert!(pair.verify(&m2, &signature).is_err());
        }

        #[test]
        fn test_single_bit_tamper_rejected(
            seed in any::<[u8; 32]>(),
            message in proptest::collection::vec(any::<u8>(), 1..128),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
            tamper_signature in any::<bool>()
        ) {
            let pair = key_pair_from_seed(&seed);
            let signature = pair.sign(&message).unwrap();

            let result = if tamper_signature {
                let mut bytes = signature.to_bytes();
                bytes[index.index(bytes.len())] ^= 1 << bit;
                pair.verify(&message, &Signature::from_bytes(bytes))
            } else {
                let mut tampered = message.clone();
                let i = index.index(tampered.len());
                tampered[i] ^= 1 << bit;
                pair.verify(&tampered, &signature)
            };
            prop_assert_eq!(result, Err(CryptoError::SignatureRejected));
        }

        #[test]
        fn test_handshake_rejects_any_tampered_server_message(
            index in 0usize..100,
            bit in 0u8..8
        ) {
            let device_keys = KeyPair::generated().unwrap();
            let server_keys = KeyPair::generated().unwrap();
            let mut device = DeviceHandshake::new(&device_keys);
            let mut server = ServerHandshake::new(&server_keys);

            let m1 = device.start().unwrap();
            let reply = server.handle_device_message(&m1).unwrap();
            let mut bytes = codec::decode(&reply.server_message).unwrap();
            bytes[index] ^= 1 << bit;

            prop_assert!(device.handle_server_message(&codec::encode(&bytes)).is_err());
            prop_assert!(device.server_public_key().is_none());
        }
    }
}
