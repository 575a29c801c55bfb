#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::agreement::AgreementKeyPair;
    use crate::cipher::{self, CipherStream, Iv, SymmetricKey};
    use crate::envelope;

    proptest! {
        #[test]
        fn test_agreement_symmetry(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let alice = AgreementKeyPair::from_secret_bytes(a);
            let bob = AgreementKeyPair::from_secret_bytes(b);
            let from_alice = alice.shared_secret(&bob.public_bytes()).expect("valid peer");
            let from_bob = bob.shared_secret(&alice.public_bytes()).expect("valid peer");
            prop_assert_eq!(from_alice, from_bob);
        }

        #[test]
        fn test_one_shot_round_trip(
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
            msg in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let key = SymmetricKey::from_bytes(key);
            let iv = Iv::from_bytes(iv);
            let ct = cipher::encrypt(&key, &iv, &msg);
            prop_assert_eq!(ct.len(), cipher::padded_len(msg.len()));
            prop_assert_eq!(cipher::decrypt(&key, &iv, &ct).expect("round trip"), msg);
        }

        #[test]
        fn test_stream_matches_one_shot_for_any_chunking(
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
            msg in proptest::collection::vec(any::<u8>(), 0..512),
            chunk in 1usize..64,
        ) {
            let key = SymmetricKey::from_bytes(key);
            let iv = Iv::from_bytes(iv);
            let expected_ct = cipher::encrypt(&key, &iv, &msg);

            let mut enc = CipherStream::encrypt(&key, &iv);
            let mut ct = Vec::new();
            for piece in msg.chunks(chunk) {
                let bound = enc.max_output_len(piece.len());
                let out = enc.update(piece);
                prop_assert!(out.len() <= bound);
                ct.extend_from_slice(&out);
            }
            ct.extend_from_slice(&enc.finalize().expect("finalize"));
            prop_assert_eq!(&ct, &expected_ct);

            let mut dec = CipherStream::decrypt(&key, &iv);
            let mut pt = Vec::new();
            for piece in ct.chunks(chunk) {
                pt.extend_from_slice(&dec.update(piece));
            }
            pt.extend_from_slice(&dec.finalize().expect("finalize"));
            prop_assert_eq!(pt, msg);
        }

        #[test]
        fn test_envelope_round_trip(
            key in any::<[u8; 32]>(),
            msg in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let key = SymmetricKey::from_bytes(key);
            let sealed = envelope::seal(&key, &msg).expect("seal");
            prop_assert_eq!(envelope::open(&key, &sealed).expect("open"), msg);
        }

        #[test]
        fn test_envelope_open_never_panics(
            key in any::<[u8; 32]>(),
            blob in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let key = SymmetricKey::from_bytes(key);
            let _ = envelope::open(&key, &blob);
        }
    }
}
