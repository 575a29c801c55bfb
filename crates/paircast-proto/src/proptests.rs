#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::types::{ParticipantKey, RelayProtocolOptions, Topic};
    use crate::uri::PairingUri;

    proptest! {
        #[test]
        fn test_topic_hex_round_trip(bytes in any::<[u8; 32]>()) {
            let topic = Topic::from_raw(bytes);
            let parsed = Topic::from_hex(&topic.to_hex()).expect("valid hex");
            prop_assert_eq!(parsed, topic);
        }

        #[test]
        fn test_uri_round_trip(
            topic in any::<[u8; 32]>(),
            key in any::<[u8; 32]>(),
            controller in any::<bool>(),
            protocol in "[a-z0-9]{1,16}",
        ) {
            let uri = PairingUri::new(
                Topic::from_raw(topic),
                ParticipantKey::from_raw(key),
                controller,
                RelayProtocolOptions { protocol, params: None },
            );
            let parsed = PairingUri::parse(&uri.to_string()).expect("round trip");
            prop_assert_eq!(parsed, uri);
        }

        #[test]
        fn test_uri_parse_never_panics(input in "\\PC{0,200}") {
            let _ = PairingUri::parse(&input);
        }
    }
}
