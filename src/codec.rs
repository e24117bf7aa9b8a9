//! Serde helpers for binary fields in JSON.
//!
//! Keys are hex, certificates and other blobs are base64.

pub mod hex_key {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let mut key = [0u8; 32];
        hex::decode_to_slice(&text, &mut key).map_err(serde::de::Error::custom)?;
        Ok(key)
    }
}

pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::hex_key")]
        key: [u8; 32],
        #[serde(with = "super::base64_bytes")]
        blob: Vec<u8>,
    }

    #[test]
    fn fields_are_text_encoded() {
        let sample = Sample {
            key: [0xab; 32],
            blob: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["key"], "ab".repeat(32));
        assert_eq!(json["blob"], "AQID");
        assert_eq!(serde_json::from_value::<Sample>(json).unwrap(), sample);
    }

    #[test]
    fn short_key_is_rejected() {
        let json = serde_json::json!({ "key": "abcd", "blob": "" });
        assert!(serde_json::from_value::<Sample>(json).is_err());
    }
}
