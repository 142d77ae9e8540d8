//! Structured (JSON) message encoding.
//!
//! Unknown fields are ignored and missing optional fields take their
//! defaults, so producers and consumers can be upgraded independently.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{headers, Codec, Generation};
use crate::broker::Message;
use crate::error::CodecError;
use crate::types::{ImagePath, LoadJob, PersistenceUpdate};

const JSON: &str = "application/json";

/// JSON codec for the current message generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredCodec;

impl StructuredCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Message, CodecError> {
        Ok(Message::new(serde_json::to_vec(value)?).with_header(headers::CONTENT_TYPE, JSON))
    }

    fn decode<T: DeserializeOwned>(message: &Message) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&message.body)?)
    }
}

impl Codec for StructuredCodec {
    fn generation(&self) -> Generation {
        Generation::Structured
    }

    fn encode_job(&self, job: &LoadJob) -> Result<Message, CodecError> {
        Self::encode(job)
    }

    fn decode_job(&self, message: &Message) -> Result<LoadJob, CodecError> {
        Self::decode(message)
    }

    fn encode_update(&self, update: &PersistenceUpdate) -> Result<Message, CodecError> {
        Self::encode(update)
    }

    fn decode_update(&self, message: &Message) -> Result<PersistenceUpdate, CodecError> {
        Self::decode(message)
    }

    fn encode_path(&self, path: &ImagePath) -> Result<Message, CodecError> {
        Self::encode(path)
    }

    fn decode_path(&self, message: &Message) -> Result<ImagePath, CodecError> {
        Self::decode(message)
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `BTreeMap<String, Vec<u8>>` with base64 values.
pub(crate) mod base64_map {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(key, value)| (key.as_str(), BASE64.encode(value)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| {
                BASE64
                    .decode(value)
                    .map(|bytes| (key, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateKind;

    #[test]
    fn test_job_decodes_with_missing_optional_fields() {
        let body = br#"{
            "anchor": "photos",
            "relative_path": "a.jpg",
            "image_id": "67e55044-10b1-426f-9247-bb680e5fe0c8"
        }"#;
        let job = StructuredCodec.decode_job(&Message::new(body.to_vec())).unwrap();
        assert_eq!(job.anchor, "photos");
        assert!(job.missing_hash_algorithms.is_empty());
        assert!(!job.generate_thumbnail);
    }

    #[test]
    fn test_job_ignores_unknown_fields() {
        let body = br#"{
            "anchor": "photos",
            "relative_path": "a.jpg",
            "image_id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "priority": 5
        }"#;
        assert!(StructuredCodec.decode_job(&Message::new(body.to_vec())).is_ok());
    }

    #[test]
    fn test_thumbnail_update_shape() {
        let update = PersistenceUpdate {
            anchor: "photos".to_string(),
            relative_path: "a.jpg".to_string(),
            kind: UpdateKind::Thumbnail { max_dimension: 256 },
        };
        let message = StructuredCodec.encode_update(&update).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(json["kind"]["type"], "thumbnail");
        assert_eq!(json["kind"]["max_dimension"], 256);
        assert_eq!(message.header(headers::CONTENT_TYPE), Some(JSON));
    }

    #[test]
    fn test_digests_are_base64() {
        let message = Message::new(
            br#"{"anchor":"a","relative_path":"b","kind":{"type":"hashes","digests":{"phash":"AQIDBAUGBwg="}}}"#
                .to_vec(),
        );
        let update = StructuredCodec.decode_update(&message).unwrap();
        match update.kind {
            UpdateKind::Hashes { digests } => {
                assert_eq!(digests["phash"], vec![1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_garbage_body_is_codec_error() {
        let result = StructuredCodec.decode_job(&Message::new(b"not json".to_vec()));
        assert!(matches!(result, Err(CodecError::Json(_))));
    }
}
