//! Payload codecs keyed by content type

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// MessagePack content type, the default for new jobs
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// JSON content type
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// YAML content type
pub const CONTENT_TYPE_YAML: &str = "application/yaml";

/// Serialization format for job payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// MessagePack format (binary, compact, fast)
    #[default]
    MessagePack,
    /// JSON format (human-readable, larger)
    Json,
    /// YAML format
    Yaml,
}

impl Codec {
    /// Get the content type string for this codec
    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::MessagePack => CONTENT_TYPE_MSGPACK,
            Codec::Json => CONTENT_TYPE_JSON,
            Codec::Yaml => CONTENT_TYPE_YAML,
        }
    }

    /// Parse content type string to codec
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        match content_type {
            CONTENT_TYPE_MSGPACK | "application/x-msgpack" => Ok(Codec::MessagePack),
            CONTENT_TYPE_JSON => Ok(Codec::Json),
            CONTENT_TYPE_YAML | "application/x-yaml" => Ok(Codec::Yaml),
            other => Err(Error::UnknownContentType(other.to_string())),
        }
    }

    /// Encode a value
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            // Named encoding keeps structs as maps, which is what other
            // msgpack producers expect.
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
            Codec::Json => serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string())),
            Codec::Yaml => serde_yaml_ng::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| Error::Serialization(e.to_string())),
        }
    }

    /// Decode a value
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::MessagePack => Ok(rmp_serde::from_slice(data)?),
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::Yaml => Ok(serde_yaml_ng::from_slice(data)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Resize {
        path: String,
        width: u32,
    }

    #[test]
    fn test_content_type_lookup() {
        assert_eq!(
            Codec::from_content_type("application/json").unwrap(),
            Codec::Json
        );
        assert_eq!(
            Codec::from_content_type("application/x-msgpack").unwrap(),
            Codec::MessagePack
        );
        assert!(matches!(
            Codec::from_content_type("text/plain"),
            Err(Error::UnknownContentType(ct)) if ct == "text/plain"
        ));
    }

    #[test]
    fn test_struct_payload_in_every_format() {
        let payload = Resize {
            path: "img/cat.png".to_string(),
            width: 640,
        };

        for codec in [Codec::MessagePack, Codec::Json, Codec::Yaml] {
            let bytes = codec.encode(&payload).unwrap();
            let decoded: Resize = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, payload, "codec {:?}", codec);
        }
    }

    #[test]
    fn test_shape_mismatch_is_a_decode_error() {
        let bytes = Codec::Json.encode("not a number").unwrap();
        let err = Codec::Json.decode::<u64>(&bytes).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
