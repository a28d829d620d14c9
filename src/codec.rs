//! Pluggable message codec.
//!
//! The engine never interprets payload bytes itself. A [`Codec`] turns a
//! typed message into the bytes of one frame and back; [`Json`] is the
//! default and covers every serde type. Swapping the codec (bincode,
//! MessagePack, a hand-rolled format) changes nothing above this seam.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encodes and decodes one message type.
///
/// A single codec value is shared by the read and write loops of every
/// connection, so implementations must be cheap to call concurrently.
pub trait Codec<T>: Send + Sync + 'static {
    /// Serialize `value` into frame payload bytes.
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize one frame payload.
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec over serde. The default for servers and clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl<T> Codec<T> for Json
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ChatLine {
        from: String,
        body: String,
    }

    #[test]
    fn json_round_trip() {
        let msg = ChatLine {
            from: "Client 1".into(),
            body: "hello".into(),
        };
        let bytes = Json.encode(&msg).unwrap();
        let back: ChatLine = Json.decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn string_round_trip() {
        let bytes = Json.encode(&"plain text".to_string()).unwrap();
        let back: String = Json.decode(&bytes).unwrap();
        assert_eq!(back, "plain text");
    }

    #[test]
    fn garbage_decodes_to_serialization_error() {
        let err = <Json as Codec<ChatLine>>::decode(&Json, b"{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)), "got: {err}");
        assert!(err.is_recoverable());
    }
}
