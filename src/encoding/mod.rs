//! Binary data encodings. Bincode is used for everything: log entries and
//! snapshots on disk, and the peer and client network protocols.

pub mod bincode;

use crate::error::Result;

/// A serializable value, encoded with bincode. Implemented for all serde
/// types via the blanket impl below, so log entries, wire messages, and
/// snapshot payloads all share the same encoding surface.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
    }

    /// Decodes a value from bytes.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: std::io::Read>(reader: R) -> Result<Self> {
        bincode::deserialize_from(reader)
    }

    /// Decodes a value from a reader, or returns None if the reader is
    /// closed. Used to detect graceful disconnects on the wire.
    fn maybe_decode_from<R: std::io::Read>(reader: R) -> Result<Option<Self>> {
        bincode::maybe_deserialize_from(reader)
    }
}

impl<V: serde::Serialize + serde::de::DeserializeOwned> Value for V {}
