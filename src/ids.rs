//! Identifier newtypes used throughout the crate.
//!
//! Every identity in the data model is its own type over a fixed-size byte
//! array, so a chunk checksum can never be passed where a file history id
//! is expected. Checksums are blake3 digests of content; the other ids are
//! random. All of them render as lowercase hex.

use std::{fmt, str::FromStr};

use rand::RngCore;
use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Error parsing an identifier from its hex form.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    /// The input does not have the expected length.
    #[error("invalid length, expected {expected} hex characters")]
    InvalidLength {
        /// Number of hex characters a valid input has.
        expected: usize,
    },
    /// The input is not valid hex.
    #[error("invalid hex")]
    InvalidHex,
}

struct BytesVisitor<const N: usize>;

impl<'de, const N: usize> de::Visitor<'de> for BytesVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of length {N}")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; N];
        for (i, byte) in arr.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(arr)
    }
}

macro_rules! bytes_id {
    ($(#[$attr:meta])* $name:ident, $len:expr) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            derive_more::From,
            derive_more::Into,
            derive_more::AsRef,
        )]
        pub struct $name([u8; $len]);

        impl $name {
            /// Create from a raw byte array.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// The raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// The identifier as a lowercase hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // first five bytes are plenty for log output
                write!(f, concat!(stringify!($name), "({})"), hex::encode(&self.0[..5]))
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != $len * 2 {
                    return Err(ParseIdError::InvalidLength { expected: $len * 2 });
                }
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdError::InvalidHex)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    // Fixed-length structures, including arrays, are supported
                    // in Serde as tuples.
                    let mut s = serializer.serialize_tuple($len)?;
                    for item in &self.0 {
                        s.serialize_element(item)?;
                    }
                    s.end()
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(de::Error::custom)
                } else {
                    deserializer
                        .deserialize_tuple($len, BytesVisitor::<$len>)
                        .map(Self)
                }
            }
        }
    };
}

bytes_id!(
    /// Content hash of a single chunk of file data.
    ChunkChecksum,
    32
);

bytes_id!(
    /// Content hash of a whole assembled file.
    FileChecksum,
    32
);

bytes_id!(
    /// Identity of a multichunk, a container of chunks packed for transfer.
    MultiChunkId,
    20
);

bytes_id!(
    /// Identity of one file's lineage across renames, edits and deletion.
    FileHistoryId,
    20
);

impl ChunkChecksum {
    /// Checksum of the given chunk data.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }
}

impl FileChecksum {
    /// Checksum of the given file contents.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }
}

impl MultiChunkId {
    /// Generate a fresh random id.
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; 20];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl FileHistoryId {
    /// Generate a fresh random id.
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; 20];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The id of a history branched off this one.
    ///
    /// Derived from the origin id, the version at which the histories
    /// diverged and the branching client, so every replica that resolves
    /// the same conflict allocates the same id.
    pub fn derive_branch(&self, version: u64, client: &ClientId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cairn.branch.v1");
        hasher.update(&self.0);
        hasher.update(&version.to_le_bytes());
        hasher.update(client.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.as_bytes()[..20]);
        Self(bytes)
    }
}

/// Name of a participating client.
///
/// Client names key vector clocks and appear in remote database file
/// names, so they are restricted to ASCII alphanumerics. Their
/// lexicographic order is the final tie break wherever the merge logic
/// needs a total order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

/// Error creating a [`ClientId`] from an invalid name.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid client id {0:?}: must be non-empty ASCII alphanumeric")]
pub struct InvalidClientId(String);

impl ClientId {
    /// Create a client id, validating the name.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidClientId> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(InvalidClientId(name));
        }
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = InvalidClientId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

impl FromStr for ClientId {
    type Err = InvalidClientId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = ChunkChecksum::of(b"hello");
        let parsed: ChunkChecksum = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 64);

        let id = FileHistoryId::from_bytes([7u8; 20]);
        let parsed: FileHistoryId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 40);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "abcd".parse::<FileHistoryId>(),
            Err(ParseIdError::InvalidLength { expected: 40 })
        );
        let bad = "zz".repeat(20);
        assert_eq!(bad.parse::<FileHistoryId>(), Err(ParseIdError::InvalidHex));
    }

    #[test]
    fn test_debug_is_short() {
        let id = MultiChunkId::from_bytes([0xab; 20]);
        assert_eq!(format!("{id:?}"), "MultiChunkId(ababababab)");
    }

    #[test]
    fn test_serde_binary_is_fixed_size() {
        let id = FileHistoryId::from_bytes([3u8; 20]);
        let bytes = postcard::to_allocvec(&id).unwrap();
        assert_eq!(bytes.len(), 20);
        let back: FileHistoryId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_serde_human_readable_is_hex() {
        let id = ChunkChecksum::of(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: ChunkChecksum = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_branch_derivation_is_deterministic() {
        let origin = FileHistoryId::from_bytes([9u8; 20]);
        let client = ClientId::new("alice").unwrap();
        let a = origin.derive_branch(3, &client);
        let b = origin.derive_branch(3, &client);
        assert_eq!(a, b);
        assert_ne!(a, origin);
        assert_ne!(a, origin.derive_branch(4, &client));
        assert_ne!(
            a,
            origin.derive_branch(3, &ClientId::new("bob").unwrap())
        );
    }

    #[test]
    fn test_client_id_validation() {
        assert!(ClientId::new("alice01").is_ok());
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("has space").is_err());
        assert!(ClientId::new("has-dash").is_err());
    }

    #[test]
    fn test_client_id_serde() {
        let id = ClientId::new("carol").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol\"");
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert!(serde_json::from_str::<ClientId>("\"bad name\"").is_err());
    }
}
