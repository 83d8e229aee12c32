//! The schema seam: discovering which objects a Root or an object references.
//!
//! Replication never interprets object bytes itself. It asks a [`Walker`]
//! for the children of a Root payload or of an object value and fetches
//! whatever is missing, one level at a time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::error::{CoreError, Result};

/// Enumerates the hashes referenced by Root payloads and object values.
pub trait Walker: Send + Sync + 'static {
    /// Hashes directly referenced by a Root payload.
    fn root_refs(&self, payload: &[u8]) -> Result<Vec<Hash>>;

    /// Hashes directly referenced by an object value.
    fn object_refs(&self, value: &[u8]) -> Result<Vec<Hash>>;
}

/// An object of the default schema: a list of children plus opaque data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagObject {
    pub refs: Vec<Hash>,
    pub data: Bytes,
}

impl DagObject {
    /// A leaf object carrying only data.
    pub fn leaf(data: impl Into<Bytes>) -> Self {
        Self {
            refs: Vec::new(),
            data: data.into(),
        }
    }

    /// An object with children.
    pub fn node(refs: Vec<Hash>, data: impl Into<Bytes>) -> Self {
        Self {
            refs,
            data: data.into(),
        }
    }

    /// Encode to CBOR.
    pub fn encode(&self) -> Vec<u8> {
        encode_object(self)
    }

    /// Hash of the encoded object.
    pub fn hash(&self) -> Hash {
        Hash::sum(&self.encode())
    }
}

/// The default schema.
///
/// A Root payload is a CBOR array of hashes; an object is a CBOR-encoded
/// [`DagObject`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CborSchema;

impl Walker for CborSchema {
    fn root_refs(&self, payload: &[u8]) -> Result<Vec<Hash>> {
        // An empty payload is a Root with no objects.
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        ciborium::from_reader(payload).map_err(|e| CoreError::Decoding(format!("root payload: {e}")))
    }

    fn object_refs(&self, value: &[u8]) -> Result<Vec<Hash>> {
        Ok(decode_object(value)?.refs)
    }
}

/// Encode a Root payload referencing `refs`.
pub fn encode_root_payload(refs: &[Hash]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + refs.len() * 34);
    let _ = ciborium::into_writer(&refs, &mut buf);
    buf
}

/// Encode an object of the default schema.
pub fn encode_object(obj: &DagObject) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + obj.refs.len() * 34 + obj.data.len());
    let _ = ciborium::into_writer(obj, &mut buf);
    buf
}

/// Decode an object of the default schema.
pub fn decode_object(value: &[u8]) -> Result<DagObject> {
    ciborium::from_reader(value).map_err(|e| CoreError::Decoding(format!("object: {e}")))
}
