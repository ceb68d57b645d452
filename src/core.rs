use std::any::Any;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used as a content fingerprint.
///
/// Every generated file is fingerprinted when it is recorded in the
/// [`SyncMetadata`](crate::SyncMetadata). The fingerprint stands in for the
/// baseline contents whenever the baseline snapshot of a file is missing, so
/// the engine can still tell an untouched file from a hand-edited one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Hash32(bytes))
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Hash32::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid blake3 hex digest '{hex}'")))
    }
}

/// The identity of a generator node: the sequence of child names leading to
/// it from the root of the tree. The root itself is named, so `/app` is the
/// root of a tree whose top node is called `app`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodePath(Vec<ArcStr>);

impl NodePath {
    pub(crate) fn root(name: &str) -> Self {
        Self(vec![name.into()])
    }

    pub(crate) fn join(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// The individual segments of this path, starting at the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|segment| segment.as_ref())
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl Debug for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodePath({self})")
    }
}

/// Identifies one task: the node that owns it and its name within that node.
/// Rendered as `/app/module:task`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub node: NodePath,
    pub name: ArcStr,
}

impl TaskId {
    pub(crate) fn new(node: NodePath, name: &str) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskId({self})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_hex_roundtrip() {
        let hash = Hash32::hash(b"hello world");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
    }

    #[test]
    fn hash_from_bad_hex() {
        assert_eq!(Hash32::from_hex("abc"), None);
        assert_eq!(Hash32::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn task_id_display() {
        let node = NodePath::root("app").join("module").join("feature");
        let id = TaskId::new(node, "main");

        assert_eq!(id.to_string(), "/app/module/feature:main");
    }
}
