use std::fmt;

use serde::{Deserialize, Serialize};

use crate::val::Val;

/// One level of a result key: either the group values for that depth or an
/// id that keeps ungrouped rows apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Group(Vec<Val>),
    Ungrouped(u64),
}

impl KeyPart {
    pub fn is_grouped(&self) -> bool {
        matches!(self, KeyPart::Group(_))
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Group(values) => {
                let mut first = true;
                for value in values {
                    if !first {
                        f.write_str("|")?;
                    }
                    write!(f, "{value}")?;
                    first = false;
                }
                Ok(())
            }
            KeyPart::Ungrouped(id) => write!(f, "#{id}"),
        }
    }
}

/// Path from the root of the result tree to a row. The root has no parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    parts: Vec<KeyPart>,
}

impl Key {
    pub fn root() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    /// Depth of this key in the tree; `None` for the root.
    pub fn depth(&self) -> Option<usize> {
        self.parts.len().checked_sub(1)
    }

    /// Depth of the rows stored beneath this key.
    pub fn child_depth(&self) -> usize {
        self.parts.len()
    }

    pub fn resolve(&self, part: KeyPart) -> Key {
        let mut parts = Vec::with_capacity(self.parts.len() + 1);
        parts.extend_from_slice(&self.parts);
        parts.push(part);
        Key { parts }
    }

    pub fn parent(&self) -> Option<Key> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Key {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    pub fn last(&self) -> Option<&KeyPart> {
        self.parts.last()
    }

    pub fn is_grouped(&self) -> bool {
        self.parts.last().is_none_or(KeyPart::is_grouped)
    }

    /// Returns a copy whose last part carries a fresh ungrouped id.
    pub fn with_unique_id(&self, id: u64) -> Key {
        let mut parts = self.parts.clone();
        if let Some(last @ KeyPart::Ungrouped(_)) = parts.last_mut() {
            *last = KeyPart::Ungrouped(id);
        }
        Key { parts }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return f.write_str("/");
        }
        for part in &self.parts {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}
