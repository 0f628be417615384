// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fact values and datoms.
use std::sync::Arc;

use crate::ident::{Attribute, EntityId};

/// A value stored under an `(entity, attribute)` pair.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Interned string.
    Str(Arc<str>),
    /// Reference to another entity.
    Ref(EntityId),
}

impl Value {
    /// Returns the integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the referenced entity, if any.
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Self::Ref(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

// Unsuffixed integer literals default to i32.
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<EntityId> for Value {
    fn from(v: EntityId) -> Self {
        Self::Ref(v)
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Ref(e) => write!(f, "{e}"),
        }
    }
}

/// One fact: `entity` has `value` under `attribute`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Datom {
    /// Subject entity.
    pub entity: EntityId,
    /// Attribute name.
    pub attribute: Attribute,
    /// Stored value.
    pub value: Value,
}

impl Datom {
    /// Builds a datom.
    pub fn new(entity: EntityId, attribute: Attribute, value: impl Into<Value>) -> Self {
        Self {
            entity,
            attribute,
            value: value.into(),
        }
    }
}
