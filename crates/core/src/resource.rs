//! Resource and operation vocabulary.
//!
//! The same names appear in three places: API paths (`/products`), queued
//! operation kinds (`UPDATE_PRODUCT`) and local collections. This module is the
//! single mapping between them.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A server resource the client knows how to mirror or mutate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Product,
    Category,
    Customer,
    Sale,
    Return,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Product,
        Resource::Category,
        Resource::Customer,
        Resource::Sale,
        Resource::Return,
    ];

    /// Resources refreshed wholesale at the end of every sync cycle.
    pub const REFERENCE_DATA: [Resource; 3] =
        [Resource::Product, Resource::Category, Resource::Customer];

    /// First path segment of the resource's REST endpoints.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Resource::Product => "products",
            Resource::Category => "categories",
            Resource::Customer => "customers",
            Resource::Sale => "sales",
            Resource::Return => "returns",
        }
    }

    /// Upper-case name used inside operation kinds.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Resource::Product => "PRODUCT",
            Resource::Category => "CATEGORY",
            Resource::Customer => "CUSTOMER",
            Resource::Sale => "SALE",
            Resource::Return => "RETURN",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.path_segment() == segment)
    }

    fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.wire_name() == name)
    }

    /// Whether offline GETs for this resource can be answered locally.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Resource::Return)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Mutation verb of a queued operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    fn wire_name(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }

    fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "CREATE" => Some(Action::Create),
            "UPDATE" => Some(Action::Update),
            "DELETE" => Some(Action::Delete),
            _ => None,
        }
    }

    /// Whether the action targets an existing record (needs an `id`).
    pub fn targets_existing(&self) -> bool {
        !matches!(self, Action::Create)
    }
}

/// Kind of a deferred mutation, e.g. `CREATE_PRODUCT`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OperationKind {
    pub action: Action,
    pub resource: Resource,
}

impl OperationKind {
    pub fn new(action: Action, resource: Resource) -> Self {
        Self { action, resource }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.action.wire_name(), self.resource.wire_name())
    }
}

impl FromStr for OperationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, resource) = s
            .split_once('_')
            .ok_or_else(|| DomainError::unknown_kind(s))?;

        match (Action::from_wire_name(action), Resource::from_wire_name(resource)) {
            (Some(action), Some(resource)) => Ok(Self { action, resource }),
            _ => Err(DomainError::unknown_kind(s)),
        }
    }
}

impl Serialize for OperationKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OperationKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
