//! Typed event payloads for the closed set of POS resource kinds.
//!
//! The wire protocol carries `resource_type` as a string and `payload` as
//! raw JSON. Internally both are lifted into a closed sum type: an unknown
//! resource kind or a payload that fails its schema is rejected as a
//! validation error at the protocol boundary, never silently mis-handled.
//!
//! Each payload carries the client's last-known version token
//! (`expected_version`) which the conflict detector compares against the
//! server's current resource version.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The closed set of business entities the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Product,
    InventoryItem,
    Sale,
}

impl ResourceKind {
    /// Parse the wire tag. Unknown tags are a validation error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "product" => Some(Self::Product),
            "inventory_item" => Some(Self::InventoryItem),
            "sale" => Some(Self::Sale),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::InventoryItem => "inventory_item",
            Self::Sale => "sale",
        }
    }

    /// All kinds, in snapshot-table order.
    #[must_use]
    pub fn all() -> [ResourceKind; 3] {
        [Self::Product, Self::InventoryItem, Self::Sale]
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unknown resource type '{0}'")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {reason}")]
    Invalid { kind: ResourceKind, reason: String },
}

/// Field values for a product mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Client's last-known resource version (lost-update detection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

/// Field values for an inventory mutation. Quantity is absolute, not a
/// delta; deltas would make version-token comparison meaningless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryPayload {
    pub product_id: String,
    pub location_id: String,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

/// One line of a sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// Field values for a completed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePayload {
    pub location_id: String,
    pub lines: Vec<SaleLine>,
    pub total_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// Tagged union over the known payload schemas.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourcePayload {
    Product(ProductPayload),
    InventoryItem(InventoryPayload),
    Sale(SalePayload),
}

impl ResourcePayload {
    /// Decode a raw wire payload against the schema of `kind`.
    pub fn decode(kind: ResourceKind, raw: &Value) -> Result<Self, PayloadError> {
        let invalid = |e: serde_json::Error| PayloadError::Invalid {
            kind,
            reason: e.to_string(),
        };
        match kind {
            ResourceKind::Product => serde_json::from_value(raw.clone())
                .map(Self::Product)
                .map_err(invalid),
            ResourceKind::InventoryItem => serde_json::from_value(raw.clone())
                .map(Self::InventoryItem)
                .map_err(invalid),
            ResourceKind::Sale => serde_json::from_value(raw.clone())
                .map(Self::Sale)
                .map_err(invalid),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Product(_) => ResourceKind::Product,
            Self::InventoryItem(_) => ResourceKind::InventoryItem,
            Self::Sale(_) => ResourceKind::Sale,
        }
    }

    /// The client's last-known version token, if the payload carried one.
    #[must_use]
    pub fn expected_version(&self) -> Option<i64> {
        match self {
            Self::Product(p) => p.expected_version,
            Self::InventoryItem(p) => p.expected_version,
            Self::Sale(p) => p.expected_version,
        }
    }

    /// Serialize back to the raw wire shape (version token stripped; it is
    /// a transport concern, not resource state).
    #[must_use]
    pub fn to_value(&self) -> Value {
        let strip = |mut v: Value| {
            if let Some(obj) = v.as_object_mut() {
                obj.remove("expected_version");
            }
            v
        };
        match self {
            Self::Product(p) => strip(serde_json::to_value(p).unwrap_or(Value::Null)),
            Self::InventoryItem(p) => strip(serde_json::to_value(p).unwrap_or(Value::Null)),
            Self::Sale(p) => strip(serde_json::to_value(p).unwrap_or(Value::Null)),
        }
    }
}
