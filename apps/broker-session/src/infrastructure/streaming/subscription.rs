//! Price subscriptions.
//!
//! A subscription is created over REST against a context id; the context id
//! binds it to one WebSocket connection, and the reference id tags every
//! streamed frame that belongs to it.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::domain::PriceSnapshot;

/// REST resource for price subscriptions.
pub const PRICE_SUBSCRIPTIONS_PATH: &str = "/trade/v1/prices/subscriptions";

/// A tradable instrument to stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instrument {
    /// Instrument id.
    pub uic: u64,
    /// Asset type, e.g. `Stock` or `StockOption`.
    pub asset_type: String,
}

impl Instrument {
    /// Create an instrument.
    #[must_use]
    pub fn new(uic: u64, asset_type: impl Into<String>) -> Self {
        Self {
            uic,
            asset_type: asset_type.into(),
        }
    }

    /// Reference id used for this instrument's subscription.
    #[must_use]
    pub fn reference_id(&self) -> String {
        format!("p{}_{}", self.uic, self.asset_type)
    }
}

/// Fresh subscription context id. Unique per connection attempt so a
/// reconnect never collides with a context the server still holds.
#[must_use]
pub fn new_context_id() -> String {
    format!("ctx{}", Uuid::new_v4().simple())
}

/// Server-side price subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Connection-wide context id.
    pub context_id: String,
    /// Per-subscription reference id.
    pub reference_id: String,
    /// Instrument id.
    pub uic: u64,
    /// Asset type.
    pub asset_type: String,
    /// Requested field groups.
    pub field_groups: Vec<String>,
}

impl Subscription {
    /// Subscription for `instrument` under `context_id`.
    #[must_use]
    pub fn new(context_id: &str, instrument: &Instrument, field_groups: &[String]) -> Self {
        Self {
            context_id: context_id.to_string(),
            reference_id: instrument.reference_id(),
            uic: instrument.uic,
            asset_type: instrument.asset_type.clone(),
            field_groups: field_groups.to_vec(),
        }
    }

    /// Body of the create request.
    #[must_use]
    pub fn request_body(&self, account_key: &str) -> Value {
        json!({
            "ContextId": self.context_id,
            "ReferenceId": self.reference_id,
            "Arguments": {
                "AccountKey": account_key,
                "Uic": self.uic,
                "AssetType": self.asset_type,
                "FieldGroups": self.field_groups,
            },
        })
    }

    /// Path that removes every subscription of `context_id`.
    #[must_use]
    pub fn context_path(context_id: &str) -> String {
        format!("{PRICE_SUBSCRIPTIONS_PATH}/{context_id}")
    }
}

/// Create-subscription response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionResponse {
    /// Echoed reference id.
    #[serde(default)]
    pub reference_id: Option<String>,
    /// Current price, delivered before any streamed update.
    #[serde(default)]
    pub snapshot: Option<PriceSnapshot>,
    /// Subscription state as reported by the server.
    #[serde(default)]
    pub state: Option<String>,
}

/// Active subscriptions of the current connection, by reference id.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_reference: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription.
    pub fn insert(&self, subscription: Subscription) {
        self.by_reference
            .write()
            .insert(subscription.reference_id.clone(), subscription);
    }

    /// Instrument id streamed under `reference_id`.
    #[must_use]
    pub fn uic_for(&self, reference_id: &str) -> Option<u64> {
        self.by_reference.read().get(reference_id).map(|s| s.uic)
    }

    /// Context id of the registered subscriptions, if any.
    #[must_use]
    pub fn context_id(&self) -> Option<String> {
        self.by_reference
            .read()
            .values()
            .next()
            .map(|s| s.context_id.clone())
    }

    /// Remove everything.
    pub fn clear(&self) -> usize {
        let mut map = self.by_reference.write();
        let removed = map.len();
        map.clear();
        removed
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_reference.read().len()
    }

    /// Whether there are none.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_reference.read().is_empty()
    }
}
