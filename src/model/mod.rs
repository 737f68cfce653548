//! In-memory model: the data store, the delta protocol, and the snapshot triple.
//!
//! Every mutation of the served model is split in two phases:
//!
//! 1. **Compute**: unlocked and possibly expensive. Reads a batch (and the
//!    already-committed state) and produces a [`Delta`].
//! 2. **Commit**: cheap. Applies the delta to a private successor of the live
//!    [`Snapshot`], which is then swapped in under the write lock.

pub mod data;
pub mod delta;
pub mod snapshot;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use data::{ConsumerProfile, DataDelta, DataStore};
pub use delta::Delta;
pub use snapshot::{RecommendSettings, Snapshot, SnapshotDelta};

pub type ProductId = u64;
pub type ConsumerId = u64;

/// Contextual key/value bag passed through to scoring and decision engines.
pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Product {
    pub fn new(id: ProductId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

fn default_event_value() -> f64 {
    1.0
}

/// One consumer interaction read from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub consumer: ConsumerId,
    pub product: ProductId,
    pub kind: String,
    #[serde(default = "default_event_value")]
    pub value: f64,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(consumer: ConsumerId, product: ProductId, kind: impl Into<String>) -> Self {
        Self {
            consumer,
            product,
            kind: kind.into(),
            value: default_event_value(),
            at: Utc::now(),
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }
}

/// Additions, renames and removals of catalogue products.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductChanges {
    #[serde(default)]
    pub upserted: Vec<Product>,
    #[serde(default)]
    pub removed: Vec<ProductId>,
}

impl ProductChanges {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }

    pub fn extend(&mut self, other: ProductChanges) {
        self.upserted.extend(other.upserted);
        self.removed.extend(other.removed);
    }
}

/// One bounded chunk of source data handed out by a [`crate::reader::DataReader`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub events: Vec<Event>,
    pub products: ProductChanges,
}

impl Batch {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            products: ProductChanges::default(),
        }
    }

    pub fn with_products(mut self, products: ProductChanges) -> Self {
        self.products = products;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.products.is_empty()
    }
}

/// A product under consideration, filled in by a scoring engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub product: ProductId,
    pub score: f64,
    pub explanation: Option<String>,
}

impl Candidate {
    pub fn new(product: ProductId) -> Self {
        Self {
            product,
            score: 0.0,
            explanation: None,
        }
    }
}

/// Final, ordered answer item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub product: ProductId,
    pub score: f64,
    pub explanation: Option<String>,
}

impl From<Candidate> for Recommendation {
    fn from(c: Candidate) -> Self {
        Self {
            product: c.product,
            score: c.score,
            explanation: c.explanation,
        }
    }
}

/// Two products to present side by side when profiling a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPair {
    pub first: ProductId,
    pub second: ProductId,
}
