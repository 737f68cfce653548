use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Batch, ConsumerId, Delta, Event, Product, ProductChanges, ProductId};

/// Everything known about one consumer: which products they touched, and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerProfile {
    pub id: ConsumerId,
    /// Event kinds observed per product.
    pub interactions: BTreeMap<ProductId, BTreeSet<String>>,
    pub event_count: u64,
}

impl ConsumerProfile {
    pub fn new(id: ConsumerId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn has_interacted(&self, product: ProductId) -> bool {
        self.interactions.contains_key(&product)
    }

    fn record(&mut self, event: &Event) {
        self.interactions
            .entry(event.product)
            .or_default()
            .insert(event.kind.clone());
        self.event_count += 1;
    }
}

/// Catalogue and consumer history of one model generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStore {
    products: BTreeMap<ProductId, Product>,
    consumers: HashMap<ConsumerId, ConsumerProfile>,
    event_count: u64,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn product(&self, id: ProductId) -> Option<&Product> {
        self.products.get(&id)
    }

    pub fn contains_product(&self, id: ProductId) -> bool {
        self.products.contains_key(&id)
    }

    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.products.values()
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<&ConsumerProfile> {
        self.consumers.get(&id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Total number of events folded into this store.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Whether `consumer` already produced any of `kinds` on `product`.
    pub fn has_happened(&self, consumer: ConsumerId, product: ProductId, kinds: &[String]) -> bool {
        if kinds.is_empty() {
            return false;
        }
        self.consumers
            .get(&consumer)
            .and_then(|profile| profile.interactions.get(&product))
            .is_some_and(|seen| kinds.iter().any(|k| seen.contains(k)))
    }

    /// For every product, the number of consumers who touched it and at least one seed.
    /// Seeds themselves are not counted.
    pub fn co_occurrence(&self, seeds: &[ProductId]) -> HashMap<ProductId, u64> {
        let seeds: HashSet<ProductId> = seeds.iter().copied().collect();
        let mut counts = HashMap::new();
        for profile in self.consumers.values() {
            if !profile.interactions.keys().any(|p| seeds.contains(p)) {
                continue;
            }
            for product in profile.interactions.keys() {
                if !seeds.contains(product) {
                    *counts.entry(*product).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn apply_products(&mut self, changes: ProductChanges) {
        for id in changes.removed {
            self.products.remove(&id);
        }
        for product in changes.upserted {
            self.products.insert(product.id, product);
        }
    }

    fn apply_events(&mut self, events: Vec<Event>) {
        for event in events {
            self.consumers
                .entry(event.consumer)
                .or_insert_with(|| ConsumerProfile::new(event.consumer))
                .record(&event);
            self.event_count += 1;
        }
    }
}

/// Pending change to a [`DataStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum DataDelta {
    Noop,
    /// Fold a batch of events and product changes in.
    Append {
        events: Vec<Event>,
        products: ProductChanges,
    },
    /// Replace the whole store, as after reading a model file.
    Replace(Box<DataStore>),
}

impl DataDelta {
    pub fn from_batch(batch: &Batch) -> Self {
        if batch.is_empty() {
            return DataDelta::Noop;
        }
        DataDelta::Append {
            events: batch.events.clone(),
            products: batch.products.clone(),
        }
    }

    pub fn products(changes: &ProductChanges) -> Self {
        if changes.is_empty() {
            return DataDelta::Noop;
        }
        DataDelta::Append {
            events: Vec::new(),
            products: changes.clone(),
        }
    }
}

impl Delta for DataDelta {
    type Target = DataStore;

    fn commit(self, target: &mut DataStore) -> Result<()> {
        match self {
            DataDelta::Noop => {}
            DataDelta::Append { events, products } => {
                target.apply_products(products);
                target.apply_events(events);
            }
            DataDelta::Replace(store) => *target = *store,
        }
        Ok(())
    }

    fn is_noop(&self) -> bool {
        matches!(self, DataDelta::Noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(events: Vec<Event>, products: Vec<Product>) -> DataStore {
        let mut store = DataStore::new();
        let batch = Batch::new(events).with_products(ProductChanges {
            upserted: products,
            removed: vec![],
        });
        DataDelta::from_batch(&batch).commit(&mut store).unwrap();
        store
    }

    #[test]
    fn append_records_events_and_products() {
        let store = store_with(
            vec![Event::new(1, 10, "view"), Event::new(1, 10, "purchase")],
            vec![Product::new(10, "kettle")],
        );
        assert_eq!(store.event_count(), 2);
        assert_eq!(store.product_count(), 1);
        let profile = store.consumer(1).unwrap();
        assert_eq!(profile.event_count, 2);
        assert!(profile.has_interacted(10));
    }

    #[test]
    fn has_happened_matches_configured_kinds_only() {
        let store = store_with(vec![Event::new(1, 10, "view")], vec![]);
        assert!(store.has_happened(1, 10, &["view".to_string()]));
        assert!(!store.has_happened(1, 10, &["purchase".to_string()]));
        assert!(!store.has_happened(2, 10, &["view".to_string()]));
        assert!(!store.has_happened(1, 10, &[]));
    }

    #[test]
    fn co_occurrence_counts_consumers_sharing_a_seed() {
        let store = store_with(
            vec![
                Event::new(1, 10, "view"),
                Event::new(1, 11, "view"),
                Event::new(2, 10, "view"),
                Event::new(2, 11, "view"),
                Event::new(2, 12, "view"),
                Event::new(3, 12, "view"),
            ],
            vec![],
        );
        let counts = store.co_occurrence(&[10]);
        assert_eq!(counts.get(&11), Some(&2));
        assert_eq!(counts.get(&12), Some(&1));
        assert!(!counts.contains_key(&10));
    }

    #[test]
    fn removals_apply_before_upserts() {
        let mut store = store_with(vec![], vec![Product::new(1, "old")]);
        DataDelta::products(&ProductChanges {
            upserted: vec![Product::new(1, "renamed")],
            removed: vec![1],
        })
        .commit(&mut store)
        .unwrap();
        assert_eq!(store.product(1).unwrap().name, "renamed");
    }

    #[test]
    fn empty_batch_is_noop() {
        assert!(DataDelta::from_batch(&Batch::default()).is_noop());
        assert!(DataDelta::products(&ProductChanges::default()).is_noop());
    }

    #[test]
    fn store_survives_json_round_trip() {
        let store = store_with(
            vec![Event::new(7, 3, "rating").with_value(4.0)],
            vec![Product::new(3, "lamp").with_attribute("lang", "en")],
        );
        let json = serde_json::to_string(&store).unwrap();
        let back: DataStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
