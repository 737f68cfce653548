use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::model::{Batch, Event, Product, ProductChanges, ProductId};
use crate::reader::DataReader;

#[derive(Debug, Clone)]
enum ProductChange {
    Upsert(Product),
    Remove(ProductId),
}

#[derive(Debug, Default)]
struct SourceLog {
    events: Vec<Event>,
    products: Vec<ProductChange>,
}

/// Append-only in-memory source, shared by any number of readers.
///
/// Producers push events and catalogue changes through a clone of the source;
/// each [`MemoryReader`] keeps its own cursor.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    log: Arc<Mutex<SourceLog>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_events(&self, events: impl IntoIterator<Item = Event>) {
        self.lock().events.extend(events);
    }

    pub fn upsert_product(&self, product: Product) {
        self.lock().products.push(ProductChange::Upsert(product));
    }

    pub fn remove_product(&self, id: ProductId) {
        self.lock().products.push(ProductChange::Remove(id));
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn reader(&self, batch_size: usize) -> MemoryReader {
        MemoryReader {
            source: self.clone(),
            batch_size: batch_size.max(1),
            event_cursor: 0,
            product_cursor: 0,
            pending: BTreeMap::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryReader {
    source: MemorySource,
    batch_size: usize,
    event_cursor: usize,
    product_cursor: usize,
    // Catalogue differences found by `skip_events`, reported with the next drain.
    pending: BTreeMap<ProductId, Option<Product>>,
}

impl MemoryReader {
    /// Collapse journal entries past the cursor so the last change per product wins.
    fn drain_products(&mut self, log: &SourceLog) -> ProductChanges {
        let mut latest = std::mem::take(&mut self.pending);
        for change in &log.products[self.product_cursor.min(log.products.len())..] {
            match change {
                ProductChange::Upsert(p) => latest.insert(p.id, Some(p.clone())),
                ProductChange::Remove(id) => latest.insert(*id, None),
            };
        }
        self.product_cursor = log.products.len();

        let mut changes = ProductChanges::default();
        for (id, product) in latest {
            match product {
                Some(p) => changes.upserted.push(p),
                None => changes.removed.push(id),
            }
        }
        changes
    }
}

impl DataReader for MemoryReader {
    fn reset(&mut self) -> Result<()> {
        self.event_cursor = 0;
        self.product_cursor = 0;
        self.pending.clear();
        Ok(())
    }

    fn read_next_batch(&mut self) -> Result<Batch> {
        let source = self.source.clone();
        let log = source.lock();
        let start = self.event_cursor.min(log.events.len());
        let end = (start + self.batch_size).min(log.events.len());
        let events = log.events[start..end].to_vec();
        self.event_cursor = end;
        let products = self.drain_products(&log);
        Ok(Batch::new(events).with_products(products))
    }

    fn finished_reading(&self) -> bool {
        let log = self.source.lock();
        self.event_cursor >= log.events.len()
            && self.product_cursor >= log.products.len()
            && self.pending.is_empty()
    }

    fn update_products(&mut self) -> Result<ProductChanges> {
        let source = self.source.clone();
        let log = source.lock();
        Ok(self.drain_products(&log))
    }

    fn skip_events(&mut self, count: u64, catalogue: Vec<Product>) -> Result<()> {
        let source = self.source.clone();
        let log = source.lock();

        let mut current = BTreeMap::new();
        for change in &log.products {
            match change {
                ProductChange::Upsert(p) => current.insert(p.id, p.clone()),
                ProductChange::Remove(id) => current.remove(id),
            };
        }
        let known: BTreeMap<ProductId, Product> =
            catalogue.into_iter().map(|p| (p.id, p)).collect();

        self.pending.clear();
        for (id, product) in &current {
            if known.get(id) != Some(product) {
                self.pending.insert(*id, Some(product.clone()));
            }
        }
        for id in known.keys() {
            if !current.contains_key(id) {
                self.pending.insert(*id, None);
            }
        }
        self.product_cursor = log.products.len();
        self.event_cursor = usize::try_from(count).unwrap_or(usize::MAX).min(log.events.len());
        Ok(())
    }
}
