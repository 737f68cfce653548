use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::{RecoError, Result};
use crate::model::{Batch, Event, Product, ProductChanges, ProductId};
use crate::reader::DataReader;

/// Reads events and products from JSON-lines files.
///
/// Events are streamed in bounded batches and the cursor survives end of file,
/// so lines appended later are picked up by the next incremental read. The
/// product file is small by comparison and is diffed as a whole.
#[derive(Debug)]
pub struct JsonLinesReader {
    events_path: PathBuf,
    products_path: Option<PathBuf>,
    batch_size: usize,
    events: Option<BufReader<File>>,
    line_no: usize,
    at_eof: bool,
    products_synced: bool,
    known_products: BTreeMap<ProductId, Product>,
}

impl JsonLinesReader {
    pub fn new(events_path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            events_path: events_path.into(),
            products_path: None,
            batch_size: batch_size.max(1),
            events: None,
            line_no: 0,
            at_eof: false,
            products_synced: false,
            known_products: BTreeMap::new(),
        }
    }

    pub fn with_products(mut self, products_path: impl Into<PathBuf>) -> Self {
        self.products_path = Some(products_path.into());
        self
    }

    fn events(&mut self) -> Result<&mut BufReader<File>> {
        if self.events.is_none() {
            let file = File::open(&self.events_path).map_err(|e| {
                RecoError::Reader(format!("{}: {e}", self.events_path.display()))
            })?;
            self.events = Some(BufReader::new(file));
        }
        self.events
            .as_mut()
            .ok_or_else(|| RecoError::Internal("event file not open".to_string()))
    }

    fn read_events(&mut self) -> Result<Vec<Event>> {
        let limit = self.batch_size;
        let path = self.events_path.clone();
        let mut line_no = self.line_no;
        let mut events = Vec::with_capacity(limit);
        let mut at_eof = false;
        let reader = self.events()?;
        let mut line = String::new();
        while events.len() < limit {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                at_eof = true;
                break;
            }
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            events.push(parse_line(&path, line_no, &line)?);
        }
        self.line_no = line_no;
        self.at_eof = at_eof;
        Ok(events)
    }

    fn diff_products(&mut self) -> Result<ProductChanges> {
        let Some(path) = self.products_path.clone() else {
            self.products_synced = true;
            return Ok(ProductChanges::default());
        };
        let file = File::open(&path)
            .map_err(|e| RecoError::Reader(format!("{}: {e}", path.display())))?;

        let mut current = BTreeMap::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let product: Product = parse_line(&path, idx + 1, &line)?;
            current.insert(product.id, product);
        }

        let mut changes = ProductChanges::default();
        for (id, product) in &current {
            if self.known_products.get(id) != Some(product) {
                changes.upserted.push(product.clone());
            }
        }
        for id in self.known_products.keys() {
            if !current.contains_key(id) {
                changes.removed.push(*id);
            }
        }
        self.known_products = current;
        self.products_synced = true;
        Ok(changes)
    }
}

fn parse_line<T: DeserializeOwned>(path: &Path, line_no: usize, line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| RecoError::Reader(format!("{}:{line_no}: {e}", path.display())))
}

impl DataReader for JsonLinesReader {
    fn reset(&mut self) -> Result<()> {
        self.events = None;
        self.line_no = 0;
        self.at_eof = false;
        self.products_synced = false;
        self.known_products.clear();
        Ok(())
    }

    fn read_next_batch(&mut self) -> Result<Batch> {
        let products = if self.products_synced {
            ProductChanges::default()
        } else {
            self.diff_products()?
        };
        let events = self.read_events()?;
        Ok(Batch::new(events).with_products(products))
    }

    fn finished_reading(&self) -> bool {
        self.at_eof && self.products_synced
    }

    fn update_products(&mut self) -> Result<ProductChanges> {
        self.diff_products()
    }

    fn skip_events(&mut self, count: u64, catalogue: Vec<Product>) -> Result<()> {
        self.reset()?;
        self.known_products = catalogue.into_iter().map(|p| (p.id, p)).collect();
        let mut skipped = 0u64;
        let mut line_no = 0usize;
        let mut at_eof = false;
        let reader = self.events()?;
        let mut line = String::new();
        while skipped < count {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                at_eof = true;
                break;
            }
            line_no += 1;
            if !line.trim().is_empty() {
                skipped += 1;
            }
        }
        self.line_no = line_no;
        self.at_eof = at_eof;
        Ok(())
    }
}
