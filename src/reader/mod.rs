//! Batched data readers: the streaming source every update job pulls from.

pub mod jsonl;
pub mod memory;

use crate::error::Result;
use crate::model::{Batch, Product, ProductChanges};

pub use jsonl::JsonLinesReader;
pub use memory::{MemoryReader, MemorySource};

/// Streaming cursor over interaction data.
///
/// A full rebuild calls [`reset`](DataReader::reset) and then drains the reader.
/// Incremental updates keep reading from wherever the cursor stopped.
/// Implementations are called from blocking threads, so they may do I/O directly.
pub trait DataReader: Send {
    /// Rewind to the beginning of the source.
    fn reset(&mut self) -> Result<()>;

    /// The next bounded batch of unseen data. An empty batch means nothing new.
    fn read_next_batch(&mut self) -> Result<Batch>;

    /// True once the cursor has consumed everything currently available.
    fn finished_reading(&self) -> bool;

    /// Catalogue changes since the last call, without touching events.
    fn update_products(&mut self) -> Result<ProductChanges>;

    /// Rewind, then move the event cursor past the first `count` events. Used
    /// after loading a model file, or after a failed update, when the model
    /// already folded those events in. `catalogue` is the product set that
    /// model holds: the next product report is the difference between the
    /// source and it, so products dropped from the source come back as removals.
    fn skip_events(&mut self, count: u64, catalogue: Vec<Product>) -> Result<()>;
}

impl<R: DataReader + ?Sized> DataReader for Box<R> {
    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn read_next_batch(&mut self) -> Result<Batch> {
        (**self).read_next_batch()
    }

    fn finished_reading(&self) -> bool {
        (**self).finished_reading()
    }

    fn update_products(&mut self) -> Result<ProductChanges> {
        (**self).update_products()
    }

    fn skip_events(&mut self, count: u64, catalogue: Vec<Product>) -> Result<()> {
        (**self).skip_events(count, catalogue)
    }
}
