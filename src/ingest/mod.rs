//! Batch face import.
//!
//! Still images are decoded, handed to the feature extractor one at a time
//! and persisted through an `IngestionSink`. A single bad item never aborts
//! the batch; the caller gets one success/failure tally at the end.

mod pipeline;
mod still;

pub use pipeline::{
    IngestionPipeline, IngestionSink, IngestionTally, ItemOutcome, ItemReport, ProgressObserver,
};
pub use still::{collect_items, ImageCrateDecoder, ImageDecoder, IngestionItem, SourceRef};
