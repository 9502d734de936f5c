use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::detect::{ExtractionOutcome, FaceImage, FeatureExtractor};
use crate::error::FlowError;

use super::still::{ImageDecoder, IngestionItem};

/// Where extracted features end up.
pub trait IngestionSink: Send + Sync {
    fn persist(&self, label: &str, feature: &str, crop: &FaceImage) -> Result<(), FlowError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestionTally {
    pub success_count: usize,
    pub failure_count: usize,
}

impl IngestionTally {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    Persisted,
    DecodeFailed(String),
    ExtractionFailed(String),
    PersistFailed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Persisted)
    }
}

#[derive(Clone, Debug)]
pub struct ItemReport {
    pub index: usize,
    pub total: usize,
    pub label: String,
    pub outcome: ItemOutcome,
}

pub type ProgressObserver = Arc<dyn Fn(&ItemReport) + Send + Sync>;

/// Sequential import: decode, extract, persist, one item at a time.
///
/// The extractor completes asynchronously; the pipeline blocks on a
/// capacity-1 channel until the item's callback fires, so item k+1 is never
/// handed to the extractor before item k has been recorded. Every failure is
/// local to its item.
pub struct IngestionPipeline {
    decoder: Arc<dyn ImageDecoder>,
    extractor: Arc<dyn FeatureExtractor>,
    sink: Arc<dyn IngestionSink>,
    observer: Option<ProgressObserver>,
}

impl IngestionPipeline {
    pub fn new(
        decoder: Arc<dyn ImageDecoder>,
        extractor: Arc<dyn FeatureExtractor>,
        sink: Arc<dyn IngestionSink>,
    ) -> Self {
        Self {
            decoder,
            extractor,
            sink,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn run(&self, items: &[IngestionItem]) -> IngestionTally {
        let mut tally = IngestionTally::default();
        for (index, item) in items.iter().enumerate() {
            let outcome = self.process(item);
            if outcome.is_success() {
                tally.success_count += 1;
            } else {
                tally.failure_count += 1;
                log::warn!("import of {} failed: {:?}", item.label, outcome);
            }
            if let Some(observer) = &self.observer {
                observer(&ItemReport {
                    index,
                    total: items.len(),
                    label: item.label.clone(),
                    outcome,
                });
            }
        }
        log::info!(
            "import finished: {} succeeded, {} failed",
            tally.success_count,
            tally.failure_count
        );
        tally
    }

    fn process(&self, item: &IngestionItem) -> ItemOutcome {
        let image = match self.decoder.decode(item) {
            Ok(image) => image,
            Err(err) => return ItemOutcome::DecodeFailed(err.to_string()),
        };

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.extractor.extract(
            image,
            &item.label,
            Box::new(move |outcome| {
                let _ = done_tx.send(outcome);
            }),
        );
        let extraction = match done_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                return ItemOutcome::ExtractionFailed(
                    FlowError::Extraction("callback dropped without a result".into()).to_string(),
                )
            }
        };

        match extraction {
            ExtractionOutcome::Extracted { feature, crop } => {
                match self.sink.persist(&item.label, &feature, &crop) {
                    Ok(()) => ItemOutcome::Persisted,
                    Err(err) => ItemOutcome::PersistFailed(err.to_string()),
                }
            }
            ExtractionOutcome::Failed(reason) => {
                ItemOutcome::ExtractionFailed(FlowError::Extraction(reason).to_string())
            }
        }
    }

    /// Run on a worker thread and deliver exactly one tally to `reporter`,
    /// including the `(0, 0)` tally for an empty batch.
    pub fn spawn(
        self,
        items: Vec<IngestionItem>,
        reporter: Sender<IngestionTally>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let tally = self.run(&items);
            if reporter.send(tally).is_err() {
                log::warn!("import tally dropped: reporting context is gone");
            }
        })
    }
}
