mod backends;
mod engine;
mod registry;

pub use backends::{StubEngine, StubExtractor};
pub use engine::{
    EngineOutcome, EngineParams, ExtractionCallback, ExtractionOutcome, FaceCapture, FaceEngine,
    FaceImage, FeatureComparator, FeatureExtractor, LivenessType, PerformanceMode, SharedEngine,
};
pub use registry::EngineRegistry;
