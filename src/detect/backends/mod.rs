pub mod stub;

pub use stub::{StubEngine, StubExtractor};
