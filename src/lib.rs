pub mod buffer;
pub mod cache;
pub mod debayer;
pub mod decode;
pub mod histogram;
pub mod inspection;
pub mod photometry;
pub mod preview;
pub mod stretch;

#[cfg(test)]
mod test_pipeline;

// Re-export commonly used items
pub use buffer::{BayerPattern, DecodedImage, PixelData, PixelFormat};
pub use cache::{CacheKey, PreviewCache};
pub use decode::{decode, BlobPayload, DecodeError};
pub use inspection::{inspect, GridSpec, InspectionOutcome, InspectionResult, InspectionScheduler};
pub use photometry::{measure_star, StarMeasurement};
pub use preview::{PreviewImage, WcsInfo};
pub use stretch::{stretch, ColorBalance, StretchConfig, StretchLevel};
