pub mod convert;
pub mod drift;
pub mod gain;
pub mod resampler;

pub use convert::Converter;
pub use drift::DriftCorrector;
pub use gain::GainControl;
pub use resampler::Resampler;
