use serde::Serialize;

pub const DEFAULT_MAX_LENGTH: usize = 512;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;

/// Sampling settings for a single generation. Serialized as-is into the `parameters` echo of a chat response.
#[derive(Serialize, Debug, Copy, Clone, PartialEq)]
pub struct SamplingParams {
    /// Maximum number of new tokens
    pub max_length: usize,
    pub temperature: f64,
    /// Nucleus threshold
    pub top_p: f64,
}

impl Default for SamplingParams {
    #[tracing::instrument(level = "trace", skip())]
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
        }
    }
}
