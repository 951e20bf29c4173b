use crate::constants::DEFAULT_MAX_NEW_TOKENS;
use candle_transformers::generation::Sampling;

/// Decoding parameters handed unchanged to [`super::VisionLanguageModel::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    /// `None` leaves the distribution unconstrained.
    pub top_p: Option<f64>,
    pub num_beams: usize,
    pub max_new_tokens: usize,
    pub use_cache: bool,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: None,
            num_beams: 1,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            use_cache: true,
            seed: None,
        }
    }
}

impl GenerationConfig {
    pub fn do_sample(&self) -> bool {
        self.temperature > 0.
    }

    pub fn sampling(&self) -> Sampling {
        if !self.do_sample() {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        match self.top_p {
            None => Sampling::All { temperature },
            Some(p) => Sampling::TopP { p, temperature },
        }
    }
}
