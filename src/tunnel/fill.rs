//! Background fill decision.
//!
//! When the client consumer of a response goes away, the producer may keep
//! reading so the cache writer gets the whole object. Whether that is worth
//! it is a policy question, so it sits behind a trait.

use crate::config::BackgroundFillConfig;

/// State of the transfer at the moment the client consumer failed.
#[derive(Debug, Clone, Copy)]
pub struct FillProgress {
    /// Producer bytes consumed so far.
    pub bytes_read: u64,
    /// Declared body length, if known.
    pub declared_length: Option<u64>,
    /// A cache-write consumer of the same producer is still alive.
    pub cache_consumer_alive: bool,
}

pub trait BackgroundFillPolicy: Send + Sync + std::fmt::Debug {
    fn should_fill(&self, progress: &FillProgress) -> bool;
}

/// Fill when enough of the body has already been read.
///
/// Unknown-length bodies qualify only with a zero threshold.
#[derive(Debug, Clone)]
pub struct RatioFill {
    enabled: bool,
    threshold: f64,
}

impl RatioFill {
    pub fn new(threshold: f64) -> Self {
        Self {
            enabled: true,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &BackgroundFillConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.completed_threshold.clamp(0.0, 1.0),
        }
    }
}

impl BackgroundFillPolicy for RatioFill {
    fn should_fill(&self, progress: &FillProgress) -> bool {
        if !self.enabled || !progress.cache_consumer_alive {
            return false;
        }
        match progress.declared_length {
            Some(0) => true,
            Some(total) => progress.bytes_read as f64 / total as f64 >= self.threshold,
            None => self.threshold <= 0.0,
        }
    }
}

/// Never fill.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFill;

impl BackgroundFillPolicy for NeverFill {
    fn should_fill(&self, _progress: &FillProgress) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(read: u64, declared: Option<u64>, cache: bool) -> FillProgress {
        FillProgress {
            bytes_read: read,
            declared_length: declared,
            cache_consumer_alive: cache,
        }
    }

    #[test]
    fn ratio_threshold_applies_to_known_lengths() {
        let policy = RatioFill::new(0.5);
        assert!(!policy.should_fill(&progress(40, Some(100), true)));
        assert!(policy.should_fill(&progress(50, Some(100), true)));
        assert!(policy.should_fill(&progress(0, Some(0), true)));
    }

    #[test]
    fn requires_live_cache_consumer() {
        let policy = RatioFill::new(0.0);
        assert!(!policy.should_fill(&progress(90, Some(100), false)));
    }

    #[test]
    fn unknown_length_needs_zero_threshold() {
        assert!(!RatioFill::new(0.1).should_fill(&progress(10, None, true)));
        assert!(RatioFill::new(0.0).should_fill(&progress(10, None, true)));
    }

    #[test]
    fn default_config_fills_any_body_with_a_cache_writer() {
        let policy = RatioFill::from_config(&BackgroundFillConfig::default());
        assert!(policy.should_fill(&progress(0, Some(100), true)));
        assert!(policy.should_fill(&progress(5, None, true)));
        assert!(!policy.should_fill(&progress(5, None, false)));
    }

    #[test]
    fn disabled_config_never_fills() {
        let config = BackgroundFillConfig {
            enabled: false,
            ..BackgroundFillConfig::default()
        };
        let policy = RatioFill::from_config(&config);
        assert!(!policy.should_fill(&progress(100, Some(100), true)));
        assert!(!NeverFill.should_fill(&progress(100, Some(100), true)));
    }
}
