use radar_common::{RadarError, Tier, TierThresholds};

/// Map a momentum score to its tier. Lower bounds are inclusive.
///
/// A negative or non-finite score means something upstream is broken, so it is
/// rejected rather than clamped into the lowest tier.
pub fn classify(score: f64, thresholds: &TierThresholds) -> Result<Tier, RadarError> {
    if !score.is_finite() || score < 0.0 {
        return Err(RadarError::InvalidScore(score));
    }
    let tier = if score >= thresholds.viral {
        Tier::ViralEmergency
    } else if score >= thresholds.coordinated {
        Tier::CoordinatedActivity
    } else if score >= thresholds.emerging {
        Tier::EmergingNarrative
    } else {
        Tier::AmbientNoise
    };
    Ok(tier)
}

/// Thresholds bundled with the classification. Stateless apart from configuration.
#[derive(Debug, Clone, Copy)]
pub struct TierClassifier {
    thresholds: TierThresholds,
}

impl TierClassifier {
    pub fn new(thresholds: TierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, score: f64) -> Result<Tier, RadarError> {
        classify(score, &self.thresholds)
    }

    /// Lowest score that lands in `tier`.
    pub fn floor(&self, tier: Tier) -> f64 {
        match tier {
            Tier::AmbientNoise => 0.0,
            Tier::EmergingNarrative => self.thresholds.emerging,
            Tier::CoordinatedActivity => self.thresholds.coordinated,
            Tier::ViralEmergency => self.thresholds.viral,
        }
    }
}

impl Default for TierClassifier {
    fn default() -> Self {
        Self::new(TierThresholds::default())
    }
}
