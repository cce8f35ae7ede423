use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{CohortSettings, PhaseWeights};
use crate::store::RatingRepository;

pub const WEIGHT_TOLERANCE: f64 = 0.001;

impl Default for CohortSettings {
    fn default() -> Self {
        Self {
            weights: PhaseWeights {
                application: 0.4,
                interview: 0.3,
                character: 0.3,
            },
            outlier_std_devs: 1.5,
            top_n_display: 5,
        }
    }
}

pub fn validate_settings(settings: &CohortSettings) -> Result<(), EngineError> {
    let weights = settings.weights;
    for (label, value) in [
        ("application_weight", weights.application),
        ("interview_weight", weights.interview),
        ("character_weight", weights.character),
    ] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(EngineError::InvalidSettings(format!(
                "{label} must be between 0 and 1, got {value}"
            )));
        }
    }

    let sum = weights.sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(EngineError::InvalidWeights { sum });
    }

    if !settings.outlier_std_devs.is_finite() || settings.outlier_std_devs <= 0.0 {
        return Err(EngineError::InvalidSettings(format!(
            "outlier_std_devs must be a positive number, got {}",
            settings.outlier_std_devs
        )));
    }

    Ok(())
}

/// Falls back to the defaults without persisting them.
pub async fn resolve_settings<R>(repo: &R, cohort_id: Uuid) -> Result<CohortSettings, EngineError>
where
    R: RatingRepository + ?Sized,
{
    match repo.settings(cohort_id).await? {
        Some(settings) => Ok(settings),
        None => {
            debug!(%cohort_id, "no stored settings, using defaults");
            Ok(CohortSettings::default())
        }
    }
}

pub async fn save_settings<R>(
    repo: &R,
    cohort_id: Uuid,
    settings: &CohortSettings,
) -> Result<(), EngineError>
where
    R: RatingRepository + ?Sized,
{
    validate_settings(settings)?;
    repo.save_settings(cohort_id, settings).await?;
    info!(
        %cohort_id,
        application = settings.weights.application,
        interview = settings.weights.interview,
        character = settings.weights.character,
        outlier_std_devs = settings.outlier_std_devs,
        top_n = settings.top_n_display,
        "cohort settings saved"
    );
    Ok(())
}
