use crate::config::ProcessingConfig;
use crate::db::{Datapoint, SampleResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SampleAnalysis {
    pub result: SampleResult,
    /// Mean channel reading scaled to 0..=1, when there were any readings.
    pub mean_intensity: Option<f64>,
    pub readings: usize,
}

/// Classifies a closed sample from the spectral readings of its datapoints.
pub fn analyse_sample(datapoints: &[Datapoint], config: &ProcessingConfig) -> SampleAnalysis {
    let readings: Vec<f64> = datapoints
        .iter()
        .flat_map(|datapoint| datapoint.channels.iter().copied())
        .filter(|value| value.is_finite())
        .collect();

    if readings.is_empty() || config.channel_full_scale <= 0.0 {
        return SampleAnalysis {
            result: SampleResult::Inconclusive,
            mean_intensity: None,
            readings: readings.len(),
        };
    }

    let mean = readings.iter().sum::<f64>() / readings.len() as f64;
    let intensity = (mean / config.channel_full_scale).clamp(0.0, 1.0);

    let result = if intensity <= config.hydrated_max {
        SampleResult::Hydrated
    } else if intensity <= config.mild_max {
        SampleResult::MildDehydration
    } else {
        SampleResult::Dehydrated
    };

    SampleAnalysis {
        result,
        mean_intensity: Some(intensity),
        readings: readings.len(),
    }
}
