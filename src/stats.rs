pub fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Population standard deviation (divides by N, not N - 1).
pub fn population_std_dev(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        return 0.0;
    }
    let m = mean(scores);
    let variance = scores.iter().map(|x| (x - m).powi(2)).sum::<f64>() / scores.len() as f64;
    variance.sqrt()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlierSplit {
    pub outliers: Vec<f64>,
    pub inliers: Vec<f64>,
}

/// Splits a group into outliers and inliers using the group's own mean and
/// standard deviation. A group of identical scores never has outliers.
pub fn classify_outliers(scores: &[f64], threshold_std_devs: f64) -> OutlierSplit {
    // Summing identical decimals can leave a stddev of a few ulps.
    let s = population_std_dev(scores);
    if s == 0.0 || scores.windows(2).all(|pair| pair[0] == pair[1]) {
        return OutlierSplit {
            outliers: Vec::new(),
            inliers: scores.to_vec(),
        };
    }

    let m = mean(scores);
    let limit = threshold_std_devs * s;
    let (outliers, inliers) = scores
        .iter()
        .copied()
        .partition(|score: &f64| (*score - m).abs() > limit);
    OutlierSplit { outliers, inliers }
}
