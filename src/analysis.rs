use crate::error::AnalysisError;

/// Centered moving average with an odd window `k`.
///
/// Leading NaNs are passed through untouched and the rest is smoothed. Near
/// either end the window shrinks to the points that exist, so the output has
/// the same length as the input. `k` must be smaller than the whole input and
/// no larger than the part after the NaNs.
pub fn moving_average(data: &[f64], k: usize) -> Result<Vec<f64>, AnalysisError> {
    if k % 2 == 0 {
        return Err(AnalysisError::EvenWindow(k));
    }
    if k >= data.len() {
        return Err(AnalysisError::WindowTooLarge {
            window: k,
            len: data.len(),
        });
    }

    let lead = data.iter().take_while(|v| v.is_nan()).count();
    let series = &data[lead..];
    if series.is_empty() {
        return Ok(data.to_vec());
    }
    if k > series.len() {
        return Err(AnalysisError::WindowTooLarge {
            window: k,
            len: series.len(),
        });
    }

    let half = k / 2;
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..lead]);
    out.extend((0..series.len()).map(|i| {
        let window = &series[i.saturating_sub(half)..(i + half + 1).min(series.len())];
        window.iter().sum::<f64>() / window.len() as f64
    }));
    Ok(out)
}
