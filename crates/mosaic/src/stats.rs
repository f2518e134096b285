//! Percentile stretch over valid pixels.

use rayon::prelude::*;

pub use ntl_common::Percentiles;

/// Lower stretch bound, in percent.
pub const LOW_PERCENTILE: f64 = 2.0;
/// Upper stretch bound, in percent.
pub const HIGH_PERCENTILE: f64 = 98.0;

/// 2nd/98th percentiles of the non-NaN values, `(0, 0)` when there are none.
pub fn percentile_stretch(data: &[f32]) -> Percentiles {
    let mut valid: Vec<f32> = data.par_iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return Percentiles::default();
    }
    valid.par_sort_unstable_by(|a, b| a.total_cmp(b));

    Percentiles::new(
        percentile_sorted(&valid, LOW_PERCENTILE),
        percentile_sorted(&valid, HIGH_PERCENTILE),
    )
}

/// Linear-interpolated percentile `q` (0..=100) of an ascending slice.
pub fn percentile_sorted(sorted: &[f32], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0] as f64,
        n => {
            let rank = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let a = sorted[lo] as f64;
            let b = sorted[hi] as f64;
            a + (b - a) * (rank - lo as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_nodata_is_zero() {
        let p = percentile_stretch(&[f32::NAN; 16]);
        assert_eq!(p, Percentiles::new(0.0, 0.0));
        assert!(p.is_empty());
        assert_eq!(percentile_stretch(&[]), Percentiles::default());
    }

    #[test]
    fn test_linear_interpolation() {
        let data: Vec<f32> = (0..=100).map(|v| v as f32).collect();
        let p = percentile_stretch(&data);
        assert!((p.p02 - 2.0).abs() < 1e-9);
        assert!((p.p98 - 98.0).abs() < 1e-9);

        let five = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        // rank = 0.98 * 4 = 3.92
        assert!((percentile_sorted(&five, 98.0) - 4.92).abs() < 1e-9);
    }

    #[test]
    fn test_ignores_nan_and_order() {
        let data = [5.0, f32::NAN, 1.0, 3.0, f32::NAN, 2.0, 4.0];
        let p = percentile_stretch(&data);
        assert!((p.p02 - 1.08).abs() < 1e-6);
        assert!((p.p98 - 4.92).abs() < 1e-6);
    }

    #[test]
    fn test_single_value() {
        let p = percentile_stretch(&[f32::NAN, 7.5]);
        assert_eq!(p, Percentiles::new(7.5, 7.5));
    }
}
