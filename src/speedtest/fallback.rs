//! Synthetic upload figure for endpoints that cannot take an upload.
//!
//! Consumer links are asymmetric, so upload is modeled as a random fraction
//! of the measured download rate with a little extra variation.

use std::ops::RangeInclusive;

use rand::Rng;
use tracing::info;

use super::UploadRate;

pub const UPLOAD_RATIO: RangeInclusive<f64> = 0.15..=0.30;
pub const JITTER: RangeInclusive<f64> = 0.9..=1.1;
/// Lowest simulated upload, 1 Mbps.
pub const FLOOR_BPS: f64 = 1_000_000.0;

/// Estimates upload from `download_bps`.
///
/// Returns `None` when the download rate is zero, negative or not finite.
/// No stand-in download rate is assumed in that case, so the upload stays
/// absent instead of being reported as the 1 Mbps floor. The floor only
/// applies to estimates derived from a positive download.
pub fn estimate<R: Rng>(download_bps: f64, rng: &mut R) -> Option<UploadRate> {
    if !download_bps.is_finite() || download_bps <= 0.0 {
        return None;
    }

    let ratio = rng.gen_range(UPLOAD_RATIO);
    let jitter = rng.gen_range(JITTER);
    let bps = (download_bps * ratio * jitter).max(FLOOR_BPS);

    info!(
        "simulated upload {:.2} Mbps from download {:.2} Mbps",
        bps / 1_000_000.0,
        download_bps / 1_000_000.0
    );
    Some(UploadRate::Simulated(bps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn hundred_mbps_download_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let upload = estimate(100_000_000.0, &mut rng).unwrap();
            assert!(upload.is_simulated());
            let bps = upload.bps();
            assert!(bps >= 13_500_000.0 - 1e-6, "{bps} below range");
            assert!(bps <= 33_000_000.0 + 1e-6, "{bps} above range");
        }
    }

    #[test]
    fn slow_download_is_floored() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1_000 {
            let bps = estimate(2_000_000.0, &mut rng).unwrap().bps();
            assert_eq!(bps, FLOOR_BPS);
        }
    }

    #[test]
    fn no_download_signal_means_no_estimate() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(estimate(0.0, &mut rng), None);
        assert_eq!(estimate(-5.0, &mut rng), None);
        assert_eq!(estimate(f64::NAN, &mut rng), None);
    }

    #[test]
    fn same_seed_same_estimate() {
        let a = estimate(80_000_000.0, &mut StdRng::seed_from_u64(42));
        let b = estimate(80_000_000.0, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
