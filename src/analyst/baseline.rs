//! Baseline adaptation
//!
//! Normal-traffic observations fold into the stored baseline with an
//! exponential moving average. Attack traffic never reaches this path:
//! the detector only adapts when no rule fired.

use chrono::Utc;

use crate::models::{Baseline, FlowSample};

/// Fold one clean sample into the baseline: `new = α·sample + (1−α)·old`.
/// The destination and protocol sets stay fixed; they were established
/// during profiling and only a re-profile changes them.
pub fn ema_update(baseline: &Baseline, sample: &FlowSample, alpha: f64) -> Baseline {
    Baseline {
        avg_pps: alpha * sample.pps + (1.0 - alpha) * baseline.avg_pps,
        avg_bps: alpha * sample.bps + (1.0 - alpha) * baseline.avg_bps,
        dst_ips: baseline.dst_ips.clone(),
        dst_ports: baseline.dst_ports.clone(),
        protocols: baseline.protocols.clone(),
        sparse: baseline.sparse,
        established_at: baseline.established_at,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(pps: f64, bps: f64) -> Baseline {
        let now = Utc::now();
        Baseline {
            avg_pps: pps,
            avg_bps: bps,
            dst_ips: vec!["10.0.0.10".to_string()],
            dst_ports: vec![443],
            protocols: vec!["tcp".to_string()],
            sparse: false,
            established_at: now,
            updated_at: now,
        }
    }

    fn sample(pps: f64, bps: f64) -> FlowSample {
        FlowSample {
            device_id: "d-1".to_string(),
            mac: "aa:bb:cc:00:00:01".to_string(),
            pps,
            bps,
            unique_dst_ips: 1,
            unique_dst_ports: 1,
            protocols: vec!["tcp".to_string()],
            window_seconds: 10,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_ema_converges_toward_observations() {
        let mut current = baseline(1.0, 100.0);
        for _ in 0..50 {
            current = ema_update(&current, &sample(2.0, 200.0), 0.1);
        }
        assert!((current.avg_pps - 2.0).abs() < 0.05);
        assert!((current.avg_bps - 200.0).abs() < 5.0);
    }

    #[test]
    fn test_single_step_weighting() {
        let updated = ema_update(&baseline(1.0, 100.0), &sample(11.0, 1100.0), 0.1);
        assert!((updated.avg_pps - 2.0).abs() < 1e-9);
        assert!((updated.avg_bps - 200.0).abs() < 1e-9);
        assert_eq!(updated.dst_ports, vec![443], "sets do not adapt");
    }
}
