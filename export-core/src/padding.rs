// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Anonymizing padding (§4.4): top a batch's exposure list up to a jittered
//! target size with synthetic keys, so the true daily count per region
//! can't be read off the export file.

use chrono::{DateTime, Utc};
use export_config::Exposure;
use rand::{rngs::OsRng, Rng};

/// `exposure_key` bytes for synthetic keys come from `OsRng`, not the
/// worker's general-purpose `StdRng` (used for lease-order shuffling):
/// these bytes end up externally visible, unlike shuffle order.
fn random_key(rng: &mut OsRng) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);
    bytes
}

/// Returns `(augmented, generated_only)`. `generated_only` is what callers
/// persist back through the publish store so repeated runs over the same
/// window see byte-identical padding.
pub fn ensure_min_num_exposures(
    source: &[Exposure],
    min_length: usize,
    jitter_range: usize,
    max_length: usize,
    created_at: DateTime<Utc>,
) -> (Vec<Exposure>, Vec<Exposure>) {
    if source.is_empty() {
        return (source.to_vec(), vec![]);
    }

    let mut rng = OsRng;
    let target = min_length + rng.gen_range(0..=jitter_range);
    let mut augmented = source.to_vec();
    if augmented.len() >= target {
        return (augmented, vec![]);
    }

    let mut generated = Vec::new();
    let mut i = 0;
    while augmented.len() < target && augmented.len() < max_length {
        let template = &source[i % source.len()];
        let synthetic = Exposure {
            exposure_key: random_key(&mut rng),
            interval_number: template.interval_number,
            interval_count: template.interval_count,
            regions: template.regions.clone(),
            created_at,
            traveler: template.traveler,
            local_provenance: false,
            transmission_risk: template.transmission_risk,
            report_type: template.report_type,
            days_since_symptom_onset: template.days_since_symptom_onset,
            revised_report_type: None,
            revised_at: None,
        };
        augmented.push(synthetic.clone());
        generated.push(synthetic);
        i += 1;
    }

    (augmented, generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use export_config::ReportType;

    fn sample(n: usize) -> Vec<Exposure> {
        (0..n)
            .map(|i| Exposure {
                exposure_key: [i as u8; 16],
                interval_number: 2650000 + i as i32,
                interval_count: 144,
                regions: vec!["US".into()],
                created_at: Utc::now(),
                traveler: false,
                local_provenance: true,
                transmission_risk: 1,
                report_type: ReportType::Confirmed,
                days_since_symptom_onset: Some(2),
                revised_report_type: None,
                revised_at: None,
            })
            .collect()
    }

    #[test]
    fn empty_source_is_never_padded() {
        let (augmented, generated) = ensure_min_num_exposures(&[], 50, 10, 100, Utc::now());
        assert!(augmented.is_empty());
        assert!(generated.is_empty());
    }

    #[test]
    fn already_at_target_is_unchanged() {
        let source = sample(60);
        let (augmented, generated) = ensure_min_num_exposures(&source, 10, 0, 100, Utc::now());
        assert_eq!(augmented.len(), source.len());
        assert!(generated.is_empty());
    }

    #[test]
    fn pads_up_to_at_least_min_length() {
        let source = sample(3);
        let now = Utc::now();
        let (augmented, generated) = ensure_min_num_exposures(&source, 50, 0, 1000, now);
        assert!(augmented.len() >= 50);
        assert_eq!(augmented.len(), source.len() + generated.len());
        for g in &generated {
            assert_eq!(g.created_at, now);
            assert!(!g.local_provenance);
        }
    }

    #[test]
    fn never_exceeds_max_length() {
        let source = sample(3);
        let (augmented, _) = ensure_min_num_exposures(&source, 500, 0, 10, Utc::now());
        assert_eq!(augmented.len(), 10);
    }

    #[test]
    fn synthetic_keys_copy_template_metadata() {
        let source = sample(1);
        let (augmented, generated) = ensure_min_num_exposures(&source, 5, 0, 5, Utc::now());
        assert_eq!(generated.len(), 4);
        for g in &generated {
            assert_eq!(g.interval_number, source[0].interval_number);
            assert_eq!(g.regions, source[0].regions);
            assert_eq!(g.report_type, source[0].report_type);
        }
        assert_eq!(augmented.len(), 5);
    }
}
