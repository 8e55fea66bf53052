use serde::Serialize;
use strata_core::{round_bucket, span_days, ContractError, Segment};

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct DensityBuckets {
    pub decision_density_bucket: f64,
    pub result_density_bucket: f64,
}

/// Aggregate counts over every segment divided by the covered span in days,
/// with spans shorter than a day counted as one day.
pub fn compute_density(segments: &[Segment]) -> Result<DensityBuckets, ContractError> {
    let (Some(start_at), Some(end_at)) = (
        segments.iter().map(|segment| segment.start_at).min(),
        segments.iter().map(|segment| segment.end_at).max(),
    ) else {
        return Ok(DensityBuckets::default());
    };

    let days = span_days(start_at, end_at).max(1.0);
    let decisions: u64 = segments
        .iter()
        .map(|segment| u64::from(segment.decision_count))
        .sum();
    let results: u64 = segments
        .iter()
        .map(|segment| u64::from(segment.result_count))
        .sum();

    Ok(DensityBuckets {
        decision_density_bucket: round_bucket("decision_density_bucket", decisions as f64 / days)?,
        result_density_bucket: round_bucket("result_density_bucket", results as f64 / days)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::days(offset)
    }

    fn segment(start: i64, end: i64, decisions: u32, results: u32) -> Segment {
        Segment {
            segment_key: format!("seg-{start}"),
            start_at: day(start),
            end_at: day(end),
            last_signal_at: day(end),
            project_ids: Vec::new(),
            decision_count: decisions,
            result_count: results,
            signal_ids: Vec::new(),
        }
    }

    #[test]
    fn five_decisions_over_ten_days() {
        let density = compute_density(&[segment(0, 10, 5, 0)]).expect("density");
        assert_eq!(density.decision_density_bucket, 0.5);
        assert_eq!(density.result_density_bucket, 0.0);
    }

    #[test]
    fn thirds_round_to_two_decimals() {
        let density = compute_density(&[segment(0, 3, 1, 2)]).expect("density");
        assert_eq!(density.decision_density_bucket, 0.33);
        assert_eq!(density.result_density_bucket, 0.67);
    }

    #[test]
    fn span_is_aggregate_across_segments() {
        let density =
            compute_density(&[segment(0, 5, 2, 0), segment(40, 40, 1, 0)]).expect("density");
        assert_eq!(density.decision_density_bucket, 0.08);
    }

    #[test]
    fn short_spans_count_as_one_day_and_empty_is_zero() {
        let density = compute_density(&[segment(2, 2, 3, 1)]).expect("density");
        assert_eq!(density.decision_density_bucket, 3.0);
        assert_eq!(density.result_density_bucket, 1.0);
        assert_eq!(compute_density(&[]).expect("empty"), DensityBuckets::default());
    }
}
