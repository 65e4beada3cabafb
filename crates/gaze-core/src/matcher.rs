use crate::enrollment::EnrollmentSet;
use crate::face::MatchDecision;

/// Nearest-descriptor match: Euclidean distance from the probe to every
/// enrollment row, argmin. The enrollment is any-match, so the nearest row
/// alone decides. Returns `None` for an empty set or a dimension mismatch.
pub fn nearest_match(probe: &[f64], set: &EnrollmentSet) -> Option<MatchDecision> {
    if set.is_empty() || probe.len() != set.dim() {
        return None;
    }

    let mut best: Option<MatchDecision> = None;
    for (i, row) in set.vectors.rows().into_iter().enumerate() {
        let dist = row
            .iter()
            .zip(probe.iter())
            .map(|(a, b)| {
                let d = a - b;
                d * d
            })
            .sum::<f64>()
            .sqrt();
        if best.map_or(true, |b| dist < b.distance) {
            best = Some(MatchDecision {
                distance: dist,
                enrollment_index: i,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::EnrollmentEntry;
    use std::time::SystemTime;

    fn set_of(rows: Vec<Vec<f64>>) -> EnrollmentSet {
        let entries = vec![EnrollmentEntry {
            label: "t".to_string(),
            time: 0,
            data: rows,
        }];
        EnrollmentSet::from_entries(&entries, SystemTime::UNIX_EPOCH).unwrap()
    }

    #[test]
    fn picks_nearest_row() {
        let set = set_of(vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.1, 0.1]]);
        let m = nearest_match(&[0.0, 0.0], &set).unwrap();
        assert_eq!(m.enrollment_index, 2);
        assert!((m.distance - (0.02f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn exact_match_has_zero_distance() {
        let set = set_of(vec![vec![0.5, 0.5, 0.5]]);
        let m = nearest_match(&[0.5, 0.5, 0.5], &set).unwrap();
        assert_eq!(m.distance, 0.0);
        assert!(m.is_accepting(0.35));
    }

    #[test]
    fn distance_is_never_negative() {
        let set = set_of(vec![vec![-3.0, 4.0]]);
        let m = nearest_match(&[3.0, -4.0], &set).unwrap();
        assert!(m.distance >= 0.0);
        assert!((m.distance - 10.0).abs() < 1e-12);
    }

    #[test]
    fn empty_set_has_no_match() {
        let set = set_of(vec![]);
        assert!(nearest_match(&[0.0; 128], &set).is_none());
    }

    #[test]
    fn dimension_mismatch_has_no_match() {
        let set = set_of(vec![vec![0.0, 0.0]]);
        assert!(nearest_match(&[0.0, 0.0, 0.0], &set).is_none());
    }
}
