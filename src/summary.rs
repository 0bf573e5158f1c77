use crate::grading::GradeBoundary;
use crate::store::ResultRecord;
use serde::Serialize;
use std::cmp::Ordering;

/// Report rounding: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCount {
    pub letter: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPosition {
    pub student_id: String,
    pub total_score: f64,
    pub grade: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub record_count: usize,
    pub mean_total: f64,
    pub median_total: f64,
    pub highest_total: Option<f64>,
    pub lowest_total: Option<f64>,
    pub grade_distribution: Vec<GradeCount>,
    pub positions: Vec<StudentPosition>,
}

/// Class statistics over stored records. Positions use competition ranking:
/// equal totals share a position and the next position skips ahead.
pub fn summarize(records: &[ResultRecord], boundaries: &[GradeBoundary]) -> ClassSummary {
    let totals: Vec<f64> = records.iter().map(|r| r.total_score).collect();
    let n = totals.len();
    let mean_total = if n > 0 {
        round_off_1_decimal(totals.iter().sum::<f64>() / (n as f64))
    } else {
        0.0
    };
    let highest_total = totals.iter().copied().reduce(f64::max);
    let lowest_total = totals.iter().copied().reduce(f64::min);

    // Boundary order first; letters no longer in the table (older records) follow.
    let mut grade_distribution: Vec<GradeCount> = boundaries
        .iter()
        .map(|b| GradeCount {
            letter: b.letter.clone(),
            count: 0,
        })
        .collect();
    for r in records {
        match grade_distribution.iter_mut().find(|g| g.letter == r.grade) {
            Some(g) => g.count += 1,
            None => grade_distribution.push(GradeCount {
                letter: r.grade.clone(),
                count: 1,
            }),
        }
    }

    let mut ranked: Vec<&ResultRecord> = records.iter().collect();
    ranked.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    let mut positions: Vec<StudentPosition> = Vec::with_capacity(n);
    for (i, r) in ranked.iter().enumerate() {
        let position = match positions.last() {
            Some(prev) if prev.total_score == r.total_score => prev.position,
            _ => i + 1,
        };
        positions.push(StudentPosition {
            student_id: r.student_id.clone(),
            total_score: r.total_score,
            grade: r.grade.clone(),
            position,
        });
    }

    ClassSummary {
        record_count: n,
        mean_total,
        median_total: round_off_1_decimal(compute_median(&totals)),
        highest_total,
        lowest_total,
        grade_distribution,
        positions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::ScoringConfig;
    use crate::store::ResultScope;

    fn rec(student: &str, total: f64, grade: &str) -> ResultRecord {
        ResultRecord {
            student_id: student.into(),
            scope: ResultScope {
                class_id: "SS1C".into(),
                subject_code: "BIO".into(),
                session: "2025/2026".into(),
                term: "3".into(),
            },
            component_scores: Default::default(),
            total_score: total,
            grade: grade.into(),
            updated_at: None,
        }
    }

    #[test]
    fn round_off_matches_report_rounding() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(35.6818), 35.7);
    }

    #[test]
    fn ties_share_a_position() {
        let records = vec![
            rec("STU003", 70.0, "B+"),
            rec("STU001", 83.0, "A"),
            rec("STU002", 70.0, "B+"),
            rec("STU004", 34.0, "F"),
        ];
        let s = summarize(&records, &ScoringConfig::system_default().boundaries);
        let pos: Vec<(&str, usize)> = s
            .positions
            .iter()
            .map(|p| (p.student_id.as_str(), p.position))
            .collect();
        assert_eq!(
            pos,
            vec![("STU001", 1), ("STU002", 2), ("STU003", 2), ("STU004", 4)]
        );
        assert_eq!(s.highest_total, Some(83.0));
        assert_eq!(s.lowest_total, Some(34.0));
        assert_eq!(s.mean_total, 64.3);
        assert_eq!(s.median_total, 70.0);
    }

    #[test]
    fn distribution_follows_boundary_order() {
        let records = vec![rec("a", 83.0, "A"), rec("b", 81.0, "A"), rec("c", 10.0, "E")];
        let s = summarize(&records, &ScoringConfig::system_default().boundaries);
        assert_eq!(s.grade_distribution[0].letter, "A+");
        assert_eq!(s.grade_distribution[0].count, 0);
        assert_eq!(s.grade_distribution[1].count, 2);
        let last = s.grade_distribution.last().expect("legacy letter");
        assert_eq!((last.letter.as_str(), last.count), ("E", 1));
    }

    #[test]
    fn empty_scope_summary() {
        let s = summarize(&[], &ScoringConfig::system_default().boundaries);
        assert_eq!(s.record_count, 0);
        assert_eq!(s.mean_total, 0.0);
        assert_eq!(s.highest_total, None);
        assert!(s.positions.is_empty());
    }
}
