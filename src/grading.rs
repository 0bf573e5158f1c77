use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Component key -> points, as stored on a result record.
pub type ComponentScores = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentWeight {
    pub key: String,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBoundary {
    pub letter: String,
    pub min_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringConfig {
    pub component_weights: Vec<ComponentWeight>,
    pub boundaries: Vec<GradeBoundary>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingError {
    /// Also raised for a component with no configured weight (`max` 0).
    #[error("score {value} for component '{component}' is outside its allowed range 0..={max}")]
    InvalidScore {
        component: String,
        value: f64,
        max: f64,
    },
    #[error("{0}")]
    Configuration(String),
}

impl GradingError {
    fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Row-level problems (bad input) as opposed to a broken configuration.
    pub fn is_score_error(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

fn boundary(letter: &str, min_score: f64, remark: &str) -> GradeBoundary {
    GradeBoundary {
        letter: letter.to_string(),
        min_score,
        remark: Some(remark.to_string()),
    }
}

impl ScoringConfig {
    /// Built-in CA/Test/Exam split used when nothing is configured.
    pub fn system_default() -> Self {
        Self {
            component_weights: vec![
                ComponentWeight {
                    key: "ca".to_string(),
                    max: 10,
                },
                ComponentWeight {
                    key: "test".to_string(),
                    max: 20,
                },
                ComponentWeight {
                    key: "exam".to_string(),
                    max: 70,
                },
            ],
            boundaries: vec![
                boundary("A+", 90.0, "Distinction"),
                boundary("A", 80.0, "Excellent"),
                boundary("B+", 70.0, "Very good"),
                boundary("B", 60.0, "Good"),
                boundary("C+", 50.0, "Credit"),
                boundary("C", 40.0, "Pass"),
                boundary("D", 35.0, "Weak pass"),
                boundary("F", 0.0, "Fail"),
            ],
        }
    }

    pub fn validate(&self) -> Result<(), GradingError> {
        validate_config(&self.component_weights, &self.boundaries)
    }

    pub fn total_max_possible(&self) -> f64 {
        total_max_possible(&self.component_weights)
    }
}

/// Tolerance for comparing scores and totals against stored values and grade minimums.
pub const SCORE_EPSILON: f64 = 1e-9;

/// Two decimal places, for totals shown while typing.
pub fn round_display(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn total_max_possible(weights: &[ComponentWeight]) -> f64 {
    weights.iter().map(|w| f64::from(w.max)).sum()
}

fn weight_for<'a>(weights: &'a [ComponentWeight], key: &str) -> Option<&'a ComponentWeight> {
    weights.iter().find(|w| w.key == key)
}

/// Sum of the provided component scores. Components absent from `scores` count as 0.
pub fn compute_total(
    scores: &ComponentScores,
    weights: &[ComponentWeight],
) -> Result<f64, GradingError> {
    let mut total = 0.0_f64;
    for (key, &value) in scores {
        let Some(weight) = weight_for(weights, key) else {
            return Err(GradingError::InvalidScore {
                component: key.clone(),
                value,
                max: 0.0,
            });
        };
        let max = f64::from(weight.max);
        if !value.is_finite() || value < 0.0 || value > max {
            return Err(GradingError::InvalidScore {
                component: key.clone(),
                value,
                max,
            });
        }
        total += value;
    }
    Ok(total)
}

/// First boundary (in table order, highest minimum first) whose minimum is
/// <= `total`. Sums a hair under a minimum through float error still reach it.
pub fn resolve_grade(
    total: f64,
    boundaries: &[GradeBoundary],
) -> Result<&GradeBoundary, GradingError> {
    if boundaries.is_empty() {
        return Err(GradingError::config("grade boundary table is empty"));
    }
    boundaries
        .iter()
        .find(|b| b.min_score <= total + SCORE_EPSILON)
        .ok_or_else(|| {
            GradingError::config(format!(
                "no grade boundary covers a total of {}",
                total
            ))
        })
}

pub fn validate_config(
    weights: &[ComponentWeight],
    boundaries: &[GradeBoundary],
) -> Result<(), GradingError> {
    if weights.is_empty() {
        return Err(GradingError::config("at least one score component is required"));
    }
    let mut seen: HashSet<&str> = HashSet::new();
    for w in weights {
        let key = w.key.trim();
        if key.is_empty() {
            return Err(GradingError::config("component keys must not be blank"));
        }
        if key != w.key {
            return Err(GradingError::config(format!(
                "component key '{}' has surrounding whitespace",
                w.key
            )));
        }
        if !seen.insert(key) {
            return Err(GradingError::config(format!(
                "duplicate component key '{}'",
                key
            )));
        }
    }
    if weights.iter().all(|w| w.max == 0) {
        return Err(GradingError::config(
            "at least one component must have a weight above 0",
        ));
    }

    if boundaries.is_empty() {
        return Err(GradingError::config("grade boundary table is empty"));
    }
    let mut prev: Option<&GradeBoundary> = None;
    for b in boundaries {
        if b.letter.trim().is_empty() {
            return Err(GradingError::config("grade letters must not be blank"));
        }
        if !b.min_score.is_finite() || b.min_score < 0.0 {
            return Err(GradingError::config(format!(
                "grade '{}' has an invalid minimum {}",
                b.letter, b.min_score
            )));
        }
        if let Some(p) = prev {
            if b.min_score >= p.min_score {
                return Err(GradingError::config(format!(
                    "grade boundaries must be strictly descending: '{}' ({}) follows '{}' ({})",
                    b.letter, b.min_score, p.letter, p.min_score
                )));
            }
        }
        prev = Some(b);
    }
    // Exhaustive over [0, max]: the catch-all must start at 0.
    if let Some(last) = prev {
        if last.min_score != 0.0 {
            return Err(GradingError::config(format!(
                "lowest grade '{}' must start at 0, not {}",
                last.letter, last.min_score
            )));
        }
    }
    Ok(())
}

/// One value as typed into the grid, before any coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum EnteredScore {
    Empty,
    Number(f64),
    Text(String),
}

impl EnteredScore {
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim();
        if t.is_empty() {
            return Self::Empty;
        }
        match t.parse::<f64>() {
            Ok(v) if v.is_finite() => Self::Number(v),
            _ => Self::Text(t.to_string()),
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Empty,
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Self::Number)
                .unwrap_or_else(|| Self::Text(n.to_string())),
            serde_json::Value::String(s) => Self::parse(s),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Blank and non-numeric input display as 0.
    pub fn display_value(&self) -> f64 {
        self.number().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Graded {
    pub total: f64,
    pub grade: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

pub fn grade_for(scores: &ComponentScores, config: &ScoringConfig) -> Result<Graded, GradingError> {
    let total = compute_total(scores, &config.component_weights)?;
    let b = resolve_grade(total, &config.boundaries)?;
    Ok(Graded {
        total,
        grade: b.letter.clone(),
        remark: b.remark.clone(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayTotal {
    pub total: f64,
    pub out_of_range: Vec<String>,
}

/// Live total while the user types. Never fails: out-of-range and unknown
/// components are listed instead, and contribute nothing.
pub fn display_total(
    entered: &BTreeMap<String, EnteredScore>,
    weights: &[ComponentWeight],
) -> DisplayTotal {
    let mut total = 0.0_f64;
    let mut out_of_range = Vec::new();
    for (key, entry) in entered {
        let value = entry.display_value();
        match weight_for(weights, key) {
            Some(w) if value >= 0.0 && value <= f64::from(w.max) => total += value,
            _ => out_of_range.push(key.clone()),
        }
    }
    DisplayTotal {
        total,
        out_of_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> ComponentScores {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn total_sums_components() {
        let cfg = ScoringConfig::system_default();
        let total = compute_total(
            &scores(&[("ca", 8.0), ("test", 15.0), ("exam", 60.0)]),
            &cfg.component_weights,
        )
        .expect("total");
        assert_eq!(total, 83.0);
    }

    #[test]
    fn missing_components_count_as_zero() {
        let cfg = ScoringConfig::system_default();
        let total = compute_total(&scores(&[("ca", 7.0)]), &cfg.component_weights).expect("total");
        assert_eq!(total, 7.0);
    }

    #[test]
    fn total_rejects_score_above_weight() {
        let cfg = ScoringConfig::system_default();
        let e = compute_total(&scores(&[("exam", 75.0)]), &cfg.component_weights)
            .expect_err("exam over 70");
        assert_eq!(
            e,
            GradingError::InvalidScore {
                component: "exam".into(),
                value: 75.0,
                max: 70.0
            }
        );
        assert!(e.is_score_error());
    }

    #[test]
    fn total_rejects_negative_and_unknown() {
        let cfg = ScoringConfig::system_default();
        assert!(matches!(
            compute_total(&scores(&[("ca", -1.0)]), &cfg.component_weights),
            Err(GradingError::InvalidScore { .. })
        ));
        assert_eq!(
            compute_total(&scores(&[("project", 3.0)]), &cfg.component_weights),
            Err(GradingError::InvalidScore {
                component: "project".into(),
                value: 3.0,
                max: 0.0
            })
        );
    }

    #[test]
    fn grade_lookup_is_inclusive_at_minimum() {
        let b = ScoringConfig::system_default().boundaries;
        assert_eq!(resolve_grade(83.0, &b).expect("83").letter, "A");
        assert_eq!(resolve_grade(34.0, &b).expect("34").letter, "F");
        assert_eq!(resolve_grade(90.0, &b).expect("90").letter, "A+");
        assert_eq!(resolve_grade(89.99, &b).expect("89.99").letter, "A");
        assert_eq!(resolve_grade(0.0, &b).expect("0").letter, "F");
    }

    #[test]
    fn grade_lookup_reports_gaps() {
        assert!(matches!(
            resolve_grade(50.0, &[]),
            Err(GradingError::Configuration(_))
        ));
        let b = vec![boundary("A", 70.0, "x"), boundary("B", 40.0, "y")];
        assert!(matches!(
            resolve_grade(39.0, &b),
            Err(GradingError::Configuration(_))
        ));
    }

    #[test]
    fn validate_accepts_default() {
        ScoringConfig::system_default().validate().expect("default config");
        assert_eq!(ScoringConfig::system_default().total_max_possible(), 100.0);
    }

    #[test]
    fn validate_rejects_bad_tables() {
        let mut cfg = ScoringConfig::system_default();
        cfg.boundaries.swap(0, 1);
        assert!(cfg.validate().is_err(), "not descending");

        let mut cfg = ScoringConfig::system_default();
        cfg.boundaries.pop();
        assert!(cfg.validate().is_err(), "no catch-all at 0");

        let mut cfg = ScoringConfig::system_default();
        for w in &mut cfg.component_weights {
            w.max = 0;
        }
        assert!(cfg.validate().is_err(), "all weights zero");

        let mut cfg = ScoringConfig::system_default();
        cfg.component_weights[1].key = "ca".into();
        assert!(cfg.validate().is_err(), "duplicate key");
    }

    #[test]
    fn entered_score_parsing() {
        assert_eq!(EnteredScore::parse("  "), EnteredScore::Empty);
        assert_eq!(EnteredScore::parse("0"), EnteredScore::Number(0.0));
        assert_eq!(EnteredScore::parse(" 7.5 "), EnteredScore::Number(7.5));
        assert_eq!(EnteredScore::parse("abs"), EnteredScore::Text("abs".into()));
        assert_eq!(
            EnteredScore::from_json(&serde_json::json!(null)),
            EnteredScore::Empty
        );
        assert_eq!(
            EnteredScore::from_json(&serde_json::json!(12)),
            EnteredScore::Number(12.0)
        );
    }

    #[test]
    fn display_total_coerces_and_flags() {
        let cfg = ScoringConfig::system_default();
        let entered: BTreeMap<String, EnteredScore> = [
            ("ca".to_string(), EnteredScore::parse("8")),
            ("test".to_string(), EnteredScore::parse("x")),
            ("exam".to_string(), EnteredScore::parse("75")),
        ]
        .into_iter()
        .collect();
        let d = display_total(&entered, &cfg.component_weights);
        assert_eq!(d.total, 8.0);
        assert_eq!(d.out_of_range, vec!["exam".to_string()]);
    }

    #[test]
    fn grade_for_carries_remark() {
        let cfg = ScoringConfig::system_default();
        let g = grade_for(&scores(&[("ca", 10.0), ("test", 20.0), ("exam", 62.0)]), &cfg)
            .expect("graded");
        assert_eq!(g.total, 92.0);
        assert_eq!(g.grade, "A+");
        assert_eq!(g.remark.as_deref(), Some("Distinction"));
    }

    #[test]
    fn total_just_under_a_minimum_keeps_the_lower_grade() {
        let cfg = ScoringConfig::system_default();
        let g = grade_for(&scores(&[("ca", 9.996), ("test", 20.0), ("exam", 60.0)]), &cfg)
            .expect("graded");
        assert!((g.total - 89.996).abs() < 1e-9, "total is the plain sum, got {}", g.total);
        assert_eq!(g.grade, "A");
    }

    #[test]
    fn float_noise_at_a_minimum_still_reaches_it() {
        let b = ScoringConfig::system_default().boundaries;
        assert_eq!(resolve_grade(90.0 - 1e-12, &b).expect("noise").letter, "A+");
        assert_eq!(resolve_grade(89.9999, &b).expect("under").letter, "A");
    }

    #[test]
    fn display_total_rounds_for_the_screen_only() {
        let cfg = ScoringConfig::system_default();
        let entered: BTreeMap<String, EnteredScore> =
            [("ca".to_string(), EnteredScore::parse("9.996"))].into_iter().collect();
        let shown = display_total(&entered, &cfg.component_weights).total;
        assert_eq!(round_display(shown), 10.0);
        assert_eq!(resolve_grade(shown, &cfg.boundaries).expect("grade").letter, "F");
        let exact = compute_total(&scores(&[("ca", 9.996)]), &cfg.component_weights).expect("total");
        assert_eq!(exact, 9.996);
    }
}
