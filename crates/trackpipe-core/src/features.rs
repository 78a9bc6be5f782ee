//! Feature engine: derived attributes for canonical records.
//!
//! [`FeatureEngine::derive`] is a pure function of its input record and the
//! [`FeatureTables`] injected at construction. It never fails: a value it
//! cannot interpret is replaced by a documented default and reported as a
//! [`Warning`] next to the derived fields.
//!
//! # Duration
//!
//! | Input | Meaning | Seconds |
//! |-------|---------|---------|
//! | `3:45` | `mm:ss` | 225 |
//! | `1:02:03` | `hh:mm:ss` | 3723 |
//! | `125000` | milliseconds | 125 |
//! | anything else | unparseable | 0 + warning |
//!
//! # Threshold tables
//!
//! Scores are classified by a [`ThresholdTable`]: an ascending list of band
//! starts beginning at 0. A score is clamped into `[0, 100]` and gets the
//! label of the last band starting at or below it, so every score maps to
//! exactly one band.

use serde::{Deserialize, Serialize};

use crate::error::TableError;
use crate::models::{CanonicalRecord, ContentLabel, DerivedFields, Warning};

/// Label used when a score cannot be parsed at all.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// One band of a threshold table: scores from `min` up to the next band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub label: String,
}

/// Ordered, gap-free classification of 0–100 scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    name: String,
    bands: Vec<Band>,
}

impl ThresholdTable {
    /// Build and validate a table.
    ///
    /// The first band must start at 0, starts must be strictly ascending and
    /// within `0..=100`, and labels must be non-empty and unique.
    pub fn new(name: impl Into<String>, bands: Vec<Band>) -> Result<Self, TableError> {
        let name = name.into();
        let first = bands.first().ok_or_else(|| TableError::Empty(name.clone()))?;
        if first.min != 0.0 {
            return Err(TableError::DoesNotStartAtZero(name));
        }

        let mut previous = f64::NEG_INFINITY;
        for (i, band) in bands.iter().enumerate() {
            if !(0.0..=100.0).contains(&band.min) || band.min <= previous {
                return Err(TableError::BadBound {
                    table: name,
                    label: band.label.clone(),
                    min: band.min.to_string(),
                });
            }
            previous = band.min;

            let repeated = bands[..i].iter().any(|b| b.label == band.label);
            if band.label.trim().is_empty() || repeated || band.label == UNKNOWN_LABEL {
                return Err(TableError::BadLabel {
                    table: name,
                    label: band.label.clone(),
                });
            }
        }

        Ok(Self { name, bands })
    }

    fn from_static(name: &str, bands: &[(f64, &str)]) -> Self {
        Self {
            name: name.to_string(),
            bands: bands
                .iter()
                .map(|(min, label)| Band {
                    min: *min,
                    label: label.to_string(),
                })
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    /// Classify a score, clamping it into `[0, 100]` first.
    pub fn classify(&self, score: f64) -> &str {
        let score = score.clamp(0.0, 100.0);
        self.bands
            .iter()
            .rev()
            .find(|b| b.min <= score)
            .or(self.bands.first())
            .map(|b| b.label.as_str())
            .unwrap_or(UNKNOWN_LABEL)
    }
}

/// The threshold tables used by a [`FeatureEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTables {
    pub popularity: ThresholdTable,
    pub danceability: ThresholdTable,
    pub energy: ThresholdTable,
}

impl Default for FeatureTables {
    fn default() -> Self {
        Self {
            popularity: ThresholdTable::from_static(
                "popularity",
                &[(0.0, "Low"), (40.0, "Medium"), (70.0, "High"), (90.0, "Very High")],
            ),
            danceability: ThresholdTable::from_static(
                "danceability",
                &[(0.0, "Low"), (50.0, "Danceable"), (75.0, "Very Danceable")],
            ),
            energy: ThresholdTable::from_static(
                "energy",
                &[(0.0, "Low"), (40.0, "Medium"), (70.0, "High")],
            ),
        }
    }
}

/// Derived fields plus the warnings produced while computing them.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    pub fields: DerivedFields,
    pub warnings: Vec<Warning>,
}

/// Computes [`DerivedFields`] from [`CanonicalRecord`]s.
#[derive(Debug, Clone, Default)]
pub struct FeatureEngine {
    tables: FeatureTables,
}

impl FeatureEngine {
    pub fn new(tables: FeatureTables) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &FeatureTables {
        &self.tables
    }

    pub fn derive(&self, record: &CanonicalRecord) -> Derivation {
        let mut warnings = Vec::new();

        let duration_seconds = parse_duration(&record.duration).unwrap_or_else(|| {
            warnings.push(Warning {
                field: "duration",
                value: record.duration.clone(),
                message: "expected mm:ss, hh:mm:ss or milliseconds; using 0".to_string(),
            });
            0
        });

        let popularity_tier = classify(
            &self.tables.popularity,
            "popularity",
            &record.popularity,
            parse_score,
            &mut warnings,
        );
        let danceability_label = classify(
            &self.tables.danceability,
            "danceability",
            &record.danceability,
            parse_percent,
            &mut warnings,
        );
        let energy_label = classify(
            &self.tables.energy,
            "energy",
            &record.energy,
            parse_percent,
            &mut warnings,
        );

        let content_label = parse_explicit(&record.explicit).unwrap_or_else(|| {
            warnings.push(Warning {
                field: "explicit",
                value: record.explicit.clone(),
                message: "unrecognized explicit indicator; using Clean".to_string(),
            });
            ContentLabel::Clean
        });

        Derivation {
            fields: DerivedFields {
                duration_seconds,
                popularity_tier,
                danceability_label,
                energy_label,
                content_label,
            },
            warnings,
        }
    }
}

fn classify(
    table: &ThresholdTable,
    field: &'static str,
    raw: &str,
    parse: fn(&str) -> Option<f64>,
    warnings: &mut Vec<Warning>,
) -> String {
    match parse(raw) {
        Some(score) => table.classify(score).to_string(),
        None => {
            warnings.push(Warning {
                field,
                value: raw.to_string(),
                message: format!("not a number; {} is {}", table.name(), UNKNOWN_LABEL),
            });
            UNKNOWN_LABEL.to_string()
        }
    }
}

/// Parse a duration into whole seconds.
///
/// Accepts `mm:ss` (seconds < 60), `hh:mm:ss` (minutes and seconds < 60) and
/// a bare integer number of milliseconds (truncated). Returns `None` for
/// anything else.
pub fn parse_duration(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let seconds = if value.contains(':') {
        let parts = value
            .split(':')
            .map(parse_digits)
            .collect::<Option<Vec<u64>>>()?;
        match parts[..] {
            [m, s] if s < 60 => m.checked_mul(60)?.checked_add(s)?,
            [h, m, s] if m < 60 && s < 60 => h.checked_mul(3600)?.checked_add(m * 60 + s)?,
            _ => return None,
        }
    } else {
        parse_digits(value)? / 1000
    };

    i64::try_from(seconds).ok()
}

fn parse_digits(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse a finite number.
pub fn parse_score(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Parse a score that may be written as a 0.0–1.0 fraction.
///
/// A value in `[0, 1]` written with a decimal point is a fraction and is
/// scaled to 0–100; integers are taken as already on the 0–100 scale.
pub fn parse_percent(value: &str) -> Option<f64> {
    let score = parse_score(value)?;
    if value.contains('.') && (0.0..=1.0).contains(&score) {
        Some(score * 100.0)
    } else {
        Some(score)
    }
}

/// Interpret an explicit-content indicator.
pub fn parse_explicit(value: &str) -> Option<ContentLabel> {
    let value = value.trim().to_lowercase();
    match value.as_str() {
        "true" | "t" | "yes" | "y" | "1" | "explicit" => Some(ContentLabel::Explicit),
        "false" | "f" | "no" | "n" | "0" | "clean" => Some(ContentLabel::Clean),
        _ => parse_score(&value).map(|v| {
            if v != 0.0 {
                ContentLabel::Explicit
            } else {
                ContentLabel::Clean
            }
        }),
    }
}
