//! Analytical query requests and their validation.
//!
//! A [`QueryRequest`] is untrusted input. [`QueryRequest::validate`] turns it
//! into a [`ValidatedQuery`], whose column names come only from the closed
//! enums below ([`Metric`], [`GroupKey`], [`Category`]) and whose numeric
//! parameters are in bounds. Stores execute `ValidatedQuery` values only, so
//! nothing from the request text ever reaches a SQL string.
//!
//! | Action | Parameters |
//! |--------|------------|
//! | `top_artists` | `metric`, `group_by`, `limit` |
//! | `avg_metrics_by_category` | `category` (alias `category_col`) |
//! | `songs_filtered` | `min_popularity`, `min_danceability`, `min_energy`, `limit` |
//! | `explicit_vs_clean_stats` | none |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::QueryResult;

/// Version tag carried by every query response.
pub const RESPONSE_VERSION: u32 = 1;

/// Rejection of a query request before any store access.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidRequest {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("missing action")]
    MissingAction,

    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    #[error("{param}: {value:?} is not one of {allowed}")]
    NotAllowed {
        param: &'static str,
        value: String,
        allowed: String,
    },

    #[error("{param}: {value} is outside {min}..={max}")]
    OutOfRange {
        param: &'static str,
        value: String,
        min: f64,
        max: f64,
    },

    #[error("{param}: expected a number, got {value}")]
    NotANumber { param: &'static str, value: String },
}

macro_rules! allow_list {
    ($(#[$meta:meta])* $name:ident, $param:literal { $($variant:ident => $col:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Store column this name refers to.
            pub fn column(&self) -> &'static str {
                match self {
                    $($name::$variant => $col),+
                }
            }

            pub fn parse(value: &str) -> Result<Self, InvalidRequest> {
                match value {
                    $($col => Ok($name::$variant),)+
                    other => Err(InvalidRequest::NotAllowed {
                        param: $param,
                        value: other.to_string(),
                        allowed: [$($col),+].join(", "),
                    }),
                }
            }
        }
    };
}

allow_list!(
    /// Numeric column ranked by `top_artists`.
    Metric, "metric" {
        Popularity => "popularity",
        Danceability => "danceability",
        Energy => "energy",
        DurationSeconds => "duration_seconds",
    }
);

allow_list!(
    /// Grouping column for `top_artists`.
    GroupKey, "group_by" {
        Artists => "artists",
        Album => "album",
        Genre => "genre",
    }
);

allow_list!(
    /// Grouping column for `avg_metrics_by_category`.
    Category, "category" {
        PopularityTier => "popularity_tier",
        DanceabilityLabel => "danceability_label",
        EnergyLabel => "energy_label",
        ContentLabel => "content_label",
        Genre => "genre",
    }
);

allow_list!(
    /// The fixed set of query actions.
    QueryAction, "action" {
        TopArtists => "top_artists",
        AvgMetricsByCategory => "avg_metrics_by_category",
        SongsFiltered => "songs_filtered",
        ExplicitVsCleanStats => "explicit_vs_clean_stats",
    }
);

impl QueryAction {
    pub fn name(&self) -> &'static str {
        self.column()
    }

    fn default_limit(&self) -> u32 {
        match self {
            Self::SongsFiltered => 50,
            _ => 10,
        }
    }
}

/// A raw query request as received from a caller.
///
/// Numeric parameters are kept as JSON values because callers send both
/// `10` and `"10"`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default, alias = "category_col")]
    pub category: Option<String>,
    #[serde(default)]
    pub min_popularity: Option<Value>,
    #[serde(default)]
    pub min_danceability: Option<Value>,
    #[serde(default)]
    pub min_energy: Option<Value>,
    #[serde(default)]
    pub limit: Option<Value>,
}

/// Bounds applied during validation.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_limit: u32,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self { max_limit: 100 }
    }
}

/// A request that passed validation. Only these reach a store.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedQuery {
    TopArtists {
        metric: Metric,
        group_by: GroupKey,
        limit: u32,
    },
    AvgMetricsByCategory {
        category: Category,
    },
    SongsFiltered {
        min_popularity: f64,
        min_danceability: f64,
        min_energy: f64,
        limit: u32,
    },
    ExplicitVsCleanStats,
}

impl ValidatedQuery {
    pub fn action(&self) -> QueryAction {
        match self {
            Self::TopArtists { .. } => QueryAction::TopArtists,
            Self::AvgMetricsByCategory { .. } => QueryAction::AvgMetricsByCategory,
            Self::SongsFiltered { .. } => QueryAction::SongsFiltered,
            Self::ExplicitVsCleanStats => QueryAction::ExplicitVsCleanStats,
        }
    }
}

impl QueryRequest {
    /// Parse an invocation event.
    ///
    /// Accepts the request object itself or a gateway wrapper whose `body`
    /// field holds the request as a JSON string.
    pub fn from_event(event: Value) -> Result<Self, InvalidRequest> {
        let event = match event {
            Value::Object(mut map) => match map.remove("body") {
                Some(Value::String(body)) => serde_json::from_str::<Value>(&body)
                    .map_err(|e| InvalidRequest::Malformed(format!("body is not JSON: {e}")))?,
                Some(other) => {
                    map.insert("body".to_string(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            },
            other => {
                return Err(InvalidRequest::Malformed(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };
        if !event.is_object() {
            return Err(InvalidRequest::Malformed("body must be a JSON object".to_string()));
        }
        serde_json::from_value(event).map_err(|e| InvalidRequest::Malformed(e.to_string()))
    }

    /// Check every parameter against its allow-list or bounds.
    ///
    /// Name parameters are checked even when the action ignores them.
    pub fn validate(&self, limits: &QueryLimits) -> Result<ValidatedQuery, InvalidRequest> {
        let action = match self.action.as_deref() {
            None | Some("") => return Err(InvalidRequest::MissingAction),
            Some(name) => {
                QueryAction::parse(name).map_err(|_| InvalidRequest::UnknownAction(name.to_string()))?
            }
        };

        let metric = self.metric.as_deref().map(Metric::parse).transpose()?;
        let group_by = self.group_by.as_deref().map(GroupKey::parse).transpose()?;
        let category = self.category.as_deref().map(Category::parse).transpose()?;

        let query = match action {
            QueryAction::TopArtists => ValidatedQuery::TopArtists {
                metric: metric.unwrap_or(Metric::Popularity),
                group_by: group_by.unwrap_or(GroupKey::Artists),
                limit: self.limit(action, limits)?,
            },
            QueryAction::AvgMetricsByCategory => ValidatedQuery::AvgMetricsByCategory {
                category: category.unwrap_or(Category::PopularityTier),
            },
            QueryAction::SongsFiltered => ValidatedQuery::SongsFiltered {
                min_popularity: threshold("min_popularity", self.min_popularity.as_ref())?,
                min_danceability: threshold("min_danceability", self.min_danceability.as_ref())?,
                min_energy: threshold("min_energy", self.min_energy.as_ref())?,
                limit: self.limit(action, limits)?,
            },
            QueryAction::ExplicitVsCleanStats => ValidatedQuery::ExplicitVsCleanStats,
        };
        Ok(query)
    }

    fn limit(&self, action: QueryAction, limits: &QueryLimits) -> Result<u32, InvalidRequest> {
        let Some(value) = self.limit.as_ref() else {
            return Ok(action.default_limit().min(limits.max_limit));
        };
        let n = number("limit", value)?;
        let max = f64::from(limits.max_limit);
        if n.fract() != 0.0 || !(1.0..=max).contains(&n) {
            return Err(InvalidRequest::OutOfRange {
                param: "limit",
                value: value.to_string(),
                min: 1.0,
                max,
            });
        }
        Ok(n as u32)
    }
}

fn threshold(param: &'static str, value: Option<&Value>) -> Result<f64, InvalidRequest> {
    let Some(value) = value else {
        return Ok(0.0);
    };
    let n = number(param, value)?;
    if !(0.0..=100.0).contains(&n) {
        return Err(InvalidRequest::OutOfRange {
            param,
            value: value.to_string(),
            min: 0.0,
            max: 100.0,
        });
    }
    Ok(n)
}

fn number(param: &'static str, value: &Value) -> Result<f64, InvalidRequest> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .ok_or_else(|| InvalidRequest::NotANumber {
            param,
            value: value.to_string(),
        })
}

/// Response envelope for an executed query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub version: u32,
    pub action: String,
    pub query_result: QueryResult,
}

impl QueryResponse {
    pub fn new(action: QueryAction, result: QueryResult) -> Self {
        Self {
            version: RESPONSE_VERSION,
            action: action.name().to_string(),
            query_result: result,
        }
    }
}
