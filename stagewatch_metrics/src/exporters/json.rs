use super::prometheus::format_value;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stagewatch_core::{MetricKind, Snapshot, SnapshotValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsDocument {
    pub metrics: Vec<MetricEntry>,
    /// Newest update across the exported series, not the wall clock, so
    /// that rendering stays a pure function of the snapshot.
    pub generated_at: Option<DateTime<Utc>>,
    pub total_series: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricEntry {
    pub name: String,
    pub kind: MetricKind,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<JsonBucket>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<Vec<JsonQuantile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonBucket {
    /// Upper bound as rendered in the text format, `+Inf` for the last one.
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonQuantile {
    pub quantile: f64,
    pub value: Option<f64>,
}

pub struct JsonExporter;

impl JsonExporter {
    pub fn document(snapshot: &Snapshot) -> MetricsDocument {
        let metrics = snapshot
            .instruments
            .iter()
            .map(|instrument| {
                let mut entry = MetricEntry {
                    name: instrument.id.name.clone(),
                    kind: instrument.kind,
                    labels: instrument.id.labels.clone(),
                    help: snapshot.help.get(&instrument.id.name).cloned(),
                    value: None,
                    buckets: None,
                    quantiles: None,
                    sum: None,
                    count: None,
                    timestamp: instrument.updated_at,
                };

                match &instrument.value {
                    SnapshotValue::Counter(value) | SnapshotValue::Gauge(value) => {
                        entry.value = Some(*value);
                    }
                    SnapshotValue::Histogram { buckets, sum, count } => {
                        entry.buckets = Some(
                            buckets
                                .iter()
                                .map(|b| JsonBucket {
                                    le: format_value(b.upper_bound),
                                    count: b.cumulative_count,
                                })
                                .collect(),
                        );
                        entry.sum = Some(*sum);
                        entry.count = Some(*count);
                    }
                    SnapshotValue::Summary { quantiles, sum, count } => {
                        entry.quantiles = Some(
                            quantiles
                                .iter()
                                .map(|q| JsonQuantile {
                                    quantile: q.quantile,
                                    value: q.value,
                                })
                                .collect(),
                        );
                        entry.sum = Some(*sum);
                        entry.count = Some(*count);
                    }
                }

                entry
            })
            .collect();

        MetricsDocument {
            metrics,
            generated_at: snapshot.as_of,
            total_series: snapshot.total_series,
            truncated: snapshot.truncated,
        }
    }

    pub fn to_string(snapshot: &Snapshot) -> Result<String> {
        Ok(serde_json::to_string_pretty(&Self::document(snapshot))?)
    }
}
