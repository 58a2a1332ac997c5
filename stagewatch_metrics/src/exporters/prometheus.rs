use stagewatch_core::{InstrumentSnapshot, Snapshot, SnapshotValue};
use std::fmt::Write;

pub struct PrometheusExporter;

impl PrometheusExporter {
    /// Renders the snapshot in the text exposition format. Output depends
    /// only on the snapshot, so identical snapshots render identically.
    pub fn format(snapshot: &Snapshot) -> String {
        let mut out = String::new();
        let mut current_name: Option<&str> = None;

        for instrument in &snapshot.instruments {
            let name = instrument.id.name.as_str();
            if current_name != Some(name) {
                if let Some(help) = snapshot.help.get(name) {
                    let _ = writeln!(out, "# HELP {} {}", name, escape_help(help));
                }
                let _ = writeln!(out, "# TYPE {} {}", name, instrument.kind);
                current_name = Some(name);
            }
            Self::write_instrument(&mut out, instrument);
        }

        if snapshot.truncated {
            let _ = writeln!(
                out,
                "# truncated: {} of {} series shown",
                snapshot.instruments.len(),
                snapshot.total_series
            );
        }

        out
    }

    fn write_instrument(out: &mut String, instrument: &InstrumentSnapshot) {
        let id = &instrument.id;
        let name = id.name.as_str();
        let labels = id.label_string();

        match &instrument.value {
            SnapshotValue::Counter(value) | SnapshotValue::Gauge(value) => {
                write_line(out, name, &labels, *value);
            }
            SnapshotValue::Histogram { buckets, sum, count } => {
                let bucket_name = format!("{}_bucket", name);
                for bucket in buckets {
                    let le = format_value(bucket.upper_bound);
                    write_line(
                        out,
                        &bucket_name,
                        &id.label_string_with("le", &le),
                        bucket.cumulative_count as f64,
                    );
                }
                write_line(out, &format!("{}_sum", name), &labels, *sum);
                write_line(out, &format!("{}_count", name), &labels, *count as f64);
            }
            SnapshotValue::Summary { quantiles, sum, count } => {
                for q in quantiles {
                    write_line(
                        out,
                        name,
                        &id.label_string_with("quantile", &format_value(q.quantile)),
                        q.value.unwrap_or(f64::NAN),
                    );
                }
                write_line(out, &format!("{}_sum", name), &labels, *sum);
                write_line(out, &format!("{}_count", name), &labels, *count as f64);
            }
        }
    }
}

fn write_line(out: &mut String, name: &str, labels: &str, value: f64) {
    if labels.is_empty() {
        let _ = writeln!(out, "{} {}", name, format_value(value));
    } else {
        let _ = writeln!(out, "{}{{{}}} {}", name, labels, format_value(value));
    }
}

pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
