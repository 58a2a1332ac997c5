use crate::error::{MetricError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identity of one instrument: a metric name plus its sorted label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricId {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl MetricId {
    /// Builds a validated identity. Duplicate label keys are rejected rather
    /// than silently collapsed.
    pub fn new<K, V>(name: impl Into<String>, labels: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let name = name.into();
        validate_metric_name(&name)?;

        let mut map = BTreeMap::new();
        for (key, value) in labels {
            let key = key.into();
            validate_label_name(&key)?;
            if map.insert(key.clone(), value.into()).is_some() {
                return Err(MetricError::InvalidLabel(format!(
                    "duplicate label '{}' on metric '{}'",
                    key, name
                )));
            }
        }

        Ok(Self { name, labels: map })
    }

    pub fn unlabeled(name: impl Into<String>) -> Result<Self> {
        Self::new(name, std::iter::empty::<(String, String)>())
    }

    /// Serialized label set without braces, e.g. `method="GET",stage="ingest"`.
    pub fn label_string(&self) -> String {
        render_labels(self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Label string with one extra pair appended, used for `le` and `quantile`.
    pub fn label_string_with(&self, key: &str, value: &str) -> String {
        render_labels(
            self.labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .chain(std::iter::once((key, value))),
        )
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{{{}}}", self.name, self.label_string())
        }
    }
}

impl FromStr for MetricId {
    type Err = MetricError;

    /// Parses the exposition selector syntax `name{key="value",...}`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some(open) = s.find('{') else {
            return Self::unlabeled(s);
        };

        let name = &s[..open];
        let body = s[open + 1..]
            .strip_suffix('}')
            .ok_or_else(|| MetricError::InvalidLabel(format!("unterminated label set in '{}'", s)))?;

        Self::new(name, parse_label_body(body)?)
    }
}

fn parse_label_body(body: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = body.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(MetricError::InvalidLabel(format!("missing '=' after '{}'", key)));
        }
        if chars.next() != Some('"') {
            return Err(MetricError::InvalidLabel(format!("value of '{}' must be quoted", key)));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(other) => value.push(other),
                    None => break,
                },
                '"' => {
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }
        if !closed {
            return Err(MetricError::InvalidLabel(format!("unterminated value for '{}'", key)));
        }
        pairs.push((key.trim().to_string(), value));

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some(',') | None => {}
            Some(other) => {
                return Err(MetricError::InvalidLabel(format!(
                    "unexpected '{}' after label value",
                    other
                )))
            }
        }
    }

    Ok(pairs)
}

fn render_labels<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

pub fn validate_metric_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(MetricError::InvalidName(format!("'{}'", name)))
    }
}

pub fn validate_label_name(name: &str) -> Result<()> {
    if name.starts_with("__") {
        return Err(MetricError::InvalidLabel(format!(
            "label '{}' uses the reserved '__' prefix",
            name
        )));
    }

    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(MetricError::InvalidLabel(format!("'{}' is not a valid label name", name)))
    }
}
