//! Exposition format decoding
//!
//! Decodes the Prometheus text format (version 0.0.4) and the compatible
//! subset of OpenMetrics text into [`MetricFamily`] values. Decoding is a
//! pure function of the body and the response content type.
//!
//! Parsing is done by `prometheus_parse`. Histogram and summary series it
//! folds together are expanded back into one sample per bucket or quantile,
//! and their `_sum`/`_count` series join the same family. Families are
//! returned sorted by name.

use crate::models::{MetricFamily, MetricSample, MetricType};
use chrono::{DateTime, Utc};
use prometheus_parse::{Sample, Scrape, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),

    #[error("exposition payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("failed to parse exposition payload: {0}")]
    Parse(String),
}

/// Sample time handed to the parser; marks samples that carried no timestamp
const UNSTAMPED: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Text dialect selected from the content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    OpenMetrics,
}

impl Format {
    fn from_content_type(content_type: Option<&str>) -> Result<Self, DecodeError> {
        let Some(content_type) = content_type else {
            return Ok(Format::Text);
        };

        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match media_type.as_str() {
            "" | "text/plain" => Ok(Format::Text),
            "application/openmetrics-text" => Ok(Format::OpenMetrics),
            _ => Err(DecodeError::UnsupportedContentType(content_type.to_string())),
        }
    }
}

/// Decode a scrape body into metric families
pub fn decode(body: &[u8], content_type: Option<&str>) -> Result<Vec<MetricFamily>, DecodeError> {
    let format = Format::from_content_type(content_type)?;
    let text = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8)?;

    let lines = text
        .lines()
        .map(str::trim)
        .take_while(|line| format != Format::OpenMetrics || *line != "# EOF")
        .map(|line| match format {
            Format::Text => Ok(line.to_owned()),
            Format::OpenMetrics => Ok(openmetrics_line(line)),
        });

    let scrape =
        Scrape::parse_at(lines, UNSTAMPED).map_err(|e| DecodeError::Parse(e.to_string()))?;

    Ok(families(scrape))
}

/// Total number of samples across families
pub fn sample_count(families: &[MetricFamily]) -> usize {
    families.iter().map(|f| f.samples.len()).sum()
}

/// Rewrite one OpenMetrics line in the text dialect: exemplars are dropped,
/// timestamps go from seconds to milliseconds and counter types name their
/// `_total` series.
fn openmetrics_line(line: &str) -> String {
    if let Some(declaration) = line.strip_prefix("# TYPE ") {
        return match declaration.split_once(' ') {
            Some((name, "counter")) if !name.ends_with("_total") => {
                format!("# TYPE {}_total counter", name)
            }
            _ => line.to_owned(),
        };
    }
    if line.starts_with('#') {
        return line.to_owned();
    }

    let line = line
        .split_once(" # ")
        .map_or(line, |(sample, _exemplar)| sample);
    let (series, rest) = match line.rfind('}') {
        Some(i) => line.split_at(i + 1),
        None => line.split_at(line.find(char::is_whitespace).unwrap_or(line.len())),
    };

    let mut tokens = rest.split_whitespace();
    match (tokens.next(), tokens.next().map(str::parse::<f64>)) {
        (Some(value), Some(Ok(secs))) if secs.is_finite() => {
            format!("{} {} {}", series, value, (secs * 1000.0).round() as i64)
        }
        _ => line.to_owned(),
    }
}

/// A parsed sample and the family it belongs to
struct Placed {
    family: String,
    metric_type: MetricType,
    labels: BTreeMap<String, String>,
    // Bucket and quantile series sort ahead of `_sum` and `_count`
    rank: u8,
    sample: Sample,
}

fn families(scrape: Scrape) -> Vec<MetricFamily> {
    let Scrape { docs, samples } = scrape;

    let aggregates: HashMap<String, MetricType> = samples
        .iter()
        .filter_map(|s| match s.value {
            Value::Histogram(_) => Some((histogram_base(&s.metric), MetricType::Histogram)),
            Value::Summary(_) => Some((s.metric.clone(), MetricType::Summary)),
            _ => None,
        })
        .collect();

    let mut placed: Vec<Placed> = samples
        .into_iter()
        .map(|sample| {
            let (family, metric_type) = family_of(&sample, &aggregates);
            let rank = match sample.value {
                Value::Histogram(_) | Value::Summary(_) => 0,
                _ => 1,
            };
            let labels = sample
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Placed {
                family,
                metric_type,
                labels,
                rank,
                sample,
            }
        })
        .collect();
    placed.sort_by(|a, b| (&a.family, &a.labels, a.rank).cmp(&(&b.family, &b.labels, b.rank)));

    let mut families: Vec<MetricFamily> = Vec::new();
    for p in placed {
        if families.last().map_or(true, |last| last.name != p.family) {
            let help = docs
                .get(&p.family)
                .or_else(|| p.family.strip_suffix("_total").and_then(|b| docs.get(b)))
                .cloned()
                .unwrap_or_default();
            families.push(MetricFamily {
                name: p.family,
                help,
                metric_type: p.metric_type,
                samples: Vec::new(),
            });
        }
        if let Some(family) = families.last_mut() {
            family.samples.extend(expand(p.sample, p.labels));
        }
    }

    families
}

fn histogram_base(metric: &str) -> String {
    metric.strip_suffix("_bucket").unwrap_or(metric).to_string()
}

fn family_of(sample: &Sample, aggregates: &HashMap<String, MetricType>) -> (String, MetricType) {
    let metric = sample.metric.clone();
    match sample.value {
        Value::Histogram(_) => (histogram_base(&metric), MetricType::Histogram),
        Value::Summary(_) => (metric, MetricType::Summary),
        Value::Counter(_) => (metric, MetricType::Counter),
        Value::Gauge(_) => (metric, MetricType::Gauge),
        Value::Untyped(_) => {
            for suffix in ["_sum", "_count", "_created"] {
                let Some(base) = metric.strip_suffix(suffix) else {
                    continue;
                };
                if let Some(&metric_type) = aggregates.get(base) {
                    return (base.to_string(), metric_type);
                }
            }
            (metric, MetricType::Untyped)
        }
    }
}

/// One sample per bucket or quantile; a single sample otherwise
fn expand(sample: Sample, labels: BTreeMap<String, String>) -> Vec<MetricSample> {
    let timestamp_ms =
        (sample.timestamp != UNSTAMPED).then(|| sample.timestamp.timestamp_millis());
    let with_label = |key: &str, bound: f64| {
        let mut labels = labels.clone();
        labels.insert(key.to_string(), format_bound(bound));
        labels
    };

    match sample.value {
        Value::Counter(value) | Value::Gauge(value) | Value::Untyped(value) => {
            vec![MetricSample {
                name: sample.metric,
                labels: labels.clone(),
                value,
                timestamp_ms,
            }]
        }
        Value::Histogram(buckets) => buckets
            .iter()
            .map(|bucket| MetricSample {
                name: sample.metric.clone(),
                labels: with_label("le", bucket.less_than),
                value: bucket.count,
                timestamp_ms,
            })
            .collect(),
        Value::Summary(quantiles) => quantiles
            .iter()
            .map(|q| MetricSample {
                name: sample.metric.clone(),
                labels: with_label("quantile", q.quantile),
                value: q.count,
                timestamp_ms,
            })
            .collect(),
    }
}

fn format_bound(bound: f64) -> String {
    if bound == f64::INFINITY {
        "+Inf".to_string()
    } else {
        bound.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_EXPORTER: &str = r#"# HELP node_cpu_seconds_total Seconds spent in each mode.
# TYPE node_cpu_seconds_total counter
node_cpu_seconds_total{cpu="0",mode="idle"} 12345.67
node_cpu_seconds_total{cpu="0",mode="user"} 89.1
# HELP node_load1 1m load average.
# TYPE node_load1 gauge
node_load1 0.42
# HELP http_request_duration_seconds Request latency.
# TYPE http_request_duration_seconds histogram
http_request_duration_seconds_bucket{le="0.1"} 3
http_request_duration_seconds_bucket{le="+Inf"} 5
http_request_duration_seconds_sum 1.7
http_request_duration_seconds_count 5
# TYPE rpc_duration_seconds summary
rpc_duration_seconds{quantile="0.5"} 0.05
rpc_duration_seconds_sum 17.5
rpc_duration_seconds_count 200
scrape_samples_scraped 11 1700000000000
"#;

    #[test]
    fn test_decode_node_exporter_fixture() {
        let families =
            decode(NODE_EXPORTER.as_bytes(), Some("text/plain; version=0.0.4")).unwrap();

        let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "http_request_duration_seconds",
                "node_cpu_seconds_total",
                "node_load1",
                "rpc_duration_seconds",
                "scrape_samples_scraped",
            ]
        );
        assert_eq!(sample_count(&families), 11);

        let histogram = &families[0];
        assert_eq!(histogram.metric_type, MetricType::Histogram);
        assert_eq!(histogram.help, "Request latency.");
        assert_eq!(histogram.samples.len(), 4);
        assert_eq!(histogram.samples[0].name, "http_request_duration_seconds_bucket");
        assert_eq!(histogram.samples[0].labels["le"], "0.1");
        assert_eq!(histogram.samples[0].value, 3.0);
        assert_eq!(histogram.samples[1].labels["le"], "+Inf");
        assert_eq!(histogram.samples[1].value, 5.0);
        assert_eq!(histogram.samples[2].name, "http_request_duration_seconds_sum");
        assert_eq!(histogram.samples[3].name, "http_request_duration_seconds_count");

        let cpu = &families[1];
        assert_eq!(cpu.metric_type, MetricType::Counter);
        assert_eq!(cpu.help, "Seconds spent in each mode.");
        assert_eq!(cpu.samples[0].labels["mode"], "idle");
        assert_eq!(cpu.samples[0].value, 12345.67);
        assert_eq!(cpu.samples[0].timestamp_ms, None);

        assert_eq!(families[2].metric_type, MetricType::Gauge);

        let summary = &families[3];
        assert_eq!(summary.metric_type, MetricType::Summary);
        assert_eq!(summary.samples.len(), 3);
        assert_eq!(summary.samples[0].labels["quantile"], "0.5");
        assert_eq!(summary.samples[2].value, 200.0);

        let untyped = &families[4];
        assert_eq!(untyped.metric_type, MetricType::Untyped);
        assert_eq!(untyped.samples[0].timestamp_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let first = decode(NODE_EXPORTER.as_bytes(), None).unwrap();
        let second = decode(NODE_EXPORTER.as_bytes(), None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_histogram_label_sets() {
        let body = "\
# TYPE latency histogram
latency_bucket{path=\"/b\",le=\"1\"} 2
latency_bucket{path=\"/b\",le=\"+Inf\"} 2
latency_bucket{path=\"/a\",le=\"1\"} 7
latency_bucket{path=\"/a\",le=\"+Inf\"} 9
latency_count{path=\"/a\"} 9
";
        let families = decode(body.as_bytes(), None).unwrap();

        assert_eq!(families.len(), 1);
        let samples = &families[0].samples;
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].labels["path"], "/a");
        assert_eq!(samples[0].labels["le"], "1");
        assert_eq!(samples[2].name, "latency_count");
        assert_eq!(samples[4].labels["path"], "/b");
        assert_eq!(samples[4].labels["le"], "+Inf");
    }

    #[test]
    fn test_special_values() {
        let body = "a NaN\nb -Inf\nc 1e3\n";
        let families = decode(body.as_bytes(), None).unwrap();
        assert!(families[0].samples[0].value.is_nan());
        assert_eq!(families[1].samples[0].value, f64::NEG_INFINITY);
        assert_eq!(families[2].samples[0].value, 1000.0);
        assert!(families[2].samples[0].labels.is_empty());
    }

    #[test]
    fn test_trailing_comma_in_labels() {
        let families = decode(b"m{a=\"1\",} 1\n", None).unwrap();
        assert_eq!(families[0].samples[0].labels["a"], "1");
    }

    #[test]
    fn test_unsupported_content_type() {
        let result = decode(
            b"",
            Some(
                "application/vnd.google.protobuf; \
                 proto=io.prometheus.client.MetricFamily; encoding=delimited",
            ),
        );
        assert!(matches!(result, Err(DecodeError::UnsupportedContentType(_))));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let families = decode(b"ok 1\nbroken{a=\"1\" 2\nm notanumber\n", None).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "ok");
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(decode(&[0xff, 0xfe], None), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_gauge_does_not_absorb_suffixed_samples() {
        let body = "# TYPE queue gauge\nqueue 1\nqueue_count 4\n";
        let families = decode(body.as_bytes(), None).unwrap();
        assert_eq!(families.len(), 2);
        assert_eq!(families[1].name, "queue_count");
        assert_eq!(families[1].metric_type, MetricType::Untyped);
    }

    #[test]
    fn test_openmetrics() {
        let body = "\
# HELP requests Requests served.
# TYPE requests counter
# UNIT requests requests
requests_total 10 1700000000.5 # {trace_id=\"abc\"} 1
# EOF
ignored 1
";
        let families = decode(
            body.as_bytes(),
            Some("application/openmetrics-text; version=1.0.0; charset=utf-8"),
        )
        .unwrap();

        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "requests_total");
        assert_eq!(families[0].metric_type, MetricType::Counter);
        assert_eq!(families[0].help, "Requests served.");
        assert_eq!(families[0].samples[0].value, 10.0);
        assert_eq!(families[0].samples[0].timestamp_ms, Some(1_700_000_000_500));
    }

    #[test]
    fn test_openmetrics_line_rewrite() {
        assert_eq!(openmetrics_line("m{a=\"x y\"} 1 2.5"), "m{a=\"x y\"} 1 2500");
        assert_eq!(openmetrics_line("m 1"), "m 1");
        assert_eq!(openmetrics_line("# TYPE c_total counter"), "# TYPE c_total counter");
        assert_eq!(openmetrics_line("# TYPE g gauge"), "# TYPE g gauge");
    }
}
