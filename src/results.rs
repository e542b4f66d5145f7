//! Per-rank measurements and their summaries.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// One measurement scraped from a log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub rank: Option<u32>,
    pub metric: String,
    pub value: f64,
}

impl Sample {
    pub fn new(metric: impl Into<String>, rank: Option<u32>, value: f64) -> Self {
        Self {
            rank,
            metric: metric.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub sum: f64,
    pub average: f64,
}

impl Summary {
    /// Unweighted summary; empty input yields all zeros
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sum: f64 = values.iter().sum();
        Self {
            count: values.len(),
            sum,
            average: sum / values.len() as f64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `Average Throughput: 123.45 samples/second`
    pub fn average_line(&self, label: &str, unit: &str) -> String {
        format!("Average {}: {:.2} {}", label, self.average, unit)
    }
}

/// Summarize and log one metric; empty input is noted, not an error
pub fn summarize(label: &str, unit: &str, values: &[f64]) -> Summary {
    let summary = Summary::of(values);
    if summary.is_empty() {
        info!("No {} samples found", label.to_lowercase());
    } else {
        info!("{}", summary.average_line(label, unit));
        info!("{} samples: {}, sum {:.2}", label, summary.count, summary.sum);
    }
    summary
}

/// Group samples by metric name and summarize each group
pub fn aggregate(samples: &[Sample]) -> BTreeMap<String, Summary> {
    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        grouped
            .entry(sample.metric.clone())
            .or_default()
            .push(sample.value);
    }
    grouped
        .into_iter()
        .map(|(metric, values)| (metric, Summary::of(&values)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_json_snapshot;

    #[test]
    fn test_empty_input_is_all_zero() {
        let summary = Summary::of(&[]);
        assert_eq!(summary, Summary { count: 0, sum: 0.0, average: 0.0 });
        assert!(summarize("Throughput", "samples/second", &[]).is_empty());
    }

    #[test]
    fn test_average_is_unweighted() {
        let summary = Summary::of(&[100.0, 200.0, 300.5]);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum, 600.5);
        assert_eq!(
            summary.average_line("Throughput", "samples/second"),
            "Average Throughput: 200.17 samples/second"
        );
    }

    #[test]
    fn test_aggregate_groups_by_metric() {
        let samples = vec![
            Sample::new("throughput", Some(0), 10.0),
            Sample::new("epoch_time", Some(0), 3.0),
            Sample::new("throughput", Some(1), 20.0),
        ];
        assert_json_snapshot!(aggregate(&samples), @r#"
        {
          "epoch_time": {
            "count": 1,
            "sum": 3.0,
            "average": 3.0
          },
          "throughput": {
            "count": 2,
            "sum": 30.0,
            "average": 15.0
          }
        }
        "#);
    }
}
