//! Choosing which features of a campaign run.

use cel::{Context, FunctionContext, Program};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::SelectionConfig;
use crate::error::{Error, Result};

/// CEL helper returning the first capture group of a regex (or the whole match)
/// Usage: extract("nccl-multi-node-all-reduce-perf", "multi-node-(.*)") -> "all-reduce-perf"
fn extract_regex(
    ftx: &FunctionContext,
    input: Arc<String>,
    pattern: Arc<String>,
) -> cel::ResolveResult {
    match Regex::new(&pattern) {
        Ok(re) => {
            let result = re
                .captures(&input)
                .and_then(|c| c.get(if c.len() > 1 { 1 } else { 0 }))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Ok(cel::Value::String(Arc::new(result)))
        }
        Err(err) => ftx.error(format!("Invalid regex pattern: {}", err)).into(),
    }
}

/// Compiled feature selection
pub struct Selector {
    labels: BTreeMap<String, String>,
    skip_labels: BTreeMap<String, String>,
    feature: Option<Regex>,
    skip_feature: Option<Regex>,
    filter: Option<(String, Program)>,
}

impl Selector {
    /// Compile selection flags; bad regexes and CEL programs are config errors
    pub fn new(config: &SelectionConfig) -> Result<Self> {
        let compile = |flag: &str, pattern: &Option<String>| -> Result<Option<Regex>> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p).map_err(|e| Error::config(format!("invalid {flag} regex: {e}")))
                })
                .transpose()
        };

        let filter = match config.filter.as_deref() {
            Some(source) => {
                let program = Program::compile(source)
                    .map_err(|e| Error::config(format!("invalid --filter expression: {e}")))?;
                Some((source.to_string(), program))
            }
            None => None,
        };

        Ok(Self {
            labels: config.labels.clone(),
            skip_labels: config.skip_labels.clone(),
            feature: compile("--feature", &config.feature)?,
            skip_feature: compile("--skip-feature", &config.skip_feature)?,
            filter,
        })
    }

    /// Whether a feature with this name and these labels should run
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<bool> {
        if !self
            .labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
        {
            return Ok(false);
        }
        if self
            .skip_labels
            .iter()
            .any(|(k, v)| labels.get(k).is_some_and(|l| l == v))
        {
            return Ok(false);
        }
        if let Some(re) = &self.feature {
            if !re.is_match(name) {
                return Ok(false);
            }
        }
        if let Some(re) = &self.skip_feature {
            if re.is_match(name) {
                return Ok(false);
            }
        }
        match &self.filter {
            Some((source, program)) => evaluate_filter(source, program, name, labels),
            None => Ok(true),
        }
    }
}

fn evaluate_filter(
    source: &str,
    program: &Program,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let mut context = Context::default();
    context.add_function("extract", extract_regex);
    context
        .add_variable("name", name.to_string())
        .map_err(|e| Error::config(format!("failed to add name to filter context: {e}")))?;

    let labels_map: HashMap<String, String> =
        labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    context
        .add_variable("labels", labels_map)
        .map_err(|e| Error::config(format!("failed to add labels to filter context: {e}")))?;

    match program.execute(&context) {
        Ok(cel::Value::Bool(selected)) => Ok(selected),
        Ok(other) => Err(Error::config(format!(
            "--filter '{source}' must evaluate to a bool, got {other:?}"
        ))),
        // a missing label key is a non-match rather than an error
        Err(cel::ExecutionError::NoSuchKey(_)) => Ok(false),
        Err(e) => Err(Error::config(format!("--filter '{source}' failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(config: SelectionConfig) -> Selector {
        Selector::new(&config).unwrap()
    }

    #[test]
    fn test_empty_selection_matches_everything() {
        let s = selector(SelectionConfig::default());
        assert!(s.matches("job-pi", &labels(&[("suite", "jobs")])).unwrap());
        assert!(s.matches("anything", &BTreeMap::new()).unwrap());
    }

    #[test]
    fn test_label_include_and_exclude() {
        let s = selector(SelectionConfig {
            labels: labels(&[("suite", "nvidia")]),
            skip_labels: labels(&[("feature", "training")]),
            ..Default::default()
        });
        let gpu = labels(&[("suite", "nvidia"), ("hardware", "gpu")]);
        let training = labels(&[("suite", "nvidia"), ("feature", "training")]);
        assert!(s.matches("nccl-single-node", &gpu).unwrap());
        assert!(!s.matches("nvidia-bert-training", &training).unwrap());
        assert!(!s.matches("job-pi", &labels(&[("suite", "jobs")])).unwrap());
    }

    #[test]
    fn test_feature_regexes() {
        let s = selector(SelectionConfig {
            feature: Some("^nccl-".to_string()),
            skip_feature: Some("alltoall".to_string()),
            ..Default::default()
        });
        let none = BTreeMap::new();
        assert!(s.matches("nccl-multi-node-all-reduce-perf", &none).unwrap());
        assert!(!s.matches("nccl-multi-node-alltoall-perf", &none).unwrap());
        assert!(!s.matches("job-pi", &none).unwrap());
    }

    #[test]
    fn test_cel_filter() {
        let s = selector(SelectionConfig {
            filter: Some(
                r#""hardware" in labels && labels["hardware"] == "gpu" && name.startsWith("nccl")"#
                    .to_string(),
            ),
            ..Default::default()
        });
        assert!(s.matches("nccl-single-node", &labels(&[("hardware", "gpu")])).unwrap());
        assert!(!s.matches("neuron-single-node", &labels(&[("hardware", "neuron")])).unwrap());
        assert!(!s.matches("job-pi", &labels(&[("suite", "jobs")])).unwrap());
    }

    #[test]
    fn test_cel_filter_with_extract() {
        let s = selector(SelectionConfig {
            filter: Some(r#"extract(name, "multi-node-(.*)") == "all-gather-perf""#.to_string()),
            ..Default::default()
        });
        let none = BTreeMap::new();
        assert!(s.matches("nccl-multi-node-all-gather-perf", &none).unwrap());
        assert!(!s.matches("nccl-multi-node-alltoall-perf", &none).unwrap());
    }

    #[test]
    fn test_invalid_selection_is_config_error() {
        let bad_regex = Selector::new(&SelectionConfig {
            feature: Some("(".to_string()),
            ..Default::default()
        });
        assert!(bad_regex.is_err());

        let s = selector(SelectionConfig {
            filter: Some(r#"name + "x""#.to_string()),
            ..Default::default()
        });
        let err = s.matches("job-pi", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
