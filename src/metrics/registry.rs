//! Metrics registry holding definitions and series.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prometheus::proto::{self, LabelPair, MetricFamily};
use prometheus::{Encoder, TextEncoder};

use crate::clock::Clock;
use crate::config::{MetricConfig, MetricType};

use super::series::{Series, SeriesValue};
use super::{MetricValue, MetricsError};

/// A metric as the registry sees it: configuration plus the full label set.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub description: String,
    pub metric_type: MetricType,
    /// Every label a series carries, sorted.
    pub labels: Vec<String>,
    /// Histogram bucket bounds.
    pub buckets: Vec<f64>,
    /// Enum states.
    pub states: Vec<String>,
    pub expiration: Option<Duration>,
    pub increment: bool,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        let buckets = if metric_type == MetricType::Histogram {
            prometheus::DEFAULT_BUCKETS.to_vec()
        } else {
            Vec::new()
        };
        Self {
            name: name.into(),
            description: String::new(),
            metric_type,
            labels: Vec::new(),
            buckets,
            states: Vec::new(),
            expiration: None,
            increment: false,
        }
    }

    /// Build from configuration, adding `extra_labels` (the `database`
    /// label and database static labels) to the declared ones.
    pub fn from_config(config: &MetricConfig, extra_labels: &[String]) -> Self {
        let mut def = Self::new(&config.name, config.metric_type)
            .with_description(&config.description)
            .with_labels(config.labels.iter().chain(extra_labels))
            .with_increment(config.increment);
        if let Some(buckets) = &config.buckets {
            def.buckets = buckets.clone();
        }
        if let Some(states) = &config.states {
            def.states = states.clone();
        }
        def.expiration = config.expiration;
        def
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set label names. They are kept sorted and deduplicated.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        labels.dedup();
        self.labels = labels;
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_increment(mut self, increment: bool) -> Self {
        self.increment = increment;
        self
    }

    /// Label values in definition order, checking the label names match.
    fn label_values(&self, labels: &BTreeMap<String, String>) -> Result<Vec<String>, MetricsError> {
        if labels.len() != self.labels.len() || !self.labels.iter().all(|l| labels.contains_key(l)) {
            return Err(MetricsError::LabelMismatch {
                metric: self.name.clone(),
                expected: self.labels.clone(),
                got: labels.keys().cloned().collect(),
            });
        }
        Ok(self.labels.iter().map(|l| labels[l].clone()).collect())
    }
}

#[derive(Debug)]
struct Family {
    def: MetricDefinition,
    series: BTreeMap<Vec<String>, Series>,
}

/// Registry of metrics and their series.
///
/// Shared as `Arc<MetricsRegistry>` between the collector and the HTTP server.
pub struct MetricsRegistry {
    clock: Arc<dyn Clock>,
    families: Mutex<BTreeMap<String, Family>>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("metric_count", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            families: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Family>> {
        self.families.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric.
    ///
    /// # Errors
    /// Returns `MetricsError::Duplicate` if the name is taken.
    pub fn register(&self, def: MetricDefinition) -> Result<(), MetricsError> {
        let mut families = self.lock();
        if families.contains_key(&def.name) {
            return Err(MetricsError::Duplicate(def.name));
        }
        families.insert(
            def.name.clone(),
            Family {
                def,
                series: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Apply an update to the series identified by `labels`, creating it if
    /// needed, and refresh its last-update time.
    ///
    /// # Errors
    /// - `MetricsError::Unknown` if the metric isn't registered
    /// - `MetricsError::LabelMismatch` if `labels` aren't exactly the metric's labels
    /// - `MetricsError::InvalidState` / `InvalidValue` if the value doesn't fit the type
    pub fn update(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        value: MetricValue,
    ) -> Result<(), MetricsError> {
        let now = self.clock.now();
        let mut families = self.lock();
        let family = families
            .get_mut(name)
            .ok_or_else(|| MetricsError::Unknown(name.to_string()))?;
        let key = family.def.label_values(labels)?;

        let mut series = family
            .series
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Series::new(&family.def, now));
        series.value.update(&family.def, &value)?;
        series.last_update = now;
        family.series.insert(key, series);
        Ok(())
    }

    /// Current value of a series.
    pub fn get(&self, name: &str, labels: &BTreeMap<String, String>) -> Option<SeriesValue> {
        let families = self.lock();
        let family = families.get(name)?;
        let key = family.def.label_values(labels).ok()?;
        family.series.get(&key).map(|series| series.value.clone())
    }

    /// Number of live series for a metric.
    pub fn series_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |family| family.series.len())
    }

    /// Remove series past their metric's expiration. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for family in self.lock().values_mut() {
            if family.def.expiration.is_none() {
                continue;
            }
            let before = family.series.len();
            let def = &family.def;
            family.series.retain(|_, series| !series.is_expired(def, now));
            let expired = before - family.series.len();
            if expired > 0 {
                tracing::debug!(metric = %def.name, expired, "Expired series removed");
            }
            removed += expired;
        }
        removed
    }

    /// Snapshot all non-empty metric families.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.lock()
            .values()
            .filter(|family| !family.series.is_empty())
            .map(to_metric_family)
            .collect()
    }

    /// Render in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(prometheus::Error::Msg(e.to_string())))
    }
}

// =============================================================================
// Exposition
// =============================================================================

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

fn to_metric_family(family: &Family) -> MetricFamily {
    let def = &family.def;
    let mut metrics = Vec::new();

    for (values, series) in &family.series {
        let labels: Vec<LabelPair> = def
            .labels
            .iter()
            .zip(values)
            .map(|(name, value)| label_pair(name, value))
            .collect();

        match &series.value {
            SeriesValue::Counter(v) => {
                let mut counter = proto::Counter::default();
                counter.set_value(*v);
                let mut metric = proto::Metric::default();
                metric.set_label(labels);
                metric.set_counter(counter);
                metrics.push(metric);
            }
            SeriesValue::Gauge(v) => {
                let mut gauge = proto::Gauge::default();
                gauge.set_value(*v);
                let mut metric = proto::Metric::default();
                metric.set_label(labels);
                metric.set_gauge(gauge);
                metrics.push(metric);
            }
            SeriesValue::Histogram { buckets, sum, count } => {
                let buckets = def
                    .buckets
                    .iter()
                    .zip(buckets)
                    .map(|(bound, cumulative)| {
                        let mut bucket = proto::Bucket::default();
                        bucket.set_upper_bound(*bound);
                        bucket.set_cumulative_count(*cumulative);
                        bucket
                    })
                    .collect();
                let mut histogram = proto::Histogram::default();
                histogram.set_sample_count(*count);
                histogram.set_sample_sum(*sum);
                histogram.set_bucket(buckets);
                let mut metric = proto::Metric::default();
                metric.set_label(labels);
                metric.set_histogram(histogram);
                metrics.push(metric);
            }
            SeriesValue::Summary { sum, count } => {
                let mut summary = proto::Summary::default();
                summary.set_sample_count(*count);
                summary.set_sample_sum(*sum);
                let mut metric = proto::Metric::default();
                metric.set_label(labels);
                metric.set_summary(summary);
                metrics.push(metric);
            }
            SeriesValue::Enum(active) => {
                // One gauge sample per state, labelled with the metric name.
                for (index, state) in def.states.iter().enumerate() {
                    let mut state_labels = labels.clone();
                    state_labels.push(label_pair(&def.name, state));
                    let mut gauge = proto::Gauge::default();
                    gauge.set_value(if index == *active { 1.0 } else { 0.0 });
                    let mut metric = proto::Metric::default();
                    metric.set_label(state_labels);
                    metric.set_gauge(gauge);
                    metrics.push(metric);
                }
            }
        }
    }

    let field_type = match def.metric_type {
        MetricType::Counter => proto::MetricType::COUNTER,
        MetricType::Gauge | MetricType::Enum => proto::MetricType::GAUGE,
        MetricType::Histogram => proto::MetricType::HISTOGRAM,
        MetricType::Summary => proto::MetricType::SUMMARY,
    };

    let mut mf = MetricFamily::default();
    mf.set_name(def.name.clone());
    mf.set_help(if def.description.is_empty() {
        def.name.clone()
    } else {
        def.description.clone()
    });
    mf.set_field_type(field_type);
    mf.set_metric(metrics);
    mf
}

/// Register user metrics from configuration.
pub fn register_configured(
    registry: &MetricsRegistry,
    metrics: &BTreeMap<String, MetricConfig>,
    extra_labels: &[String],
) -> Result<(), MetricsError> {
    for config in metrics.values() {
        registry.register(MetricDefinition::from_config(config, extra_labels))?;
    }
    Ok(())
}
