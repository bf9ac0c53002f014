use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};
use crate::xid::{TransactionId, XidCodec};

const XA_REGISTRY_PREFIX: &str = "xa";

// metric names
const ROWS_WRITTEN: &str = "rows_written";
const BRANCHES_PREPARED: &str = "branches_prepared";
const BRANCHES_ABANDONED: &str = "branches_abandoned";
const HANGING_BRANCHES: &str = "hanging_branches";
const COMMITS: &str = "commits";
const ROLLBACKS: &str = "rollbacks";
const COMMIT_TIME: &str = "commit_time";

// label keys
pub(crate) const JOB_LABEL: &str = "job";
pub(crate) const SUBTASK_LABEL: &str = "subtask";
pub(crate) const OUTCOME_LABEL: &str = "outcome";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // It is okay to use a blocking mutex because each metric is registered only once.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the transactional write path, labelled by job and subtask.
pub(crate) struct XaMetrics {
    pub(crate) rows_written: Family<Vec<(String, String)>, Counter>,
    pub(crate) branches_prepared: Family<Vec<(String, String)>, Counter>,
    pub(crate) branches_abandoned: Family<Vec<(String, String)>, Counter>,
    pub(crate) hanging: Family<Vec<(String, String)>, Gauge>,
    /// additionally labelled by `outcome`
    pub(crate) commits: Family<Vec<(String, String)>, Counter>,
    /// additionally labelled by `outcome`
    pub(crate) rollbacks: Family<Vec<(String, String)>, Counter>,
    /// microseconds spent on a commit, retries included
    pub(crate) commit_time: Family<Vec<(String, String)>, Histogram>,
}

impl XaMetrics {
    fn new() -> Self {
        let metrics = Self {
            rows_written: Family::<Vec<(String, String)>, Counter>::default(),
            branches_prepared: Family::<Vec<(String, String)>, Counter>::default(),
            branches_abandoned: Family::<Vec<(String, String)>, Counter>::default(),
            hanging: Family::<Vec<(String, String)>, Gauge>::default(),
            commits: Family::<Vec<(String, String)>, Counter>::default(),
            rollbacks: Family::<Vec<(String, String)>, Counter>::default(),
            // exponential buckets in the range 100 microseconds to 15 minutes
            commit_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60000000.0 * 15.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(XA_REGISTRY_PREFIX);
        registry.register(
            ROWS_WRITTEN,
            "Total number of rows executed inside transaction branches",
            metrics.rows_written.clone(),
        );
        registry.register(
            BRANCHES_PREPARED,
            "Total number of branches prepared",
            metrics.branches_prepared.clone(),
        );
        registry.register(
            BRANCHES_ABANDONED,
            "Total number of branches abandoned to the hanging list",
            metrics.branches_abandoned.clone(),
        );
        registry.register(
            HANGING_BRANCHES,
            "Number of hanging branches tracked in the writer state",
            metrics.hanging.clone(),
        );
        registry.register(
            COMMITS,
            "Total number of commit calls by outcome",
            metrics.commits.clone(),
        );
        registry.register(
            ROLLBACKS,
            "Total number of rollback calls by outcome",
            metrics.rollbacks.clone(),
        );
        registry.register(
            COMMIT_TIME,
            "A Histogram to keep track of the total time taken to commit a branch, in microseconds",
            metrics.commit_time.clone(),
        );
        metrics
    }
}

static XA_METRICS: OnceLock<XaMetrics> = OnceLock::new();

pub(crate) fn xa_metrics() -> &'static XaMetrics {
    XA_METRICS.get_or_init(XaMetrics::new)
}

/// Labels identifying one subtask's writer.
pub(crate) fn subtask_labels(codec: &XidCodec) -> Vec<(String, String)> {
    vec![
        (JOB_LABEL.to_string(), codec.job_id().to_string()),
        (SUBTASK_LABEL.to_string(), codec.subtask_index().to_string()),
    ]
}

/// Labels of the subtask that produced `xid`; ids of a foreign layout get empty values.
pub(crate) fn xid_labels(xid: &TransactionId) -> Vec<(String, String)> {
    let job = xid.job_id().map(|job| job.to_string()).unwrap_or_default();
    let subtask = xid
        .coordinates()
        .map(|c| c.subtask_index.to_string())
        .unwrap_or_default();
    vec![
        (JOB_LABEL.to_string(), job),
        (SUBTASK_LABEL.to_string(), subtask),
    ]
}

/// `labels` plus the given outcome.
pub(crate) fn with_outcome(labels: &[(String, String)], outcome: &str) -> Vec<(String, String)> {
    let mut labels = labels.to_vec();
    labels.push((OUTCOME_LABEL.to_string(), outcome.to_string()));
    labels
}

/// Exponential bucket distribution with range.
/// Creates `length` buckets, where the lowest bucket is `min` and the highest bucket is `max`.
/// The final +Inf bucket is not counted and not included in the returned iterator.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    // a single bucket has no growth to solve for.
    let growth_factor = if length > 1 {
        (max / min).powf(1.0 / (length as f64 - 1.0))
    } else {
        1.0
    };

    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the families exist even if nothing has been recorded yet
    let _ = xa_metrics();
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xid::JobId;

    #[test]
    fn buckets_span_the_range() {
        let buckets: Vec<f64> = exponential_buckets_range(1.0, 100.0, 3).collect();
        assert_eq!(buckets.len(), 3);
        assert!((buckets[0] - 1.0).abs() < 1e-9);
        assert!((buckets[1] - 10.0).abs() < 1e-9);
        assert!((buckets[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn encoded_metrics_carry_prefix_and_labels() {
        let codec = XidCodec::new(JobId::from_name("metrics-test"), 11);
        let labels = subtask_labels(&codec);
        xa_metrics().rows_written.get_or_create(&labels).inc_by(3);
        xa_metrics()
            .commits
            .get_or_create(&with_outcome(&labels, "committed"))
            .inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("xa_rows_written_total"));
        assert!(text.contains(r#"subtask="11""#));
        assert!(text.contains(r#"outcome="committed""#));
    }
}
