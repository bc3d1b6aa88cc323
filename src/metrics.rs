//! Metrics helpers and the Prometheus exporter hookup.

// std
use std::sync::OnceLock;
// crates.io
use metrics::Label;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 4]>;

const METRIC_REQUESTS_TOTAL: &str = "metadata_requests_total";
const METRIC_REQUEST_DURATION: &str = "metadata_request_duration_seconds";
const METRIC_AUTHN_FAILURES: &str = "metadata_authn_failures_total";
const METRIC_RETRY_FAILURES: &str = "metadata_retry_failures_total";
const METRIC_TOKEN_REFRESH_TOTAL: &str = "metadata_token_refresh_total";
const METRIC_TOKEN_REFRESH_DURATION: &str = "metadata_token_refresh_duration_seconds";
const METRIC_CACHED_IDENTITIES: &str = "metadata_cached_identities";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the
/// recorder is installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Cache(format!("Failed to install metrics recorder: {err}.")))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a served metadata request along with its latency.
pub fn record_request(route: &str, status: u16, duration: Duration) {
	let mut labels = LabelSet::with_capacity(2);

	labels.push(Label::new("route", route.to_owned()));
	labels.push(Label::new("status", status.to_string()));

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::histogram!(METRIC_REQUEST_DURATION, labels.iter()).record(duration.as_secs_f64());
}

/// Record a request that could not be mapped to a workload identity.
pub fn record_authn_failure(reason: &'static str) {
	let labels = [Label::new("reason", reason)];

	metrics::counter!(METRIC_AUTHN_FAILURES, labels.iter()).increment(1);
}

/// Record a failed attempt inside a retried operation.
pub fn record_retry_failure(operation: &str) {
	let labels = [Label::new("operation", operation.to_owned())];

	metrics::counter!(METRIC_RETRY_FAILURES, labels.iter()).increment(1);
}

/// Record the outcome of a token refresh for one identity.
pub fn record_token_refresh(reference: &IdentityRef, outcome: &'static str, duration: Duration) {
	let mut labels = LabelSet::with_capacity(3);

	labels.push(Label::new("namespace", reference.namespace.clone()));
	labels.push(Label::new("name", reference.name.clone()));
	labels.push(Label::new("outcome", outcome));

	metrics::counter!(METRIC_TOKEN_REFRESH_TOTAL, labels.iter()).increment(1);
	metrics::histogram!(METRIC_TOKEN_REFRESH_DURATION, labels.iter())
		.record(duration.as_secs_f64());
}

/// Track how many identities currently hold a warm token slot.
pub fn record_cached_identities(count: usize) {
	metrics::gauge!(METRIC_CACHED_IDENTITIES).set(count as f64);
}
