//! Inventory record types mirrored from the platform API.

// std
use std::{collections::BTreeMap, fmt, net::IpAddr};
// crates.io
use serde::{Deserialize, Serialize};

/// Annotation and label group consumed from node objects.
pub const NODE_GROUP: &str = "node.metadata-emulator.dev";
/// Node key selecting the traffic-interception mechanism.
pub const NODE_ROUTING_MODE_KEY: &str = "node.metadata-emulator.dev/routingMode";
/// Node key naming the node-wide fallback identity.
pub const NODE_SERVICE_ACCOUNT_NAME_KEY: &str = "node.metadata-emulator.dev/serviceAccountName";
/// Node key naming the node-wide fallback identity's namespace.
pub const NODE_SERVICE_ACCOUNT_NAMESPACE_KEY: &str =
	"node.metadata-emulator.dev/serviceAccountNamespace";

/// Reference to a platform identity, unique by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityRef {
	/// Namespace owning the identity.
	pub namespace: String,
	/// Identity name within the namespace.
	pub name: String,
}
impl IdentityRef {
	/// Build a reference from its two components.
	pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
		Self { namespace: namespace.into(), name: name.into() }
	}
}
impl fmt::Display for IdentityRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.namespace, self.name)
	}
}

/// A workload scheduled on the local node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
	/// Namespace owning the workload.
	pub namespace: String,
	/// Workload name within the namespace.
	pub name: String,
	/// Identity the workload runs as.
	pub identity: IdentityRef,
	/// Address assigned to the workload.
	pub pod_ip: IpAddr,
	/// Whether the workload shares the node's network namespace.
	#[serde(default)]
	pub host_network: bool,
}
impl Workload {
	/// The identity reference this workload authenticates as.
	pub fn reference(&self) -> IdentityRef {
		self.identity.clone()
	}

	/// Store key, unique within the cluster.
	pub(crate) fn key(&self) -> (String, String) {
		(self.namespace.clone(), self.name.clone())
	}
}

/// Cluster identity object carrying provider annotations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	/// Reference uniquely naming the identity.
	pub reference: IdentityRef,
	/// String-keyed annotations, including the impersonation email when set.
	#[serde(default)]
	pub annotations: BTreeMap<String, String>,
}
impl Identity {
	/// Look up one annotation value.
	pub fn annotation(&self, key: &str) -> Option<&str> {
		self.annotations.get(key).map(String::as_str)
	}
}

/// The local node object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
	/// Node name.
	pub name: String,
	/// The node's internal address.
	pub internal_ip: Option<IpAddr>,
	/// String-keyed annotations.
	#[serde(default)]
	pub annotations: BTreeMap<String, String>,
	/// String-keyed labels.
	#[serde(default)]
	pub labels: BTreeMap<String, String>,
}
impl Node {
	/// Look up a key on the node, preferring annotations over labels.
	pub fn annotation_or_label(&self, key: &str) -> Option<&str> {
		self.annotations.get(key).or_else(|| self.labels.get(key)).map(String::as_str)
	}

	/// The node-wide fallback identity, when both parts are configured.
	pub fn fallback_identity(&self) -> Option<IdentityRef> {
		let name = self.annotation_or_label(NODE_SERVICE_ACCOUNT_NAME_KEY)?;
		let namespace = self.annotation_or_label(NODE_SERVICE_ACCOUNT_NAMESPACE_KEY)?;

		Some(IdentityRef::new(namespace, name))
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn node_with(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
		Node {
			name: "worker-7".into(),
			internal_ip: Some("10.0.0.1".parse().unwrap()),
			annotations: annotations
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect(),
			labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
		}
	}

	#[test]
	fn fallback_identity_requires_both_parts() {
		let node = node_with(&[(NODE_SERVICE_ACCOUNT_NAME_KEY, "telemetry")], &[]);

		assert_eq!(node.fallback_identity(), None);

		let node = node_with(
			&[
				(NODE_SERVICE_ACCOUNT_NAME_KEY, "telemetry"),
				(NODE_SERVICE_ACCOUNT_NAMESPACE_KEY, "obs"),
			],
			&[],
		);

		assert_eq!(node.fallback_identity(), Some(IdentityRef::new("obs", "telemetry")));
	}

	#[test]
	fn annotations_win_over_labels() {
		let node = node_with(
			&[
				(NODE_SERVICE_ACCOUNT_NAME_KEY, "from-annotation"),
				(NODE_SERVICE_ACCOUNT_NAMESPACE_KEY, "obs"),
			],
			&[
				(NODE_SERVICE_ACCOUNT_NAME_KEY, "from-label"),
				(NODE_SERVICE_ACCOUNT_NAMESPACE_KEY, "other"),
			],
		);

		assert_eq!(node.fallback_identity(), Some(IdentityRef::new("obs", "from-annotation")));
	}
}
