//! Source-IP request authentication against the workload inventory.

// std
use std::net::{IpAddr, SocketAddr};
// self
use crate::{
	_prelude::*,
	inventory::Inventory,
	metrics,
	retry::{self, Operation, RetryPolicy},
};

/// Maps transport-level peer addresses onto workload identities.
///
/// Identity is derived exclusively from the connection's source address; no
/// request header ever participates, since any workload could forge one.
pub struct Authenticator {
	inventory: Arc<dyn Inventory>,
	policy: RetryPolicy,
	ctx: CancellationToken,
}
impl Authenticator {
	/// Build an authenticator with the default retry policy.
	pub fn new(inventory: Arc<dyn Inventory>, ctx: CancellationToken) -> Self {
		Self { inventory, policy: RetryPolicy::default(), ctx }
	}

	/// Override the retry policy applied to inventory reads.
	pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Resolve the identity behind `peer`.
	///
	/// Ambiguous IPs are retried so a transiently double-indexed address can
	/// reconcile, then surface through the retry-exhausted path; an ambiguous
	/// address is never resolved by picking one of its claimants. Unmatched
	/// IPs fall back to the node-wide identity when the caller is the node
	/// itself.
	#[tracing::instrument(skip(self), fields(peer = %peer))]
	pub async fn identify(&self, peer: SocketAddr) -> Result<IdentityRef> {
		let ip = peer.ip();
		let lookup = retry::run(
			&self.ctx,
			Operation { description: "workload lookup by IP", policy: self.policy },
			|err| err.is_transport() || matches!(err, Error::Ambiguous { .. }),
			|| self.inventory.workload_by_ip(ip),
		)
		.await;

		match lookup {
			Ok(workload) => Ok(workload.reference()),
			Err(Error::NoMatch { .. }) => self.node_fallback(ip).await,
			Err(err) => {
				metrics::record_authn_failure(match &err {
					Error::RetryExhausted { .. } => "ambiguous",
					_ => "lookup_failed",
				});

				Err(err)
			},
		}
	}

	async fn node_fallback(&self, ip: IpAddr) -> Result<IdentityRef> {
		let node = retry::run(
			&self.ctx,
			Operation { description: "node read", policy: self.policy },
			Error::is_transport,
			|| self.inventory.node(),
		)
		.await?;

		if node.internal_ip != Some(ip) {
			metrics::record_authn_failure("no_match");

			return Err(Error::Forbidden(format!(
				"IP {ip} matches neither a workload on this node nor the node address."
			)));
		}

		node.fallback_identity().ok_or_else(|| {
			metrics::record_authn_failure("no_node_identity");

			Error::Forbidden(format!(
				"Node callers from {ip} require the node fallback identity annotations."
			))
		})
	}
}
