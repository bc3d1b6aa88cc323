//! Workload inventory abstraction and the node-local in-memory cache.

pub mod cache;
pub mod types;

// std
use std::net::IpAddr;
// crates.io
use async_trait::async_trait;
// self
use crate::_prelude::*;
pub use crate::inventory::{
	cache::{CacheOptions, InventoryCache},
	types::{Identity, IdentityRef, Node, Workload},
};

/// Cluster-state change delivered to registered listeners.
///
/// Events from a single source arrive in the order they occurred; no ordering
/// holds across sources, so listeners must be idempotent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	/// A workload using the identity became ready on this node.
	AddWorkload(IdentityRef),
	/// A workload using the identity left this node.
	DeleteWorkload(IdentityRef),
	/// The identity object changed cluster-wide.
	UpdateIdentity(IdentityRef),
	/// The identity object was deleted cluster-wide.
	DeleteIdentity(IdentityRef),
	/// The node-wide fallback identity changed (possibly to none).
	UpdateNodeIdentity(Option<IdentityRef>),
}

/// Listener invoked for every inventory event.
pub type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Read access to the platform's workload inventory.
///
/// The sole dependency-injection seam of the emulator: the in-memory cache and
/// direct platform reads both live behind it.
#[async_trait]
pub trait Inventory: Send + Sync {
	/// Resolve the workload owning `ip` on this node.
	///
	/// Exactly one match succeeds; zero matches yield [`Error::NoMatch`] and
	/// more than one yields [`Error::Ambiguous`]. Host-networked workloads are
	/// never returned here.
	async fn workload_by_ip(&self, ip: IpAddr) -> Result<Workload>;

	/// Fetch the identity object backing `reference`.
	async fn identity(&self, reference: &IdentityRef) -> Result<Identity>;

	/// Fetch the local node object.
	async fn node(&self) -> Result<Node>;

	/// Register a listener for inventory events.
	async fn add_listener(&self, listener: Listener);
}

/// Direct platform reads backing the cache's fallback path.
#[async_trait]
pub trait DirectReader: Send + Sync {
	/// Read all non-host-networked workloads on this node owning `ip`.
	async fn workloads_by_ip(&self, ip: IpAddr) -> Result<Vec<Workload>>;

	/// Read one identity object, `None` when absent.
	async fn read_identity(&self, reference: &IdentityRef) -> Result<Option<Identity>>;

	/// Read the local node object, `None` when absent.
	async fn read_node(&self) -> Result<Option<Node>>;
}
