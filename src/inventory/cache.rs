//! In-memory inventory cache fed by platform informers.

// std
use std::{collections::HashMap, net::IpAddr};
// crates.io
use async_trait::async_trait;
use smallvec::SmallVec;
use tokio::sync::RwLock;
// self
use crate::{
	_prelude::*,
	inventory::{
		DirectReader, Event, Inventory, Listener,
		types::{Identity, Node, Workload},
	},
};

type WorkloadKey = (String, String);

/// Per-store fallback toggles; direct platform reads on cache miss are on by
/// default and disableable for benchmarking.
#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
	/// Consult the platform directly when an IP is not in the index.
	pub workload_fallback: bool,
	/// Consult the platform directly when an identity is not cached.
	pub identity_fallback: bool,
	/// Consult the platform directly when the node object is not cached.
	pub node_fallback: bool,
}
impl Default for CacheOptions {
	fn default() -> Self {
		Self { workload_fallback: true, identity_fallback: true, node_fallback: true }
	}
}

#[derive(Debug, Default)]
struct WorkloadStore {
	records: HashMap<WorkloadKey, Workload>,
	// Host-networked workloads are kept in `records` but never appear here;
	// they share the node's address and must go through the node fallback.
	by_ip: HashMap<IpAddr, SmallVec<[WorkloadKey; 1]>>,
}
impl WorkloadStore {
	fn index(&mut self, workload: &Workload) {
		if workload.host_network {
			return;
		}

		let keys = self.by_ip.entry(workload.pod_ip).or_default();
		let key = workload.key();

		if !keys.contains(&key) {
			keys.push(key);
		}
	}

	fn unindex(&mut self, workload: &Workload) {
		if let Some(keys) = self.by_ip.get_mut(&workload.pod_ip) {
			keys.retain(|key| *key != workload.key());

			if keys.is_empty() {
				self.by_ip.remove(&workload.pod_ip);
			}
		}
	}
}

/// Node-local index of workloads, cluster identities, and the node object.
///
/// Informer tasks push deltas in through the `apply_*`/`remove_*`/`sync_*`
/// methods; readers go through the [`Inventory`] trait. Events derived from
/// deltas are dispatched to listeners after the store lock is released.
pub struct InventoryCache {
	workloads: RwLock<WorkloadStore>,
	identities: RwLock<HashMap<IdentityRef, Identity>>,
	node: RwLock<Option<Node>>,
	node_identity: RwLock<Option<IdentityRef>>,
	listeners: RwLock<Vec<Listener>>,
	fallback: Option<Arc<dyn DirectReader>>,
	options: CacheOptions,
}
impl InventoryCache {
	/// Build an empty cache with an optional direct-read fallback.
	pub fn new(fallback: Option<Arc<dyn DirectReader>>, options: CacheOptions) -> Self {
		Self {
			workloads: RwLock::new(WorkloadStore::default()),
			identities: RwLock::new(HashMap::new()),
			node: RwLock::new(None),
			node_identity: RwLock::new(None),
			listeners: RwLock::new(Vec::new()),
			fallback,
			options,
		}
	}

	/// Upsert a workload record observed on this node.
	pub async fn apply_workload(&self, workload: Workload) {
		let mut events = Vec::new();

		{
			let mut store = self.workloads.write().await;

			match store.records.insert(workload.key(), workload.clone()) {
				Some(previous) => {
					store.unindex(&previous);

					if previous.identity != workload.identity {
						events.push(Event::DeleteWorkload(previous.reference()));
						events.push(Event::AddWorkload(workload.reference()));
					}
				},
				None => events.push(Event::AddWorkload(workload.reference())),
			}

			store.index(&workload);
		}

		self.dispatch(&events).await;
	}

	/// Drop a workload record.
	pub async fn remove_workload(&self, namespace: &str, name: &str) {
		let mut events = Vec::new();

		{
			let mut store = self.workloads.write().await;

			if let Some(previous) = store.records.remove(&(namespace.into(), name.into())) {
				store.unindex(&previous);
				events.push(Event::DeleteWorkload(previous.reference()));
			}
		}

		self.dispatch(&events).await;
	}

	/// Replace the workload store with a freshly listed snapshot.
	///
	/// Emits deletions for records absent from the snapshot, then applies the
	/// snapshot records individually so identity changes surface as events.
	pub async fn sync_workloads(&self, listed: Vec<Workload>) {
		let stale: Vec<WorkloadKey> = {
			let store = self.workloads.read().await;

			store
				.records
				.keys()
				.filter(|key| !listed.iter().any(|workload| workload.key() == **key))
				.cloned()
				.collect()
		};

		for (namespace, name) in stale {
			self.remove_workload(&namespace, &name).await;
		}
		for workload in listed {
			self.apply_workload(workload).await;
		}
	}

	/// Upsert the node object, tracking its fallback identity.
	pub async fn apply_node(&self, node: Node) {
		let next = node.fallback_identity();

		{
			*self.node.write().await = Some(node);
		}

		let changed = {
			let mut current = self.node_identity.write().await;

			if *current == next {
				false
			} else {
				*current = next.clone();

				true
			}
		};

		if changed {
			self.dispatch(&[Event::UpdateNodeIdentity(next)]).await;
		}
	}

	/// Upsert an identity object.
	pub async fn apply_identity(&self, identity: Identity) {
		let reference = identity.reference.clone();

		{
			self.identities.write().await.insert(reference.clone(), identity);
		}

		self.dispatch(&[Event::UpdateIdentity(reference)]).await;
	}

	/// Drop an identity object.
	pub async fn remove_identity(&self, reference: &IdentityRef) {
		let removed = { self.identities.write().await.remove(reference).is_some() };

		if removed {
			self.dispatch(&[Event::DeleteIdentity(reference.clone())]).await;
		}
	}

	/// Replace the identity store with a freshly listed snapshot.
	pub async fn sync_identities(&self, listed: Vec<Identity>) {
		let stale: Vec<IdentityRef> = {
			let store = self.identities.read().await;

			store
				.keys()
				.filter(|reference| {
					!listed.iter().any(|identity| identity.reference == **reference)
				})
				.cloned()
				.collect()
		};

		for reference in stale {
			self.remove_identity(&reference).await;
		}
		for identity in listed {
			self.apply_identity(identity).await;
		}
	}

	/// Whether every store has been seeded at least once.
	pub async fn node_seeded(&self) -> bool {
		self.node.read().await.is_some()
	}

	async fn dispatch(&self, events: &[Event]) {
		if events.is_empty() {
			return;
		}

		let listeners = self.listeners.read().await;

		for event in events {
			for listener in listeners.iter() {
				listener(event);
			}
		}
	}
}
#[async_trait]
impl Inventory for InventoryCache {
	async fn workload_by_ip(&self, ip: IpAddr) -> Result<Workload> {
		let mut matched: SmallVec<[Workload; 1]> = {
			let store = self.workloads.read().await;

			store
				.by_ip
				.get(&ip)
				.map(|keys| {
					keys.iter().filter_map(|key| store.records.get(key).cloned()).collect()
				})
				.unwrap_or_default()
		};

		if matched.len() > 1 {
			return Err(Error::Ambiguous { ip });
		}
		if let Some(found) = matched.pop() {
			return Ok(found);
		}

		if self.options.workload_fallback
			&& let Some(reader) = &self.fallback
		{
			let mut direct = reader.workloads_by_ip(ip).await?;

			direct.retain(|workload| !workload.host_network);

			if direct.len() > 1 {
				return Err(Error::Ambiguous { ip });
			}
			if let Some(found) = direct.pop() {
				return Ok(found);
			}
		}

		Err(Error::NoMatch { ip })
	}

	async fn identity(&self, reference: &IdentityRef) -> Result<Identity> {
		if let Some(identity) = self.identities.read().await.get(reference) {
			return Ok(identity.clone());
		}

		if self.options.identity_fallback
			&& let Some(reader) = &self.fallback
			&& let Some(identity) = reader.read_identity(reference).await?
		{
			return Ok(identity);
		}

		Err(Error::Platform(format!("Identity {reference} is not present in the cluster.")))
	}

	async fn node(&self) -> Result<Node> {
		if let Some(node) = self.node.read().await.clone() {
			return Ok(node);
		}

		if self.options.node_fallback
			&& let Some(reader) = &self.fallback
			&& let Some(node) = reader.read_node().await?
		{
			return Ok(node);
		}

		Err(Error::Platform("The local node object is not available.".into()))
	}

	async fn add_listener(&self, listener: Listener) {
		self.listeners.write().await.push(listener);
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{collections::BTreeMap, sync::Mutex};
	// self
	use super::*;

	fn workload(namespace: &str, name: &str, identity: &str, ip: &str) -> Workload {
		Workload {
			namespace: namespace.into(),
			name: name.into(),
			identity: IdentityRef::new(namespace, identity),
			pod_ip: ip.parse().unwrap(),
			host_network: false,
		}
	}

	async fn recording_cache() -> (Arc<InventoryCache>, Arc<Mutex<Vec<Event>>>) {
		let cache = Arc::new(InventoryCache::new(None, CacheOptions::default()));
		let events = Arc::new(Mutex::new(Vec::new()));
		let sink = events.clone();

		cache
			.add_listener(Box::new(move |event| sink.lock().unwrap().push(event.clone())))
			.await;

		(cache, events)
	}

	#[tokio::test]
	async fn one_match_resolves_and_respects_the_index_contract() {
		let (cache, _) = recording_cache().await;

		cache.apply_workload(workload("prod", "api-0", "api", "10.0.0.7")).await;

		let found = cache.workload_by_ip("10.0.0.7".parse().unwrap()).await.unwrap();

		assert!(!found.host_network);
		assert_eq!(found.pod_ip, "10.0.0.7".parse::<IpAddr>().unwrap());
		assert_eq!(found.reference(), IdentityRef::new("prod", "api"));
	}

	#[tokio::test]
	async fn duplicate_ips_are_ambiguous_not_arbitrary() {
		let (cache, _) = recording_cache().await;

		cache.apply_workload(workload("prod", "api-0", "api", "10.0.0.5")).await;
		cache.apply_workload(workload("prod", "api-1", "worker", "10.0.0.5")).await;

		let err = cache.workload_by_ip("10.0.0.5".parse().unwrap()).await.unwrap_err();

		assert!(matches!(err, Error::Ambiguous { .. }));
	}

	#[tokio::test]
	async fn host_networked_workloads_never_appear_in_the_ip_index() {
		let (cache, _) = recording_cache().await;
		let mut host = workload("kube-system", "agent-x", "agent", "10.0.0.1");

		host.host_network = true;
		cache.apply_workload(host).await;

		let err = cache.workload_by_ip("10.0.0.1".parse().unwrap()).await.unwrap_err();

		assert!(matches!(err, Error::NoMatch { .. }));
	}

	#[tokio::test]
	async fn workload_lifecycle_emits_add_and_delete() {
		let (cache, events) = recording_cache().await;

		cache.apply_workload(workload("prod", "api-0", "api", "10.0.0.7")).await;
		cache.remove_workload("prod", "api-0").await;

		let seen = events.lock().unwrap().clone();

		assert_eq!(seen, vec![
			Event::AddWorkload(IdentityRef::new("prod", "api")),
			Event::DeleteWorkload(IdentityRef::new("prod", "api")),
		]);
	}

	#[tokio::test]
	async fn identity_change_on_update_is_a_delete_plus_add() {
		let (cache, events) = recording_cache().await;

		cache.apply_workload(workload("prod", "api-0", "api", "10.0.0.7")).await;
		cache.apply_workload(workload("prod", "api-0", "batch", "10.0.0.7")).await;

		let seen = events.lock().unwrap().clone();

		assert_eq!(seen, vec![
			Event::AddWorkload(IdentityRef::new("prod", "api")),
			Event::DeleteWorkload(IdentityRef::new("prod", "api")),
			Event::AddWorkload(IdentityRef::new("prod", "batch")),
		]);
	}

	#[tokio::test]
	async fn node_identity_transitions_dispatch_updates() {
		let (cache, events) = recording_cache().await;
		let mut node = Node {
			name: "worker-7".into(),
			internal_ip: Some("10.0.0.1".parse().unwrap()),
			annotations: BTreeMap::new(),
			labels: BTreeMap::new(),
		};

		cache.apply_node(node.clone()).await;

		node.annotations.insert(
			crate::inventory::types::NODE_SERVICE_ACCOUNT_NAME_KEY.into(),
			"telemetry".into(),
		);
		node.annotations.insert(
			crate::inventory::types::NODE_SERVICE_ACCOUNT_NAMESPACE_KEY.into(),
			"obs".into(),
		);
		cache.apply_node(node.clone()).await;
		// Unchanged reapply must stay silent.
		cache.apply_node(node.clone()).await;

		node.annotations.clear();
		cache.apply_node(node).await;

		let seen = events.lock().unwrap().clone();

		assert_eq!(seen, vec![
			Event::UpdateNodeIdentity(Some(IdentityRef::new("obs", "telemetry"))),
			Event::UpdateNodeIdentity(None),
		]);
	}

	#[tokio::test]
	async fn fallback_reader_serves_cache_misses() {
		struct StaticReader(Workload);

		#[async_trait]
		impl DirectReader for StaticReader {
			async fn workloads_by_ip(&self, ip: IpAddr) -> Result<Vec<Workload>> {
				Ok(if self.0.pod_ip == ip { vec![self.0.clone()] } else { Vec::new() })
			}

			async fn read_identity(&self, _: &IdentityRef) -> Result<Option<Identity>> {
				Ok(None)
			}

			async fn read_node(&self) -> Result<Option<Node>> {
				Ok(None)
			}
		}

		let target = workload("prod", "api-0", "api", "10.0.0.7");
		let cache = Arc::new(InventoryCache::new(
			Some(Arc::new(StaticReader(target.clone()))),
			CacheOptions::default(),
		));
		let found = cache.workload_by_ip("10.0.0.7".parse().unwrap()).await.unwrap();

		assert_eq!(found, target);

		let disabled = InventoryCache::new(
			Some(Arc::new(StaticReader(target))),
			CacheOptions { workload_fallback: false, ..CacheOptions::default() },
		);
		let err = disabled.workload_by_ip("10.0.0.7".parse().unwrap()).await.unwrap_err();

		assert!(matches!(err, Error::NoMatch { .. }));
	}
}
