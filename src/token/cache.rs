//! Slot map, per-identity refresh workers, and the derived token caches.

// std
use std::{
	collections::HashMap,
	sync::atomic::{AtomicBool, AtomicU32, Ordering},
};
// crates.io
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
	sync::{Semaphore, mpsc, oneshot},
	time,
};
// self
use crate::{
	_prelude::*,
	federate::{AccessToken, FederatedCredentials, IdentityToken},
	inventory::{Event, Inventory, Listener},
	metrics,
	token::{self, AssertionIssuer, REFRESH_SAFETY_MARGIN, TokenBundle, TokenSource},
};

// Parked workers only wake on an external nudge; the duration just needs to
// outlive any realistic process lifetime.
const PARKED: Duration = Duration::from_secs(60 * 60 * 24 * 365);
const MAX_ERROR_RETRIES: u32 = 5;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type SlotOutcome = std::result::Result<Arc<TokenBundle>, Arc<Error>>;
type SlotRequest = Option<oneshot::Sender<SlotOutcome>>;
type DerivedKey = (IdentityRef, String, String);

/// Tuning knobs for the token cache.
#[derive(Clone, Copy, Debug)]
pub struct TokenCacheOptions {
	/// Bound on concurrent outbound exchanges across all identities.
	pub concurrency: usize,
}
impl Default for TokenCacheOptions {
	fn default() -> Self {
		Self { concurrency: 10 }
	}
}

/// Per-identity token store with proactive refresh and strict single-flight.
///
/// One refresh worker runs per cached identity; everyone else waits on a
/// channel the worker answers. Slot lifecycle is driven by inventory events
/// through [`TokenCache::listener`].
#[derive(Clone)]
pub struct TokenCache {
	shared: Arc<Shared>,
}
impl TokenCache {
	/// Build the cache and start its background sweeper.
	pub fn new(
		inventory: Arc<dyn Inventory>,
		issuer: Arc<dyn AssertionIssuer>,
		credentials: FederatedCredentials,
		options: TokenCacheOptions,
		ctx: CancellationToken,
	) -> Self {
		let shared = Arc::new(Shared {
			slots: Mutex::new(HashMap::new()),
			node_identity: Mutex::new(None),
			identity_tokens: Mutex::new(HashMap::new()),
			scoped_access_tokens: Mutex::new(HashMap::new()),
			inventory,
			issuer,
			credentials,
			semaphore: Arc::new(Semaphore::new(options.concurrency.max(1))),
			ctx,
		});

		spawn_sweeper(shared.clone());

		Self { shared }
	}

	/// Listener wiring inventory events into slot lifecycle.
	pub fn listener(&self) -> Listener {
		let shared = self.shared.clone();

		Box::new(move |event| shared.on_event(event))
	}

	/// Keep tokens warm for the emulator's own identity.
	pub fn warm_node_identity(&self, reference: &IdentityRef) {
		self.shared.on_event(&Event::UpdateNodeIdentity(Some(reference.clone())));
	}

	/// Number of identities currently holding a warm slot.
	pub fn size(&self) -> usize {
		self.shared.slots.lock().len()
	}

	/// Current token bundle for the identity, fetching through the slot's
	/// refresh worker when nothing fresh is cached.
	#[tracing::instrument(skip(self), fields(identity = %reference))]
	pub async fn tokens(&self, reference: &IdentityRef) -> Result<Arc<TokenBundle>> {
		// One retry covers the race where a worker removes its slot between
		// the lookup and the send.
		for _ in 0..2 {
			let slot = self.shared.ensure_slot(reference, false);

			if let Some(bundle) = slot.fresh() {
				return Ok(bundle);
			}

			let (tx, rx) = oneshot::channel();

			if slot.requests.send(Some(tx)).await.is_err() {
				continue;
			}

			return match rx.await {
				Ok(Ok(bundle)) => Ok(bundle),
				Ok(Err(err)) => Err(Error::Shared(err)),
				Err(_) => Err(Error::Canceled { desc: format!("token fetch for {reference}") }),
			};
		}

		Err(Error::Cache(format!("Refresh worker for {reference} is unavailable.")))
	}

	/// Impersonated identity token for `(identity, audience)`.
	#[tracing::instrument(skip(self), fields(identity = %reference, audience = %audience))]
	pub async fn identity_token(
		&self,
		reference: &IdentityRef,
		audience: &str,
	) -> Result<IdentityToken> {
		let bundle = self.tokens(reference).await?;
		let email = token::require_email(&bundle, reference)?;
		let key = (reference.clone(), email.clone(), audience.to_owned());
		let cached = self.shared.identity_tokens.lock().get(&key).cloned();

		if let Some(token) = cached
			&& !token.expires.is_expired()
		{
			return Ok(token);
		}

		let token = token::mint_identity_token(
			&self.shared.credentials,
			&self.shared.ctx,
			&bundle,
			&email,
			audience,
		)
		.await?;

		self.shared.identity_tokens.lock().insert(key, token.clone());

		Ok(token)
	}

	/// Access token with a caller-chosen scope set.
	///
	/// Scope overrides only exist through impersonation; identities without an
	/// email fall back to their default bundle.
	#[tracing::instrument(skip(self, scopes), fields(identity = %reference))]
	pub async fn scoped_access_token(
		&self,
		reference: &IdentityRef,
		scopes: &[String],
	) -> Result<AccessToken> {
		let bundle = self.tokens(reference).await?;
		let Some(email) = bundle.email.clone() else {
			return Ok(bundle.primary().clone());
		};
		let key = (reference.clone(), email.clone(), scopes.join(" "));
		let cached = self.shared.scoped_access_tokens.lock().get(&key).cloned();

		if let Some(token) = cached
			&& !token.expires.is_expired()
		{
			return Ok(token);
		}

		let token = token::mint_scoped_access_token(
			&self.shared.credentials,
			&self.shared.ctx,
			&bundle,
			&email,
			scopes,
		)
		.await?;

		self.shared.scoped_access_tokens.lock().insert(key, token.clone());

		Ok(token)
	}

	#[cfg(test)]
	pub(crate) fn slot_state(&self, reference: &IdentityRef) -> Option<(u32, bool, bool)> {
		self.shared.slots.lock().get(reference).map(|slot| {
			(
				slot.pod_count.load(Ordering::SeqCst),
				slot.used_by_node.load(Ordering::SeqCst),
				slot.deleted.load(Ordering::SeqCst),
			)
		})
	}
}

struct Slot {
	reference: IdentityRef,
	pod_count: AtomicU32,
	used_by_node: AtomicBool,
	deleted: AtomicBool,
	current: Mutex<Option<Arc<TokenBundle>>>,
	requests: mpsc::Sender<SlotRequest>,
}
impl Slot {
	fn removable(&self) -> bool {
		self.deleted.load(Ordering::SeqCst)
			|| (self.pod_count.load(Ordering::SeqCst) == 0
				&& !self.used_by_node.load(Ordering::SeqCst))
	}

	fn fresh(&self) -> Option<Arc<TokenBundle>> {
		self.current.lock().as_ref().filter(|bundle| !bundle.is_expired()).cloned()
	}

	fn nudge(&self) {
		let _ = self.requests.try_send(None);
	}
}

struct Shared {
	slots: Mutex<HashMap<IdentityRef, Arc<Slot>>>,
	node_identity: Mutex<Option<IdentityRef>>,
	identity_tokens: Mutex<HashMap<DerivedKey, IdentityToken>>,
	scoped_access_tokens: Mutex<HashMap<DerivedKey, AccessToken>>,
	inventory: Arc<dyn Inventory>,
	issuer: Arc<dyn AssertionIssuer>,
	credentials: FederatedCredentials,
	semaphore: Arc<Semaphore>,
	ctx: CancellationToken,
}
impl Shared {
	fn ensure_slot(self: &Arc<Self>, reference: &IdentityRef, used_by_node: bool) -> Arc<Slot> {
		let mut slots = self.slots.lock();

		if let Some(slot) = slots.get(reference) {
			if used_by_node {
				slot.used_by_node.store(true, Ordering::SeqCst);
			}

			return slot.clone();
		}

		let (tx, rx) = mpsc::channel(1);
		let slot = Arc::new(Slot {
			reference: reference.clone(),
			pod_count: AtomicU32::new(0),
			used_by_node: AtomicBool::new(used_by_node),
			deleted: AtomicBool::new(false),
			current: Mutex::new(None),
			requests: tx,
		});

		slots.insert(reference.clone(), slot.clone());
		metrics::record_cached_identities(slots.len());

		let shared = self.clone();
		let worker = slot.clone();

		tokio::spawn(async move { refresh_loop(shared, worker, rx).await });

		slot
	}

	fn remove_slot(&self, slot: &Arc<Slot>) {
		let mut slots = self.slots.lock();

		if let Some(current) = slots.get(&slot.reference)
			&& Arc::ptr_eq(current, slot)
		{
			slots.remove(&slot.reference);
		}

		metrics::record_cached_identities(slots.len());
	}

	fn on_event(self: &Arc<Self>, event: &Event) {
		match event {
			Event::AddWorkload(reference) => {
				let slot = self.ensure_slot(reference, false);

				slot.pod_count.fetch_add(1, Ordering::SeqCst);
			},
			Event::DeleteWorkload(reference) => {
				if let Some(slot) = self.slots.lock().get(reference) {
					let _ = slot.pod_count.fetch_update(
						Ordering::SeqCst,
						Ordering::SeqCst,
						|count| count.checked_sub(1),
					);
				}
			},
			Event::UpdateNodeIdentity(next) => {
				let previous = {
					let mut current = self.node_identity.lock();

					std::mem::replace(&mut *current, next.clone())
				};

				if previous == *next {
					return;
				}
				if let Some(previous) = previous
					&& let Some(slot) = self.slots.lock().get(&previous).cloned()
				{
					slot.used_by_node.store(false, Ordering::SeqCst);
					slot.nudge();
				}
				if let Some(next) = next {
					self.ensure_slot(next, true);
				}
			},
			Event::UpdateIdentity(reference) => {
				if let Some(slot) = self.slots.lock().get(reference) {
					slot.deleted.store(false, Ordering::SeqCst);
					slot.nudge();
				}
			},
			Event::DeleteIdentity(reference) => {
				if let Some(slot) = self.slots.lock().get(reference) {
					slot.deleted.store(true, Ordering::SeqCst);
					slot.nudge();
				}
			},
		}
	}

	async fn build_tokens(&self, reference: &IdentityRef) -> Result<TokenBundle> {
		token::build_bundle(&*self.inventory, &*self.issuer, &self.credentials, &self.ctx, reference)
			.await
	}
}
#[async_trait]
impl TokenSource for TokenCache {
	async fn tokens(&self, reference: &IdentityRef) -> Result<Arc<TokenBundle>> {
		TokenCache::tokens(self, reference).await
	}

	async fn identity_token(
		&self,
		reference: &IdentityRef,
		audience: &str,
	) -> Result<IdentityToken> {
		TokenCache::identity_token(self, reference, audience).await
	}

	async fn scoped_access_token(
		&self,
		reference: &IdentityRef,
		scopes: &[String],
	) -> Result<AccessToken> {
		TokenCache::scoped_access_token(self, reference, scopes).await
	}
}

async fn refresh_loop(shared: Arc<Shared>, slot: Arc<Slot>, mut rx: mpsc::Receiver<SlotRequest>) {
	let mut retries = 0_u32;
	let mut first_pass = true;
	let mut pending: Vec<oneshot::Sender<SlotOutcome>> = Vec::new();

	loop {
		// Demand-created slots get one fetch before the removal check so the
		// first waiter is served rather than turned away.
		if !first_pass && slot.removable() {
			finish(&shared, &slot, &mut rx, pending);

			return;
		}

		first_pass = false;

		let permit = tokio::select! {
			permit = shared.semaphore.clone().acquire_owned() => match permit {
				Ok(permit) => permit,
				Err(_) => return,
			},
			_ = shared.ctx.cancelled() => return,
		};
		let started = Instant::now();
		let outcome = shared.build_tokens(&slot.reference).await;

		drop(permit);

		if slot.removable() {
			finish(&shared, &slot, &mut rx, pending);

			return;
		}

		let (sleep_for, reply) = match outcome {
			Ok(bundle) => {
				let bundle = Arc::new(bundle);

				retries = 0;
				*slot.current.lock() = Some(bundle.clone());
				metrics::record_token_refresh(&slot.reference, "success", started.elapsed());

				let ttl = bundle.time_until_expiration().saturating_sub(REFRESH_SAFETY_MARGIN);

				(ttl, Ok(bundle))
			},
			Err(err @ Error::InvalidAnnotation { .. }) => {
				metrics::record_token_refresh(
					&slot.reference,
					"invalid_annotation",
					started.elapsed(),
				);
				tracing::warn!(
					identity = %slot.reference,
					error = %err,
					"parking refresh until the identity changes"
				);

				(PARKED, Err(Arc::new(err)))
			},
			Err(err) => {
				let delay = Duration::from_secs(1 << retries.min(MAX_ERROR_RETRIES));

				retries = retries.saturating_add(1);
				metrics::record_token_refresh(&slot.reference, "error", started.elapsed());
				tracing::warn!(
					identity = %slot.reference,
					error = %err,
					?delay,
					"token refresh failed"
				);

				(delay, Err(Arc::new(err)))
			},
		};

		drain_requests(&mut rx, &mut pending);

		for responder in pending.drain(..) {
			let _ = responder.send(reply.clone());
		}

		let timer = time::sleep(sleep_for);

		tokio::pin!(timer);
		tokio::select! {
			_ = &mut timer => {},
			message = rx.recv() => {
				// A queued waiter is carried into the next iteration and
				// answered once the fetch completes; a `None` nudge just
				// re-evaluates the slot.
				if let Some(Some(responder)) = message {
					pending.push(responder);
				}
			},
			_ = shared.ctx.cancelled() => return,
		}
	}
}

fn drain_requests(
	rx: &mut mpsc::Receiver<SlotRequest>,
	pending: &mut Vec<oneshot::Sender<SlotOutcome>>,
) {
	while let Ok(message) = rx.try_recv() {
		if let Some(responder) = message {
			pending.push(responder);
		}
	}
}

fn finish(
	shared: &Shared,
	slot: &Arc<Slot>,
	rx: &mut mpsc::Receiver<SlotRequest>,
	mut pending: Vec<oneshot::Sender<SlotOutcome>>,
) {
	shared.remove_slot(slot);
	drain_requests(rx, &mut pending);

	let err = Arc::new(Error::Cache(format!("Identity {} left the cache.", slot.reference)));

	for responder in pending {
		let _ = responder.send(Err(err.clone()));
	}

	tracing::debug!(identity = %slot.reference, "refresh worker exited");
}

fn spawn_sweeper(shared: Arc<Shared>) {
	tokio::spawn(async move {
		let mut interval = time::interval(SWEEP_INTERVAL);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					shared.identity_tokens.lock().retain(|_, token| !token.expires.is_expired());
					shared
						.scoped_access_tokens
						.lock()
						.retain(|_, token| !token.expires.is_expired());
				},
				_ = shared.ctx.cancelled() => return,
			}
		}
	});
}

#[cfg(test)]
mod tests {
	// std
	use std::net::IpAddr;
	// crates.io
	use async_trait::async_trait;
	// self
	use super::*;
	use crate::{
		federate::ProviderName,
		inventory::{Identity, Node, Workload},
		token::assertion::{Assertion, encode_test_assertion},
	};

	struct EmptyInventory;

	#[async_trait]
	impl Inventory for EmptyInventory {
		async fn workload_by_ip(&self, ip: IpAddr) -> Result<Workload> {
			Err(Error::NoMatch { ip })
		}

		async fn identity(&self, reference: &IdentityRef) -> Result<Identity> {
			Err(Error::Platform(format!("Identity {reference} is not present in the cluster.")))
		}

		async fn node(&self) -> Result<Node> {
			Err(Error::Platform("The local node object is not available.".into()))
		}

		async fn add_listener(&self, _: Listener) {}
	}

	struct StaticIssuer;

	#[async_trait]
	impl AssertionIssuer for StaticIssuer {
		async fn issue(&self, reference: &IdentityRef, audience: &str) -> Result<Assertion> {
			Assertion::parse(encode_test_assertion(
				&format!("system:serviceaccount:{}:{}", reference.namespace, reference.name),
				audience,
				600,
			))
		}
	}

	fn test_cache() -> TokenCache {
		let provider: ProviderName =
			"projects/1234567890/locations/global/workloadIdentityPools/pool/providers/prov"
				.parse()
				.unwrap();
		let credentials =
			FederatedCredentials::with_client(provider, reqwest::Client::new());

		TokenCache::new(
			Arc::new(EmptyInventory),
			Arc::new(StaticIssuer),
			credentials,
			TokenCacheOptions::default(),
			CancellationToken::new(),
		)
	}

	#[tokio::test]
	async fn workload_events_drive_slot_bookkeeping() {
		let cache = test_cache();
		let listener = cache.listener();
		let reference = IdentityRef::new("prod", "api");

		listener(&Event::AddWorkload(reference.clone()));
		listener(&Event::AddWorkload(reference.clone()));

		assert_eq!(cache.slot_state(&reference), Some((2, false, false)));

		listener(&Event::DeleteWorkload(reference.clone()));
		listener(&Event::DeleteWorkload(reference.clone()));
		// Floor at zero even if deletes outnumber adds.
		listener(&Event::DeleteWorkload(reference.clone()));

		assert_eq!(cache.slot_state(&reference), Some((0, false, false)));
	}

	#[tokio::test]
	async fn node_identity_moves_between_slots() {
		let cache = test_cache();
		let listener = cache.listener();
		let first = IdentityRef::new("obs", "telemetry");
		let second = IdentityRef::new("obs", "collector");

		listener(&Event::UpdateNodeIdentity(Some(first.clone())));

		assert_eq!(cache.slot_state(&first), Some((0, true, false)));

		listener(&Event::UpdateNodeIdentity(Some(second.clone())));

		assert_eq!(cache.slot_state(&first), Some((0, false, false)));
		assert_eq!(cache.slot_state(&second), Some((0, true, false)));
	}

	#[tokio::test]
	async fn identity_deletion_flags_the_slot_until_an_update() {
		let cache = test_cache();
		let listener = cache.listener();
		let reference = IdentityRef::new("prod", "api");

		listener(&Event::AddWorkload(reference.clone()));
		listener(&Event::DeleteIdentity(reference.clone()));

		assert_eq!(cache.slot_state(&reference), Some((1, false, true)));

		listener(&Event::UpdateIdentity(reference.clone()));

		assert_eq!(cache.slot_state(&reference), Some((1, false, false)));
	}
}
