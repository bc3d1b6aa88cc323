//! Integration tests for the token exchange pipeline and cache lifecycle.

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicI32, Ordering},
	},
	time::Duration,
};
// crates.io
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;
// self
use crate::common::{
	EMAIL, StaticIssuer, credentials_for, empty_inventory, identity, mock_google, workload,
};
use metadata_emulator::{
	Error, IdentityRef, Result, TokenCache,
	inventory::{Inventory, InventoryCache},
	token::{AssertionIssuer, TokenCacheOptions, assertion::Assertion},
};

async fn cache_with(
	server: &MockServer,
	issuer: Arc<dyn AssertionIssuer>,
	email: Option<&str>,
) -> (TokenCache, Arc<InventoryCache>, CancellationToken) {
	let inventory = empty_inventory();

	inventory.apply_identity(identity(email)).await;

	let ctx = CancellationToken::new();
	let tokens = TokenCache::new(
		inventory.clone(),
		issuer,
		credentials_for(server),
		TokenCacheOptions::default(),
		ctx.clone(),
	);

	inventory.add_listener(tokens.listener()).await;
	inventory.apply_workload(workload("10.0.0.7")).await;

	(tokens, inventory, ctx)
}

#[tokio::test(flavor = "multi_thread")]
async fn annotated_identities_get_an_impersonated_bundle() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let (tokens, _inventory, _ctx) =
		cache_with(&server, Arc::new(StaticIssuer), Some(EMAIL)).await;
	let reference = IdentityRef::new("prod", "api");
	let bundle = tokens.tokens(&reference).await?;

	assert_eq!(bundle.direct.token, "federated-token");
	assert_eq!(bundle.email.as_deref(), Some(EMAIL));
	assert_eq!(bundle.primary().token, "impersonated-token");
	assert!(!bundle.is_expired());

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unannotated_identities_get_the_direct_token() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let (tokens, _inventory, _ctx) = cache_with(&server, Arc::new(StaticIssuer), None).await;
	let bundle = tokens.tokens(&IdentityRef::new("prod", "api")).await?;

	assert_eq!(bundle.primary().token, "federated-token");
	assert!(bundle.impersonated.is_none());

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn token_fetches_are_single_flight_per_identity() -> Result<()> {
	struct CountingIssuer {
		in_flight: AtomicI32,
		max_in_flight: AtomicI32,
	}

	#[async_trait]
	impl AssertionIssuer for CountingIssuer {
		async fn issue(&self, reference: &IdentityRef, audience: &str) -> Result<Assertion> {
			let entered = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;

			self.max_in_flight.fetch_max(entered, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(50)).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			StaticIssuer.issue(reference, audience).await
		}
	}

	let server = MockServer::start().await;

	mock_google(&server).await;

	let issuer = Arc::new(CountingIssuer {
		in_flight: AtomicI32::new(0),
		max_in_flight: AtomicI32::new(0),
	});
	let (tokens, _inventory, _ctx) = cache_with(&server, issuer.clone(), Some(EMAIL)).await;
	let reference = IdentityRef::new("prod", "api");
	let mut waiters = Vec::new();

	for _ in 0..8 {
		let tokens = tokens.clone();
		let reference = reference.clone();

		waiters.push(tokio::spawn(async move { tokens.tokens(&reference).await }));
	}
	for waiter in waiters {
		waiter.await.expect("waiter task")?;
	}

	assert_eq!(
		issuer.max_in_flight.load(Ordering::SeqCst),
		1,
		"two token fetches for one identity overlapped"
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_tokens_are_cached_per_audience() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let (tokens, _inventory, _ctx) =
		cache_with(&server, Arc::new(StaticIssuer), Some(EMAIL)).await;
	let reference = IdentityRef::new("prod", "api");
	let first = tokens.identity_token(&reference, "https://example.com").await?;
	let second = tokens.identity_token(&reference, "https://example.com").await?;

	assert_eq!(first.jwt, second.jwt);

	let mint_calls = server
		.received_requests()
		.await
		.unwrap_or_default()
		.iter()
		.filter(|request| request.url.path().ends_with(":generateIdToken"))
		.count();

	assert_eq!(mint_calls, 1, "second lookup must come from the derived cache");

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_identities_error_until_they_return() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let (tokens, inventory, _ctx) =
		cache_with(&server, Arc::new(StaticIssuer), Some(EMAIL)).await;
	let reference = IdentityRef::new("prod", "api");

	tokens.tokens(&reference).await?;

	// Deleting the identity flags the slot; its worker exits and removes it.
	inventory.remove_identity(&reference).await;

	let mut removed = false;

	for _ in 0..100 {
		if tokens.size() == 0 {
			removed = true;

			break;
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	assert!(removed, "slot should be removed after the identity deletion");

	let err = tokens.tokens(&reference).await.expect_err("identity is gone");

	assert!(matches!(err, Error::Shared(_) | Error::Platform(_)), "got {err:?}");

	// The identity coming back makes the next request succeed again.
	inventory.apply_identity(identity(Some(EMAIL))).await;

	let bundle = tokens.tokens(&reference).await?;

	assert_eq!(bundle.primary().token, "impersonated-token");

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_annotations_surface_and_park_the_slot() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let (tokens, _inventory, _ctx) =
		cache_with(&server, Arc::new(StaticIssuer), Some("not-an-email")).await;
	let err = tokens
		.tokens(&IdentityRef::new("prod", "api"))
		.await
		.expect_err("annotation is invalid");

	match err {
		Error::Shared(inner) => {
			assert!(matches!(*inner, Error::InvalidAnnotation { .. }), "got {inner:?}")
		},
		other => panic!("expected a shared invalid-annotation error, got {other:?}"),
	}

	Ok(())
}
