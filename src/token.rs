//! Per-identity token cache with proactive refresh.

pub mod assertion;
pub mod cache;

// crates.io
use async_trait::async_trait;
use chrono::TimeDelta;
// self
use crate::{
	_prelude::*,
	federate::{self, AccessToken, FederatedCredentials, IdentityToken},
	inventory::Inventory,
	retry::{self, Operation},
};
pub use crate::token::{
	assertion::Assertion,
	cache::{TokenCache, TokenCacheOptions},
};

/// Safety margin subtracted from a token's lifetime when scheduling refresh.
pub const REFRESH_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Effective expiration of a credential.
///
/// Both deadlines are tracked so a wall-clock jump can only shorten a token's
/// usable life, never extend it.
#[derive(Clone, Copy, Debug)]
pub struct Expiration {
	/// Monotonic deadline.
	pub monotonic: Instant,
	/// Wall-clock deadline as reported by the issuer.
	pub wall_clock: DateTime<Utc>,
}
impl Expiration {
	/// Expiration `ttl` from now.
	pub fn after(ttl: Duration) -> Self {
		Self {
			monotonic: Instant::now() + ttl,
			wall_clock: Utc::now() + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
		}
	}

	/// Expiration at an issuer-reported wall-clock instant.
	pub fn at(wall_clock: DateTime<Utc>) -> Self {
		let ttl = (wall_clock - Utc::now()).to_std().unwrap_or_default();

		Self { monotonic: Instant::now() + ttl, wall_clock }
	}

	/// Time left under the stricter of the two deadlines; zero once expired.
	pub fn time_until(&self) -> Duration {
		let monotonic = self.monotonic.saturating_duration_since(Instant::now());
		let wall_clock = (self.wall_clock - Utc::now()).to_std().unwrap_or_default();

		monotonic.min(wall_clock)
	}

	/// Whether the credential is past its effective expiration.
	pub fn is_expired(&self) -> bool {
		self.time_until().is_zero()
	}
}

/// Issues signed workload assertions from the platform.
///
/// The returned assertion is audience-bound to the federated provider and is
/// consumed opaquely; only the exchange endpoint verifies its signature.
#[async_trait]
pub trait AssertionIssuer: Send + Sync {
	/// Request a fresh assertion for the identity.
	async fn issue(&self, reference: &IdentityRef, audience: &str) -> Result<Assertion>;
}

/// Most recent successful token material for one identity.
#[derive(Clone, Debug)]
pub struct TokenBundle {
	/// Assertion the tokens were exchanged from.
	pub assertion: Assertion,
	/// Federated pool-principal access token.
	pub direct: AccessToken,
	/// Impersonated access token, when the identity carries an email.
	pub impersonated: Option<AccessToken>,
	/// Impersonation email the bundle was built with.
	pub email: Option<String>,
}
impl TokenBundle {
	/// Token handed to metadata clients: impersonated when available.
	pub fn primary(&self) -> &AccessToken {
		self.impersonated.as_ref().unwrap_or(&self.direct)
	}

	/// Time until the earliest token in the bundle expires.
	pub fn time_until_expiration(&self) -> Duration {
		let direct = self.direct.expires.time_until();

		match &self.impersonated {
			Some(token) => direct.min(token.expires.time_until()),
			None => direct,
		}
	}

	/// Whether any token in the bundle is past its effective expiration.
	pub fn is_expired(&self) -> bool {
		self.time_until_expiration().is_zero()
	}
}

/// Source of workload credentials consumed by the metadata handlers.
///
/// Two implementations exist: [`TokenCache`] keeps bundles warm per identity,
/// while [`DirectTokens`] performs the full exchange on every request for
/// operators who need revocations honored immediately.
#[async_trait]
pub trait TokenSource: Send + Sync {
	/// Access-token bundle for the identity.
	async fn tokens(&self, reference: &IdentityRef) -> Result<Arc<TokenBundle>>;

	/// Impersonated identity token for `(identity, audience)`.
	async fn identity_token(
		&self,
		reference: &IdentityRef,
		audience: &str,
	) -> Result<IdentityToken>;

	/// Access token with a caller-chosen scope set.
	async fn scoped_access_token(
		&self,
		reference: &IdentityRef,
		scopes: &[String],
	) -> Result<AccessToken>;
}

/// Run the full assertion → exchange → impersonation pipeline once.
pub async fn build_bundle(
	inventory: &dyn Inventory,
	issuer: &dyn AssertionIssuer,
	credentials: &FederatedCredentials,
	ctx: &CancellationToken,
	reference: &IdentityRef,
) -> Result<TokenBundle> {
	let identity = retry::run(ctx, Operation::new("identity read"), Error::is_transport, || {
		inventory.identity(reference)
	})
	.await?;
	let email = federate::impersonation_email(&identity)?;
	let audience = credentials.provider().audience();
	let assertion =
		retry::run(ctx, Operation::new("assertion issuance"), Error::is_transport, || {
			issuer.issue(reference, &audience)
		})
		.await?;
	let direct = retry::run(
		ctx,
		Operation::new("sts exchange"),
		federate::upstream_retryable,
		|| credentials.exchange(&assertion.jwt),
	)
	.await?;
	let impersonated = match &email {
		Some(email) => Some(
			retry::run(
				ctx,
				Operation::new("impersonated access token"),
				federate::upstream_retryable,
				|| credentials.impersonate(&direct, email, None),
			)
			.await?,
		),
		None => None,
	};

	Ok(TokenBundle { assertion, direct, impersonated, email })
}

pub(crate) fn require_email(bundle: &TokenBundle, reference: &IdentityRef) -> Result<String> {
	bundle.email.clone().ok_or_else(|| Error::InvalidAnnotation {
		reason: format!(
			"Identity tokens for {reference} require the impersonation email annotation."
		),
	})
}

pub(crate) async fn mint_identity_token(
	credentials: &FederatedCredentials,
	ctx: &CancellationToken,
	bundle: &TokenBundle,
	email: &str,
	audience: &str,
) -> Result<IdentityToken> {
	retry::run(
		ctx,
		Operation::new("identity token mint"),
		federate::upstream_retryable,
		|| credentials.identity_token(&bundle.direct, email, audience),
	)
	.await
}

pub(crate) async fn mint_scoped_access_token(
	credentials: &FederatedCredentials,
	ctx: &CancellationToken,
	bundle: &TokenBundle,
	email: &str,
	scopes: &[String],
) -> Result<AccessToken> {
	retry::run(
		ctx,
		Operation::new("scoped access token mint"),
		federate::upstream_retryable,
		|| credentials.impersonate(&bundle.direct, email, Some(scopes)),
	)
	.await
}

/// Uncached token source; every call performs the full exchange.
pub struct DirectTokens {
	inventory: Arc<dyn Inventory>,
	issuer: Arc<dyn AssertionIssuer>,
	credentials: FederatedCredentials,
	ctx: CancellationToken,
}
impl DirectTokens {
	/// Build a pass-through token source.
	pub fn new(
		inventory: Arc<dyn Inventory>,
		issuer: Arc<dyn AssertionIssuer>,
		credentials: FederatedCredentials,
		ctx: CancellationToken,
	) -> Self {
		Self { inventory, issuer, credentials, ctx }
	}
}
#[async_trait]
impl TokenSource for DirectTokens {
	async fn tokens(&self, reference: &IdentityRef) -> Result<Arc<TokenBundle>> {
		let bundle = build_bundle(
			&*self.inventory,
			&*self.issuer,
			&self.credentials,
			&self.ctx,
			reference,
		)
		.await?;

		Ok(Arc::new(bundle))
	}

	async fn identity_token(
		&self,
		reference: &IdentityRef,
		audience: &str,
	) -> Result<IdentityToken> {
		let bundle = self.tokens(reference).await?;
		let email = require_email(&bundle, reference)?;

		mint_identity_token(&self.credentials, &self.ctx, &bundle, &email, audience).await
	}

	async fn scoped_access_token(
		&self,
		reference: &IdentityRef,
		scopes: &[String],
	) -> Result<AccessToken> {
		let bundle = self.tokens(reference).await?;
		let Some(email) = bundle.email.clone() else {
			return Ok(bundle.primary().clone());
		};

		mint_scoped_access_token(&self.credentials, &self.ctx, &bundle, &email, scopes).await
	}
}
