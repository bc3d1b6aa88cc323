//! Native-compatible metadata endpoints over the authenticator and token cache.

// crates.io
use serde_json::json;
// self
use crate::{
	_prelude::*,
	authn::Authenticator,
	federate::{self, DEFAULT_SCOPES, ProviderName},
	http::router::{Payload, RequestContext, Router, handler, lister},
	inventory::Inventory,
	token::TokenSource,
};

/// Shared dependencies behind the metadata endpoints.
pub struct MetadataService {
	/// Source-IP authenticator.
	pub authn: Authenticator,
	/// Cached or pass-through token source.
	pub tokens: Arc<dyn TokenSource>,
	/// Workload inventory, used for identity annotation lookups.
	pub inventory: Arc<dyn Inventory>,
	/// Federated provider this emulator exchanges against.
	pub provider: ProviderName,
	/// Project id served at `project/project-id`.
	pub project_id: String,
	/// Node name served at `instance/name`.
	pub node_name: String,
}
impl MetadataService {
	async fn caller(&self, ctx: &RequestContext) -> Result<IdentityRef> {
		self.authn.identify(ctx.peer).await
	}

	async fn caller_email(&self, ctx: &RequestContext) -> Result<Option<String>> {
		let reference = self.caller(ctx).await?;
		let identity = self.inventory.identity(&reference).await?;

		federate::impersonation_email(&identity)
	}

	fn served_email(&self, email: Option<String>) -> String {
		email.unwrap_or_else(|| self.provider.pool_default_email(&self.project_id))
	}
}

/// Build the metadata route table on top of `service`.
pub fn build_router(service: Arc<MetadataService>) -> Router {
	let mut router = Router::new();

	{
		let service = service.clone();

		router.route(
			"/computeMetadata/v1/instance/name",
			handler(move |_| {
				let name = service.node_name.clone();

				async move { Ok(Payload::Text(name)) }
			}),
		);
	}
	{
		let service = service.clone();

		router.route(
			"/computeMetadata/v1/project/project-id",
			handler(move |_| {
				let project_id = service.project_id.clone();

				async move { Ok(Payload::Text(project_id)) }
			}),
		);
	}
	{
		let service = service.clone();

		router.route(
			"/computeMetadata/v1/project/numeric-project-id",
			handler(move |_| {
				let number = service.provider.project_number().to_string();

				async move { Ok(Payload::Text(number)) }
			}),
		);
	}
	{
		let service = service.clone();

		router.lister(
			"/computeMetadata/v1/instance/service-accounts",
			lister(move |ctx| {
				let service = service.clone();

				async move {
					let mut entries = vec!["default".to_owned()];

					if let Some(email) = service.caller_email(&ctx).await? {
						entries.push(email);
					}

					Ok(entries)
				}
			}),
		);
	}

	router.route(
		"/computeMetadata/v1/instance/service-accounts/$sa/aliases",
		handler(|_| async { Ok(Payload::Text("default".to_owned())) }),
	);

	{
		let service = service.clone();

		router.route(
			"/computeMetadata/v1/instance/service-accounts/$sa/email",
			handler(move |ctx| {
				let service = service.clone();

				async move {
					let email = service.caller_email(&ctx).await?;

					Ok(Payload::Text(service.served_email(email)))
				}
			}),
		);
	}

	router.route(
		"/computeMetadata/v1/instance/service-accounts/$sa/scopes",
		handler(|_| async {
			Ok(Payload::List(DEFAULT_SCOPES.iter().map(|scope| (*scope).to_owned()).collect()))
		}),
	);

	{
		let service = service.clone();

		router.route_token(
			"/computeMetadata/v1/instance/service-accounts/$sa/token",
			handler(move |ctx| {
				let service = service.clone();

				async move { access_token(&service, ctx).await }
			}),
		);
	}
	{
		let service = service.clone();

		router.route_token(
			"/computeMetadata/v1/instance/service-accounts/$sa/identity",
			handler(move |ctx| {
				let service = service.clone();

				async move { identity_token(&service, ctx).await }
			}),
		);
	}

	router
}

async fn access_token(service: &MetadataService, ctx: RequestContext) -> Result<Payload> {
	let reference = service.caller(&ctx).await?;
	let scopes: Vec<String> = ctx
		.query
		.get("scopes")
		.map(|raw| {
			raw.split(',')
				.filter(|scope| !scope.is_empty())
				.map(str::to_owned)
				.collect()
		})
		.unwrap_or_default();
	let (token, expires) = if scopes.is_empty() {
		let bundle = service.tokens.tokens(&reference).await?;
		let primary = bundle.primary();

		(primary.token.clone(), primary.expires)
	} else {
		let token = service.tokens.scoped_access_token(&reference, &scopes).await?;

		(token.token, token.expires)
	};

	Ok(Payload::Json(json!({
		"access_token": token,
		"expires_in": expires.time_until().as_secs(),
		"token_type": "Bearer",
	})))
}

async fn identity_token(service: &MetadataService, ctx: RequestContext) -> Result<Payload> {
	let audience = ctx.query.get("audience").filter(|audience| !audience.is_empty()).ok_or(
		Error::Validation {
			field: "audience",
			reason: "Query parameter is required and must be non-empty.".into(),
		},
	)?;
	let reference = service.caller(&ctx).await?;
	let token = service.tokens.identity_token(&reference, audience).await?;

	Ok(Payload::Text(token.jwt))
}
