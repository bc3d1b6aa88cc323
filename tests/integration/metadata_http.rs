//! End-to-end tests of the HTTP surface over a live listener.

// std
use std::{sync::Arc, time::Duration};
// crates.io
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;
// self
use crate::common::{
	EMAIL, PROVIDER, StaticIssuer, annotated_node, credentials_for, empty_inventory,
	fast_policy, identity, mock_google, workload,
};
use metadata_emulator::{
	Result, TokenCache,
	authn::Authenticator,
	federate::ProviderName,
	http::{
		handlers::{MetadataService, build_router},
		server::serve_metadata,
	},
	inventory::{Inventory, InventoryCache},
	token::TokenCacheOptions,
};

struct Emulator {
	base: String,
	ctx: CancellationToken,
}
impl Emulator {
	async fn start(server: &MockServer, inventory: Arc<InventoryCache>) -> Self {
		let ctx = CancellationToken::new();
		let provider: ProviderName = PROVIDER.parse().expect("valid provider literal");
		let tokens = TokenCache::new(
			inventory.clone(),
			Arc::new(StaticIssuer),
			credentials_for(server),
			TokenCacheOptions::default(),
			ctx.clone(),
		);

		inventory.add_listener(tokens.listener()).await;

		let service = Arc::new(MetadataService {
			authn: Authenticator::new(inventory.clone(), ctx.clone())
				.with_policy(fast_policy()),
			tokens: Arc::new(tokens),
			inventory,
			provider,
			project_id: "my-project".into(),
			node_name: "worker-7".into(),
		});
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("ephemeral port");
		let addr = listener.local_addr().expect("bound address");

		tokio::spawn(serve_metadata(
			listener,
			Arc::new(build_router(service)),
			ctx.clone(),
			Duration::from_secs(1),
		));

		Self { base: format!("http://{addr}"), ctx }
	}

	fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base)
	}
}
impl Drop for Emulator {
	fn drop(&mut self) {
		self.ctx.cancel();
	}
}

fn client() -> reqwest::Client {
	reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.build()
		.expect("client")
}

fn flavored(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
	request.header("Metadata-Flavor", "Google")
}

async fn pod_inventory() -> Arc<InventoryCache> {
	let inventory = empty_inventory();

	inventory.apply_workload(workload("127.0.0.1")).await;
	inventory.apply_identity(identity(Some(EMAIL))).await;

	inventory
}

#[tokio::test(flavor = "multi_thread")]
async fn the_flavor_header_is_required() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let emulator = Emulator::start(&server, pod_inventory().await).await;
	let response =
		client().get(emulator.url("/computeMetadata/v1/instance/name")).send().await?;

	assert_eq!(response.status().as_u16(), 403);
	assert!(
		response
			.text()
			.await?
			.starts_with("Missing required header \"Metadata-Flavor\"")
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn the_instance_name_is_served_with_response_headers() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let emulator = Emulator::start(&server, pod_inventory().await).await;
	let response = flavored(client().get(emulator.url("/computeMetadata/v1/instance/name")))
		.send()
		.await?;

	assert_eq!(response.status().as_u16(), 200);
	assert_eq!(
		response.headers().get("Metadata-Flavor").and_then(|value| value.to_str().ok()),
		Some("Google")
	);
	assert_eq!(
		response.headers().get("Server").and_then(|value| value.to_str().ok()),
		Some("Metadata Server")
	);
	assert_eq!(response.text().await?, "worker-7");

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn the_service_account_directory_lists_and_redirects() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let emulator = Emulator::start(&server, pod_inventory().await).await;
	let listing = flavored(
		client().get(emulator.url("/computeMetadata/v1/instance/service-accounts/")),
	)
	.send()
	.await?;

	assert_eq!(listing.status().as_u16(), 200);
	assert_eq!(listing.text().await?, format!("default/\n{EMAIL}/\n"));

	let redirect = flavored(
		client().get(emulator.url("/computeMetadata/v1/instance/service-accounts")),
	)
	.send()
	.await?;

	assert_eq!(redirect.status().as_u16(), 301);
	assert_eq!(
		redirect.headers().get("Location").and_then(|value| value.to_str().ok()),
		Some("/computeMetadata/v1/instance/service-accounts/")
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn the_token_endpoint_round_trips_as_json() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let emulator = Emulator::start(&server, pod_inventory().await).await;
	let response = flavored(
		client()
			.get(emulator.url("/computeMetadata/v1/instance/service-accounts/default/token")),
	)
	.send()
	.await?;

	assert_eq!(response.status().as_u16(), 200);

	let body: Value = response.json().await?;

	assert_eq!(body["access_token"], "impersonated-token");
	assert_eq!(body["token_type"], "Bearer");

	let expires_in = body["expires_in"].as_u64().expect("expires_in is an integer");

	assert!(expires_in > 0 && expires_in <= 3600);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn the_recursive_render_never_issues_tokens() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let emulator = Emulator::start(&server, pod_inventory().await).await;
	let response = flavored(client().get(
		emulator.url("/computeMetadata/v1/instance/service-accounts/?recursive=true"),
	))
	.send()
	.await?;

	assert_eq!(response.status().as_u16(), 200);

	let body: Value = response.json().await?;

	for (_, entry) in body.as_object().expect("recursive render is an object") {
		assert!(entry.get("token").is_none(), "token leaked into a directory browse");
		assert!(entry.get("email").is_some());
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn node_callers_use_the_annotated_fallback_identity() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let inventory = empty_inventory();

	inventory.apply_node(annotated_node("127.0.0.1")).await;
	inventory
		.apply_identity(metadata_emulator::inventory::Identity {
			reference: metadata_emulator::IdentityRef::new("obs", "telemetry"),
			annotations: Default::default(),
		})
		.await;

	let emulator = Emulator::start(&server, inventory).await;
	let response = flavored(
		client()
			.get(emulator.url("/computeMetadata/v1/instance/service-accounts/default/token")),
	)
	.send()
	.await?;

	assert_eq!(response.status().as_u16(), 200);

	let body: Value = response.json().await?;

	// No impersonation email on the node identity, so the direct federated
	// token is served.
	assert_eq!(body["access_token"], "federated-token");

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_callers_are_forbidden() -> Result<()> {
	let server = MockServer::start().await;

	mock_google(&server).await;

	let inventory = empty_inventory();

	// The node's address differs from the loopback caller, so the fallback
	// must reject it.
	inventory.apply_node(annotated_node("10.0.0.1")).await;

	let emulator = Emulator::start(&server, inventory).await;
	let response = flavored(
		client()
			.get(emulator.url("/computeMetadata/v1/instance/service-accounts/default/token")),
	)
	.send()
	.await?;

	assert_eq!(response.status().as_u16(), 403);

	Ok(())
}
