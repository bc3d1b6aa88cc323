//! Shared fixtures for the integration tests.

// std
use std::{collections::BTreeMap, sync::Arc};
// crates.io
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{TimeDelta, Utc};
use serde_json::json;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path, path_regex},
};
// self
use metadata_emulator::{
	IdentityRef, Result,
	federate::{FederatedCredentials, ProviderName, SERVICE_ACCOUNT_EMAIL_ANNOTATION},
	inventory::{CacheOptions, Identity, InventoryCache, Node, Workload},
	retry::{Jitter, RetryPolicy},
	token::{AssertionIssuer, assertion::Assertion},
};

/// Provider used across the integration tests.
pub const PROVIDER: &str =
	"projects/1234567890/locations/global/workloadIdentityPools/cluster-pool/providers/cluster-provider";
/// Impersonation email carried by annotated test identities.
pub const EMAIL: &str = "svc@proj.iam.gserviceaccount.com";

/// Compact JWT with the given claims and an unverifiable signature.
pub fn encode_jwt(claims: serde_json::Value) -> String {
	let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","kid":"test"}"#);
	let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
	let signature = URL_SAFE_NO_PAD.encode("signature");

	format!("{header}.{payload}.{signature}")
}

/// Issues unsigned assertions without touching any platform API.
pub struct StaticIssuer;

#[async_trait]
impl AssertionIssuer for StaticIssuer {
	async fn issue(&self, reference: &IdentityRef, audience: &str) -> Result<Assertion> {
		let now = Utc::now().timestamp();

		Assertion::parse(encode_jwt(json!({
			"sub": format!("system:serviceaccount:{}:{}", reference.namespace, reference.name),
			"aud": audience,
			"iat": now,
			"exp": now + 600,
		})))
	}
}

/// Mount STS, impersonation, and identity-token mocks on `server`.
pub async fn mock_google(server: &MockServer) {
	Mock::given(method("POST"))
		.and(path("/v1/token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"access_token": "federated-token",
			"issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
			"token_type": "Bearer",
			"expires_in": 3600,
		})))
		.mount(server)
		.await;
	Mock::given(method("POST"))
		.and(path_regex(r"^/v1/projects/-/serviceAccounts/.+:generateAccessToken$"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"accessToken": "impersonated-token",
			"expireTime": (Utc::now() + TimeDelta::hours(1)).to_rfc3339(),
		})))
		.mount(server)
		.await;
	Mock::given(method("POST"))
		.and(path_regex(r"^/v1/projects/-/serviceAccounts/.+:generateIdToken$"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"token": encode_jwt(json!({
				"aud": "https://example.com",
				"email": EMAIL,
				"exp": Utc::now().timestamp() + 3600,
			})),
		})))
		.mount(server)
		.await;
}

/// Federated credentials pointed at the mock server.
pub fn credentials_for(server: &MockServer) -> FederatedCredentials {
	let provider: ProviderName = PROVIDER.parse().expect("valid provider literal");
	let base = server.uri().parse().expect("mock server URI");

	FederatedCredentials::with_client(provider, reqwest::Client::new())
		.with_endpoints(base, server.uri().parse().expect("mock server URI"))
}

/// Millisecond-scale retry policy so failure paths stay fast.
pub fn fast_policy() -> RetryPolicy {
	RetryPolicy {
		max_attempts: 3,
		initial_delay: std::time::Duration::from_millis(1),
		max_delay: std::time::Duration::from_millis(2),
		jitter: Jitter::None,
	}
}

/// Workload record for the tests' fixed pod.
pub fn workload(ip: &str) -> Workload {
	Workload {
		namespace: "prod".into(),
		name: "api-0".into(),
		identity: IdentityRef::new("prod", "api"),
		pod_ip: ip.parse().expect("test IP literal"),
		host_network: false,
	}
}

/// Identity object, optionally annotated for impersonation.
pub fn identity(email: Option<&str>) -> Identity {
	let mut annotations = BTreeMap::new();

	if let Some(email) = email {
		annotations.insert(SERVICE_ACCOUNT_EMAIL_ANNOTATION.to_owned(), email.to_owned());
	}

	Identity { reference: IdentityRef::new("prod", "api"), annotations }
}

/// Node record with the fallback identity annotations set.
pub fn annotated_node(internal_ip: &str) -> Node {
	use metadata_emulator::inventory::types::{
		NODE_SERVICE_ACCOUNT_NAME_KEY, NODE_SERVICE_ACCOUNT_NAMESPACE_KEY,
	};

	let mut annotations = BTreeMap::new();

	annotations.insert(NODE_SERVICE_ACCOUNT_NAME_KEY.to_owned(), "telemetry".to_owned());
	annotations.insert(NODE_SERVICE_ACCOUNT_NAMESPACE_KEY.to_owned(), "obs".to_owned());

	Node {
		name: "worker-7".into(),
		internal_ip: Some(internal_ip.parse().expect("test IP literal")),
		annotations,
		labels: BTreeMap::new(),
	}
}

/// Empty inventory cache without fallback readers.
pub fn empty_inventory() -> Arc<InventoryCache> {
	Arc::new(InventoryCache::new(None, CacheOptions::default()))
}
