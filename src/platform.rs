//! In-cluster platform API access behind the inventory seams.
//!
//! Everything here is replaceable in tests: the emulator core only sees the
//! [`Inventory`](crate::inventory::Inventory), `DirectReader`, and
//! [`AssertionIssuer`] traits.

// std
use std::{collections::BTreeMap, net::IpAddr, path::PathBuf};
// crates.io
use async_trait::async_trait;
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;
// self
use crate::{
	_prelude::*,
	inventory::{DirectReader, Identity, InventoryCache, Node, Workload},
	token::{AssertionIssuer, assertion::Assertion},
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const ASSERTION_TTL_SECONDS: u64 = 3600;
const WATCH_TIMEOUT_SECONDS: u64 = 300;
const RELIST_BACKOFF: Duration = Duration::from_secs(5);

/// Connection settings for the platform API server.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
	/// API server base URL.
	pub base_url: Url,
	/// Path of the rotating bearer token file.
	pub token_path: PathBuf,
	/// Path of the cluster CA bundle.
	pub ca_path: PathBuf,
	/// Node whose workloads this emulator serves.
	pub node_name: String,
}
impl PlatformConfig {
	/// Configuration from the standard in-cluster environment.
	pub fn in_cluster(node_name: impl Into<String>) -> Result<Self> {
		let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| Error::Validation {
			field: "KUBERNETES_SERVICE_HOST",
			reason: "Must be set when running in-cluster.".into(),
		})?;
		let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
		let base_url = Url::parse(&format!("https://{host}:{port}"))?;

		Ok(Self {
			base_url,
			token_path: PathBuf::from(format!("{SERVICE_ACCOUNT_DIR}/token")),
			ca_path: PathBuf::from(format!("{SERVICE_ACCOUNT_DIR}/ca.crt")),
			node_name: node_name.into(),
		})
	}
}

/// Thin REST client for the platform API.
#[derive(Clone, Debug)]
pub struct PlatformClient {
	client: Client,
	base_url: Url,
	token_path: PathBuf,
	node_name: String,
}
impl PlatformClient {
	/// Build a client trusting the cluster CA.
	pub fn new(config: PlatformConfig) -> Result<Self> {
		let ca = std::fs::read(&config.ca_path)?;
		let client = Client::builder()
			.user_agent(format!("metadata-emulator/{}", env!("CARGO_PKG_VERSION")))
			.add_root_certificate(Certificate::from_pem(&ca)?)
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self {
			client,
			base_url: config.base_url,
			token_path: config.token_path,
			node_name: config.node_name,
		})
	}

	/// List the non-terminal workloads scheduled on this node.
	pub async fn list_pods(&self) -> Result<Vec<Workload>> {
		let url = self.url("api/v1/pods")?;
		let selector = format!("spec.nodeName={}", self.node_name);
		let list: List<Pod> = self.get_json(url, &[("fieldSelector", selector.as_str())]).await?;

		Ok(list.items.into_iter().filter_map(workload_from_pod).collect())
	}

	/// List every identity in the cluster.
	pub async fn list_identities(&self) -> Result<Vec<Identity>> {
		let url = self.url("api/v1/serviceaccounts")?;
		let list: List<ServiceAccount> = self.get_json(url, &[]).await?;

		Ok(list.items.into_iter().filter_map(identity_from_service_account).collect())
	}

	/// Read the local node object.
	pub async fn get_node(&self) -> Result<Node> {
		let url = self.url(&format!("api/v1/nodes/{}", self.node_name))?;
		let node: NodeObject = self.get_json(url, &[]).await?;

		Ok(node_from_object(node))
	}

	async fn bearer(&self) -> Result<String> {
		// The kubelet rotates the projected token; re-read it per request.
		Ok(tokio::fs::read_to_string(&self.token_path).await?.trim().to_owned())
	}

	fn url(&self, path: &str) -> Result<Url> {
		Ok(self.base_url.join(path)?)
	}

	async fn get_json<T>(&self, url: Url, query: &[(&str, &str)]) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let response = self
			.client
			.get(url)
			.query(query)
			.bearer_auth(self.bearer().await?)
			.send()
			.await?;

		deserialize_checked(response).await
	}

	/// Open a watch stream for pods on this node.
	pub async fn watch_pods(&self, resource_version: &str) -> Result<WatchStream> {
		let selector = format!("spec.nodeName={}", self.node_name);

		self.watch("api/v1/pods", &[("fieldSelector", selector.as_str())], resource_version)
			.await
	}

	/// Open a watch stream for the local node object.
	pub async fn watch_node(&self, resource_version: &str) -> Result<WatchStream> {
		let selector = format!("metadata.name={}", self.node_name);

		self.watch("api/v1/nodes", &[("fieldSelector", selector.as_str())], resource_version)
			.await
	}

	/// Open a watch stream for cluster identities.
	pub async fn watch_identities(&self, resource_version: &str) -> Result<WatchStream> {
		self.watch("api/v1/serviceaccounts", &[], resource_version).await
	}

	async fn watch(
		&self,
		path: &str,
		query: &[(&str, &str)],
		resource_version: &str,
	) -> Result<WatchStream> {
		let timeout = WATCH_TIMEOUT_SECONDS.to_string();
		let response = self
			.client
			.get(self.url(path)?)
			.query(query)
			.query(&[
				("watch", "true"),
				("allowWatchBookmarks", "false"),
				("resourceVersion", resource_version),
				("timeoutSeconds", timeout.as_str()),
			])
			.bearer_auth(self.bearer().await?)
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();

			return Err(Error::Platform(format!("Watch on {path} failed ({status}): {body}")));
		}

		Ok(WatchStream { response, buffer: Vec::new() })
	}

	/// Most recent resource version of a listed collection, for watch resume.
	pub async fn list_resource_version(&self, path: &str, query: &[(&str, &str)]) -> Result<String> {
		let url = self.url(path)?;
		let list: ListMeta = self.get_json(url, query).await?;

		Ok(list.metadata.resource_version.unwrap_or_default())
	}
}
#[async_trait]
impl DirectReader for PlatformClient {
	async fn workloads_by_ip(&self, ip: IpAddr) -> Result<Vec<Workload>> {
		let url = self.url("api/v1/pods")?;
		let selector = format!("spec.nodeName={},status.podIP={ip}", self.node_name);
		let list: List<Pod> = self.get_json(url, &[("fieldSelector", selector.as_str())]).await?;

		Ok(list.items.into_iter().filter_map(workload_from_pod).collect())
	}

	async fn read_identity(&self, reference: &IdentityRef) -> Result<Option<Identity>> {
		let url = self.url(&format!(
			"api/v1/namespaces/{}/serviceaccounts/{}",
			reference.namespace, reference.name
		))?;
		let response = self.client.get(url).bearer_auth(self.bearer().await?).send().await?;

		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}

		let object: ServiceAccount = deserialize_checked(response).await?;

		Ok(identity_from_service_account(object))
	}

	async fn read_node(&self) -> Result<Option<Node>> {
		let url = self.url(&format!("api/v1/nodes/{}", self.node_name))?;
		let response = self.client.get(url).bearer_auth(self.bearer().await?).send().await?;

		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}

		let object: NodeObject = deserialize_checked(response).await?;

		Ok(Some(node_from_object(object)))
	}
}
#[async_trait]
impl AssertionIssuer for PlatformClient {
	async fn issue(&self, reference: &IdentityRef, audience: &str) -> Result<Assertion> {
		let url = self.url(&format!(
			"api/v1/namespaces/{}/serviceaccounts/{}/token",
			reference.namespace, reference.name
		))?;
		let request = TokenRequest {
			api_version: "authentication.k8s.io/v1",
			kind: "TokenRequest",
			spec: TokenRequestSpec {
				audiences: vec![audience.to_owned()],
				expiration_seconds: ASSERTION_TTL_SECONDS,
			},
		};
		let response = self
			.client
			.post(url)
			.bearer_auth(self.bearer().await?)
			.json(&request)
			.send()
			.await?;
		let issued: IssuedToken = deserialize_checked(response).await?;

		Assertion::parse(issued.status.token)
	}
}

/// Chunked line reader over a platform watch response.
pub struct WatchStream {
	response: Response,
	buffer: Vec<u8>,
}
impl WatchStream {
	/// Next watch event, `None` once the server closes the stream.
	pub async fn next_event<T>(&mut self) -> Result<Option<WatchEvent<T>>>
	where
		T: DeserializeOwned,
	{
		loop {
			if let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
				let line: Vec<u8> = self.buffer.drain(..=position).collect();
				let line = &line[..line.len() - 1];

				if line.is_empty() {
					continue;
				}

				return Ok(Some(serde_json::from_slice(line)?));
			}

			match self.response.chunk().await? {
				Some(bytes) => self.buffer.extend_from_slice(&bytes),
				None => return Ok(None),
			}
		}
	}
}

/// One delta from a platform watch stream.
#[derive(Debug, Deserialize)]
pub struct WatchEvent<T> {
	/// `ADDED`, `MODIFIED`, `DELETED`, or `ERROR`.
	#[serde(rename = "type")]
	pub kind: String,
	/// The object the delta applies to.
	pub object: T,
}

/// Informer resync and fallback settings.
#[derive(Clone, Copy, Debug)]
pub struct InformerOptions {
	/// Full re-list cadence.
	pub resync: Duration,
}

/// Run the pod informer until the context is canceled.
pub async fn run_pod_informer(
	client: Arc<PlatformClient>,
	cache: Arc<InventoryCache>,
	options: InformerOptions,
	ctx: CancellationToken,
) {
	run_informer(&ctx, options, || async {
		let workloads = client.list_pods().await?;
		let selector = format!("spec.nodeName={}", client.node_name);
		let version = client
			.list_resource_version("api/v1/pods", &[("fieldSelector", selector.as_str())])
			.await?;

		cache.sync_workloads(workloads).await;

		let mut stream = client.watch_pods(&version).await?;

		while let Some(event) = stream.next_event::<Pod>().await? {
			match (event.kind.as_str(), workload_from_pod(event.object)) {
				("ADDED" | "MODIFIED", Some(workload)) => cache.apply_workload(workload).await,
				("DELETED", Some(workload)) =>
					cache.remove_workload(&workload.namespace, &workload.name).await,
				_ => {},
			}
		}

		Ok(())
	})
	.await;
}

/// Run the node informer until the context is canceled.
pub async fn run_node_informer(
	client: Arc<PlatformClient>,
	cache: Arc<InventoryCache>,
	options: InformerOptions,
	ctx: CancellationToken,
) {
	run_informer(&ctx, options, || async {
		let node = client.get_node().await?;
		let selector = format!("metadata.name={}", client.node_name);
		let version = client
			.list_resource_version("api/v1/nodes", &[("fieldSelector", selector.as_str())])
			.await?;

		cache.apply_node(node).await;

		let mut stream = client.watch_node(&version).await?;

		while let Some(event) = stream.next_event::<NodeObject>().await? {
			if matches!(event.kind.as_str(), "ADDED" | "MODIFIED") {
				cache.apply_node(node_from_object(event.object)).await;
			}
		}

		Ok(())
	})
	.await;
}

/// Run the cluster identity informer until the context is canceled.
pub async fn run_identity_informer(
	client: Arc<PlatformClient>,
	cache: Arc<InventoryCache>,
	options: InformerOptions,
	ctx: CancellationToken,
) {
	run_informer(&ctx, options, || async {
		let identities = client.list_identities().await?;
		let version = client.list_resource_version("api/v1/serviceaccounts", &[]).await?;

		cache.sync_identities(identities).await;

		let mut stream = client.watch_identities(&version).await?;

		while let Some(event) = stream.next_event::<ServiceAccount>().await? {
			match (event.kind.as_str(), identity_from_service_account(event.object)) {
				("ADDED" | "MODIFIED", Some(identity)) => cache.apply_identity(identity).await,
				("DELETED", Some(identity)) => cache.remove_identity(&identity.reference).await,
				_ => {},
			}
		}

		Ok(())
	})
	.await;
}

// List, watch, re-list on resync; back off briefly after failures so a flapping
// API server is not hammered.
async fn run_informer<F, Fut>(ctx: &CancellationToken, options: InformerOptions, mut cycle: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<()>>,
{
	while !ctx.is_cancelled() {
		let deadline = tokio::time::sleep(options.resync);

		tokio::pin!(deadline);
		tokio::select! {
			outcome = cycle() => {
				if let Err(err) = outcome {
					tracing::warn!(error = %err, "informer cycle failed");

					tokio::select! {
						_ = tokio::time::sleep(RELIST_BACKOFF) => {},
						_ = ctx.cancelled() => return,
					}
				}
			},
			_ = &mut deadline => {},
			_ = ctx.cancelled() => return,
		}
	}
}

fn workload_from_pod(pod: Pod) -> Option<Workload> {
	let namespace = pod.metadata.namespace?;
	let pod_ip: IpAddr = pod.status.pod_ip?.parse().ok()?;

	Some(Workload {
		identity: IdentityRef::new(
			namespace.clone(),
			pod.spec.service_account_name.unwrap_or_else(|| "default".into()),
		),
		namespace,
		name: pod.metadata.name,
		pod_ip,
		host_network: pod.spec.host_network,
	})
}

fn identity_from_service_account(object: ServiceAccount) -> Option<Identity> {
	let namespace = object.metadata.namespace?;

	Some(Identity {
		reference: IdentityRef::new(namespace, object.metadata.name),
		annotations: object.metadata.annotations,
	})
}

fn node_from_object(object: NodeObject) -> Node {
	let internal_ip = object
		.status
		.addresses
		.iter()
		.find(|address| address.kind == "InternalIP")
		.and_then(|address| address.address.parse().ok());

	Node {
		name: object.metadata.name,
		internal_ip,
		annotations: object.metadata.annotations,
		labels: object.metadata.labels,
	}
}

async fn deserialize_checked<T>(response: Response) -> Result<T>
where
	T: DeserializeOwned,
{
	let status = response.status();

	if !status.is_success() {
		let body = response.text().await.unwrap_or_default();

		return Err(Error::Platform(format!("Platform API returned {status}: {body}")));
	}

	Ok(response.json().await?)
}

#[derive(Debug, Deserialize)]
struct List<T> {
	#[serde(default)]
	items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ListMeta {
	metadata: CollectionMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionMeta {
	resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
	name: String,
	#[serde(default)]
	namespace: Option<String>,
	#[serde(default)]
	annotations: BTreeMap<String, String>,
	#[serde(default)]
	labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct Pod {
	metadata: ObjectMeta,
	#[serde(default)]
	spec: PodSpec,
	#[serde(default)]
	status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
	#[serde(default)]
	service_account_name: Option<String>,
	#[serde(default)]
	host_network: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
	#[serde(default)]
	pod_ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceAccount {
	metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct NodeObject {
	metadata: ObjectMeta,
	#[serde(default)]
	status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
	#[serde(default)]
	addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
	#[serde(rename = "type")]
	kind: String,
	address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
	api_version: &'static str,
	kind: &'static str,
	spec: TokenRequestSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequestSpec {
	audiences: Vec<String>,
	expiration_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct IssuedToken {
	status: TokenRequestStatus,
}

#[derive(Debug, Deserialize)]
struct TokenRequestStatus {
	token: String,
}
