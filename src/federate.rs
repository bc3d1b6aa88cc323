//! Stateless federated token exchange against the cloud identity APIs.

// std
use std::{fmt, str::FromStr};
// crates.io
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;
// self
use crate::{
	_prelude::*,
	inventory::Identity,
	token::Expiration,
};

/// Default security token service endpoint.
pub const STS_ENDPOINT: &str = "https://sts.googleapis.com";
/// Default service-account impersonation endpoint.
pub const IAM_CREDENTIALS_ENDPOINT: &str = "https://iamcredentials.googleapis.com";
/// Identity annotation carrying the impersonation email.
pub const SERVICE_ACCOUNT_EMAIL_ANNOTATION: &str = "iam.gke.io/gcp-service-account";
/// Scopes requested for every exchanged access token.
pub const DEFAULT_SCOPES: [&str; 2] = [
	"https://www.googleapis.com/auth/cloud-platform",
	"https://www.googleapis.com/auth/userinfo.email",
];

const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";
const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
const EMAIL_DOMAIN_SUFFIX: &str = ".iam.gserviceaccount.com";

/// Fully-qualified workload identity provider resource name.
///
/// `projects/{number}/locations/global/workloadIdentityPools/{pool}/providers/{provider}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderName {
	raw: String,
	project_number: u64,
	pool: String,
	provider: String,
}
impl ProviderName {
	/// Numeric project owning the pool.
	pub fn project_number(&self) -> u64 {
		self.project_number
	}

	/// Pool segment of the resource name.
	pub fn pool(&self) -> &str {
		&self.pool
	}

	/// Provider segment of the resource name.
	pub fn provider_id(&self) -> &str {
		&self.provider
	}

	/// STS audience for assertions exchanged against this provider.
	pub fn audience(&self) -> String {
		format!("//iam.googleapis.com/{}", self.raw)
	}

	/// Pseudo-email reported for identities without an impersonation email.
	pub fn pool_default_email(&self, project_id: &str) -> String {
		format!("{}@{project_id}{EMAIL_DOMAIN_SUFFIX}", self.pool)
	}
}
impl FromStr for ProviderName {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		let invalid = |reason: &str| Error::Validation {
			field: "workload_identity_provider",
			reason: reason.into(),
		};
		let parts: Vec<&str> = raw.split('/').collect();
		let [
			"projects",
			number,
			"locations",
			"global",
			"workloadIdentityPools",
			pool,
			"providers",
			provider,
		] = parts.as_slice()
		else {
			return Err(invalid(
				"Expected projects/{number}/locations/global/workloadIdentityPools/{pool}/providers/{provider}.",
			));
		};
		let project_number =
			number.parse::<u64>().map_err(|_| invalid("Project segment must be numeric."))?;

		if pool.is_empty() || provider.is_empty() {
			return Err(invalid("Pool and provider segments must be non-empty."));
		}

		Ok(Self {
			raw: raw.to_owned(),
			project_number,
			pool: (*pool).to_owned(),
			provider: (*provider).to_owned(),
		})
	}
}
impl fmt::Display for ProviderName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.raw)
	}
}

/// Bearer credential usable against cloud resource APIs.
#[derive(Clone, Debug)]
pub struct AccessToken {
	/// Opaque bearer string.
	pub token: String,
	/// Effective expiration of the credential.
	pub expires: Expiration,
}

/// Signed JWT whose claims include audience and email.
#[derive(Clone, Debug)]
pub struct IdentityToken {
	/// Compact-serialized JWT.
	pub jwt: String,
	/// Effective expiration taken from the `exp` claim.
	pub expires: Expiration,
}

/// Extract and validate the impersonation email from an identity object.
///
/// Absence of the annotation is not an error; a present-but-malformed value
/// is, so a typo never silently downgrades an identity to direct tokens.
pub fn impersonation_email(identity: &Identity) -> Result<Option<String>> {
	let Some(email) = identity.annotation(SERVICE_ACCOUNT_EMAIL_ANNOTATION) else {
		return Ok(None);
	};

	validate_service_account_email(email).map_err(|_| Error::InvalidAnnotation {
		reason: format!(
			"Annotation {SERVICE_ACCOUNT_EMAIL_ANNOTATION} of {} is not a service account email: {email:?}.",
			identity.reference
		),
	})?;

	Ok(Some(email.to_owned()))
}

/// Validate `{local}@{project}.iam.gserviceaccount.com` shape.
pub fn validate_service_account_email(email: &str) -> Result<()> {
	let err = || Error::Validation {
		field: "service_account_email",
		reason: format!("Expected {{name}}@{{project}}{EMAIL_DOMAIN_SUFFIX}, got {email:?}."),
	};
	let (local, domain) = email.split_once('@').ok_or_else(err)?;
	let project = domain.strip_suffix(EMAIL_DOMAIN_SUFFIX).ok_or_else(err)?;
	let segment_ok = |segment: &str| {
		!segment.is_empty()
			&& segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
	};

	if segment_ok(local) && segment_ok(project) { Ok(()) } else { Err(err()) }
}

/// Whether an upstream failure is worth retrying: transport faults and 5xx.
pub fn upstream_retryable(err: &Error) -> bool {
	match err {
		Error::Upstream { status, .. } => status.is_server_error(),
		other => other.is_transport(),
	}
}

/// Stateless client for the federated token exchange pipeline.
#[derive(Clone, Debug)]
pub struct FederatedCredentials {
	client: Client,
	provider: ProviderName,
	sts_endpoint: Url,
	iam_endpoint: Url,
}
impl FederatedCredentials {
	/// Build a client against the public Google endpoints.
	pub fn new(provider: ProviderName) -> Result<Self> {
		let client = Client::builder()
			.user_agent(format!("metadata-emulator/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.timeout(Duration::from_secs(10))
			.build()?;

		Ok(Self::with_client(provider, client))
	}

	/// Build against a supplied HTTP client (primarily for tests).
	pub fn with_client(provider: ProviderName, client: Client) -> Self {
		Self {
			client,
			provider,
			sts_endpoint: Url::parse(STS_ENDPOINT).expect("compiled-in endpoint literal"),
			iam_endpoint: Url::parse(IAM_CREDENTIALS_ENDPOINT)
				.expect("compiled-in endpoint literal"),
		}
	}

	/// Point the client at alternative endpoints.
	pub fn with_endpoints(mut self, sts: Url, iam: Url) -> Self {
		self.sts_endpoint = sts;
		self.iam_endpoint = iam;

		self
	}

	/// Provider this client exchanges against.
	pub fn provider(&self) -> &ProviderName {
		&self.provider
	}

	/// Exchange a signed workload assertion for a federated access token.
	#[tracing::instrument(skip(self, assertion), fields(provider = %self.provider))]
	pub async fn exchange(&self, assertion: &str) -> Result<AccessToken> {
		let url = self.sts_endpoint.join("v1/token")?;
		let request = StsExchangeRequest {
			grant_type: GRANT_TYPE_TOKEN_EXCHANGE,
			audience: self.provider.audience(),
			scope: DEFAULT_SCOPES.join(" "),
			requested_token_type: TOKEN_TYPE_ACCESS_TOKEN,
			subject_token: assertion,
			subject_token_type: TOKEN_TYPE_JWT,
		};
		let response: StsExchangeResponse = self.post_json(url, None, &request).await?;

		Ok(AccessToken {
			token: response.access_token,
			expires: Expiration::after(Duration::from_secs(response.expires_in)),
		})
	}

	/// Derive an access token for `email` from a federated token.
	#[tracing::instrument(skip(self, access, scopes), fields(email = %email))]
	pub async fn impersonate(
		&self,
		access: &AccessToken,
		email: &str,
		scopes: Option<&[String]>,
	) -> Result<AccessToken> {
		let url = self
			.iam_endpoint
			.join(&format!("v1/projects/-/serviceAccounts/{email}:generateAccessToken"))?;
		let default_scopes: Vec<String> =
			DEFAULT_SCOPES.iter().map(|scope| (*scope).to_owned()).collect();
		let request = GenerateAccessTokenRequest {
			scope: scopes.map(<[String]>::to_vec).unwrap_or(default_scopes),
		};
		let response: GenerateAccessTokenResponse =
			self.post_json(url, Some(&access.token), &request).await?;

		Ok(AccessToken {
			token: response.access_token,
			expires: Expiration::at(response.expire_time),
		})
	}

	/// Mint an impersonated identity token for `audience`.
	#[tracing::instrument(skip(self, access), fields(email = %email, audience = %audience))]
	pub async fn identity_token(
		&self,
		access: &AccessToken,
		email: &str,
		audience: &str,
	) -> Result<IdentityToken> {
		let url = self
			.iam_endpoint
			.join(&format!("v1/projects/-/serviceAccounts/{email}:generateIdToken"))?;
		let request = GenerateIdTokenRequest { audience, include_email: true };
		let response: GenerateIdTokenResponse =
			self.post_json(url, Some(&access.token), &request).await?;
		let expires_at = jwt_expiration(&response.token)?;

		Ok(IdentityToken { jwt: response.token, expires: Expiration::at(expires_at) })
	}

	async fn post_json<T, R>(&self, url: Url, bearer: Option<&str>, body: &T) -> Result<R>
	where
		T: Serialize + Sync,
		R: DeserializeOwned,
	{
		let mut builder = self.client.post(url).json(body);

		if let Some(token) = bearer {
			builder = builder.bearer_auth(token);
		}

		let response = builder.send().await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();

			return Err(Error::Upstream { status, body });
		}

		Ok(response.json().await?)
	}
}

/// Wall-clock expiration parsed from a compact JWT's `exp` claim.
///
/// The signature is deliberately not verified; the token is consumed only by
/// services that verify it themselves.
pub fn jwt_expiration(jwt: &str) -> Result<DateTime<Utc>> {
	let mut segments = jwt.split('.');
	let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
		(Some(_), Some(payload), Some(_), None) => payload,
		_ => return Err(Error::Assertion("JWT must have exactly three segments.".into())),
	};
	let decoded = URL_SAFE_NO_PAD
		.decode(payload)
		.map_err(|err| Error::Assertion(format!("JWT payload is not base64url: {err}.")))?;
	let claims: ExpClaim = serde_json::from_slice(&decoded)?;

	DateTime::from_timestamp(claims.exp, 0)
		.ok_or_else(|| Error::Assertion(format!("JWT exp claim {} is out of range.", claims.exp)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StsExchangeRequest<'a> {
	grant_type: &'a str,
	audience: String,
	scope: String,
	requested_token_type: &'a str,
	subject_token: &'a str,
	subject_token_type: &'a str,
}

// The exchange response follows RFC 8693 field naming, unlike the request.
#[derive(Debug, Deserialize)]
struct StsExchangeResponse {
	access_token: String,
	expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenRequest {
	scope: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
	access_token: String,
	expire_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateIdTokenRequest<'a> {
	audience: &'a str,
	include_email: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateIdTokenResponse {
	token: String,
}

#[derive(Debug, Deserialize)]
struct ExpClaim {
	exp: i64,
}
