//! Parsing of platform-issued workload assertions.

// crates.io
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
// self
use crate::{_prelude::*, token::Expiration};

const SERVICE_ACCOUNT_SUBJECT_PREFIX: &str = "system:serviceaccount:";

/// Opaque signed assertion plus the claims read from its payload.
///
/// The signature is never verified here; the federated exchange endpoint is
/// the sole consumer that validates it.
#[derive(Clone, Debug)]
pub struct Assertion {
	/// Compact-serialized JWT as issued by the platform.
	pub jwt: String,
	/// Claims parsed from the payload segment.
	pub claims: AssertionClaims,
	/// Effective expiration derived from the `exp` claim.
	pub expires: Expiration,
}
impl Assertion {
	/// Parse a compact JWT without verifying its signature.
	pub fn parse(jwt: impl Into<String>) -> Result<Self> {
		let jwt = jwt.into();
		let mut segments = jwt.split('.');
		let payload = match (segments.next(), segments.next(), segments.next(), segments.next())
		{
			(Some(_), Some(payload), Some(_), None) => payload,
			_ =>
				return Err(Error::Assertion(
					"Assertion must be a compact JWT with three segments.".into(),
				)),
		};
		let decoded = URL_SAFE_NO_PAD.decode(payload).map_err(|err| {
			Error::Assertion(format!("Assertion payload is not base64url: {err}."))
		})?;
		let raw: RawClaims = serde_json::from_slice(&decoded)?;
		let issued_at = DateTime::from_timestamp(raw.iat, 0).ok_or_else(|| {
			Error::Assertion(format!("Assertion iat claim {} is out of range.", raw.iat))
		})?;
		let expires_at = DateTime::from_timestamp(raw.exp, 0).ok_or_else(|| {
			Error::Assertion(format!("Assertion exp claim {} is out of range.", raw.exp))
		})?;
		let claims = AssertionClaims {
			subject: raw.sub,
			audience: raw.aud.into_first(),
			issued_at,
			expires_at,
		};

		Ok(Self { jwt, claims, expires: Expiration::at(expires_at) })
	}

	/// Identity reference encoded in the `system:serviceaccount:` subject.
	pub fn subject_reference(&self) -> Result<IdentityRef> {
		let rest =
			self.claims.subject.strip_prefix(SERVICE_ACCOUNT_SUBJECT_PREFIX).ok_or_else(
				|| {
					Error::Assertion(format!(
						"Assertion subject {:?} is not a service account.",
						self.claims.subject
					))
				},
			)?;

		match rest.split_once(':') {
			Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() =>
				Ok(IdentityRef::new(namespace, name)),
			_ => Err(Error::Assertion(format!(
				"Assertion subject {:?} lacks a namespace/name pair.",
				self.claims.subject
			))),
		}
	}
}

/// Claims carried in a workload assertion payload.
#[derive(Clone, Debug)]
pub struct AssertionClaims {
	/// `system:serviceaccount:{namespace}:{name}`.
	pub subject: String,
	/// Audience the assertion is bound to.
	pub audience: String,
	/// Issuance instant.
	pub issued_at: DateTime<Utc>,
	/// Expiration instant.
	pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
	sub: String,
	#[serde(default)]
	aud: Audience,
	iat: i64,
	exp: i64,
}

// The platform emits either a bare string or a list here.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum Audience {
	#[default]
	Absent,
	One(String),
	Many(Vec<String>),
}
impl Audience {
	fn into_first(self) -> String {
		match self {
			Self::Absent => String::new(),
			Self::One(audience) => audience,
			Self::Many(audiences) => audiences.into_iter().next().unwrap_or_default(),
		}
	}
}

#[cfg(test)]
pub(crate) fn encode_test_assertion(subject: &str, audience: &str, ttl_secs: i64) -> String {
	let now = Utc::now().timestamp();
	let payload = serde_json::json!({
		"sub": subject,
		"aud": audience,
		"iat": now,
		"exp": now + ttl_secs,
	});
	let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","kid":"test"}"#);
	let payload = URL_SAFE_NO_PAD.encode(payload.to_string());

	format!("{header}.{payload}.c2lnbmF0dXJl")
}
