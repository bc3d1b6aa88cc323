//! Crate-wide error types and `Result` alias.

// std
use std::{net::IpAddr, sync::Arc};
// crates.io
use http::StatusCode;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the metadata emulator.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("No workload found for IP {ip}.")]
	NoMatch { ip: IpAddr },
	#[error("Multiple workloads share IP {ip}; refusing to pick one.")]
	Ambiguous { ip: IpAddr },
	#[error("Caller is not a known workload: {0}")]
	Forbidden(String),
	#[error("{0}")]
	NotFound(String),

	#[error("{desc}: retry budget exhausted: {source}")]
	RetryExhausted { desc: String, #[source] source: Box<Error> },
	#[error("{desc}: canceled")]
	Canceled { desc: String },

	#[error("Upstream API error (HTTP {status}): {body}")]
	Upstream { status: StatusCode, body: String },

	#[error("Invalid service account annotation: {reason}")]
	InvalidAnnotation { reason: String },
	#[error("Assertion error: {0}")]
	Assertion(String),
	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Platform API error: {0}")]
	Platform(String),
	#[error("Interception error: {0}")]
	Intercept(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },

	// One refresh outcome can satisfy several waiters.
	#[error(transparent)]
	Shared(#[from] Arc<Error>),
}
impl Error {
	/// Map the error onto the HTTP status served at the metadata boundary.
	///
	/// Upstream cloud failures keep their original status so callers see the
	/// exact response the cloud API produced.
	pub fn http_status(&self) -> StatusCode {
		match self {
			Self::NoMatch { .. } | Self::Forbidden(_) => StatusCode::FORBIDDEN,
			Self::NotFound(_) => StatusCode::NOT_FOUND,
			Self::Ambiguous { .. } | Self::RetryExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
			Self::Canceled { .. } =>
				StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
			Self::Upstream { status, .. } => *status,
			Self::InvalidAnnotation { .. } | Self::Validation { .. } => StatusCode::BAD_REQUEST,
			Self::Shared(inner) => inner.http_status(),
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Whether the error came from the transport layer rather than a decisive
	/// upstream response.
	pub fn is_transport(&self) -> bool {
		match self {
			Self::Io(_) | Self::Reqwest(_) => true,
			Self::Shared(inner) => inner.is_transport(),
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn boundary_statuses_follow_the_error_kind() {
		let no_match = Error::NoMatch { ip: "10.0.0.9".parse().unwrap() };
		let ambiguous = Error::Ambiguous { ip: "10.0.0.5".parse().unwrap() };
		let exhausted = Error::RetryExhausted {
			desc: "workload lookup".into(),
			source: Box::new(Error::Ambiguous { ip: "10.0.0.5".parse().unwrap() }),
		};
		let canceled = Error::Canceled { desc: "token fetch".into() };
		let upstream =
			Error::Upstream { status: StatusCode::UNAUTHORIZED, body: "denied".into() };

		assert_eq!(no_match.http_status(), StatusCode::FORBIDDEN);
		assert_eq!(ambiguous.http_status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(exhausted.http_status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(canceled.http_status().as_u16(), 499);
		assert_eq!(upstream.http_status(), StatusCode::UNAUTHORIZED);
	}
}
