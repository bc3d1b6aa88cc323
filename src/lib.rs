//! Node-local emulator of the GCE metadata server — authenticates workloads by
//! source IP and exchanges workload identity assertions for federated Google
//! Cloud credentials.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod authn;
pub mod config;
pub mod federate;
pub mod http;
pub mod intercept;
pub mod inventory;
pub mod metrics;
pub mod platform;
pub mod retry;
pub mod token;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;
	pub use tokio_util::sync::CancellationToken;

	pub use crate::{Error, Result, inventory::IdentityRef};
}
pub use crate::{
	error::{Error, Result},
	inventory::{IdentityRef, Inventory, Workload},
	token::{TokenCache, TokenSource},
};
