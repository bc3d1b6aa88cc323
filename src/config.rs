//! Process configuration: flags, required environment, and tracing setup.

// std
use std::{net::Ipv4Addr, path::PathBuf};
// crates.io
use clap::Parser;
use tracing_subscriber::EnvFilter;
// self
use crate::{
	_prelude::*,
	federate::ProviderName,
	intercept::EbpfSettings,
	inventory::CacheOptions,
	token::TokenCacheOptions,
};

/// Command-line and environment configuration of the emulator process.
#[derive(Clone, Debug, Parser)]
#[command(name = "metadata-emulator", version, about)]
pub struct Config {
	/// Metadata listener port; ignored in Loopback mode, which always binds
	/// 169.254.169.254:80.
	#[arg(long, default_value_t = 8080)]
	pub server_port: u16,
	/// Internal listener port for /healthz, /readyz, and /metrics.
	#[arg(long, default_value_t = 8081)]
	pub health_port: u16,
	/// Fully-qualified workload identity provider resource name.
	#[arg(long)]
	pub workload_identity_provider: ProviderName,
	/// Project id served at project/project-id; defaults to the provider's
	/// numeric project.
	#[arg(long)]
	pub project_id: Option<String>,
	/// Identity this process keeps warm for its own impersonated tokens.
	#[arg(long)]
	pub service_account_name: Option<String>,
	/// Namespace of the process identity.
	#[arg(long)]
	pub service_account_namespace: Option<String>,

	/// Watch pods on this node.
	#[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
	pub watch_pods: bool,
	/// Pod informer re-list cadence.
	#[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
	pub watch_pods_resync_period: Duration,
	/// Disable the direct platform read on pod cache misses.
	#[arg(long, default_value_t = false)]
	pub watch_pods_disable_fallback: bool,
	/// Watch the local node object.
	#[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
	pub watch_node: bool,
	/// Node informer re-list cadence.
	#[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
	pub watch_node_resync_period: Duration,
	/// Disable the direct platform read on node cache misses.
	#[arg(long, default_value_t = false)]
	pub watch_node_disable_fallback: bool,
	/// Watch cluster service accounts.
	#[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
	pub watch_service_accounts: bool,
	/// Service-account informer re-list cadence.
	#[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
	pub watch_service_accounts_resync_period: Duration,
	/// Disable the direct platform read on service-account cache misses.
	#[arg(long, default_value_t = false)]
	pub watch_service_accounts_disable_fallback: bool,

	/// Keep tokens warm per identity; disable to honor revocations
	/// immediately at the cost of per-request exchanges.
	#[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
	pub cache_tokens: bool,
	/// Bound on concurrent outbound token exchanges.
	#[arg(long, default_value_t = 10)]
	pub cache_tokens_concurrency: usize,

	/// Compiled connect4 object installed in eBPF routing mode.
	#[arg(long, default_value = "/opt/metadata-emulator/connect4.o")]
	pub ebpf_object: PathBuf,
	/// bpffs directory for program and map pins.
	#[arg(long, default_value = "/sys/fs/bpf/metadata-emulator")]
	pub ebpf_pin_dir: PathBuf,
	/// Root control group the connect4 program attaches to.
	#[arg(long, default_value = "/sys/fs/cgroup")]
	pub cgroup_path: PathBuf,
	/// Turn on the connect4 program's trace logging.
	#[arg(long, default_value_t = false)]
	pub ebpf_debug: bool,

	/// Grace given to in-flight requests during shutdown.
	#[arg(long, value_parser = humantime::parse_duration, default_value = "20s")]
	pub shutdown_grace_period: Duration,
	/// Log filter directive, e.g. `info` or `metadata_emulator=debug`.
	#[arg(long, default_value = "info")]
	pub log_level: String,

	/// Local node identifier.
	#[arg(long, env = "NODE_NAME")]
	pub node_name: String,
	/// This process's IPv4 address, the rewrite target in eBPF mode.
	#[arg(long, env = "POD_IP")]
	pub pod_ip: Ipv4Addr,
}
impl Config {
	/// Install the global tracing subscriber according to `--log-level`.
	pub fn init_tracing(&self) {
		let filter =
			EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
		let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
	}

	/// The identity this process requests its own impersonated tokens as.
	pub fn process_identity(&self) -> Option<IdentityRef> {
		match (&self.service_account_namespace, &self.service_account_name) {
			(Some(namespace), Some(name)) => Some(IdentityRef::new(namespace, name)),
			_ => None,
		}
	}

	/// Fallback toggles derived from the watch flags.
	pub fn cache_options(&self) -> CacheOptions {
		CacheOptions {
			workload_fallback: !self.watch_pods_disable_fallback,
			identity_fallback: !self.watch_service_accounts_disable_fallback,
			node_fallback: !self.watch_node_disable_fallback,
		}
	}

	/// Token cache tuning derived from the flags.
	pub fn token_cache_options(&self) -> TokenCacheOptions {
		TokenCacheOptions { concurrency: self.cache_tokens_concurrency }
	}

	/// eBPF loader settings derived from the flags.
	pub fn ebpf_settings(&self) -> EbpfSettings {
		EbpfSettings {
			object_path: self.ebpf_object.clone(),
			pin_dir: self.ebpf_pin_dir.clone(),
			cgroup_path: self.cgroup_path.clone(),
			debug: self.ebpf_debug,
		}
	}

	/// Project id served to clients.
	pub fn served_project_id(&self) -> String {
		self.project_id
			.clone()
			.unwrap_or_else(|| self.workload_identity_provider.project_number().to_string())
	}
}
