//! Process supervisor: wiring, startup ordering, and signal-driven shutdown.

// std
use std::{net::SocketAddr, sync::Arc};
// crates.io
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
// self
use metadata_emulator::{
	Result, TokenCache, TokenSource,
	authn::Authenticator,
	config::Config,
	federate::FederatedCredentials,
	http::{
		handlers::{MetadataService, build_router},
		server::{ReadyCheck, serve_health, serve_metadata},
	},
	intercept::{self, LINK_LOCAL_ADDR, LINK_LOCAL_PORT, RoutingMode},
	inventory::{Inventory, InventoryCache},
	metrics,
	platform::{
		InformerOptions, PlatformClient, PlatformConfig, run_identity_informer,
		run_node_informer, run_pod_informer,
	},
	token::{AssertionIssuer, DirectTokens},
};

fn main() {
	let config = Config::parse();

	config.init_tracing();

	let runtime = match tokio::runtime::Runtime::new() {
		Ok(runtime) => runtime,
		Err(err) => {
			eprintln!("failed to start runtime: {err}");
			std::process::exit(1);
		},
	};

	if let Err(err) = runtime.block_on(run(config)) {
		tracing::error!(error = %err, "emulator exited with an error");
		std::process::exit(1);
	}
}

async fn run(config: Config) -> Result<()> {
	metrics::install_default_exporter()?;

	let ctx = CancellationToken::new();

	spawn_signal_handler(ctx.clone());

	let platform = Arc::new(PlatformClient::new(PlatformConfig::in_cluster(&config.node_name)?)?);
	let cache = Arc::new(InventoryCache::new(Some(platform.clone()), config.cache_options()));
	let inventory: Arc<dyn Inventory> = cache.clone();
	let issuer: Arc<dyn AssertionIssuer> = platform.clone();
	let credentials = FederatedCredentials::new(config.workload_identity_provider.clone())?;
	let tokens: Arc<dyn TokenSource> = if config.cache_tokens {
		let token_cache = TokenCache::new(
			inventory.clone(),
			issuer,
			credentials,
			config.token_cache_options(),
			ctx.clone(),
		);

		cache.add_listener(token_cache.listener()).await;

		if let Some(identity) = config.process_identity() {
			token_cache.warm_node_identity(&identity);
		}

		Arc::new(token_cache)
	} else {
		Arc::new(DirectTokens::new(inventory.clone(), issuer, credentials, ctx.clone()))
	};

	spawn_informers(&config, platform, cache.clone(), ctx.clone());

	// The node object steers interception, so read it before binding.
	let node = cache.node().await?;
	let mode = RoutingMode::from_node(&node);
	let guard =
		intercept::install(mode, config.pod_ip, config.server_port, &config.ebpf_settings())
			.await?;
	// Close the interceptor even when serving fails to start.
	let outcome = serve_all(&config, mode, cache, inventory, tokens, ctx).await;

	guard.close().await?;
	tracing::info!("shutdown complete");

	outcome
}

async fn serve_all(
	config: &Config,
	mode: RoutingMode,
	cache: Arc<InventoryCache>,
	inventory: Arc<dyn Inventory>,
	tokens: Arc<dyn TokenSource>,
	ctx: CancellationToken,
) -> Result<()> {
	let bind_addr: SocketAddr = match mode {
		RoutingMode::Loopback => (LINK_LOCAL_ADDR, LINK_LOCAL_PORT).into(),
		_ => ([0, 0, 0, 0], config.server_port).into(),
	};
	let metadata_listener = TcpListener::bind(bind_addr).await?;
	let health_listener =
		TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.health_port))).await?;
	let service = Arc::new(MetadataService {
		authn: Authenticator::new(inventory.clone(), ctx.clone()),
		tokens,
		inventory,
		provider: config.workload_identity_provider.clone(),
		project_id: config.served_project_id(),
		node_name: config.node_name.clone(),
	});
	let router = Arc::new(build_router(service));
	let ready: ReadyCheck = {
		let cache = cache.clone();

		Arc::new(move || {
			let cache = cache.clone();

			Box::pin(async move { cache.node_seeded().await })
		})
	};
	let metadata = tokio::spawn(serve_metadata(
		metadata_listener,
		router,
		ctx.clone(),
		config.shutdown_grace_period,
	));
	let health = tokio::spawn(serve_health(health_listener, ready, ctx.clone()));

	tracing::info!(?mode, node = config.node_name, "metadata emulator started");

	let (metadata, health) = tokio::join!(metadata, health);

	for outcome in [metadata, health] {
		match outcome {
			Ok(Ok(())) => {},
			Ok(Err(err)) => tracing::error!(error = %err, "listener failed"),
			Err(err) => tracing::error!(error = %err, "listener task panicked"),
		}
	}

	Ok(())
}

fn spawn_signal_handler(ctx: CancellationToken) {
	tokio::spawn(async move {
		let interrupted = async {
			#[cfg(unix)]
			{
				use tokio::signal::unix::{SignalKind, signal};

				match signal(SignalKind::terminate()) {
					Ok(mut terminate) => {
						terminate.recv().await;
					},
					Err(err) => {
						tracing::error!(error = %err, "failed to install SIGTERM handler");
						std::future::pending::<()>().await;
					},
				}
			}
			#[cfg(not(unix))]
			std::future::pending::<()>().await;
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => tracing::info!("received interrupt"),
			_ = interrupted => tracing::info!("received termination signal"),
		}

		ctx.cancel();
	});
}

fn spawn_informers(
	config: &Config,
	platform: Arc<PlatformClient>,
	cache: Arc<InventoryCache>,
	ctx: CancellationToken,
) {
	if config.watch_pods {
		tokio::spawn(run_pod_informer(
			platform.clone(),
			cache.clone(),
			InformerOptions { resync: config.watch_pods_resync_period },
			ctx.clone(),
		));
	}
	if config.watch_node {
		tokio::spawn(run_node_informer(
			platform.clone(),
			cache.clone(),
			InformerOptions { resync: config.watch_node_resync_period },
			ctx.clone(),
		));
	}
	if config.watch_service_accounts {
		tokio::spawn(run_identity_informer(
			platform,
			cache,
			InformerOptions { resync: config.watch_service_accounts_resync_period },
			ctx,
		));
	}
}
