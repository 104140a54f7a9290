//! Assembles a single-process relay deployment: one gateway bound to one TCP listener, wired
//! in-process to one state service (§1, §4). A multi-gateway fleet replaces the `InProcessStateClient`/
//! `ChannelGatewaySink` pair built here with networked RPC stubs; that transport is out of scope
//! (§1's Non-goals).

mod state_client;

use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use relay_common::{GatewayConfig, StateConfig};
use relay_gateway::GatewayRuntime;
use relay_state::{Cache, ChannelGatewaySink, GatewayRegistry, InMemoryCache, InMemoryRouter, NullUpstream, RedisCache, Router, StateService, Upstream};

use state_client::InProcessStateClient;

/// The routing key this single-process deployment registers itself under. There is only one
/// gateway in the fleet here, so any stable string works — a networked deployment would use
/// each gateway's real `"<ip>:<port>"` instead (§6).
const LOCAL_GATEWAY_ENDPOINT: &str = "local";

fn main() {
    env_logger::init();

    let listen_addr: SocketAddr = env::var("RELAY_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:7000".to_string())
        .parse()
        .unwrap_or_else(|e| {
            error!("invalid RELAY_LISTEN_ADDR: {e}");
            process::exit(1);
        });

    let cache = build_cache();
    let router: Arc<dyn Router> = Arc::new(InMemoryRouter::new());
    let upstream: Arc<dyn Upstream> = Arc::new(NullUpstream);
    let gateways = Arc::new(GatewayRegistry::new());

    let state = StateService::spawn(
        StateConfig::default(),
        cache,
        router,
        upstream,
        Arc::clone(&gateways),
    );

    // Crash recovery must finish before anything is accepted, per §4.8/§7: a process that
    // cannot recover its owned login-slot partition must not serve traffic that belongs to it.
    if let Err(e) = state.recover() {
        error!("crash recovery failed, refusing to start: {e}");
        process::exit(1);
    }

    let client = Arc::new(InProcessStateClient::new(Arc::clone(&state), LOCAL_GATEWAY_ENDPOINT));
    let gateway_config = GatewayConfig::default();
    let gateway = match GatewayRuntime::start(listen_addr, &gateway_config, client) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("failed to start gateway on {listen_addr}: {e}");
            process::exit(1);
        }
    };
    gateways.register(
        LOCAL_GATEWAY_ENDPOINT,
        Arc::new(ChannelGatewaySink::new(gateway.command_sender())),
    );

    info!("relay-serverd listening on {}", gateway.local_addr());

    wait_for_shutdown_signal();
    info!("shutdown signal received, draining connections");

    gateway.request_shutdown();
    std::thread::sleep(gateway_config.shutdown_grace);
    gateway.join();
    state.shutdown();
    drop(state);

    info!("relay-serverd exited cleanly");
}

fn build_cache() -> Arc<dyn Cache> {
    match env::var("REDIS_URL") {
        Ok(url) => match RedisCache::connect(&url) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                error!("failed to connect to redis at {url}: {e}");
                process::exit(1);
            }
        },
        Err(_) => {
            info!("REDIS_URL not set; using an in-memory cache with no cross-process durability");
            Arc::new(InMemoryCache::new())
        }
    }
}

/// Blocks until SIGINT, SIGTERM, SIGHUP, or SIGQUIT is observed (§5, §10).
fn wait_for_shutdown_signal() {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGQUIT,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&flag)) {
            error!("failed to register handler for signal {signal}: {e}");
        }
    }
    while !flag.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
}
