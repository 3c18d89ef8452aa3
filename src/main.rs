use clap::Parser;
use eyre::format_err;
use kube::Client;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};

use lbex::configurator::Configurator;
use lbex::controller::{Controller, Settings};
use lbex::nginx::{config::MainConfig, Mode, NginxDriver};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ")");

const ABOUT: &str = r#"
External load balancer for Kubernetes (lbex)

Watch the Kubernetes API server for services carrying the
kubernetes.io/loadbalancer-class: loadbalancer-lbex annotation and keep a
local NGINX stream proxy configured to forward their traffic to the right
backends.
"#;

/// External load balancer for Kubernetes
#[derive(Parser)]
#[command(version = VERSION, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "LBEX_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "LBEX_LOG_STYLE")]
    log_style: String,

    /// absolute path to a kubeconfig file
    #[arg(long, default_value = "", env = "LBEX_KUBECONFIG")]
    kubeconfig: String,
    /// kubectl proxy server running at the given url
    #[arg(long, default_value = "", env = "LBEX_PROXY")]
    proxy: String,

    /// provide load balancing for this service only
    #[arg(long, default_value = "", env = "LBEX_SERVICE_NAME")]
    service_name: String,
    /// provide load balancing for services in this pool
    #[arg(long, default_value = "", env = "LBEX_SERVICE_POOL")]
    service_pool: String,
    /// provide load balancing for services in --service-pool only
    #[arg(long, env = "LBEX_STRICT_AFFINITY")]
    strict_affinity: bool,
    /// do not provide load balancing for services in --service-pool
    #[arg(long, env = "LBEX_ANTI_AFFINITY")]
    anti_affinity: bool,

    /// make the per-port listener annotation mandatory
    #[arg(long, env = "LBEX_REQUIRE_PORT", action = clap::ArgAction::Set, default_value_t = true)]
    require_port: bool,

    /// serve a health check endpoint from the proxy
    #[arg(long, env = "LBEX_HEALTH_CHECK", action = clap::ArgAction::Set, default_value_t = true)]
    health_check: bool,
    /// health check listener port
    #[arg(long, default_value_t = 7331, env = "LBEX_HEALTH_PORT")]
    health_port: u16,

    /// full: control a local NGINX process; dry-run: only write
    /// configuration files
    #[arg(long, value_enum, default_value = "full", env = "LBEX_MODE")]
    mode: Mode,
    /// NGINX configuration directory
    #[arg(long, default_value = "/etc/nginx", env = "LBEX_NGINX_CONF_DIR")]
    nginx_conf_dir: PathBuf,
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    // credentials: proxy url, else kubeconfig, else in-cluster discovery;
    // only the first applicable method is tried
    let kube_cfg = if !cli.proxy.is_empty() {
        let url: http::Uri = (cli.proxy.parse())
            .map_err(|e| format_err!("invalid proxy url {}: {e}", cli.proxy))?;
        kube::Config::new(url)
    } else if !cli.kubeconfig.is_empty() {
        let kubeconfig = kube::config::Kubeconfig::read_from(&cli.kubeconfig)
            .map_err(|e| format_err!("read kubeconfig failed: {}: {e}", cli.kubeconfig))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
            .await
            .map_err(|e| format_err!("invalid kubeconfig: {}: {e}", cli.kubeconfig))?
    } else {
        kube::Config::incluster().map_err(|e| format_err!("in-cluster discovery failed: {e}"))?
    };

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);
    let client: Client = kube_cfg.try_into()?;

    let driver = NginxDriver::new(
        cli.nginx_conf_dir,
        cli.mode,
        MainConfig {
            health_check: cli.health_check,
            health_port: cli.health_port,
            ..MainConfig::default()
        },
    );
    driver.ensure_dirs().await?;
    driver.write_main().await?;
    driver.start().await?;

    let cfgtor = Arc::new(Configurator::new(driver, cli.require_port));
    let controller = Controller::new(
        cfgtor,
        Settings {
            service_name: optional(cli.service_name),
            service_pool: optional(cli.service_pool),
            strict_affinity: cli.strict_affinity,
            anti_affinity: cli.anti_affinity,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        };
        let _ = shutdown_tx.send(true);
    });

    controller.run(client, shutdown_rx).await
}
