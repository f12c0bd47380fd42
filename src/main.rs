use std::sync::Arc;

use pingora_core::server::{configuration::Opt, Server};

use pinggate::{
    admin::AdminHttpApp,
    config::{
        etcd::{BundleApplier, EtcdConfigSync},
        Config,
    },
    connector::ConnectorRegistry,
    core::status::{self, ConfigSource},
    gateway::Gateway,
    logging::Logger,
    service::{http::GatewayHttpApp, restart::RestartService, status::StatusHttpApp},
};

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        ConnectorRegistry::with_builtin(),
    ));

    // The inline bundle is active before any listener accepts traffic
    log::info!("Applying bundle version {} from config file...", config.bundle.version);
    if let Err(e) = gateway.apply_bundle(config.bundle.clone()) {
        eprintln!("Invalid bundle in configuration: {e}");
        std::process::exit(1);
    }
    if config.etcd.is_none() {
        status::mark_ready(ConfigSource::Yaml);
    }

    let mut pinggate_server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        pinggate_server.add_service(log_service);
    }

    if let Some(etcd_cfg) = &config.etcd {
        log::info!("Adding etcd config sync service...");
        let applier = BundleApplier::new(gateway.clone());
        let etcd_sync = EtcdConfigSync::new(etcd_cfg.clone(), Box::new(applier));
        pinggate_server.add_service(pingora::services::background::background_service(
            "etcd config sync",
            etcd_sync,
        ));
    }

    if let Some(admin_cfg) = &config.admin {
        log::info!("Adding Admin HTTP...");
        pinggate_server.add_service(AdminHttpApp::admin_http_service(admin_cfg, gateway.clone()));
    }

    if let Some(status_cfg) = &config.status {
        log::info!("Adding Status HTTP...");
        pinggate_server.add_service(StatusHttpApp::status_http_service(
            status_cfg,
            gateway.clone(),
        ));
    }

    pinggate_server.add_service(pingora::services::background::background_service(
        "restart",
        RestartService::new(gateway.clone()),
    ));

    log::info!("Adding listeners...");
    let http_service = match GatewayHttpApp::gateway_http_service(gateway, &config.listeners) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to add listeners: {e}");
            std::process::exit(1);
        }
    };

    log::info!("Bootstrapping...");
    pinggate_server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    pinggate_server.add_service(http_service);

    log::info!("Starting Server...");
    pinggate_server.run_forever();
}
