use std::sync::Arc;

use pingora::services::listening::Service;
use pingora_core::{
    listeners::tls::TlsSettings,
    server::{configuration::Opt, Server},
    services::background::background_service,
};

use reliefops::{
    auth::OperatorAuth,
    config::{Config, Listener, ReliefOps, StoreBackend, Tls},
    dashboard::{Dashboard, DashboardSync},
    geo::GeoResolver,
    lifecycle::RequestLifecycle,
    logging,
    service::{
        http::{ReliefContext, ReliefHttpApp},
        status::StatusHttpApp,
    },
    store::{EtcdRequestStore, MemoryRequestStore, RequestStore},
};

fn main() {
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let logger = logging::init(config.reliefops.log.as_ref());

    let store = match build_store(&config.reliefops) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to set up request store: {e}");
            std::process::exit(1);
        }
    };

    let auth = match OperatorAuth::from_config(&config.reliefops.auth) {
        Ok(auth) => auth,
        Err(e) => {
            eprintln!("Failed to set up operator auth: {e}");
            std::process::exit(1);
        }
    };

    let dashboard = Arc::new(Dashboard::new());
    let lifecycle = RequestLifecycle::new(store.clone(), GeoResolver::default());
    let ctx = Arc::new(ReliefContext::new(
        lifecycle,
        auth,
        dashboard.clone(),
        &config.reliefops.intake,
    ));

    let mut reliefops_server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        reliefops_server.add_service(log_service);
    }

    log::info!("Adding dashboard sync service...");
    reliefops_server.add_service(background_service(
        "dashboard sync",
        DashboardSync::new(store, dashboard.clone()),
    ));

    let mut http_service = ReliefHttpApp::relief_http_service(ctx);

    log::info!("Adding listeners...");
    if let Err(e) = add_listeners(&mut http_service, &config.reliefops.listeners) {
        eprintln!("Failed to add listeners: {e}");
        std::process::exit(1);
    }

    add_optional_services(&mut reliefops_server, &config.reliefops, dashboard);

    log::info!("Bootstrapping...");
    reliefops_server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    reliefops_server.add_service(http_service);

    log::info!("Starting Server...");
    reliefops_server.run_forever();
}

fn build_store(cfg: &ReliefOps) -> Result<Arc<dyn RequestStore>, Box<dyn std::error::Error>> {
    match cfg.store.backend {
        StoreBackend::Memory => {
            log::info!("Using in-memory request store");
            Ok(Arc::new(MemoryRequestStore::new()))
        }
        StoreBackend::Etcd => {
            let etcd_cfg = cfg
                .etcd
                .as_ref()
                .ok_or("etcd backend selected without an etcd section")?;
            log::info!("Using etcd request store at {:?}", etcd_cfg.host);
            Ok(Arc::new(EtcdRequestStore::new(etcd_cfg.clone())))
        }
    }
}

fn add_listeners(
    http_service: &mut Service<ReliefHttpApp>,
    listeners: &[Listener],
) -> Result<(), Box<dyn std::error::Error>> {
    for list_cfg in listeners {
        match &list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(cert_path, key_path)?;
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => http_service.add_tcp(&list_cfg.address.to_string()),
        }
    }
    Ok(())
}

fn add_optional_services(server: &mut Server, cfg: &ReliefOps, dashboard: Arc<Dashboard>) {
    if let Some(prometheus_cfg) = &cfg.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    if let Some(status_cfg) = &cfg.status {
        log::info!("Adding Status HTTP...");
        server.add_service(StatusHttpApp::status_http_service(status_cfg, dashboard));
    }
}
