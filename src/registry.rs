use std::{collections::HashMap, env, sync::Arc, time::Duration};

use tokio::{
    fs,
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::CommandRunner,
    error::{Error, Result},
    routes::RouteConfig,
    service::Service,
    settings::Settings,
};

/// Id of the distinguished service representing the supervisor itself.
pub const SELF_SERVICE_ID: &str = "services";

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry-level actions requested by builtin service commands. Delivered
/// over a channel so services never hold a reference back to the registry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlRequest {
    ReloadServiceList,
    RegenerateRoutes,
}

struct InnerRegistry {
    services: HashMap<String, Service>,
    varnish_reload: Option<CommandRunner>,
}

/// The complete set of services, keyed by id. Ids are never removed; an id
/// seen again during reconciliation refreshes the existing service in place.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<Mutex<InnerRegistry>>,
    settings: Settings,
    control: mpsc::UnboundedSender<ControlRequest>,
    shutdown: CancellationToken,
}

impl ServiceRegistry {
    /// Must be called from within the tokio runtime; spawns the control loop
    /// that serves builtin command requests.
    pub fn new(settings: Settings, shutdown: CancellationToken) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let registry = ServiceRegistry {
            inner: Arc::new(Mutex::new(InnerRegistry {
                services: HashMap::new(),
                varnish_reload: None,
            })),
            settings,
            control: control_tx,
            shutdown,
        };

        registry.clone().start_control_loop(control_rx);
        registry
    }

    fn start_control_loop(self, mut control_rx: mpsc::UnboundedReceiver<ControlRequest>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    request = control_rx.recv() => match request {
                        None => break,
                        Some(ControlRequest::ReloadServiceList) => {
                            self.reconcile().await;
                            if let Ok(service) = self.self_service().await {
                                service.log("Loaded service list".to_string());
                            }
                        }
                        Some(ControlRequest::RegenerateRoutes) => {
                            self.regenerate_routes().await;
                        }
                    }
                }
            }
        });
    }

    /// Registers the self service. It must be the first service created so
    /// that all subsequent registry logging has a destination.
    pub async fn load_self_service(&self) -> Result<Service> {
        let working_dir = env::current_dir()?;
        let service = Service::new(
            SELF_SERVICE_ID.to_string(),
            working_dir,
            true,
            self.settings.clone(),
            self.control.clone(),
            self.shutdown.clone(),
        )
        .await;

        let reload = CommandRunner::new(
            service.run_context(),
            self.settings.varnish_reload().to_string(),
            "Update Varnish".to_string(),
            false,
        );

        let mut inner = self.inner.lock().await;
        inner.varnish_reload = Some(reload);
        inner
            .services
            .insert(SELF_SERVICE_ID.to_string(), service.clone());

        Ok(service)
    }

    /// Syncs the registry against the service-list document. A document that
    /// can't be read or parsed aborts the whole cycle with no partial effect.
    /// On success, route configuration is regenerated exactly once.
    pub async fn reconcile(&self) {
        let path = self.settings.service_list_path();

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) => {
                self.log_err(format!(
                    "Can't read service list file {}: {err}",
                    path.display()
                ))
                .await;
                return;
            }
        };

        let mapping: HashMap<String, String> = match serde_json::from_str(&content) {
            Ok(mapping) => mapping,
            Err(err) => {
                self.log_err(format!(
                    "Invalid service list file {} (should be an object of key/value pairs): {err}",
                    path.display()
                ))
                .await;
                return;
            }
        };

        self.reconcile_mapping(mapping).await;
        self.regenerate_routes().await;
    }

    /// Applies one service-list mapping: known ids are refreshed in place
    /// (processes and buffers survive), new ids are constructed and start
    /// themselves. Ids absent from the mapping are left untouched.
    pub async fn reconcile_mapping(&self, mapping: HashMap<String, String>) {
        for (id, relative_path) in mapping {
            let existing = self.inner.lock().await.services.get(&id).cloned();
            match existing {
                Some(service) => service.update_from_config().await,
                None => {
                    info!("Registering service \"{id}\" from {relative_path}");
                    let directory = self.settings.root_path().join(&relative_path);
                    let service = Service::new(
                        id.clone(),
                        directory,
                        false,
                        self.settings.clone(),
                        self.control.clone(),
                        self.shutdown.clone(),
                    )
                    .await;
                    self.inner.lock().await.services.insert(id, service);
                }
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Service> {
        self.inner
            .lock()
            .await
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownService(id.to_string()))
    }

    pub async fn self_service(&self) -> Result<Service> {
        self.get(SELF_SERVICE_ID).await
    }

    /// Snapshot of the registered services. No ordering is guaranteed;
    /// callers that need one must sort.
    pub async fn all(&self) -> Vec<Service> {
        self.inner.lock().await.services.values().cloned().collect()
    }

    /// Derives the reverse-proxy configuration from the current registry,
    /// writes it out, and asks the edge proxy to reload it.
    pub async fn regenerate_routes(&self) {
        let services = self.all().await;
        let config = RouteConfig::from_services(&services);

        let path = self.settings.vcl_path();
        match fs::write(&path, config.render()).await {
            Ok(()) => info!(
                "Wrote route configuration for {} backends to {}",
                config.entries().len(),
                path.display()
            ),
            Err(err) => {
                self.log_err(format!(
                    "Can't write route configuration to {}: {err}",
                    path.display()
                ))
                .await;
            }
        }

        let reload = self.inner.lock().await.varnish_reload.clone();
        match reload {
            Some(runner) => runner.run_once(),
            None => warn!("No proxy reload command registered, skipping reload"),
        }
    }

    /// Kills every live child process and joins the supervision tasks. The
    /// shutdown token must already be cancelled so the loops don't respawn.
    pub async fn shutdown(&self) {
        let mut handles = Vec::new();
        {
            let inner = self.inner.lock().await;
            for service in inner.services.values() {
                handles.extend(service.kill_all());
            }
            if let Some(reload) = &inner.varnish_reload {
                reload.kill();
                if let Some(handle) = reload.take_task() {
                    handles.push(handle);
                }
            }
        }

        for handle in handles {
            if timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Timed out waiting for a supervision task to finish");
            }
        }
    }

    async fn log_err(&self, line: String) {
        match self.self_service().await {
            Ok(service) => service.log_err(line),
            Err(_) => error!("{line}"),
        }
    }
}
