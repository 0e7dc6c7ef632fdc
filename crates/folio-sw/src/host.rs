//! Worker host: drives the lifecycle and dispatches events.
//!
//! Stands in for the browser side of a service worker. It keeps the
//! installing / waiting / active slots of one registration, the pages
//! (clients) the worker may control, and the notifications it has shown.
//! State locks are never held while a lifecycle handler runs. Register jobs
//! run one at a time, and event dispatch waits out an activation in progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::fetch::Request;
use crate::lifecycle::{
    ActivateOutcome, ClickAction, FetchOutcome, InstallOutcome, Notification, SyncOutcome,
    WorkerLifecycle,
};
use crate::{SwError, SwResult};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Uninstalled,
    /// Installing (install event).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced by a newer worker.
    Redundant,
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceWorkerState::Uninstalled => "uninstalled",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Bucket owned by this worker's version.
    pub cache_name: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handler: Arc<dyn WorkerLifecycle>,
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("cache_name", &self.cache_name)
            .field("state", &self.state)
            .finish()
    }
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(cache_name: impl Into<String>, handler: Arc<dyn WorkerLifecycle>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Uninstalled,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn handler(&self) -> Arc<dyn WorkerLifecycle> {
        Arc::clone(&self.handler)
    }
}

// ==================== Registration ====================

/// The worker slots of one scope.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Put a worker in the installing slot. Returns the worker it replaced.
    fn begin_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorkerId> {
        worker.set_state(ServiceWorkerState::Installing);
        self.installing.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        })
    }

    /// Move the installing worker to waiting.
    ///
    /// Returns `None` if `id` was superseded while installing, otherwise the
    /// id of a waiting worker it displaced, if any.
    fn install_complete(&mut self, id: ServiceWorkerId) -> Option<Option<ServiceWorkerId>> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return None;
        }
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        let displaced = self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        });
        Some(displaced)
    }

    /// Promote the waiting worker. Returns it and the worker it replaced.
    fn begin_activation(&mut self) -> Option<(ServiceWorker, Option<ServiceWorkerId>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let replaced = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        });

        self.active = Some(worker.clone());
        Some((worker, replaced))
    }

    fn activation_complete(&mut self, id: ServiceWorkerId) -> bool {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                true
            }
            _ => false,
        }
    }

    /// The active worker, once it has finished activating.
    pub fn controller(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.is_active())
    }
}

// ==================== Clients ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A page the worker may control.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker controlling this page.
    pub controller: Option<ServiceWorkerId>,
}

/// Options for `Clients::match_all`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
    next_id: u64,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, url: Url, client_type: ClientType, focused: bool) -> Client {
        self.next_id += 1;
        let client = Client {
            id: format!("client-{}", self.next_id),
            url,
            client_type,
            focused,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Add an uncontrolled window, as when a page opens before the worker.
    pub fn add(&mut self, url: Url) -> Client {
        self.insert(url, ClientType::Window, false)
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match all clients.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Make `worker` the controller of every client. Returns the ids that changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Hand every client controlled by `from` over to `to`. Returns the ids moved.
    pub fn replace_controller(
        &mut self,
        from: ServiceWorkerId,
        to: ServiceWorkerId,
    ) -> Vec<String> {
        let mut moved: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller == Some(from))
            .map(|c| {
                c.controller = Some(to);
                c.id.clone()
            })
            .collect();
        moved.sort();
        moved
    }

    /// Set the controller of one client. Returns whether it changed.
    pub fn set_controller(&mut self, id: &str, worker: ServiceWorkerId) -> bool {
        match self.clients.get_mut(id) {
            Some(client) if client.controller != Some(worker) => {
                client.controller = Some(worker);
                true
            }
            _ => false,
        }
    }

    /// Open a window.
    pub fn open_window(&mut self, url: Url) -> Client {
        for client in self.clients.values_mut() {
            client.focused = false;
        }
        self.insert(url, ClientType::Window, true)
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> SwResult<Client> {
        let is_window = match self.clients.get(id) {
            Some(client) => client.client_type == ClientType::Window,
            None => return Err(SwError::NotFound(id.to_string())),
        };
        if !is_window {
            return Err(SwError::State("Can only focus window clients".to_string()));
        }

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients
            .get(id)
            .cloned()
            .ok_or_else(|| SwError::NotFound(id.to_string()))
    }

    /// First window showing `url`.
    pub fn find_window(&self, url: &Url) -> Option<&Client> {
        self.match_all(&ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        })
        .into_iter()
        .find(|c| &c.url == url)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }
}

// ==================== Host ====================

/// Events raised by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A new worker started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    NotificationShown { id: NotificationId },
    NotificationClosed { id: NotificationId },
    WindowOpened { client_id: String, url: Url },
    WindowFocused { client_id: String },
}

/// What happened when a worker was registered.
#[derive(Debug, Clone)]
pub struct RegisterReport {
    pub worker_id: ServiceWorkerId,
    pub install: InstallOutcome,
    /// Present when the worker went on to activate.
    pub activate: Option<ActivateOutcome>,
}

/// Hosts one registration and its clients.
pub struct WorkerHost {
    registration: RwLock<Registration>,
    clients: RwLock<Clients>,
    notifications: RwLock<HashMap<NotificationId, Notification>>,
    /// Held for a whole register or activate job.
    jobs: Mutex<()>,
    /// Held from promotion until the active worker is activated and has claimed.
    activation: Mutex<()>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

impl WorkerHost {
    /// Create a host for `scope`.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(Registration::new(scope)),
                clients: RwLock::new(Clients::new()),
                notifications: RwLock::new(HashMap::new()),
                jobs: Mutex::new(()),
                activation: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(worker = worker_id.raw(), state = %new_state, "Worker state changed");
        self.emit(HostEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    /// Install a worker and, when allowed, activate it.
    ///
    /// Install runs to completion before activation starts. The worker
    /// activates right away if its install asked to skip waiting or if no
    /// worker is active yet; otherwise it stays in the waiting slot.
    ///
    /// A register call made while another job is running waits for it, so
    /// an install never overlaps an earlier worker's activation.
    pub async fn register(
        &self,
        handler: Arc<dyn WorkerLifecycle>,
        cache_name: impl Into<String>,
    ) -> RegisterReport {
        let _job = self.jobs.lock().await;

        let worker = ServiceWorker::new(cache_name, Arc::clone(&handler));
        let worker_id = worker.id;

        let replaced = self.registration.write().await.begin_install(worker);
        if let Some(old) = replaced {
            self.emit_state(old, ServiceWorkerState::Redundant);
        }
        self.emit(HostEvent::UpdateFound { worker_id });
        self.emit_state(worker_id, ServiceWorkerState::Installing);

        let install = handler.on_install().await;

        let completed = self.registration.write().await.install_complete(worker_id);
        let Some(displaced) = completed else {
            info!(worker = worker_id.raw(), "Install superseded by a newer worker");
            return RegisterReport {
                worker_id,
                install,
                activate: None,
            };
        };
        if let Some(old) = displaced {
            self.emit_state(old, ServiceWorkerState::Redundant);
        }
        self.emit_state(worker_id, ServiceWorkerState::Installed);

        let has_active = self.registration.read().await.active.is_some();
        let activate = if install.skip_waiting || !has_active {
            self.activate_locked().await
        } else {
            info!(worker = worker_id.raw(), "Installed; waiting for open pages to close");
            None
        };

        RegisterReport {
            worker_id,
            install,
            activate,
        }
    }

    /// Activate the waiting worker, if any.
    ///
    /// Bucket cleanup finishes before the worker is marked activated; clients
    /// are claimed after that when the outcome asks for it. Pages controlled
    /// by the replaced worker move to the new one as soon as it is promoted.
    pub async fn activate_waiting(&self) -> Option<ActivateOutcome> {
        let _job = self.jobs.lock().await;
        self.activate_locked().await
    }

    /// Activation body; the caller holds `jobs`.
    async fn activate_locked(&self) -> Option<ActivateOutcome> {
        let _activation = self.activation.lock().await;

        let (worker, replaced) = self.registration.write().await.begin_activation()?;
        if let Some(old) = replaced {
            self.emit_state(old, ServiceWorkerState::Redundant);
        }
        self.emit_state(worker.id, ServiceWorkerState::Activating);

        if let Some(old) = replaced {
            let moved = self.clients.write().await.replace_controller(old, worker.id);
            for client_id in moved {
                self.emit(HostEvent::ControllerChange {
                    client_id,
                    worker_id: worker.id,
                });
            }
        }

        let outcome = worker.handler().on_activate().await;

        if !self
            .registration
            .write()
            .await
            .activation_complete(worker.id)
        {
            return Some(outcome);
        }
        self.emit_state(worker.id, ServiceWorkerState::Activated);

        if outcome.claim_clients {
            let changed = self.clients.write().await.claim(worker.id);
            for client_id in changed {
                self.emit(HostEvent::ControllerChange {
                    client_id,
                    worker_id: worker.id,
                });
            }
        }

        Some(outcome)
    }

    /// The active worker, if any.
    pub async fn active(&self) -> Option<ServiceWorker> {
        self.registration.read().await.active.clone()
    }

    /// The waiting worker, if any.
    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    /// The installing worker, if any.
    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.registration.read().await.installing.clone()
    }

    pub async fn scope(&self) -> Url {
        self.registration.read().await.scope.clone()
    }

    /// The worker that handles events, once any activation in progress is done.
    async fn controller(&self) -> Option<ServiceWorker> {
        drop(self.activation.lock().await);
        self.registration.read().await.controller().cloned()
    }

    // ---------- clients ----------

    /// Open a page that is not yet controlled.
    pub async fn add_client(&self, url: Url) -> Client {
        self.clients.write().await.add(url)
    }

    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn match_all_clients(&self, options: &ClientMatchOptions) -> Vec<Client> {
        self.clients
            .read()
            .await
            .match_all(options)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    // ---------- events ----------

    /// Dispatch a fetch. `None` means the browser fetches natively.
    ///
    /// Navigations go to the active worker, which then controls the client.
    /// Sub-resource requests are only intercepted for clients controlled by
    /// the active worker.
    pub async fn fetch(&self, client_id: Option<&str>, request: Request) -> Option<FetchOutcome> {
        let controller = self.controller().await?;

        if let Some(client_id) = client_id {
            if request.is_navigation() {
                let changed = self
                    .clients
                    .write()
                    .await
                    .set_controller(client_id, controller.id);
                if changed {
                    self.emit(HostEvent::ControllerChange {
                        client_id: client_id.to_string(),
                        worker_id: controller.id,
                    });
                }
            } else {
                let controlled_by = self
                    .clients
                    .read()
                    .await
                    .get(client_id)
                    .and_then(|c| c.controller);
                if controlled_by != Some(controller.id) {
                    debug!(client = client_id, url = %request.url, "Client not controlled");
                    return None;
                }
            }
        }

        controller.handler().on_fetch(request).await.into_outcome()
    }

    /// Dispatch a background sync event.
    pub async fn sync(&self, tag: &str) -> Option<SyncOutcome> {
        let controller = self.controller().await?;
        Some(controller.handler().on_sync(tag).await)
    }

    /// Dispatch a push event and show the resulting notification.
    pub async fn push(&self, payload: Option<&[u8]>) -> Option<NotificationId> {
        let controller = self.controller().await?;
        let notification = controller.handler().on_push(payload).await;

        let id = NotificationId::new();
        info!(title = %notification.title, "Showing notification");
        self.notifications.write().await.insert(id, notification);
        self.emit(HostEvent::NotificationShown { id });
        Some(id)
    }

    /// Notifications currently shown.
    pub async fn notifications(&self) -> Vec<(NotificationId, Notification)> {
        let mut shown: Vec<_> = self
            .notifications
            .read()
            .await
            .iter()
            .map(|(id, n)| (*id, n.clone()))
            .collect();
        shown.sort_by_key(|(id, _)| id.0);
        shown
    }

    /// Handle a click: close the notification, then focus or open the target page.
    pub async fn click_notification(&self, id: NotificationId) -> SwResult<Client> {
        let notification = self
            .notifications
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| SwError::NotFound(format!("notification {}", id.0)))?;
        self.emit(HostEvent::NotificationClosed { id });

        let controller = self
            .controller()
            .await
            .ok_or_else(|| SwError::State("no active worker".to_string()))?;

        let ClickAction::OpenWindow(url) = controller
            .handler()
            .on_notification_click(&notification)
            .await;

        let mut clients = self.clients.write().await;
        let existing = clients.find_window(&url).map(|c| c.id.clone());
        match existing {
            Some(client_id) => {
                let client = clients.focus(&client_id)?;
                self.emit(HostEvent::WindowFocused { client_id });
                Ok(client)
            }
            None => {
                let client = clients.open_window(url.clone());
                self.emit(HostEvent::WindowOpened {
                    client_id: client.id.clone(),
                    url,
                });
                Ok(client)
            }
        }
    }
}
