//! # Broker
//!
//! Accepts module connections, keeps the registry and routes calls between modules.
//!
//! ## Connection lifecycle
//!
//! `Connecting -> Authenticating -> Active -> Disconnecting -> Closed`
//!
//! A connection authenticates with a Hello frame carrying its module descriptor and
//! initial services; the broker answers with the assigned module id. While Active it
//! accepts Call, Send, RegisterService and Disconnect frames.
//!
//! ## Routing
//!
//! A Call is resolved against the target's registered methods and forwarded under a fresh
//! broker-wide call-id. The answer is re-tagged with the caller's own call-id on the way
//! back. Routing failures are answered with a Fault; the broker never tears down the
//! caller because of them.
//!
//! ## Invariants
//! - No DashMap guard is held across an await.
//! - When a connection closes, every call forwarded to it is answered with a
//!   `CommunicationFailure`.

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::watch;

use sbwrpc::Event;
use sbwrpc::Fault;
use sbwrpc::FaultKind;
use sbwrpc::Frame;
use sbwrpc::Invocation;
use sbwrpc::ManagementPolicy;
use sbwrpc::ModuleDescriptor;
use sbwrpc::ModuleId;
use sbwrpc::ServiceDescriptor;
use sbwrpc::Value;

use crate::config::BROKER_MODULE_NAME;
use crate::config::BrokerConfig;
use crate::launcher::Launcher;
use crate::launcher::ProcessLauncher;
use crate::launcher::reachable;
use crate::listener::Listener;
use crate::listener::ListenerId;
use crate::listener::ListenerRegistry;
use crate::peer;
use crate::peer::CallIds;
use crate::peer::CallResult;
use crate::peer::Inbox;
use crate::peer::Peer;
use crate::registry::Registry;
use crate::registry::module_not_found;
use crate::system;
use crate::tcp::TcpAcceptor;
use crate::transport::Transport;

/// A resolved invocation, forwarded under the method's canonical signature.
struct Route {
    target: Arc<Peer>,
    from: ModuleId,
    to: ModuleId,
    service: String,
    selector: String,
    args: Vec<u8>,
}

impl Route {
    /// Encodes a Call under `call_id`, or a Send when there is none.
    fn encode(&self, call_id: Option<u32>) -> Result<Vec<u8>, Fault> {
        let invocation = Invocation {
            from: self.from,
            to: self.to,
            service: &self.service,
            selector: &self.selector,
            args: &self.args,
        };
        let frame = match call_id {
            Some(call_id) => Frame::Call { call_id, invocation },
            None => Frame::Send(invocation),
        };
        Ok(frame.encode()?)
    }
}

/// An authenticated module connection.
#[derive(Clone)]
struct Connection {
    id: ModuleId,
    name: String,
    peer: Arc<Peer>,
}

struct Inner {
    config: BrokerConfig,
    registry: Registry,
    connections: DashMap<ModuleId, Connection>,
    next_module_id: AtomicU32,
    call_ids: CallIds,
    listeners: ListenerRegistry,
    launcher: Arc<dyn Launcher>,
    /// Where launched modules connect; the bound address once serving.
    address: RwLock<String>,
    /// Announces every module that finishes authenticating.
    startups: broadcast::Sender<(String, ModuleId)>,
    shutdown: watch::Sender<bool>,
}

/// A cheaply cloneable handle to one broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Creates a broker that starts managed modules as child processes.
    pub fn new(config: BrokerConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new());
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: BrokerConfig, launcher: Arc<dyn Launcher>) -> Self {
        let registry = Registry::new();
        for module in &config.modules {
            registry.declare(module.descriptor());
        }
        if let Err(fault) =
            registry.insert(ModuleId::BROKER, system::module_descriptor(), vec![system::service_descriptor()])
        {
            tracing::error!(%fault, "cannot register the system service");
        }

        let (startups, _) = broadcast::channel(64);
        let address = RwLock::new(config.listen.clone());
        let inner = Inner {
            config,
            registry,
            connections: DashMap::new(),
            next_module_id: AtomicU32::new(ModuleId::BROKER.0 + 1),
            call_ids: peer::call_ids(),
            listeners: ListenerRegistry::new(),
            launcher,
            address,
            startups,
            shutdown: watch::Sender::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn add_listener(&self, listener: impl Listener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Ids of all running instances, the broker's own included.
    pub fn modules(&self) -> Vec<ModuleId> {
        self.inner.registry.ids()
    }

    /// Calls forwarded to modules and not yet answered.
    pub fn pending_len(&self) -> usize {
        let peers: Vec<Arc<Peer>> = self.inner.connections.iter().map(|c| c.peer.clone()).collect();
        peers.iter().map(|p| p.pending_len()).sum()
    }

    /// The address handed to launched modules.
    pub fn address(&self) -> String {
        self.inner.address.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Closes every connection and stops accepting new ones.
    pub fn shutdown(&self) {
        tracing::info!("broker shutting down");
        self.inner.shutdown.send_replace(true);
    }

    fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    // ========================================================================
    //  Connections
    // ========================================================================

    /// Binds the configured address and serves connections until shutdown.
    pub async fn listen(&self) -> anyhow::Result<()> {
        let acceptor = TcpAcceptor::bind(&self.inner.config.listen, self.inner.config.max_frame_len).await?;
        tracing::info!(addr = %acceptor.local_addr()?, "broker listening");
        self.serve(acceptor).await
    }

    pub async fn serve(&self, acceptor: TcpAcceptor) -> anyhow::Result<()> {
        let address = reachable(acceptor.local_addr()?).to_string();
        *self.inner.address.write().unwrap_or_else(PoisonError::into_inner) = address;

        let shutdown = wait_for_shutdown(self.shutdown_requested());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = acceptor.accept() => match accepted {
                    Ok((transport, addr)) => {
                        let id = self.attach(Box::new(transport));
                        tracing::debug!(%id, %addr, "accepted connection");
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = &mut shutdown => break,
            }
        }
        Ok(())
    }

    /// Takes over a fresh connection. The returned id is the one the module will be
    /// assigned if it authenticates.
    pub fn attach(&self, transport: Box<dyn Transport>) -> ModuleId {
        let id = ModuleId(self.inner.next_module_id.fetch_add(1, Ordering::Relaxed));
        let (peer, inbox) = Peer::with_call_ids(id.to_string(), transport, self.inner.call_ids.clone());
        let broker = self.clone();
        tokio::spawn(async move { broker.run_connection(id, Arc::new(peer), inbox).await });
        id
    }

    async fn run_connection(self, id: ModuleId, peer: Arc<Peer>, mut inbox: Inbox) {
        tracing::debug!(%id, state = "connecting");
        let shutdown = wait_for_shutdown(self.shutdown_requested());
        tokio::pin!(shutdown);

        let authenticated = tokio::select! {
            conn = self.authenticate(id, &peer, &mut inbox) => conn,
            _ = &mut shutdown => None,
        };
        let Some(conn) = authenticated else {
            // Shutdown may interrupt authentication after the module was recorded.
            if self.inner.connections.remove(&id).is_some() {
                self.inner.registry.remove(id);
            }
            peer.close().await;
            tracing::debug!(%id, state = "closed");
            return;
        };

        tracing::info!(%id, module = %conn.name, state = "active");

        let reason = loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        if !self.handle_frame(&conn, &msg).await {
                            break "disconnect requested";
                        }
                    }
                    None => break "connection lost",
                },
                _ = &mut shutdown => break "broker shutting down",
            }
        };

        self.teardown(&conn, reason).await;
    }

    /// Waits for Hello and registers the module. Returns `None` if the connection is
    /// refused or lost first.
    async fn authenticate(&self, id: ModuleId, peer: &Arc<Peer>, inbox: &mut Inbox) -> Option<Connection> {
        let first = inbox.recv().await?;
        tracing::debug!(%id, state = "authenticating");

        let (call_id, module, services) = match Frame::decode(&first) {
            Ok(Frame::Hello { call_id, module, services }) => (call_id, module, services),
            Ok(other) => {
                tracing::warn!(%id, kind = ?other.kind(), "first frame is not Hello");
                if let Some(call_id) = other.call_id() {
                    let fault = Fault::protocol("expected Hello");
                    self.answer(peer, call_id, Err(fault)).await;
                }
                return None;
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "malformed Hello");
                return None;
            }
        };

        if module.name == BROKER_MODULE_NAME {
            let fault = Fault::new(FaultKind::DuplicateDefinition, "module name BROKER is reserved");
            self.answer(peer, call_id, Err(fault)).await;
            return None;
        }

        let conn = Connection { id, name: module.name.clone(), peer: peer.clone() };
        self.inner.connections.insert(id, conn.clone());
        if let Err(fault) = self.inner.registry.insert(id, module, services.clone()) {
            tracing::warn!(%id, module = %conn.name, %fault, "refusing module");
            self.inner.connections.remove(&id);
            self.answer(peer, call_id, Err(fault)).await;
            return None;
        }

        if !self.answer(peer, call_id, encoded(&id.to_value())).await {
            self.inner.connections.remove(&id);
            self.inner.registry.remove(id);
            return None;
        }

        self.emit(Event::ModuleConnected { id, name: conn.name.clone() }).await;
        for service in &services {
            self.emit(Event::ServiceRegistered { id, name: conn.name.clone(), service: service.name.clone() })
                .await;
        }
        let _ = self.inner.startups.send((conn.name.clone(), id));
        Some(conn)
    }

    /// Handles one frame from an active connection. Returns false once the connection
    /// should close.
    async fn handle_frame(&self, conn: &Connection, msg: &[u8]) -> bool {
        let frame = match Frame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %conn.id, error = %e, "malformed frame");
                return false;
            }
        };

        match frame {
            Frame::Call { call_id, invocation } => self.route_call(conn, call_id, invocation).await,
            Frame::Send(invocation) => self.route_send(conn, invocation).await,
            Frame::RegisterService { call_id, service } => self.register_service(conn, call_id, service).await,
            Frame::Disconnect => return false,
            Frame::Hello { call_id, .. } => {
                let fault = Fault::protocol(format!("{} is already authenticated", conn.id));
                self.answer(&conn.peer, call_id, Err(fault)).await;
            }
            Frame::Event(event) => tracing::debug!(id = %conn.id, %event, "ignoring event from module"),
            // Answers are consumed by the peer's pump.
            Frame::Reply { .. } | Frame::Fault { .. } => {}
        }
        true
    }

    async fn register_service(&self, conn: &Connection, call_id: u32, service: ServiceDescriptor) {
        let name = service.name.clone();
        match self.inner.registry.add_service(conn.id, service) {
            Ok(()) => {
                tracing::info!(id = %conn.id, service = %name, "service registered");
                self.answer(&conn.peer, call_id, encoded(&Value::Void)).await;
                self.emit(Event::ServiceRegistered { id: conn.id, name: conn.name.clone(), service: name })
                    .await;
            }
            Err(fault) => {
                self.answer(&conn.peer, call_id, Err(fault)).await;
            }
        }
    }

    async fn teardown(&self, conn: &Connection, reason: &str) {
        tracing::info!(id = %conn.id, module = %conn.name, %reason, state = "disconnecting");
        self.inner.connections.remove(&conn.id);
        self.emit(Event::ModuleDisconnecting { id: conn.id, name: conn.name.clone() }).await;
        self.inner.registry.remove(conn.id);

        // Fails every call forwarded to this module; the forwarding tasks relay the fault.
        conn.peer.close().await;

        self.emit(Event::ModuleShutdown { id: conn.id, name: conn.name.clone() }).await;
        tracing::debug!(id = %conn.id, state = "closed");
    }

    // ========================================================================
    //  Routing
    // ========================================================================

    async fn route_call(&self, caller: &Connection, call_id: u32, invocation: Invocation<'_>) {
        tracing::debug!(
            from = %caller.id,
            to = %invocation.to,
            service = invocation.service,
            selector = invocation.selector,
            call_id,
            "routing call"
        );

        if invocation.to == ModuleId::BROKER {
            let broker = self.clone();
            let peer = caller.peer.clone();
            let service = invocation.service.to_string();
            let selector = invocation.selector.to_string();
            let args = invocation.args.to_vec();
            tokio::spawn(async move {
                let (result, after) = system::call(&broker, &service, &selector, &args).await;
                broker.answer(&peer, call_id, result).await;
                broker.finish(after);
            });
            return;
        }

        let route = match self.resolve_route(caller.id, &invocation) {
            Ok(route) => route,
            Err(fault) => {
                self.answer(&caller.peer, call_id, Err(fault)).await;
                return;
            }
        };

        let broker = self.clone();
        let caller = caller.peer.clone();
        tokio::spawn(async move {
            let result = route.target.call(|forward_id| route.encode(Some(forward_id))).await;
            broker.answer(&caller, call_id, result).await;
        });
    }

    async fn route_send(&self, caller: &Connection, invocation: Invocation<'_>) {
        if invocation.to == ModuleId::BROKER {
            let broker = self.clone();
            let service = invocation.service.to_string();
            let selector = invocation.selector.to_string();
            let args = invocation.args.to_vec();
            tokio::spawn(async move {
                let (result, after) = system::call(&broker, &service, &selector, &args).await;
                if let Err(fault) = result {
                    tracing::debug!(%fault, "one-way system call failed");
                }
                broker.finish(after);
            });
            return;
        }

        let result = match self.resolve_route(caller.id, &invocation) {
            Ok(route) => match route.encode(None) {
                Ok(payload) => route.target.send(&payload).await,
                Err(fault) => Err(fault),
            },
            Err(fault) => Err(fault),
        };
        if let Err(fault) = result {
            tracing::debug!(from = %caller.id, %fault, "dropping one-way call");
        }
    }

    fn finish(&self, after: system::After) {
        match after {
            system::After::Nothing => {}
            system::After::Shutdown => self.shutdown(),
        }
    }

    /// Finds the target connection and the method an invocation picks.
    fn resolve_route(&self, from: ModuleId, invocation: &Invocation<'_>) -> Result<Route, Fault> {
        let target = self
            .inner
            .connections
            .get(&invocation.to)
            .map(|c| c.peer.clone())
            .ok_or_else(|| module_not_found(invocation.to))?;
        let method = self.inner.registry.resolve(invocation.to, invocation.service, invocation.selector)?;

        Ok(Route {
            target,
            from,
            to: invocation.to,
            service: invocation.service.to_string(),
            selector: method.signature.to_string(),
            args: invocation.args.to_vec(),
        })
    }

    /// Sends the outcome of a call back to whoever made it. Returns false if the
    /// caller is gone.
    async fn answer(&self, peer: &Peer, call_id: u32, result: CallResult) -> bool {
        let payload = match peer::encode_answer(call_id, result) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = peer.name(), call_id, error = %e, "cannot encode answer");
                return false;
            }
        };
        match peer.send(&payload).await {
            Ok(()) => true,
            Err(fault) => {
                tracing::debug!(peer = peer.name(), call_id, %fault, "caller is gone");
                false
            }
        }
    }

    // ========================================================================
    //  Events
    // ========================================================================

    /// Notifies local listeners and every other connected module.
    async fn emit(&self, event: Event) {
        tracing::debug!(%event, "event");
        self.inner.listeners.dispatch(&event);

        let payload = match Frame::Event(event.clone()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(%event, error = %e, "cannot encode event");
                return;
            }
        };
        let about = event.module_id();
        let peers: Vec<Arc<Peer>> = self
            .inner
            .connections
            .iter()
            .filter(|c| Some(c.id) != about)
            .map(|c| c.peer.clone())
            .collect();
        for peer in peers {
            let _ = peer.send(&payload).await;
        }
    }

    // ========================================================================
    //  Module management
    // ========================================================================

    /// Declares a module so that lookups can find or start it.
    pub async fn register_module(&self, descriptor: ModuleDescriptor) -> Result<(), Fault> {
        if descriptor.name.is_empty() || descriptor.name == BROKER_MODULE_NAME {
            return Err(Fault::new(
                FaultKind::DuplicateDefinition,
                format!("module name `{}` is reserved", descriptor.name),
            ));
        }
        let name = descriptor.name.clone();
        self.inner.registry.declare(descriptor);
        tracing::info!(module = %name, "module declared");
        self.emit(Event::ModuleRegistered { name }).await;
        Ok(())
    }

    /// Forgets a declaration. Instances already running keep running.
    pub async fn unregister_module(&self, name: &str) -> Result<(), Fault> {
        if name == BROKER_MODULE_NAME {
            return Err(Fault::new(FaultKind::DuplicateDefinition, "module name BROKER is reserved"));
        }
        if self.inner.registry.undeclare(name).is_none() {
            return Err(Fault::new(FaultKind::ModuleNotFound, format!("module `{}` is not declared", name)));
        }
        tracing::info!(module = %name, "module unregistered");
        Ok(())
    }

    /// Finds a running instance of the named module, starting one if its policy asks
    /// the broker to.
    pub async fn get_module_instance(&self, name: &str) -> Result<ModuleId, Fault> {
        if name == BROKER_MODULE_NAME {
            return Ok(ModuleId::BROKER);
        }

        let declaration = self.inner.registry.declaration(name);
        let policy = declaration.as_ref().map(|d| d.policy).unwrap_or_default();
        if policy != ManagementPolicy::MultiInstance {
            if let Some(id) = self.inner.registry.find_running(name) {
                return Ok(id);
            }
        }

        match declaration {
            Some(declaration) if policy.broker_managed() => self.start(&declaration).await,
            _ => Err(Fault::new(FaultKind::ModuleNotFound, format!("module `{}` is not running", name))),
        }
    }

    async fn start(&self, module: &ModuleDescriptor) -> Result<ModuleId, Fault> {
        let start_failure = |message: String| Fault::new(FaultKind::ModuleStartFailure, message);

        // Subscribe first so a fast module cannot connect unseen.
        let mut startups = self.inner.startups.subscribe();
        let address = self.address();
        tracing::info!(module = %module.name, broker = %address, "starting module");
        self.inner
            .launcher
            .launch(module, &address)
            .await
            .map_err(|e| start_failure(format!("cannot start `{}`: {:#}", module.name, e)))?;

        let wait = async {
            loop {
                match startups.recv().await {
                    Ok((name, id)) if name == module.name => return Ok(id),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(start_failure("broker is shutting down".to_string()));
                    }
                }
            }
        };

        let timeout = self.inner.config.start_timeout();
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(module = %module.name, ?timeout, "module did not connect in time");
                Err(start_failure(format!("`{}` did not connect within {:?}", module.name, timeout)))
            }
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}

fn encoded(value: &Value) -> CallResult {
    Ok(sbwrpc::encode(value)?)
}
