//! # Module Runtime
//!
//! The facade used by code that offers or consumes services.
//!
//! A `Module` owns a table of `ServiceObject`s, each a list of method signatures with the
//! handlers bound to them. Once connected, a dispatcher task serves incoming calls, each
//! on its own task, while any number of local tasks issue outgoing calls over the same
//! connection.
//!
//! Remote modules are reached through handles:
//!
//! `Module -> ModuleHandle -> ServiceHandle -> MethodHandle`
//!
//! ## Invariants
//! - A handler failure or panic becomes an `Application` fault for the caller; it never
//!   takes down the dispatcher.
//! - Arguments are checked against the method signature before a frame is sent.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;

use sbwrpc::Element;
use sbwrpc::Event;
use sbwrpc::Fault;
use sbwrpc::FaultKind;
use sbwrpc::Frame;
use sbwrpc::Invocation;
use sbwrpc::ManagementPolicy;
use sbwrpc::MethodDescriptor;
use sbwrpc::MethodSignature;
use sbwrpc::ModuleDescriptor;
use sbwrpc::ModuleId;
use sbwrpc::ModuleStatus;
use sbwrpc::Selector;
use sbwrpc::ServiceDescriptor;
use sbwrpc::Signature;
use sbwrpc::Value;
use sbwrpc::codec::check_args;
use sbwrpc::codec::decode_untyped;
use sbwrpc::descriptor::command_value;

use crate::config::ModuleConfig;
use crate::listener::Listener;
use crate::listener::ListenerId;
use crate::listener::ListenerRegistry;
use crate::peer;
use crate::peer::CallResult;
use crate::peer::Inbox;
use crate::peer::Peer;
use crate::registry;
use crate::system;
use crate::tcp::TcpTransport;
use crate::transport::Transport;

/// A bound method implementation.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

// ============================================================================
//  SERVICE OBJECTS
// ============================================================================

/// A service offered by this module: its descriptor plus one handler per method.
pub struct ServiceObject {
    descriptor: ServiceDescriptor,
    handlers: Vec<Handler>,
}

impl ServiceObject {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, category: impl Into<String>) -> Self {
        Self { descriptor: ServiceDescriptor::new(name, display_name, category), handlers: Vec::new() }
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.descriptor.help = help.into();
        self
    }

    /// Binds a handler to a signature such as `"double sin(double x)"`.
    ///
    /// Handlers receive arguments already checked against the parameter list. Returning an
    /// error answers the caller with an `Application` fault, unless the error is itself a
    /// `Fault`, which is passed on unchanged.
    pub fn add_method<F>(&mut self, signature: &str, help: &str, handler: F) -> Result<&mut Self, Fault>
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.bind(
            signature,
            help,
            Arc::new(move |args: Vec<Value>| {
                let handler = handler.clone();
                async move { handler(args) }.boxed()
            }),
        )
    }

    /// As `add_method`, for handlers that await.
    pub fn add_async_method<F, Fut>(&mut self, signature: &str, help: &str, handler: F) -> Result<&mut Self, Fault>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.bind(signature, help, Arc::new(move |args: Vec<Value>| handler(args).boxed()))
    }

    fn bind(&mut self, signature: &str, help: &str, handler: Handler) -> Result<&mut Self, Fault> {
        let signature = MethodSignature::parse(signature)?;
        if let Some(existing) = self.descriptor.signatures().find(|s| s.same_shape(&signature)) {
            return Err(Fault::new(
                FaultKind::DuplicateDefinition,
                format!("`{}` clashes with `{}` in service `{}`", signature, existing, self.descriptor.name),
            ));
        }
        self.descriptor.methods.push(MethodDescriptor { signature, help: help.to_string() });
        self.handlers.push(handler);
        Ok(self)
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

// ============================================================================
//  MODULE
// ============================================================================

/// The connection to the broker, once established.
#[derive(Clone)]
struct Link {
    id: ModuleId,
    peer: Arc<Peer>,
}

impl Link {
    async fn call(&self, to: ModuleId, service: &str, selector: &str, args: &[Value]) -> CallResult {
        let args = sbwrpc::encode_args(args)?;
        let from = self.id;
        self.peer
            .call(|call_id| {
                let invocation = Invocation { from, to, service, selector, args: &args };
                Ok(Frame::Call { call_id, invocation }.encode()?)
            })
            .await
    }

    async fn send(&self, to: ModuleId, service: &str, selector: &str, args: &[Value]) -> Result<(), Fault> {
        let args = sbwrpc::encode_args(args)?;
        let invocation = Invocation { from: self.id, to, service, selector, args: &args };
        self.peer.send(&Frame::Send(invocation).encode()?).await
    }

    /// Calls the broker's system service and decodes the result.
    async fn system(&self, selector: &str, args: &[Value]) -> Result<Value, Fault> {
        let bytes = self.call(ModuleId::BROKER, system::SERVICE, selector, args).await?;
        Ok(decode_untyped(&bytes)?)
    }
}

struct ModuleInner {
    descriptor: ModuleDescriptor,
    services: DashMap<String, Arc<ServiceObject>>,
    listeners: ListenerRegistry,
    /// The current connection. Replaced on reconnect once the previous one has closed.
    link: RwLock<Option<Link>>,
}

/// One participant in the module network. Cheap to clone.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, policy: ManagementPolicy) -> Self {
        Self::from_descriptor(ModuleDescriptor::new(name, display_name, policy))
    }

    pub fn from_descriptor(descriptor: ModuleDescriptor) -> Self {
        let inner = ModuleInner {
            descriptor,
            services: DashMap::new(),
            listeners: ListenerRegistry::new(),
            link: RwLock::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.inner.descriptor
    }

    /// The id the broker assigned on the most recent connection.
    pub fn module_id(&self) -> Option<ModuleId> {
        self.current_link().map(|l| l.id)
    }

    pub fn is_connected(&self) -> bool {
        self.current_link().is_some_and(|l| !l.peer.is_closed())
    }

    fn current_link(&self) -> Option<Link> {
        self.inner.link.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn link(&self) -> Result<Link, Fault> {
        match self.current_link() {
            Some(link) if !link.peer.is_closed() => Ok(link),
            Some(_) => Err(Fault::communication(format!("{} is disconnected", self.inner.descriptor.name))),
            None => Err(Fault::communication(format!("{} is not connected", self.inner.descriptor.name))),
        }
    }

    /// Offers a service. Before connecting this only records it; afterwards the broker
    /// is told as well, and the service is dropped again if the broker refuses it.
    pub async fn add_service(&self, service: ServiceObject) -> Result<(), Fault> {
        registry::validate_service(&service.descriptor)?;
        let descriptor = service.descriptor.clone();
        match self.inner.services.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => {
                return Err(Fault::new(
                    FaultKind::DuplicateDefinition,
                    format!("service `{}` is already defined", descriptor.name),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(service));
            }
        }

        let Ok(link) = self.link() else { return Ok(()) };
        let name = descriptor.name.clone();
        let registered = link
            .peer
            .call(|call_id| Ok(Frame::RegisterService { call_id, service: descriptor }.encode()?))
            .await;
        if let Err(fault) = registered {
            self.inner.services.remove(&name);
            return Err(fault);
        }
        tracing::debug!(module = %self.inner.descriptor.name, service = %name, "service registered");
        Ok(())
    }

    pub fn add_listener(&self, listener: impl Listener) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    // ========================================================================
    //  Connection
    // ========================================================================

    /// Connects to the broker over TCP and registers every service added so far. A module
    /// whose previous connection has ended may connect again and gets a fresh id.
    pub async fn connect(&self, config: &ModuleConfig) -> Result<ModuleId, Fault> {
        let transport = TcpTransport::connect(&config.broker, config.max_frame_len).await?;
        self.connect_with(Box::new(transport)).await
    }

    /// As `connect`, over an already established transport.
    pub async fn connect_with(&self, transport: Box<dyn Transport>) -> Result<ModuleId, Fault> {
        if self.is_connected() {
            return Err(Fault::protocol(format!("{} is already connected", self.inner.descriptor.name)));
        }

        let (peer, inbox) = Peer::new(self.inner.descriptor.name.clone(), transport);
        let peer = Arc::new(peer);
        let module = self.inner.descriptor.clone();
        let services: Vec<ServiceDescriptor> =
            self.inner.services.iter().map(|s| s.descriptor.clone()).collect();

        let hello = peer
            .call(|call_id| Ok(Frame::Hello { call_id, module, services }.encode()?))
            .await
            .and_then(|bytes| Ok(ModuleId::from_value(&sbwrpc::decode(&bytes, &Signature::integer())?)?));
        let id = match hello {
            Ok(id) => id,
            Err(fault) => {
                peer.close().await;
                return Err(fault);
            }
        };

        let raced = {
            let mut link = self.inner.link.write().unwrap_or_else(PoisonError::into_inner);
            if link.as_ref().is_some_and(|l| !l.peer.is_closed()) {
                true
            } else {
                *link = Some(Link { id, peer: peer.clone() });
                false
            }
        };
        if raced {
            peer.close().await;
            return Err(Fault::protocol(format!("{} is already connected", self.inner.descriptor.name)));
        }

        tracing::info!(module = %self.inner.descriptor.name, %id, "connected to broker");
        tokio::spawn(self.clone().dispatch(peer, inbox));
        Ok(id)
    }

    /// Tells the broker this module is leaving and closes the connection.
    pub async fn disconnect(&self) {
        let Some(link) = self.current_link() else { return };
        if link.peer.is_closed() {
            return;
        }
        if let Ok(payload) = Frame::Disconnect.encode() {
            let _ = link.peer.send(&payload).await;
        }
        link.peer.close().await;
        tracing::info!(module = %self.inner.descriptor.name, id = %link.id, "disconnected");
    }

    /// Resolves once the connection to the broker has ended.
    pub async fn run_until_disconnected(&self) {
        if let Some(link) = self.current_link() {
            link.peer.closed().await;
        }
    }

    // ========================================================================
    //  Discovery
    // ========================================================================

    /// Finds, or has the broker start, an instance of the named module.
    pub async fn get_module_instance(&self, name: &str) -> Result<ModuleHandle, Fault> {
        let link = self.link()?;
        let id = link.system("int getModuleInstance(string)", &[Value::from(name)]).await?;
        Ok(ModuleHandle { link, id: ModuleId::from_value(&id)? })
    }

    /// A handle to a module instance by id. Nothing is checked until it is used.
    pub fn module(&self, id: ModuleId) -> Result<ModuleHandle, Fault> {
        Ok(ModuleHandle { link: self.link()?, id })
    }

    pub async fn list_modules(&self) -> Result<Vec<ModuleDescriptor>, Fault> {
        let modules = self.link()?.system("getListOfModules", &[]).await?;
        let modules: sbwrpc::Result<Vec<ModuleDescriptor>> = modules.into_vector()?.iter().map(ModuleDescriptor::from_value).collect();
        Ok(modules?)
    }

    /// Declared modules, plus running ones never declared when `include_running` is set.
    pub async fn module_descriptors(&self, include_running: bool) -> Result<Vec<ModuleDescriptor>, Fault> {
        let modules = self.link()?.system("getModuleDescriptors", &[Value::from(include_running)]).await?;
        let modules: sbwrpc::Result<Vec<ModuleDescriptor>> = modules.into_vector()?.iter().map(ModuleDescriptor::from_value).collect();
        Ok(modules?)
    }

    pub async fn module_status(&self, name: &str) -> Result<ModuleStatus, Fault> {
        let code = self.link()?.system("getModuleStatus", &[Value::from(name)]).await?;
        Ok(ModuleStatus::from_code(code.as_integer()?)?)
    }

    pub async fn module_instance_ids(&self) -> Result<Vec<ModuleId>, Fault> {
        let ids = self.link()?.system("getExistingModuleInstanceIds", &[]).await?;
        let ids: sbwrpc::Result<Vec<ModuleId>> = ids.into_vector()?.iter().map(ModuleId::from_value).collect();
        Ok(ids?)
    }

    pub async fn find_services(&self, category: &str, recursive: bool) -> Result<Vec<ServiceSummary>, Fault> {
        let args = [Value::from(category), Value::from(recursive)];
        let found = self.link()?.system("findServices", &args).await?;
        let found: sbwrpc::Result<Vec<ServiceSummary>> = found.into_vector()?.iter().map(ServiceSummary::from_value).collect();
        Ok(found?)
    }

    pub async fn service_categories(&self, parent: &str) -> Result<Vec<String>, Fault> {
        let found = self.link()?.system("getServiceCategories", &[Value::from(parent)]).await?;
        let found: sbwrpc::Result<Vec<String>> = found.into_vector()?.into_iter().map(Value::into_string).collect();
        Ok(found?)
    }

    /// Declares a module to the broker so it can be found or started by name.
    pub async fn register_module(&self, descriptor: &ModuleDescriptor) -> Result<(), Fault> {
        let args = [
            Value::from(descriptor.name.as_str()),
            Value::from(descriptor.display_name.as_str()),
            Value::Integer(descriptor.policy.code() as i32),
            command_value(&descriptor.command),
            Value::from(descriptor.help.as_str()),
        ];
        self.link()?.system("registerModule", &args).await?;
        Ok(())
    }

    pub async fn unregister_module(&self, name: &str) -> Result<(), Fault> {
        self.link()?.system("unregisterModule", &[Value::from(name)]).await?;
        Ok(())
    }

    /// Asks the broker to close every connection, this one included, and stop.
    pub async fn shutdown_broker(&self) -> Result<(), Fault> {
        self.link()?.system("shutdownBroker", &[]).await?;
        Ok(())
    }

    // ========================================================================
    //  Dispatch
    // ========================================================================

    async fn dispatch(self, peer: Arc<Peer>, mut inbox: Inbox) {
        while let Some(msg) = inbox.recv().await {
            let frame = match Frame::decode(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(module = %self.inner.descriptor.name, error = %e, "malformed frame");
                    break;
                }
            };

            match frame {
                Frame::Call { call_id, invocation } => {
                    let incoming = Incoming::from(&invocation);
                    let module = self.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        let result = module.handle_invocation(&incoming).await;
                        match peer::encode_answer(call_id, result) {
                            Ok(payload) => {
                                if let Err(fault) = peer.send(&payload).await {
                                    tracing::debug!(call_id, %fault, "cannot deliver answer");
                                }
                            }
                            Err(e) => tracing::warn!(call_id, error = %e, "cannot encode answer"),
                        }
                    });
                }
                Frame::Send(invocation) => {
                    let incoming = Incoming::from(&invocation);
                    let module = self.clone();
                    tokio::spawn(async move {
                        if let Err(fault) = module.handle_invocation(&incoming).await {
                            tracing::warn!(
                                service = %incoming.service,
                                selector = %incoming.selector,
                                %fault,
                                "one-way call failed"
                            );
                        }
                    });
                }
                Frame::Event(event) => self.on_event(&event),
                Frame::Disconnect => {
                    tracing::info!(module = %self.inner.descriptor.name, "broker closed the connection");
                    break;
                }
                other => {
                    tracing::debug!(kind = ?other.kind(), "ignoring unexpected frame");
                }
            }
        }
        peer.close().await;
    }

    fn on_event(&self, event: &Event) {
        tracing::debug!(module = %self.inner.descriptor.name, %event, "event");
        self.inner.listeners.dispatch(event);
    }

    /// Runs the handler an invocation selects and encodes its result.
    async fn handle_invocation(&self, incoming: &Incoming) -> CallResult {
        let service = self.inner.services.get(&incoming.service).map(|s| s.value().clone()).ok_or_else(|| {
            Fault::new(
                FaultKind::ServiceNotFound,
                format!("{} has no service `{}`", self.inner.descriptor.name, incoming.service),
            )
        })?;

        let selector = Selector::parse(&incoming.selector)?;
        let index = selector.resolve(service.descriptor.signatures())?;
        let signature = &service.descriptor.methods[index].signature;
        let args = sbwrpc::decode_args(&incoming.args, &signature.params)?;
        let handler = service.handlers[index].clone();

        let outcome = AssertUnwindSafe(async move { handler(args).await }).catch_unwind().await;
        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                return Err(match e.downcast::<Fault>() {
                    Ok(fault) => fault,
                    Err(e) => Fault::application(format!("{:#}", e)),
                });
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::warn!(method = %signature, %message, "handler panicked");
                return Err(Fault::application(format!("`{}` panicked: {}", signature, message)));
            }
        };
        Ok(sbwrpc::encode_result(&value, &signature.returns)?)
    }
}

/// An owned copy of an invocation, handed to a worker task.
struct Incoming {
    service: String,
    selector: String,
    args: Vec<u8>,
}

impl From<&Invocation<'_>> for Incoming {
    fn from(invocation: &Invocation<'_>) -> Self {
        Self {
            service: invocation.service.to_string(),
            selector: invocation.selector.to_string(),
            args: invocation.args.to_vec(),
        }
    }
}

// ============================================================================
//  REMOTE HANDLES
// ============================================================================

/// A service found through discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSummary {
    pub module: ModuleId,
    pub module_name: String,
    pub service: String,
    pub display_name: String,
    pub category: String,
    pub help: String,
}

impl ServiceSummary {
    pub fn from_value(value: &Value) -> sbwrpc::Result<Self> {
        let fields = value.as_list()?;
        if fields.len() != 6 {
            return Err(sbwrpc::Error::ProtocolViolation(format!(
                "service summary has {} fields, expected 6",
                fields.len()
            )));
        }
        Ok(Self {
            module: ModuleId::from_value(&fields[0])?,
            module_name: fields[1].as_str()?.to_string(),
            service: fields[2].as_str()?.to_string(),
            display_name: fields[3].as_str()?.to_string(),
            category: fields[4].as_str()?.to_string(),
            help: fields[5].as_str()?.to_string(),
        })
    }
}

/// A remote module instance.
#[derive(Clone)]
pub struct ModuleHandle {
    link: Link,
    id: ModuleId,
}

impl ModuleHandle {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub async fn descriptor(&self) -> Result<ModuleDescriptor, Fault> {
        let value = self.link.system("getModuleDescriptor", &[self.id.to_value()]).await?;
        Ok(ModuleDescriptor::from_value(&value)?)
    }

    pub async fn services(&self) -> Result<Vec<ServiceDescriptor>, Fault> {
        let value = self.link.system("getServiceDescriptors", &[self.id.to_value()]).await?;
        let services: sbwrpc::Result<Vec<ServiceDescriptor>> = value.into_vector()?.iter().map(ServiceDescriptor::from_value).collect();
        Ok(services?)
    }

    pub async fn get_service(&self, name: &str) -> Result<ServiceHandle, Fault> {
        let descriptor = self.services().await?.into_iter().find(|s| s.name == name).ok_or_else(|| {
            Fault::new(FaultKind::ServiceNotFound, format!("{} has no service `{}`", self.id, name))
        })?;
        Ok(ServiceHandle { link: self.link.clone(), module: self.id, descriptor })
    }

    /// Calls a method by selector without checking arguments locally.
    pub async fn call(&self, service: &str, selector: &str, args: &[Value]) -> Result<Value, Fault> {
        let bytes = self.link.call(self.id, service, selector, args).await?;
        Ok(decode_untyped(&bytes)?)
    }
}

/// A service of a remote module.
#[derive(Clone)]
pub struct ServiceHandle {
    link: Link,
    module: ModuleId,
    descriptor: ServiceDescriptor,
}

impl ServiceHandle {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Picks one method of this service, e.g. `"sin"` or `"double sin(double)"`.
    pub fn get_method(&self, selector: &str) -> Result<MethodHandle, Fault> {
        let selector = Selector::parse(selector)?;
        let index = selector.resolve(self.descriptor.signatures())?;
        Ok(MethodHandle {
            link: self.link.clone(),
            module: self.module,
            service: self.descriptor.name.clone(),
            method: self.descriptor.methods[index].clone(),
        })
    }

    /// Calls the method named `name` whose parameters fit `args`. The broker resolves
    /// the overload, so arguments matching several of them fail with `MethodAmbiguous`.
    pub async fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, Fault> {
        let params = args.iter().map(|a| Element::new(a.signature())).collect();
        let selector = Selector::with_params(name, params).to_string();
        let bytes = self.link.call(self.module, &self.descriptor.name, &selector, args).await?;
        Ok(decode_untyped(&bytes)?)
    }
}

/// One method of a remote service.
#[derive(Clone)]
pub struct MethodHandle {
    link: Link,
    module: ModuleId,
    service: String,
    method: MethodDescriptor,
}

impl MethodHandle {
    pub fn signature(&self) -> &MethodSignature {
        &self.method.signature
    }

    pub fn help(&self) -> &str {
        &self.method.help
    }

    /// Calls the method and waits for its result.
    ///
    /// Arguments that do not fit the signature fail with `TypeMismatch` before anything
    /// is sent.
    pub async fn call(&self, args: &[Value]) -> Result<Value, Fault> {
        let signature = &self.method.signature;
        check_args(args, &signature.params)?;
        let bytes = self.link.call(self.module, &self.service, &signature.to_string(), args).await?;
        Ok(sbwrpc::decode_result(&bytes, &signature.returns)?)
    }

    /// Invokes the method without waiting for, or receiving, a result.
    pub async fn send(&self, args: &[Value]) -> Result<(), Fault> {
        let signature = &self.method.signature;
        check_args(args, &signature.params)?;
        self.link.send(self.module, &self.service, &signature.to_string(), args).await
    }
}
