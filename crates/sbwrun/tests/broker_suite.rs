//! End-to-end scenarios: a broker with modules attached over in-memory transports.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;

use sbwrpc::Event;
use sbwrpc::Fault;
use sbwrpc::FaultKind;
use sbwrpc::ManagementPolicy;
use sbwrpc::ModuleDescriptor;
use sbwrpc::ModuleId;
use sbwrpc::ModuleStatus;
use sbwrpc::Value;
use sbwrun::Broker;
use sbwrun::BrokerConfig;
use sbwrun::Module;
use sbwrun::ModuleConfig;
use sbwrun::ServiceObject;
use sbwrun::channel::DuplexChannelTransport;
use sbwrun::config::ModuleDeclaration;
use sbwrun::launcher::Launcher;
use sbwrun::tcp::TcpAcceptor;
use sbwrun::transport::Transport;

const WAIT: Duration = Duration::from_secs(5);

async fn join(broker: &Broker, module: &Module) -> Result<ModuleId, Fault> {
    let (broker_end, module_end) = DuplexChannelTransport::pair();
    broker.attach(Box::new(broker_end));
    module.connect_with(Box::new(module_end)).await
}

fn plain(name: &str) -> Module {
    Module::new(name, name, ManagementPolicy::SelfManaged)
}

fn trig_service(calls: Arc<AtomicUsize>) -> Result<ServiceObject, Fault> {
    let mut trig = ServiceObject::new("trig", "Trigonometry", "math/trig").help("Trigonometric functions");
    trig.add_method("double sin(double x)", "Sine of x", move |args| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Double(args[0].as_double()?.sin()))
    })?
    .add_method("double cos(double x)", "Cosine of x", |args| Ok(Value::Double(args[0].as_double()?.cos())))?;
    Ok(trig)
}

/// Listener that forwards every event to a channel.
fn event_sink() -> (impl Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |event: &Event| -> anyhow::Result<()> {
        tx.send(event.clone())?;
        Ok(())
    };
    (listener, rx)
}

async fn next_matching(rx: &mut mpsc::UnboundedReceiver<Event>, wanted: impl Fn(&Event) -> bool) -> Option<Event> {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if wanted(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

// ============================================================================
//  CALLS
// ============================================================================

#[tokio::test]
async fn test_trig_end_to_end() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let provider = plain("edu.demo.trig");
    provider.add_service(trig_service(calls.clone())?).await?;
    let provider_id = join(&broker, &provider).await?;
    assert_eq!(provider.module_id(), Some(provider_id));

    let caller = plain("caller");
    join(&broker, &caller).await?;

    let trig = caller.get_module_instance("edu.demo.trig").await?;
    assert_eq!(trig.id(), provider_id);
    let service = trig.get_service("trig").await?;
    assert_eq!(service.descriptor().category, "math/trig");

    let sin = service.get_method("sin")?;
    assert_eq!(sin.help(), "Sine of x");
    assert_eq!(sin.call(&[Value::Double(0.0)]).await?, Value::Double(0.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let err = sin.call(&[Value::from("x")]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::TypeMismatch);
    let err = sin.call(&[]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::TypeMismatch);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let cos = service.get_method("double cos(double)")?;
    assert_eq!(cos.call(&[Value::Double(0.0)]).await?, Value::Double(1.0));
    Ok(())
}

#[tokio::test]
async fn test_routing_faults() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let provider = plain("edu.demo.trig");
    provider.add_service(trig_service(Arc::new(AtomicUsize::new(0)))?).await?;
    let provider_id = join(&broker, &provider).await?;
    let caller = plain("caller");
    join(&broker, &caller).await?;

    let missing = caller.module(ModuleId(99))?;
    let err = tokio::time::timeout(WAIT, missing.call("trig", "sin", &[Value::Double(0.0)])).await?.unwrap_err();
    assert_eq!(err.kind, FaultKind::ModuleNotFound);

    let trig = caller.module(provider_id)?;
    let err = trig.call("stats", "mean", &[]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::ServiceNotFound);
    let err = trig.call("trig", "tan", &[Value::Double(0.0)]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::MethodNotFound);
    let err = trig.call("trig", "sin(double", &[Value::Double(0.0)]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::SignatureSyntax);
    let err = trig.call("trig", "sin(double)", &[Value::from("x")]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::TypeMismatch);

    let err = caller.get_module_instance("edu.demo.plot").await.err().expect("plot is not running");
    assert_eq!(err.kind, FaultKind::ModuleNotFound);
    let trig_handle = caller.get_module_instance("edu.demo.trig").await?;
    let err = trig_handle.get_service("stats").await.err().expect("trig has no stats service");
    assert_eq!(err.kind, FaultKind::ServiceNotFound);

    assert_eq!(trig.call("trig", "sin(double)", &[Value::Double(0.0)]).await?, Value::Double(0.0));
    Ok(())
}

#[tokio::test]
async fn test_ambiguous_overloads_are_rejected() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());

    let mut overloads = ServiceObject::new("over", "Overloads", "test");
    overloads
        .add_method("double f(double)", "", |args| Ok(Value::Double(args[0].as_double()? * 2.0)))?
        .add_method("int f(int)", "", |args| Ok(Value::Integer(args[0].as_integer()? * 2)))?
        .add_method("int g({})", "", |args| Ok(Value::Integer(args[0].as_list()?.len() as i32)))?
        .add_method("int g({double})", "", |_| Ok(Value::Integer(-1)))?;
    let provider = plain("provider");
    provider.add_service(overloads).await?;
    let provider_id = join(&broker, &provider).await?;

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let service = caller.module(provider_id)?.get_service("over").await?;

    let err = service.get_method("f").err().expect("f is ambiguous");
    assert_eq!(err.kind, FaultKind::MethodAmbiguous);

    // Both `g({})` and `g({double})` accept a list holding one double.
    let err = service.invoke("g", &[Value::List(vec![Value::Double(1.0)])]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::MethodAmbiguous);

    assert_eq!(service.invoke("f", &[Value::Integer(4)]).await?, Value::Integer(8));
    assert_eq!(service.invoke("f", &[Value::Double(1.5)]).await?, Value::Double(3.0));
    assert_eq!(service.invoke("g", &[Value::List(vec![Value::from("a"), Value::from("b")])]).await?, Value::Integer(2));

    // A full signature names one overload, and the broker forwards it unchanged.
    let one_double = [Value::List(vec![Value::Double(1.0)])];
    assert_eq!(service.get_method("int g({})")?.call(&one_double).await?, Value::Integer(1));
    assert_eq!(service.get_method("int g({double})")?.call(&one_double).await?, Value::Integer(-1));
    let provider_handle = caller.module(provider_id)?;
    assert_eq!(provider_handle.call("over", "int g({double x})", &one_double).await?, Value::Integer(-1));
    assert_eq!(provider_handle.call("over", "int g({})", &one_double).await?, Value::Integer(1));
    Ok(())
}

#[tokio::test]
async fn test_handler_failures_become_application_faults() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());

    let mut faulty = ServiceObject::new("faulty", "Faulty", "test");
    faulty
        .add_method("int fail()", "", |_| anyhow::bail!("no luck"))?
        .add_method("int explode()", "", |_| panic!("kaboom"))?
        .add_method("int lie()", "", |_| Ok(Value::from("not an int")))?
        .add_method("int refuse()", "", |_| Err(Fault::new(FaultKind::ModuleStartFailure, "custom").into()))?
        .add_async_method("int later(int)", "", |args| async move {
            tokio::task::yield_now().await;
            anyhow::Ok(Value::Integer(args[0].as_integer()? + 1))
        })?;
    let provider = plain("provider");
    provider.add_service(faulty).await?;
    let provider_id = join(&broker, &provider).await?;

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let service = caller.module(provider_id)?.get_service("faulty").await?;

    let err = service.get_method("fail")?.call(&[]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::Application);
    assert!(err.message.contains("no luck"));

    let err = service.get_method("explode")?.call(&[]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::Application);
    assert!(err.message.contains("kaboom"));

    let err = service.get_method("lie")?.call(&[]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::TypeMismatch);

    let err = service.get_method("refuse")?.call(&[]).await.unwrap_err();
    assert_eq!(err, Fault::new(FaultKind::ModuleStartFailure, "custom"));

    assert_eq!(service.get_method("later")?.call(&[Value::Integer(1)]).await?, Value::Integer(2));
    Ok(())
}

#[tokio::test]
async fn test_one_way_sends() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut sink = ServiceObject::new("sink", "Sink", "test");
    sink.add_method("void put(string)", "", move |args| {
        tx.send(args[0].as_str()?.to_string())?;
        Ok(Value::Void)
    })?;
    let provider = plain("provider");
    provider.add_service(sink).await?;
    let provider_id = join(&broker, &provider).await?;

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let put = caller.module(provider_id)?.get_service("sink").await?.get_method("put")?;
    put.send(&[Value::from("hello")]).await?;
    assert_eq!(put.call(&[Value::from("world")]).await?, Value::Void);

    let mut received = vec![
        tokio::time::timeout(WAIT, rx.recv()).await?.expect("first"),
        tokio::time::timeout(WAIT, rx.recv()).await?.expect("second"),
    ];
    received.sort();
    assert_eq!(received, vec!["hello", "world"]);
    Ok(())
}

// ============================================================================
//  REGISTRATION
// ============================================================================

#[tokio::test]
async fn test_duplicate_definitions() -> anyhow::Result<()> {
    let mut trig = ServiceObject::new("trig", "Trig", "math/trig");
    trig.add_method("double sin(double)", "", |_| Ok(Value::Double(0.0)))?;
    let err = trig.add_method("double sin(double x)", "", |_| Ok(Value::Double(0.0))).err().expect("duplicate");
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);
    let err = trig.add_method("double sin(", "", |_| Ok(Value::Double(0.0))).err().expect("syntax");
    assert_eq!(err.kind, FaultKind::SignatureSyntax);
    trig.add_method("double sin(int)", "", |_| Ok(Value::Double(1.0)))?;
    assert_eq!(trig.descriptor().methods.len(), 2);

    let broker = Broker::new(BrokerConfig::default());
    let provider = plain("provider");
    provider.add_service(trig).await?;
    let err = provider.add_service(ServiceObject::new("trig", "Again", "math")).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);
    let provider_id = join(&broker, &provider).await?;

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let service = caller.module(provider_id)?.get_service("trig").await?;
    assert_eq!(service.get_method("sin(double)")?.call(&[Value::Double(5.0)]).await?, Value::Double(0.0));
    assert_eq!(service.get_method("sin(int)")?.call(&[Value::Integer(5)]).await?, Value::Double(1.0));
    Ok(())
}

#[tokio::test]
async fn test_services_added_after_connecting() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let provider = plain("provider");
    let provider_id = join(&broker, &provider).await?;

    let caller = plain("caller");
    let (listener, mut events) = event_sink();
    caller.add_listener(listener);
    join(&broker, &caller).await?;

    provider.add_service(trig_service(Arc::new(AtomicUsize::new(0)))?).await?;
    let event = next_matching(&mut events, |e| matches!(e, Event::ServiceRegistered { .. })).await;
    assert_eq!(
        event,
        Some(Event::ServiceRegistered { id: provider_id, name: "provider".into(), service: "trig".into() })
    );

    let sin = caller.module(provider_id)?.get_service("trig").await?.get_method("sin")?;
    assert_eq!(sin.call(&[Value::Double(0.0)]).await?, Value::Double(0.0));
    Ok(())
}

#[tokio::test]
async fn test_reserved_module_name_is_refused() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let impostor = plain("BROKER");
    let err = join(&broker, &impostor).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);
    assert!(!impostor.is_connected());
    assert_eq!(broker.modules(), vec![ModuleId::BROKER]);
    Ok(())
}

// ============================================================================
//  DISCONNECTS AND EVENTS
// ============================================================================

#[tokio::test]
async fn test_disconnect_fails_forwarded_calls() -> anyhow::Result<()> {
    const K: usize = 6;
    let broker = Broker::new(BrokerConfig::default());
    let started = Arc::new(AtomicUsize::new(0));

    let mut slow = ServiceObject::new("slow", "Slow", "test");
    let counter = started.clone();
    slow.add_async_method("void hang(int)", "Never returns", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            anyhow::Ok(Value::Void)
        }
    })?;
    let provider = plain("provider");
    provider.add_service(slow).await?;
    let provider_id = join(&broker, &provider).await?;

    let caller = plain("caller");
    let (listener, mut events) = event_sink();
    caller.add_listener(listener);
    join(&broker, &caller).await?;

    let hang = caller.module(provider_id)?.get_service("slow").await?.get_method("hang")?;
    let tasks: Vec<_> = (0..K as i32)
        .map(|i| {
            let hang = hang.clone();
            tokio::spawn(async move { hang.call(&[Value::Integer(i)]).await })
        })
        .collect();

    tokio::time::timeout(WAIT, async {
        while started.load(Ordering::SeqCst) < K {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(broker.pending_len(), K);

    provider.disconnect().await;
    for task in tasks {
        let result = tokio::time::timeout(WAIT, task).await??;
        assert_eq!(result.unwrap_err().kind, FaultKind::CommunicationFailure);
    }
    assert_eq!(broker.pending_len(), 0);
    assert!(!provider.is_connected());

    let event = next_matching(&mut events, |e| matches!(e, Event::ModuleShutdown { .. })).await;
    assert_eq!(event, Some(Event::ModuleShutdown { id: provider_id, name: "provider".into() }));

    let err = caller.module(provider_id)?.call("slow", "hang", &[Value::Integer(0)]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::ModuleNotFound);
    Ok(())
}

#[tokio::test]
async fn test_module_reconnects_after_disconnect() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let provider = plain("edu.demo.trig");
    provider.add_service(trig_service(Arc::new(AtomicUsize::new(0)))?).await?;
    let first = join(&broker, &provider).await?;
    assert!(join(&broker, &provider).await.is_err());

    provider.disconnect().await;
    assert!(!provider.is_connected());
    tokio::time::timeout(WAIT, async {
        while broker.registry().contains(first) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    let second = join(&broker, &provider).await?;
    assert_ne!(first, second);
    assert_eq!(provider.module_id(), Some(second));
    assert!(provider.is_connected());

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let trig = caller.get_module_instance("edu.demo.trig").await?;
    assert_eq!(trig.id(), second);
    let sin = trig.get_service("trig").await?.get_method("sin")?;
    assert_eq!(sin.call(&[Value::Double(0.0)]).await?, Value::Double(0.0));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_connections_that_never_authenticate() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let (broker_end, silent_end) = DuplexChannelTransport::pair();
    broker.attach(Box::new(broker_end));
    tokio::task::yield_now().await;

    broker.shutdown();
    let received = tokio::time::timeout(WAIT, silent_end.recv()).await??;
    assert_eq!(received, None);
    assert_eq!(broker.modules(), vec![ModuleId::BROKER]);
    Ok(())
}

#[tokio::test]
async fn test_failing_listener_does_not_block_others() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    broker.add_listener(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("always fails") });
    broker.add_listener(|_: &Event| -> anyhow::Result<()> { panic!("always panics") });
    let (listener, mut events) = event_sink();
    let id = broker.add_listener(listener);

    let module = plain("observed");
    let module_id = join(&broker, &module).await?;
    let event = next_matching(&mut events, |e| matches!(e, Event::ModuleConnected { .. })).await;
    assert_eq!(event, Some(Event::ModuleConnected { id: module_id, name: "observed".into() }));

    assert!(broker.remove_listener(id));
    assert!(!broker.remove_listener(id));
    Ok(())
}

// ============================================================================
//  MODULE MANAGEMENT
// ============================================================================

/// Launcher that starts nothing.
struct InertLauncher;

#[async_trait::async_trait]
impl Launcher for InertLauncher {
    async fn launch(&self, _: &ModuleDescriptor, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Launcher that hands launch requests to the test.
struct ChannelLauncher {
    requests: mpsc::UnboundedSender<ModuleDescriptor>,
}

#[async_trait::async_trait]
impl Launcher for ChannelLauncher {
    async fn launch(&self, module: &ModuleDescriptor, _: &str) -> anyhow::Result<()> {
        self.requests.send(module.clone())?;
        Ok(())
    }
}

/// Launcher that records the broker address each launch was given.
struct AddressLauncher {
    addresses: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl Launcher for AddressLauncher {
    async fn launch(&self, _: &ModuleDescriptor, broker: &str) -> anyhow::Result<()> {
        self.addresses.send(broker.to_string())?;
        Ok(())
    }
}

fn managed_config(name: &str, policy: ManagementPolicy, start_timeout_ms: u64) -> BrokerConfig {
    BrokerConfig {
        start_timeout_ms,
        modules: vec![ModuleDeclaration {
            name: name.to_string(),
            display_name: None,
            policy,
            command: vec!["sbwd".into(), "trig".into()],
            help: String::new(),
        }],
        ..BrokerConfig::default()
    }
}

#[tokio::test]
async fn test_managed_module_that_never_connects() -> anyhow::Result<()> {
    let config = managed_config("edu.demo.lazy", ManagementPolicy::Unique, 100);
    let broker = Broker::with_launcher(config, Arc::new(InertLauncher));
    let caller = plain("caller");
    join(&broker, &caller).await?;

    let started = tokio::time::Instant::now();
    let err = caller.get_module_instance("edu.demo.lazy").await.err().expect("lazy never connects");
    assert_eq!(err.kind, FaultKind::ModuleStartFailure);
    assert!(started.elapsed() >= Duration::from_millis(100));
    Ok(())
}

#[tokio::test]
async fn test_managed_module_started_on_demand() -> anyhow::Result<()> {
    let (requests, mut launched) = mpsc::unbounded_channel();
    let config = managed_config("edu.demo.trig", ManagementPolicy::Unique, 5_000);
    let broker = Broker::with_launcher(config, Arc::new(ChannelLauncher { requests }));

    let host = broker.clone();
    let spawner = tokio::spawn(async move {
        let mut started = Vec::new();
        while let Some(descriptor) = launched.recv().await {
            let module = Module::from_descriptor(descriptor);
            module.add_service(trig_service(Arc::new(AtomicUsize::new(0)))?).await?;
            join(&host, &module).await?;
            started.push(module);
        }
        anyhow::Ok(started.len())
    });

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let first = caller.get_module_instance("edu.demo.trig").await?;
    let second = caller.get_module_instance("edu.demo.trig").await?;
    assert_eq!(first.id(), second.id());

    let sin = first.get_service("trig").await?.get_method("sin")?;
    assert_eq!(sin.call(&[Value::Double(0.0)]).await?, Value::Double(0.0));

    drop(broker);
    drop(caller);
    spawner.abort();
    Ok(())
}

#[tokio::test]
async fn test_multi_instance_modules_start_every_time() -> anyhow::Result<()> {
    let (requests, mut launched) = mpsc::unbounded_channel();
    let config = managed_config("edu.demo.worker", ManagementPolicy::MultiInstance, 5_000);
    let broker = Broker::with_launcher(config, Arc::new(ChannelLauncher { requests }));

    let host = broker.clone();
    tokio::spawn(async move {
        let mut started = Vec::new();
        while let Some(descriptor) = launched.recv().await {
            let module = Module::from_descriptor(descriptor);
            if join(&host, &module).await.is_ok() {
                started.push(module);
            }
        }
    });

    let caller = plain("caller");
    join(&broker, &caller).await?;
    let first = caller.get_module_instance("edu.demo.worker").await?;
    let second = caller.get_module_instance("edu.demo.worker").await?;
    assert_ne!(first.id(), second.id());
    assert_eq!(first.descriptor().await?.name, "edu.demo.worker");
    Ok(())
}

// ============================================================================
//  SYSTEM SERVICE
// ============================================================================

#[tokio::test]
async fn test_discovery_through_the_system_service() -> anyhow::Result<()> {
    let broker = Broker::new(managed_config("edu.demo.plot", ManagementPolicy::Unique, 100));
    let provider = plain("edu.demo.trig");
    provider.add_service(trig_service(Arc::new(AtomicUsize::new(0)))?).await?;
    let provider_id = join(&broker, &provider).await?;
    let caller = plain("caller");
    let caller_id = join(&broker, &caller).await?;

    let names: Vec<String> = caller.list_modules().await?.into_iter().map(|m| m.name).collect();
    assert!(names.contains(&"BROKER".to_string()));
    assert!(names.contains(&"edu.demo.plot".to_string()));
    assert!(names.contains(&"edu.demo.trig".to_string()));

    let ids = caller.module_instance_ids().await?;
    assert_eq!(ids, vec![ModuleId::BROKER, provider_id, caller_id]);

    let found = caller.find_services("math", true).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].module, provider_id);
    assert_eq!(found[0].service, "trig");
    assert!(caller.find_services("math", false).await?.is_empty());

    assert_eq!(caller.service_categories("").await?, vec!["math", "system"]);
    assert_eq!(caller.service_categories("math").await?, vec!["trig"]);

    let system = caller.get_module_instance("BROKER").await?;
    assert_eq!(system.id(), ModuleId::BROKER);
    let help = system
        .call("broker", "getMethodHelp", &[provider_id.to_value(), Value::from("trig"), Value::from("cos")])
        .await?;
    assert_eq!(help, Value::from("Cosine of x"));
    let version = system.call("broker", "getVersion", &[]).await?;
    assert!(!version.as_str()?.is_empty());

    let mut stats = ModuleDescriptor::new("edu.demo.stats", "Statistics", ManagementPolicy::SelfManaged);
    stats.help = "Descriptive statistics".into();
    caller.register_module(&stats).await?;
    assert_eq!(broker.registry().declaration("edu.demo.stats"), Some(stats));

    let err = system.call("nope", "getVersion", &[]).await.unwrap_err();
    assert_eq!(err.kind, FaultKind::ServiceNotFound);
    Ok(())
}

#[tokio::test]
async fn test_module_status_and_descriptors() -> anyhow::Result<()> {
    let broker = Broker::with_launcher(
        managed_config("edu.demo.plot", ManagementPolicy::Unique, 100),
        Arc::new(InertLauncher),
    );
    let provider = plain("edu.demo.trig");
    join(&broker, &provider).await?;
    let caller = plain("caller");
    join(&broker, &caller).await?;

    assert_eq!(caller.module_status("edu.demo.plot").await?, ModuleStatus::Registered);
    assert_eq!(caller.module_status("edu.demo.trig").await?, ModuleStatus::Running);
    assert_eq!(caller.module_status("edu.demo.none").await?, ModuleStatus::Unregistered);

    let declared: Vec<String> = caller.module_descriptors(false).await?.into_iter().map(|m| m.name).collect();
    assert_eq!(declared, vec!["edu.demo.plot"]);
    let all: Vec<String> = caller.module_descriptors(true).await?.into_iter().map(|m| m.name).collect();
    for name in ["edu.demo.plot", "BROKER", "edu.demo.trig", "caller"] {
        assert!(all.contains(&name.to_string()), "{} missing from {:?}", name, all);
    }

    provider.disconnect().await;
    tokio::time::timeout(WAIT, async {
        while broker.registry().find_running("edu.demo.trig").is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(caller.module_status("edu.demo.trig").await?, ModuleStatus::Unregistered);
    Ok(())
}

#[tokio::test]
async fn test_declarations_managed_through_the_system_service() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let caller = plain("caller");
    join(&broker, &caller).await?;

    let mut stats = ModuleDescriptor::new("edu.demo.stats", "Statistics", ManagementPolicy::Unique);
    stats.command = vec!["/opt/sbw tools/stats".into(), "--label".into(), "two words".into()];
    caller.register_module(&stats).await?;
    assert_eq!(broker.registry().declaration("edu.demo.stats"), Some(stats.clone()));
    assert_eq!(caller.module_descriptors(false).await?, vec![stats]);

    caller.unregister_module("edu.demo.stats").await?;
    assert_eq!(broker.registry().declaration("edu.demo.stats"), None);
    assert_eq!(caller.module_status("edu.demo.stats").await?, ModuleStatus::Unregistered);

    let err = caller.unregister_module("edu.demo.stats").await.unwrap_err();
    assert_eq!(err.kind, FaultKind::ModuleNotFound);
    let err = caller.unregister_module("BROKER").await.unwrap_err();
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_requested_by_a_module() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let bystander = plain("bystander");
    join(&broker, &bystander).await?;
    let caller = plain("caller");
    join(&broker, &caller).await?;

    caller.shutdown_broker().await?;
    tokio::time::timeout(WAIT, caller.run_until_disconnected()).await?;
    tokio::time::timeout(WAIT, bystander.run_until_disconnected()).await?;
    assert!(!caller.is_connected());
    assert!(!bystander.is_connected());
    Ok(())
}

#[tokio::test]
async fn test_launched_modules_learn_the_bound_address() -> anyhow::Result<()> {
    let (addresses, mut launched) = mpsc::unbounded_channel();
    let config = BrokerConfig {
        listen: "0.0.0.0:0".to_string(),
        ..managed_config("edu.demo.lazy", ManagementPolicy::Unique, 100)
    };
    let broker = Broker::with_launcher(config, Arc::new(AddressLauncher { addresses }));
    let acceptor = TcpAcceptor::bind("0.0.0.0:0", 1 << 20).await?;
    let port = acceptor.local_addr()?.port();
    let server = broker.clone();
    let serving = tokio::spawn(async move { server.serve(acceptor).await });

    let caller = plain("caller");
    caller.connect(&ModuleConfig::new(format!("127.0.0.1:{}", port))).await?;
    let err = caller.get_module_instance("edu.demo.lazy").await.err().expect("lazy never connects");
    assert_eq!(err.kind, FaultKind::ModuleStartFailure);

    let address = tokio::time::timeout(WAIT, launched.recv()).await?.expect("one launch");
    assert_eq!(address, format!("127.0.0.1:{}", port));
    assert_eq!(broker.address(), address);

    broker.shutdown();
    tokio::time::timeout(WAIT, serving).await???;
    Ok(())
}

#[tokio::test]
async fn test_modules_over_tcp() -> anyhow::Result<()> {
    let broker = Broker::new(BrokerConfig::default());
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", 1 << 20).await?;
    let config = ModuleConfig::new(acceptor.local_addr()?.to_string());
    let server = broker.clone();
    let serving = tokio::spawn(async move { server.serve(acceptor).await });

    let provider = plain("edu.demo.trig");
    provider.add_service(trig_service(Arc::new(AtomicUsize::new(0)))?).await?;
    provider.connect(&config).await?;

    let caller = plain("caller");
    caller.connect(&config).await?;
    let sin = caller.get_module_instance("edu.demo.trig").await?.get_service("trig").await?.get_method("sin")?;
    assert_eq!(sin.call(&[Value::Double(0.0)]).await?, Value::Double(0.0));

    broker.shutdown();
    tokio::time::timeout(WAIT, serving).await???;
    tokio::time::timeout(WAIT, caller.run_until_disconnected()).await?;
    assert!(!caller.is_connected());
    Ok(())
}
