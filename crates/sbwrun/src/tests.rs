//! Unit tests for the registry, listeners, configuration and transports.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use sbwrpc::Event;
use sbwrpc::Fault;
use sbwrpc::FaultKind;
use sbwrpc::ManagementPolicy;
use sbwrpc::MethodDescriptor;
use sbwrpc::MethodSignature;
use sbwrpc::ModuleDescriptor;
use sbwrpc::ModuleId;
use sbwrpc::ModuleStatus;
use sbwrpc::ServiceDescriptor;

use crate::channel::DuplexChannelTransport;
use crate::config::BrokerConfig;
use crate::listener::ListenerRegistry;
use crate::registry::Registry;
use crate::tcp::TcpAcceptor;
use crate::tcp::TcpTransport;
use crate::transport;
use crate::transport::Transport;

fn service(name: &str, category: &str, signatures: &[&str]) -> Result<ServiceDescriptor, Fault> {
    let mut service = ServiceDescriptor::new(name, name, category);
    for signature in signatures {
        service.methods.push(MethodDescriptor {
            signature: MethodSignature::parse(signature)?,
            help: format!("help for {}", signature),
        });
    }
    Ok(service)
}

fn module(name: &str) -> ModuleDescriptor {
    ModuleDescriptor::new(name, name, ManagementPolicy::SelfManaged)
}

// ============================================================================
//  REGISTRY
// ============================================================================

#[test]
fn test_registry_resolves_selectors() -> Result<(), Fault> {
    let registry = Registry::new();
    let trig = service("trig", "math/trig", &["double sin(double)", "double atan(double)", "double atan(double, double)"])?;
    registry.insert(ModuleId(1), module("trig"), vec![trig])?;

    let method = registry.resolve(ModuleId(1), "trig", "sin")?;
    assert_eq!(method.signature.to_string(), "double sin(double)");
    assert_eq!(method.help, "help for double sin(double)");

    let method = registry.resolve(ModuleId(1), "trig", "atan(double, double)")?;
    assert_eq!(method.signature.params.len(), 2);

    let err = registry.resolve(ModuleId(1), "trig", "atan").unwrap_err();
    assert_eq!(err.kind, FaultKind::MethodAmbiguous);
    let err = registry.resolve(ModuleId(1), "trig", "cos").unwrap_err();
    assert_eq!(err.kind, FaultKind::MethodNotFound);
    let err = registry.resolve(ModuleId(1), "stats", "sin").unwrap_err();
    assert_eq!(err.kind, FaultKind::ServiceNotFound);
    let err = registry.resolve(ModuleId(2), "trig", "sin").unwrap_err();
    assert_eq!(err.kind, FaultKind::ModuleNotFound);
    let err = registry.resolve(ModuleId(1), "trig", "sin(").unwrap_err();
    assert_eq!(err.kind, FaultKind::SignatureSyntax);
    Ok(())
}

#[test]
fn test_registry_rejects_duplicates() -> Result<(), Fault> {
    let registry = Registry::new();

    let clash = service("trig", "math", &["double sin(double)", "int sin(double x)"])?;
    let err = registry.insert(ModuleId(1), module("trig"), vec![clash]).unwrap_err();
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);
    assert!(!registry.contains(ModuleId(1)));

    let twice = vec![service("trig", "math", &[])?, service("trig", "math", &[])?];
    let err = registry.insert(ModuleId(1), module("trig"), twice).unwrap_err();
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);

    let overloads = service("trig", "math", &["double sin(double)", "double sin(int)"])?;
    registry.insert(ModuleId(1), module("trig"), vec![overloads])?;
    assert_eq!(registry.resolve(ModuleId(1), "trig", "sin(int)")?.signature.to_string(), "double sin(int)");
    assert_eq!(registry.resolve(ModuleId(1), "trig", "sin(double)")?.signature.to_string(), "double sin(double)");

    let err = registry.add_service(ModuleId(1), service("trig", "math", &[])?).unwrap_err();
    assert_eq!(err.kind, FaultKind::DuplicateDefinition);
    registry.add_service(ModuleId(1), service("stats", "math/stats", &["double mean(double[])"])?)?;
    assert_eq!(registry.get(ModuleId(1)).map(|e| e.services.len()), Some(2));
    Ok(())
}

#[test]
fn test_registry_instances() -> Result<(), Fault> {
    let registry = Registry::new();
    registry.insert(ModuleId(4), module("trig"), vec![])?;
    registry.insert(ModuleId(2), module("trig"), vec![])?;
    registry.insert(ModuleId(3), module("stats"), vec![])?;

    assert_eq!(registry.find_running("trig"), Some(ModuleId(2)));
    assert_eq!(registry.find_running("plot"), None);
    assert_eq!(registry.ids(), vec![ModuleId(2), ModuleId(3), ModuleId(4)]);

    assert!(registry.remove(ModuleId(2)).is_some());
    assert!(registry.remove(ModuleId(2)).is_none());
    assert_eq!(registry.find_running("trig"), Some(ModuleId(4)));
    Ok(())
}

#[test]
fn test_registry_categories() -> Result<(), Fault> {
    let registry = Registry::new();
    registry.insert(
        ModuleId(1),
        module("mathlib"),
        vec![
            service("trig", "math/trig", &[])?,
            service("stats", "math/stats", &[])?,
            service("fit", "math/stats/fit", &[])?,
        ],
    )?;
    registry.insert(ModuleId(2), module("plotter"), vec![service("plot", "/plot/", &[])?])?;

    assert_eq!(registry.categories(""), vec!["math", "plot"]);
    assert_eq!(registry.categories("math"), vec!["stats", "trig"]);
    assert_eq!(registry.categories("math/stats/"), vec!["fit"]);
    assert!(registry.categories("plot").is_empty());
    assert!(registry.categories("ma").is_empty());

    assert_eq!(registry.find_services("math", false).len(), 0);
    assert_eq!(registry.find_services("math", true).len(), 3);
    assert_eq!(registry.find_services("math/stats", false).len(), 1);
    assert_eq!(registry.find_services("plot", false).len(), 1);
    assert_eq!(registry.find_services("", true).len(), 4);
    Ok(())
}

#[test]
fn test_registry_declarations() {
    let registry = Registry::new();
    let mut trig = module("trig");
    trig.policy = ManagementPolicy::Unique;
    registry.declare(module("stats"));
    registry.declare(trig.clone());

    assert_eq!(registry.declaration("trig"), Some(trig));
    assert_eq!(registry.declaration("plot"), None);
    let names: Vec<String> = registry.declarations().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["stats", "trig"]);
}

#[test]
fn test_registry_module_status() -> Result<(), Fault> {
    let registry = Registry::new();
    registry.declare(module("trig"));
    registry.insert(ModuleId(3), module("adhoc"), vec![])?;

    assert_eq!(registry.status("trig"), ModuleStatus::Registered);
    assert_eq!(registry.status("adhoc"), ModuleStatus::Running);
    assert_eq!(registry.status("plot"), ModuleStatus::Unregistered);

    let declared: Vec<String> = registry.modules(false).into_iter().map(|d| d.name).collect();
    assert_eq!(declared, vec!["trig"]);
    let all: Vec<String> = registry.modules(true).into_iter().map(|d| d.name).collect();
    assert_eq!(all, vec!["trig", "adhoc"]);

    registry.insert(ModuleId(4), module("trig"), vec![])?;
    assert_eq!(registry.status("trig"), ModuleStatus::Running);
    assert_eq!(registry.modules(true).len(), 2);

    assert!(registry.undeclare("trig").is_some());
    assert!(registry.undeclare("trig").is_none());
    assert_eq!(registry.declaration("trig"), None);
    assert_eq!(registry.status("trig"), ModuleStatus::Running);
    registry.remove(ModuleId(4));
    assert_eq!(registry.status("trig"), ModuleStatus::Unregistered);
    Ok(())
}

// ============================================================================
//  LISTENERS
// ============================================================================

#[test]
fn test_failing_listeners_do_not_stop_delivery() {
    let listeners = ListenerRegistry::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    listeners.add(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("first listener fails") });
    listeners.add(|_: &Event| -> anyhow::Result<()> { panic!("second listener panics") });
    let counter = delivered.clone();
    listeners.add(move |_: &Event| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let event = Event::ModuleConnected { id: ModuleId(1), name: "trig".into() };
    assert_eq!(listeners.dispatch(&event), 2);
    assert_eq!(listeners.dispatch(&event), 2);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[test]
fn test_listener_removal() {
    let listeners = ListenerRegistry::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let id = listeners.add(move |_: &Event| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert_eq!(listeners.len(), 1);

    let event = Event::ModuleRegistered { name: "trig".into() };
    listeners.dispatch(&event);
    assert!(listeners.remove(id));
    assert!(!listeners.remove(id));
    listeners.dispatch(&event);

    assert!(listeners.is_empty());
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

// ============================================================================
//  CONFIGURATION
// ============================================================================

#[test]
fn test_config_defaults() -> anyhow::Result<()> {
    let config = BrokerConfig::from_toml_str("")?;
    assert_eq!(config, BrokerConfig::default());
    assert_eq!(config.listen, "127.0.0.1:10102");
    assert_eq!(config.start_timeout().as_secs(), 10);
    assert!(config.modules.is_empty());
    Ok(())
}

#[test]
fn test_config_modules() -> anyhow::Result<()> {
    let config = BrokerConfig::from_toml_str(
        r#"
        listen = "0.0.0.0:9000"
        start_timeout_ms = 250

        [[modules]]
        name = "edu.demo.trig"
        display_name = "Trigonometry"
        policy = "unique"
        command = ["sbwd", "trig"]

        [[modules]]
        name = "edu.demo.plot"
        "#,
    )?;
    assert_eq!(config.listen, "0.0.0.0:9000");
    assert_eq!(config.start_timeout().as_millis(), 250);

    let trig = config.modules[0].descriptor();
    assert_eq!(trig.display_name, "Trigonometry");
    assert_eq!(trig.policy, ManagementPolicy::Unique);
    assert_eq!(trig.command, vec!["sbwd", "trig"]);

    let plot = config.modules[1].descriptor();
    assert_eq!(plot.display_name, "edu.demo.plot");
    assert_eq!(plot.policy, ManagementPolicy::SelfManaged);
    Ok(())
}

#[test]
fn test_config_rejects_bad_declarations() {
    let cases = [
        "[[modules]]\nname = \"a\"\n[[modules]]\nname = \"a\"\n",
        "[[modules]]\nname = \"a\"\npolicy = \"multi-instance\"\n",
        "[[modules]]\nname = \"BROKER\"\n",
        "[[modules]]\nname = \"a\"\npolicy = \"sometimes\"\n",
        "listen = 5\n",
        "colour = \"blue\"\n",
    ];
    for case in cases {
        assert!(BrokerConfig::from_toml_str(case).is_err(), "accepted {:?}", case);
    }
}

// ============================================================================
//  TRANSPORTS
// ============================================================================

#[tokio::test]
async fn test_channel_transport_close_wakes_both_ends() -> transport::Result<()> {
    let (a, b) = DuplexChannelTransport::pair();
    a.send(b"one").await?;
    assert_eq!(b.recv().await?, Some(b"one".to_vec()));

    let a = Arc::new(a);
    let reader = a.clone();
    let pending = tokio::spawn(async move { reader.recv().await });
    tokio::task::yield_now().await;
    a.close().await;
    a.close().await;

    assert!(matches!(pending.await, Ok(Err(transport::Error::ConnectionLost(_)))));
    assert!(a.send(b"two").await.is_err());
    assert_eq!(b.recv().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_tcp_transport_preserves_frames() -> anyhow::Result<()> {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", 1024).await?;
    let addr = acceptor.local_addr()?.to_string();

    let client = TcpTransport::connect(&addr, 1024).await?;
    let (server, _) = acceptor.accept().await?;

    client.send(b"").await?;
    client.send(&[7u8; 1000]).await?;
    assert_eq!(server.recv().await?, Some(Vec::new()));
    assert_eq!(server.recv().await?, Some(vec![7u8; 1000]));

    let err = client.send(&[0u8; 1025]).await.unwrap_err();
    assert!(matches!(err, transport::Error::PayloadTooLarge { len: 1025, max: 1024 }));

    client.close().await;
    assert_eq!(server.recv().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_tcp_transport_rejects_oversized_frames() -> anyhow::Result<()> {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0", 16).await?;
    let addr = acceptor.local_addr()?.to_string();

    let client = TcpTransport::connect(&addr, 1024).await?;
    let (server, _) = acceptor.accept().await?;

    client.send(&[1u8; 17]).await?;
    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, transport::Error::PayloadTooLarge { len: 17, max: 16 }));
    Ok(())
}
