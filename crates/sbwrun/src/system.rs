//! # Broker System Service
//!
//! The broker answers calls addressed to module 0 itself, through a service named
//! `broker`. Modules reach it with ordinary Call frames, so discovery needs no frame
//! kinds of its own.

use std::sync::OnceLock;

use sbwrpc::ArrayValue;
use sbwrpc::Fault;
use sbwrpc::FaultKind;
use sbwrpc::ManagementPolicy;
use sbwrpc::MethodDescriptor;
use sbwrpc::MethodSignature;
use sbwrpc::ModuleDescriptor;
use sbwrpc::ModuleId;
use sbwrpc::Selector;
use sbwrpc::ServiceDescriptor;
use sbwrpc::Signature;
use sbwrpc::Value;
use sbwrpc::decode_args;
use sbwrpc::descriptor::command_from_value;
use sbwrpc::encode_result;

use crate::broker::Broker;
use crate::config::BROKER_MODULE_NAME;
use crate::peer::CallResult;
use crate::registry::module_not_found;

pub const SERVICE: &str = "broker";

const METHODS: &[(&str, &str)] = &[
    ("int getModuleInstance(string name)", "Finds or starts an instance of the named module."),
    ("{} getModuleDescriptor(int moduleId)", "Describes a running module instance."),
    ("{}[] getListOfModules()", "Describes every declared or running module."),
    (
        "{}[] getModuleDescriptors(boolean includeRunning)",
        "Describes declared modules, and optionally running ones never declared.",
    ),
    ("int getModuleStatus(string name)", "0 if unknown, 1 if declared, 2 if running."),
    ("int[] getExistingModuleInstanceIds()", "Ids of all running module instances."),
    ("{}[] getServiceDescriptors(int moduleId)", "Describes the services of a module instance."),
    ("{}[] getMethods(int moduleId, string service)", "Signatures and help of a service's methods."),
    (
        "string getMethodHelp(int moduleId, string service, string method)",
        "Help text of the method a selector picks.",
    ),
    (
        "{}[] findServices(string category, boolean recursive)",
        "Services in a category, optionally including subcategories.",
    ),
    ("string[] getServiceCategories(string parent)", "Immediate subcategories of a category."),
    (
        "void registerModule(string name, string displayName, int policy, string[] command, string help)",
        "Declares a module so it can be found or started later.",
    ),
    ("void unregisterModule(string name)", "Forgets a module declaration."),
    ("void shutdownBroker()", "Closes every connection and stops the broker."),
    ("string getVersion()", "Version of the broker."),
];

fn methods() -> &'static [MethodDescriptor] {
    static TABLE: OnceLock<Vec<MethodDescriptor>> = OnceLock::new();
    TABLE.get_or_init(|| {
        METHODS
            .iter()
            .filter_map(|(signature, help)| match MethodSignature::parse(signature) {
                Ok(signature) => Some(MethodDescriptor { signature, help: help.to_string() }),
                Err(e) => {
                    tracing::error!(%signature, error = %e, "bad system method signature");
                    None
                }
            })
            .collect()
    })
}

/// The descriptor under which module 0 is registered.
pub fn module_descriptor() -> ModuleDescriptor {
    let mut descriptor = ModuleDescriptor::new(BROKER_MODULE_NAME, "SBW Broker", ManagementPolicy::SelfManaged);
    descriptor.help = "Module registry and call router".to_string();
    descriptor
}

pub fn service_descriptor() -> ServiceDescriptor {
    let mut descriptor = ServiceDescriptor::new(SERVICE, "Broker", "system");
    descriptor.help = "Discovery and lifecycle of the module network".to_string();
    descriptor.methods = methods().to_vec();
    descriptor
}

/// What the broker does once a system call has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    Nothing,
    Shutdown,
}

/// Runs one system call and returns the encoded result item.
pub async fn call(broker: &Broker, service: &str, selector: &str, args: &[u8]) -> (CallResult, After) {
    match dispatch(broker, service, selector, args).await {
        Ok((result, after)) => (Ok(result), after),
        Err(fault) => (Err(fault), After::Nothing),
    }
}

async fn dispatch(broker: &Broker, service: &str, selector: &str, args: &[u8]) -> Result<(Vec<u8>, After), Fault> {
    if service != SERVICE {
        return Err(Fault::new(
            FaultKind::ServiceNotFound,
            format!("{} has no service `{}`", BROKER_MODULE_NAME, service),
        ));
    }
    let selector = Selector::parse(selector)?;
    let method = &methods()[selector.resolve(methods().iter().map(|m| &m.signature))?];
    let args = decode_args(args, &method.signature.params)?;

    tracing::debug!(method = %method.signature.name, "system call");
    let (result, after) = invoke(broker, &method.signature.name, args).await?;
    Ok((encode_result(&result, &method.signature.returns)?, after))
}

async fn invoke(broker: &Broker, name: &str, args: Vec<Value>) -> Result<(Value, After), Fault> {
    let registry = broker.registry();
    let value = match name {
        "getModuleInstance" => broker.get_module_instance(args[0].as_str()?).await?.to_value(),
        "getModuleDescriptor" => {
            let id = ModuleId::from_value(&args[0])?;
            registry.get(id).ok_or_else(|| module_not_found(id))?.descriptor.to_value()
        }
        "getListOfModules" => module_list(registry.modules(true))?,
        "getModuleDescriptors" => module_list(registry.modules(args[0].as_bool()?))?,
        "getModuleStatus" => Value::Integer(registry.status(args[0].as_str()?).code()),
        "getExistingModuleInstanceIds" => Value::integers(registry.ids().into_iter().map(|id| id.0 as i32))?,
        "getServiceDescriptors" => {
            let id = ModuleId::from_value(&args[0])?;
            let entry = registry.get(id).ok_or_else(|| module_not_found(id))?;
            list_array(entry.services.iter().map(ServiceDescriptor::to_value).collect())?
        }
        "getMethods" => {
            let service = registry.service(ModuleId::from_value(&args[0])?, args[1].as_str()?)?;
            list_array(service.methods.iter().map(MethodDescriptor::to_value).collect())?
        }
        "getMethodHelp" => {
            let id = ModuleId::from_value(&args[0])?;
            let method = registry.resolve(id, args[1].as_str()?, args[2].as_str()?)?;
            Value::String(method.help)
        }
        "findServices" => list_array(registry.find_services(args[0].as_str()?, args[1].as_bool()?))?,
        "getServiceCategories" => Value::strings(registry.categories(args[0].as_str()?))?,
        "registerModule" => {
            broker.register_module(declared_module(&args)?).await?;
            Value::Void
        }
        "unregisterModule" => {
            broker.unregister_module(args[0].as_str()?).await?;
            Value::Void
        }
        "shutdownBroker" => return Ok((Value::Void, After::Shutdown)),
        "getVersion" => Value::String(env!("CARGO_PKG_VERSION").to_string()),
        other => return Err(Fault::new(FaultKind::MethodNotFound, format!("no system method `{}`", other))),
    };
    Ok((value, After::Nothing))
}

fn declared_module(args: &[Value]) -> Result<ModuleDescriptor, Fault> {
    let code = args[2].as_integer()?;
    let policy = u8::try_from(code)
        .map_err(|_| Fault::protocol(format!("unknown management policy {}", code)))
        .and_then(|code| ManagementPolicy::from_code(code).map_err(Fault::from))?;

    let mut descriptor = ModuleDescriptor::new(args[0].as_str()?, args[1].as_str()?, policy);
    descriptor.command = command_from_value(&args[3])?;
    descriptor.help = args[4].as_str()?.to_string();
    Ok(descriptor)
}

fn module_list(modules: Vec<ModuleDescriptor>) -> Result<Value, Fault> {
    list_array(modules.iter().map(ModuleDescriptor::to_value).collect())
}

fn list_array(items: Vec<Value>) -> Result<Value, Fault> {
    Ok(Value::Array(ArrayValue::vector(Signature::any_list(), items)?))
}
