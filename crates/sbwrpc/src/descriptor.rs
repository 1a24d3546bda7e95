//! # Descriptors
//!
//! Module and service metadata. Descriptors travel as plain `Value` lists so the broker's
//! system service can hand them out unchanged.

use crate::error::{Error, Result};
use crate::signature::MethodSignature;
use crate::signature::Signature;
use crate::value::{ArrayValue, Value};

use serde::{Deserialize, Serialize};

/// Broker-assigned identifier of a running module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// The broker itself.
    pub const BROKER: ModuleId = ModuleId(0);

    pub fn to_value(self) -> Value {
        Value::Integer(self.0 as i32)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let id = value.as_integer()?;
        u32::try_from(id)
            .map(ModuleId)
            .map_err(|_| Error::ProtocolViolation(format!("negative module id {}", id)))
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "module-{}", self.0)
    }
}

/// Who starts instances of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagementPolicy {
    /// Started by hand; the broker never launches it.
    #[default]
    SelfManaged,
    /// Launched on demand by the broker; at most one instance is used.
    Unique,
    /// Launched by the broker for every instance request.
    MultiInstance,
}

impl ManagementPolicy {
    pub fn code(self) -> u8 {
        match self {
            ManagementPolicy::SelfManaged => 0,
            ManagementPolicy::Unique => 1,
            ManagementPolicy::MultiInstance => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ManagementPolicy::SelfManaged),
            1 => Ok(ManagementPolicy::Unique),
            2 => Ok(ManagementPolicy::MultiInstance),
            other => Err(Error::ProtocolViolation(format!("unknown management policy {}", other))),
        }
    }

    /// True if the broker is responsible for starting instances.
    pub fn broker_managed(self) -> bool {
        !matches!(self, ManagementPolicy::SelfManaged)
    }
}

/// What the broker knows about a module name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Neither declared nor connected.
    Unregistered,
    /// Declared (by configuration or `registerModule`) but no instance is connected.
    Registered,
    /// At least one instance is connected.
    Running,
}

impl ModuleStatus {
    pub fn code(self) -> i32 {
        match self {
            ModuleStatus::Unregistered => 0,
            ModuleStatus::Registered => 1,
            ModuleStatus::Running => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(ModuleStatus::Unregistered),
            1 => Ok(ModuleStatus::Registered),
            2 => Ok(ModuleStatus::Running),
            other => Err(Error::ProtocolViolation(format!("unknown module status {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    /// Unique module name, e.g. `"edu.demo.trig"`.
    pub name: String,
    pub display_name: String,
    pub policy: ManagementPolicy,
    /// Launch command for broker-managed modules.
    pub command: Vec<String>,
    pub help: String,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, policy: ManagementPolicy) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            policy,
            command: Vec::new(),
            help: String::new(),
        }
    }

    /// `{string name, string displayName, int policy, string[] command, string help}`
    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::String(self.name.clone()),
            Value::String(self.display_name.clone()),
            Value::Integer(self.policy.code() as i32),
            command_value(&self.command),
            Value::String(self.help.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let fields = fields(value, 5, "module descriptor")?;
        let code = fields[2].as_integer()?;
        let code = u8::try_from(code)
            .map_err(|_| Error::ProtocolViolation(format!("unknown management policy {}", code)))?;
        Ok(Self {
            name: fields[0].as_str()?.to_string(),
            display_name: fields[1].as_str()?.to_string(),
            policy: ManagementPolicy::from_code(code)?,
            command: command_from_value(&fields[3])?,
            help: fields[4].as_str()?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub signature: MethodSignature,
    pub help: String,
}

impl MethodDescriptor {
    /// `{string signature, string help}`
    pub fn to_value(&self) -> Value {
        Value::List(vec![Value::String(self.signature.to_string()), Value::String(self.help.clone())])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let fields = fields(value, 2, "method descriptor")?;
        Ok(Self {
            signature: MethodSignature::parse(fields[0].as_str()?)?,
            help: fields[1].as_str()?.to_string(),
        })
    }
}

/// A named collection of methods offered by one module.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    /// Unique within the owning module.
    pub name: String,
    pub display_name: String,
    /// Slash-delimited path, e.g. `"math/trig"`.
    pub category: String,
    pub help: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            category: category.into(),
            help: String::new(),
            methods: Vec::new(),
        }
    }

    pub fn signatures(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.iter().map(|m| &m.signature)
    }

    /// True if `category` equals this service's category or is one of its ancestors.
    pub fn in_category(&self, category: &str, recursive: bool) -> bool {
        let category = category.trim_matches('/');
        let own = self.category.trim_matches('/');
        if own == category {
            return true;
        }
        recursive
            && (category.is_empty()
                || own.strip_prefix(category).is_some_and(|rest| rest.starts_with('/')))
    }

    /// `{string name, string displayName, string category, string help, {}[] methods}`
    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::String(self.name.clone()),
            Value::String(self.display_name.clone()),
            Value::String(self.category.clone()),
            Value::String(self.help.clone()),
            Value::List(self.methods.iter().map(MethodDescriptor::to_value).collect()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let fields = fields(value, 5, "service descriptor")?;
        Ok(Self {
            name: fields[0].as_str()?.to_string(),
            display_name: fields[1].as_str()?.to_string(),
            category: fields[2].as_str()?.to_string(),
            help: fields[3].as_str()?.to_string(),
            methods: fields[4]
                .as_list()?
                .iter()
                .map(MethodDescriptor::from_value)
                .collect::<Result<_>>()?,
        })
    }

    /// The summary handed out by service discovery:
    /// `{int moduleId, string module, string service, string displayName, string category, string help}`
    pub fn summary(&self, module: ModuleId, module_name: &str) -> Value {
        Value::List(vec![
            module.to_value(),
            Value::String(module_name.to_string()),
            Value::String(self.name.clone()),
            Value::String(self.display_name.clone()),
            Value::String(self.category.clone()),
            Value::String(self.help.clone()),
        ])
    }
}

/// A launch command as `string[]`, one item per argument.
pub fn command_value(command: &[String]) -> Value {
    Value::Array(ArrayValue {
        element: Signature::string(),
        shape: vec![command.len() as u32],
        items: command.iter().cloned().map(Value::String).collect(),
    })
}

pub fn command_from_value(value: &Value) -> Result<Vec<String>> {
    let array = value.as_array()?;
    if array.shape().len() != 1 {
        return Err(Error::ProtocolViolation(format!("command has {} dimensions", array.shape().len())));
    }
    array.items().iter().map(|item| Ok(item.as_str()?.to_string())).collect()
}

fn fields<'v>(value: &'v Value, arity: usize, what: &str) -> Result<&'v [Value]> {
    let items = value.as_list()?;
    if items.len() != arity {
        return Err(Error::ProtocolViolation(format!(
            "{} has {} fields, expected {}",
            what,
            items.len(),
            arity
        )));
    }
    Ok(items)
}
