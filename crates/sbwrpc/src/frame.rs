//! # Protocol Frames
//!
//! The envelope of every message exchanged between a module and the broker.
//!
//! A frame is a flat sequence of Sbwpack items: a Byte kind followed by kind-specific
//! fields. Argument and result payloads are carried as single pre-encoded items so the
//! broker can route them without decoding.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Borrowed Payloads**: Decoded frames borrow strings and payloads from the input buffer.
//! - **Exact Length**: Trailing bytes after the last field are a protocol violation.

use crate::codec::{decode_any, encode_value};
use crate::descriptor::{ManagementPolicy, ModuleDescriptor, ModuleId, ServiceDescriptor};
use crate::error::{Error, Fault, FaultKind, Result};
use crate::value::Value;

use sbwpack::{Decoder, Encoder, Tag};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Reply = 0,
    Send = 1,
    Call = 2,
    Fault = 3,
    Hello = 4,
    RegisterService = 5,
    Event = 6,
    Disconnect = 7,
}

impl Kind {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Kind::Reply,
            1 => Kind::Send,
            2 => Kind::Call,
            3 => Kind::Fault,
            4 => Kind::Hello,
            5 => Kind::RegisterService,
            6 => Kind::Event,
            7 => Kind::Disconnect,
            other => return Err(Error::ProtocolViolation(format!("unknown frame kind {}", other))),
        })
    }
}

/// Addressing and payload of a Call or Send.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<'a> {
    pub from: ModuleId,
    pub to: ModuleId,
    pub service: &'a str,
    /// A selector string; see `Selector::parse`.
    pub selector: &'a str,
    /// One encoded List item holding the arguments.
    pub args: &'a [u8],
}

/// Lifecycle notifications broadcast by the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A module was declared to the broker (it may not be running).
    ModuleRegistered { name: String },
    ModuleConnected { id: ModuleId, name: String },
    ServiceRegistered { id: ModuleId, name: String, service: String },
    ModuleDisconnecting { id: ModuleId, name: String },
    ModuleShutdown { id: ModuleId, name: String },
}

impl Event {
    fn code(&self) -> u8 {
        match self {
            Event::ModuleRegistered { .. } => 0,
            Event::ModuleConnected { .. } => 1,
            Event::ServiceRegistered { .. } => 2,
            Event::ModuleDisconnecting { .. } => 3,
            Event::ModuleShutdown { .. } => 4,
        }
    }

    /// The module the event is about, if it has a running instance.
    pub fn module_id(&self) -> Option<ModuleId> {
        match self {
            Event::ModuleRegistered { .. } => None,
            Event::ModuleConnected { id, .. }
            | Event::ServiceRegistered { id, .. }
            | Event::ModuleDisconnecting { id, .. }
            | Event::ModuleShutdown { id, .. } => Some(*id),
        }
    }

    pub fn module_name(&self) -> &str {
        match self {
            Event::ModuleRegistered { name }
            | Event::ModuleConnected { name, .. }
            | Event::ServiceRegistered { name, .. }
            | Event::ModuleDisconnecting { name, .. }
            | Event::ModuleShutdown { name, .. } => name,
        }
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.byte(self.code())?;
        match self {
            Event::ModuleRegistered { name } => enc.str(name)?,
            Event::ModuleConnected { id, name }
            | Event::ModuleDisconnecting { id, name }
            | Event::ModuleShutdown { id, name } => {
                write_id(enc, *id)?;
                enc.str(name)?;
            }
            Event::ServiceRegistered { id, name, service } => {
                write_id(enc, *id)?;
                enc.str(name)?;
                enc.str(service)?;
            }
        }
        Ok(())
    }

    fn decode(dec: &mut Decoder) -> Result<Self> {
        let code = dec.byte()?;
        if code == 0 {
            return Ok(Event::ModuleRegistered { name: dec.str()?.to_string() });
        }
        let id = read_id(dec)?;
        let name = dec.str()?.to_string();
        Ok(match code {
            1 => Event::ModuleConnected { id, name },
            2 => Event::ServiceRegistered { id, name, service: dec.str()?.to_string() },
            3 => Event::ModuleDisconnecting { id, name },
            4 => Event::ModuleShutdown { id, name },
            other => return Err(Error::ProtocolViolation(format!("unknown event {}", other))),
        })
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::ModuleRegistered { name } => write!(f, "module {} registered", name),
            Event::ModuleConnected { id, name } => write!(f, "{} ({}) connected", name, id),
            Event::ServiceRegistered { id, name, service } => {
                write!(f, "{} ({}) registered service {}", name, id, service)
            }
            Event::ModuleDisconnecting { id, name } => write!(f, "{} ({}) disconnecting", name, id),
            Event::ModuleShutdown { id, name } => write!(f, "{} ({}) shut down", name, id),
        }
    }
}

/// A decoded message. Borrowed fields point into the buffer it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<'a> {
    Call { call_id: u32, invocation: Invocation<'a> },
    /// A one-way invocation; never answered.
    Send(Invocation<'a>),
    /// `result` is exactly one encoded item.
    Reply { call_id: u32, result: &'a [u8] },
    Fault { call_id: u32, fault: Fault },
    /// The first frame of every module connection.
    Hello { call_id: u32, module: ModuleDescriptor, services: Vec<ServiceDescriptor> },
    RegisterService { call_id: u32, service: ServiceDescriptor },
    Event(Event),
    Disconnect,
}

fn write_id(enc: &mut Encoder, id: ModuleId) -> Result<()> {
    enc.integer(id.0 as i32)?;
    Ok(())
}

fn read_id(dec: &mut Decoder) -> Result<ModuleId> {
    Ok(ModuleId(dec.integer()? as u32))
}

fn write_invocation(enc: &mut Encoder, inv: &Invocation) -> Result<()> {
    write_id(enc, inv.from)?;
    write_id(enc, inv.to)?;
    enc.str(inv.service)?;
    enc.str(inv.selector)?;
    if Decoder::new(inv.args).peek_tag()? != Tag::List {
        return Err(Error::ProtocolViolation("Arguments must be a list".into()));
    }
    enc.item(inv.args)?;
    Ok(())
}

fn read_invocation<'a>(dec: &mut Decoder<'a>) -> Result<Invocation<'a>> {
    let from = read_id(dec)?;
    let to = read_id(dec)?;
    let service = dec.str()?;
    let selector = dec.str()?;
    if dec.peek_tag()? != Tag::List {
        return Err(Error::ProtocolViolation("Arguments must be a list".into()));
    }
    let args = dec.item()?;
    Ok(Invocation { from, to, service, selector, args })
}

impl<'a> Frame<'a> {
    pub fn kind(&self) -> Kind {
        match self {
            Frame::Call { .. } => Kind::Call,
            Frame::Send(_) => Kind::Send,
            Frame::Reply { .. } => Kind::Reply,
            Frame::Fault { .. } => Kind::Fault,
            Frame::Hello { .. } => Kind::Hello,
            Frame::RegisterService { .. } => Kind::RegisterService,
            Frame::Event(_) => Kind::Event,
            Frame::Disconnect => Kind::Disconnect,
        }
    }

    /// The call this frame belongs to, for frames that open or answer a call.
    pub fn call_id(&self) -> Option<u32> {
        match self {
            Frame::Call { call_id, .. }
            | Frame::Reply { call_id, .. }
            | Frame::Fault { call_id, .. }
            | Frame::Hello { call_id, .. }
            | Frame::RegisterService { call_id, .. } => Some(*call_id),
            Frame::Send(_) | Frame::Event(_) | Frame::Disconnect => None,
        }
    }

    /// Encode this frame into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.byte(self.kind() as u8)?;

        match self {
            Frame::Call { call_id, invocation } => {
                enc.integer(*call_id as i32)?;
                write_invocation(&mut enc, invocation)?;
            }
            Frame::Send(invocation) => write_invocation(&mut enc, invocation)?,
            Frame::Reply { call_id, result } => {
                enc.integer(*call_id as i32)?;
                enc.item(result)?;
            }
            Frame::Fault { call_id, fault } => {
                enc.integer(*call_id as i32)?;
                enc.integer(fault.kind.code())?;
                enc.str(&fault.message)?;
            }
            Frame::Hello { call_id, module, services } => {
                enc.integer(*call_id as i32)?;
                enc.str(&module.name)?;
                enc.str(&module.display_name)?;
                enc.byte(module.policy.code())?;
                enc.str(&module.help)?;
                enc.list_begin()?;
                for service in services {
                    encode_value(&mut enc, &service.to_value())?;
                }
                enc.list_end()?;
            }
            Frame::RegisterService { call_id, service } => {
                enc.integer(*call_id as i32)?;
                encode_value(&mut enc, &service.to_value())?;
            }
            Frame::Event(event) => event.encode(&mut enc)?,
            Frame::Disconnect => {}
        }

        Ok(enc.into_bytes()?)
    }

    /// Decode a frame from a complete buffer.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let kind = Kind::from_u8(dec.byte()?)?;

        let frame = match kind {
            Kind::Call => {
                let call_id = dec.integer()? as u32;
                Frame::Call { call_id, invocation: read_invocation(&mut dec)? }
            }
            Kind::Send => Frame::Send(read_invocation(&mut dec)?),
            Kind::Reply => {
                let call_id = dec.integer()? as u32;
                Frame::Reply { call_id, result: dec.item()? }
            }
            Kind::Fault => {
                let call_id = dec.integer()? as u32;
                let code = dec.integer()?;
                let kind = FaultKind::from_code(code)
                    .ok_or_else(|| Error::ProtocolViolation(format!("unknown fault code {}", code)))?;
                let message = dec.str()?.to_string();
                Frame::Fault { call_id, fault: Fault { kind, message } }
            }
            Kind::Hello => {
                let call_id = dec.integer()? as u32;
                let mut module = ModuleDescriptor::new(dec.str()?, dec.str()?, ManagementPolicy::SelfManaged);
                module.policy = ManagementPolicy::from_code(dec.byte()?)?;
                module.help = dec.str()?.to_string();
                let mut services = Vec::new();
                let mut iter = dec.list()?;
                while let Some(mut item) = iter.next()? {
                    services.push(ServiceDescriptor::from_value(&decode_any(&mut item)?)?);
                }
                Frame::Hello { call_id, module, services }
            }
            Kind::RegisterService => {
                let call_id = dec.integer()? as u32;
                let service = ServiceDescriptor::from_value(&decode_any(&mut dec)?)?;
                Frame::RegisterService { call_id, service }
            }
            Kind::Event => Frame::Event(Event::decode(&mut dec)?),
            Kind::Disconnect => Frame::Disconnect,
        };

        dec.finish()?;
        Ok(frame)
    }
}

/// Builds a Reply frame for an already decoded result value.
pub fn reply(call_id: u32, result: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_value(&mut enc, result)?;
    let result = enc.into_bytes()?;
    Frame::Reply { call_id, result: &result }.encode()
}

/// Builds a Fault frame.
pub fn fault(call_id: u32, fault: Fault) -> Result<Vec<u8>> {
    Frame::Fault { call_id, fault }.encode()
}
