//! # SbwRPC
//!
//! The typed call protocol spoken between modules and the broker, layered over Sbwpack.
//!
//! ## Architecture
//!
//! - `signature`: structural type descriptors, method signatures and selectors, with a parser
//!   for the textual `"double sin(double)"` syntax.
//! - `value`: dynamically typed values that carry their own signature.
//! - `codec`: strict value encoding and signature-directed decoding.
//! - `descriptor`: module and service metadata as exchanged with the broker.
//! - `frame`: the envelope for every message on a connection.
//! - `error`: local errors and the wire-level `Fault`.

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod signature;
pub mod value;

pub use codec::{decode, decode_args, decode_result, encode, encode_args, encode_result};
pub use descriptor::{ManagementPolicy, MethodDescriptor, ModuleDescriptor, ModuleId, ModuleStatus, ServiceDescriptor};
pub use error::{Error, Fault, FaultKind, Result};
pub use frame::{Event, Frame, Invocation};
pub use signature::{Atomic, Element, MethodSignature, Selector, Signature};
pub use value::{ArrayValue, Value};
