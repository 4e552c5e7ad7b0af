pub mod chain;
pub mod config;
pub mod connection;
pub mod decode;
pub mod loopback;
pub mod parameter;
pub mod registry;
pub mod session;
pub mod topic;

pub use zenoh::Result;

pub use chain::{
    CallbackChain, FireReport, HandlerError, attach_connect_chain, attach_message_chain,
};
pub use connection::{ConnectError, ConnectEvent, Connection, ConnectionState, ConnectionStatus, Message};
pub use decode::{DecodeError, ParamKind, ParamValue};
pub use parameter::{BoolParameter, FloatParameter, IntParameter, Parameter};
pub use registry::{ParameterInfo, ParameterRegistry};

pub trait Builder {
    type Output;
    fn build(self) -> Result<Self::Output>;
}
