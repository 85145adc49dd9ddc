//! Connection lifecycle
//!
//! - [`fsm`]: the pure state machine
//! - [`actor`]: the tokio task running it, and the [`ConnectionHandle`] to talk to it
//! - [`driver`]: protocol hooks a concrete transport implements
//! - [`command`] / [`status`]: the administrative command surface

pub mod actor;
pub mod command;
pub mod driver;
pub mod fsm;
pub mod status;

pub use actor::{ConnectionActor, ConnectionHandle};
pub use command::{CommandEnvelope, CommandKind, CommandReply, ConnectionCommand, RequestMeta, Requester};
pub use driver::{DriverEvents, ProtocolDriver, Publisher};
pub use fsm::{ClientEffect, ClientFsm, ClientInput, ClientState, ConnectOrigin, FsmSettings, TunnelEvent};
pub use status::{build_report, ConnectionStatusReport, ResourceKind, ResourceStatus};
