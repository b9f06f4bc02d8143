//! FolioChat Client
//!
//! Connection channel, answer assembly, turn coordination and the rate
//! gate, wired together by a single driver task. Front ends talk to it
//! through a `ClientHandle` and watch a `ViewState`.

pub mod channel;
pub mod coordinator;
pub mod dispatcher;
pub mod gate;
pub mod session;

pub use channel::{ChannelConfig, ChannelError, ChannelEvent, ChannelHandle, ConnectionChannel};
pub use coordinator::{AnimationPhase, CoordinatorConfig, TurnCoordinator, TurnId};
pub use dispatcher::{AnswerAssembler, Dispatch, Dispatcher};
pub use gate::{GateConfig, GateOutcome, GateRejection, RateGate};
pub use session::{
    connect, spawn_driver, ClientConfig, ClientError, ClientHandle, ClientParts, Outbound,
    SurfaceCommand, SurfaceEvent, ViewState,
};
