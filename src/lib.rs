pub mod arbiter;
pub mod attack;
pub mod codec;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event_log;
pub mod fault;
pub mod observer;
pub mod reporter;
pub mod runtime;
pub mod simulation;
pub mod stats;
pub mod trace;
pub mod types;

pub use arbiter::{BusArbiter, BusState, NodeSnapshot};
pub use attack::{
    forge_corrupting_frame, AttackStrategy, BusOffAttack, NodeSchedule, PeriodicSender,
};
pub use codec::{decode, encode, encode_frame, DecodeError, EncodedStream};
pub use config::{BusConfig, FaultPolicy, ScenarioConfig};
pub use cursor::TransmitCursor;
pub use error::SimError;
pub use fault::FaultCounter;
pub use observer::{BusEvent, BusObserver, CommittedFrame};
pub use runtime::{BusHandle, BusRuntime};
pub use simulation::Simulation;
pub use types::{BitPolarity, CanFrame, ErrorFlagKind, FaultState, FrameField, NodeId};
