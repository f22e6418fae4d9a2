//! Command-orchestration core for an Omnipod-style pump controller.
//!
//! `PodManager` is the seam between therapy intent (pair, bolus, temp basal,
//! deactivate, ...) and the radio link (the `MessageExchangeProvider`
//! collaborator, out of this crate's scope) and durable storage (the
//! `Repository` collaborator, implemented by `pod-store`).

pub mod conversation;
pub mod exchange;
pub mod manager;
pub mod message;
pub mod nonce;
pub mod parameters;
pub mod progress;
pub mod repository;
pub mod status;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use conversation::{CancellationToken, Conversation, RequestSource};
pub use exchange::{
    BasalScheduleContext, ExchangeProgress, ExchangeResult, MessageExchange,
    MessageExchangeProvider, ResponseMessage,
};
pub use manager::PodManager;
pub use message::{
    AlertRepeat, AlertSlot, Beep, MessageBuilder, PodDateTime, RequestBody, RequestMessage,
    StatusRequestKind,
};
pub use nonce::NonceGenerator;
pub use parameters::{ExchangeParameters, TxPower};
pub use progress::PodProgress;
pub use repository::Repository;
pub use status::{BasalState, BolusState, PodState, PodStatus, RuntimeVariables};
