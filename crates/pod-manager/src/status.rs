//! The Pod State Record and the status payload parsed out of pod replies.

use chrono::{DateTime, Utc};
use pod_common::Units;
use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeResult;
use crate::progress::PodProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasalState {
    Off,
    Scheduled,
    Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusState {
    Inactive,
    Extended,
    Immediate,
}

/// The status payload carried in every pod reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    pub progress: PodProgress,
    pub basal_state: BasalState,
    pub bolus_state: BolusState,
    pub alert_mask: u8,
    pub delivered_insulin: Units,
    pub not_delivered_insulin: Units,
    pub reservoir: Units,
    /// 4-bit wrapping message sequence, 0..=15.
    pub message_sequence: u8,
}

impl PodStatus {
    pub fn initial() -> Self {
        Self {
            progress: PodProgress::InitialState,
            basal_state: BasalState::Off,
            bolus_state: BolusState::Inactive,
            alert_mask: 0,
            delivered_insulin: Units::ZERO,
            not_delivered_insulin: Units::ZERO,
            reservoir: Units::ZERO,
            message_sequence: 0,
        }
    }
}

/// Nonce-sync slot and any other per-pod runtime flags, separate from the
/// persisted status so the nonce generator stays a pure stateful object that
/// doesn't need a back-reference to its owning pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeVariables {
    /// Set by response parsing when the pod requests nonce renegotiation;
    /// must be empty outside the window between reject-parse and retry.
    pub nonce_sync: Option<u16>,
}

/// The authoritative in-memory snapshot of one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodState {
    // NOTE: cloned freely for repository persistence snapshots; mutation
    // always happens on the instance behind `PodManager`'s mutex.
    pub radio_address: u32,
    pub lot: Option<u32>,
    pub serial: Option<u32>,
    pub activation_date: Option<DateTime<Utc>>,
    pub insertion_date: Option<DateTime<Utc>>,
    pub reservoir_used_for_priming: Option<Units>,
    pub last_status: Option<PodStatus>,
    #[serde(skip)]
    pub last_user_settings: Option<()>,
    pub last_temp_basal_result: Option<ExchangeResult>,
    pub runtime_variables: RuntimeVariables,
}

impl PodState {
    pub fn new(radio_address: u32) -> Self {
        Self {
            radio_address,
            lot: None,
            serial: None,
            activation_date: None,
            insertion_date: None,
            reservoir_used_for_priming: None,
            last_status: None,
            last_user_settings: None,
            last_temp_basal_result: None,
            runtime_variables: RuntimeVariables::default(),
        }
    }

    pub fn with_identity(mut self, lot: u32, serial: u32) -> Self {
        self.lot = Some(lot);
        self.serial = Some(serial);
        self
    }

    pub fn progress(&self) -> Option<PodProgress> {
        self.last_status.as_ref().map(|s| s.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pod_has_no_status() {
        let pod = PodState::new(0xABCD);
        assert!(pod.progress().is_none());
    }
}
