//! The exchange primitive's supporting types and the consumed collaborator
//! traits (`MessageExchange`, `MessageExchangeProvider`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pod_common::{PodError, Units};
use serde::{Deserialize, Serialize};

use crate::message::RequestMessage;
use crate::parameters::ExchangeParameters;
use crate::status::PodState;

/// One basal-schedule payload carried through a basal-schedule exchange's
/// progress so the response parser and the final `ExchangeResult` agree on
/// what was actually sent.
#[derive(Debug, Clone)]
pub struct BasalScheduleContext {
    pub entries: Vec<Units>,
    pub pod_date_year: u16,
    pub utc_offset_minutes: i32,
}

/// Durable outcome of one request/response round trip. Persisted exactly
/// once, regardless of success, failure, or exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeResult {
    pub request_time: DateTime<Utc>,
    pub result_time: DateTime<Utc>,
    pub success: bool,
    pub exception: Option<String>,
}

impl ExchangeResult {
    pub fn success(request_time: DateTime<Utc>, result_time: DateTime<Utc>) -> Self {
        Self {
            request_time,
            result_time,
            success: true,
            exception: None,
        }
    }

    pub fn failed(request_time: DateTime<Utc>, result_time: DateTime<Utc>, error: PodError) -> Self {
        Self {
            request_time,
            result_time,
            success: false,
            exception: Some(error.to_string()),
        }
    }
}

/// A single exchange's mutable progress record, allocated by
/// `Conversation::new_exchange` and finalized by `perform_exchange`.
#[derive(Debug, Clone)]
pub struct ExchangeProgress {
    pub request: RequestMessage,
    pub running: bool,
    pub finished: bool,
    pub request_time: Option<DateTime<Utc>>,
    pub result_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<PodError>,
    pub basal_schedule: Option<BasalScheduleContext>,
}

impl ExchangeProgress {
    pub fn new(request: RequestMessage) -> Self {
        Self {
            request,
            running: false,
            finished: false,
            request_time: None,
            result_time: None,
            success: false,
            error: None,
            basal_schedule: None,
        }
    }

    pub fn with_basal_schedule(mut self, ctx: BasalScheduleContext) -> Self {
        self.basal_schedule = Some(ctx);
        self
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.request_time = Some(at);
        self.running = true;
    }

    pub fn finish(&mut self, at: DateTime<Utc>, success: bool, error: Option<PodError>) {
        self.running = false;
        self.finished = true;
        self.result_time = Some(at);
        self.success = success;
        self.error = error;
    }

    pub fn to_result(&self) -> ExchangeResult {
        let request_time = self.request_time.unwrap_or_else(Utc::now);
        let result_time = self.result_time.unwrap_or(request_time);
        ExchangeResult {
            request_time,
            result_time,
            success: self.success,
            exception: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Opaque parsed response. The real codec (out of scope) fills this in;
/// only the fields the command layer reasons about are modeled here.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub sequence: u8,
    pub status: crate::status::PodStatus,
    pub triggers_nonce_sync: Option<u16>,
}

/// One initialize -> send -> receive cycle against the radio. Returned fresh
/// by the provider for every attempt (including the nonce-resync retry).
#[async_trait]
pub trait MessageExchange: Send + Sync {
    async fn initialize_exchange(&mut self, progress: &ExchangeProgress) -> pod_common::Result<()>;

    async fn get_response(
        &mut self,
        request: &RequestMessage,
        progress: &ExchangeProgress,
    ) -> pod_common::Result<ResponseMessage>;

    /// Updates `pod.last_status` and, if the pod rejected the nonce, sets
    /// `pod.runtime_variables.nonce_sync`.
    fn parse_response(&self, response: &ResponseMessage, pod: &mut PodState, progress: &mut ExchangeProgress);
}

/// Supplies a configured `MessageExchange` per call.
#[async_trait]
pub trait MessageExchangeProvider: Send + Sync {
    async fn get_message_exchange(
        &self,
        parameters: &ExchangeParameters,
        pod: &PodState,
    ) -> pod_common::Result<Box<dyn MessageExchange>>;
}
