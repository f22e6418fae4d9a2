//! In-memory test doubles for the command layer's collaborator traits.
//!
//! `ScriptedExchangeProvider` replays a fixed sequence of pod responses, one
//! per radio attempt (including nonce-resync retries); `InMemoryRepository`
//! records every persisted exchange result for assertions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::exchange::{
    ExchangeProgress, ExchangeResult, MessageExchange, MessageExchangeProvider, ResponseMessage,
};
use crate::message::RequestMessage;
use crate::parameters::ExchangeParameters;
use crate::repository::Repository;
use crate::status::{PodState, PodStatus};

/// One scripted reply to a single radio attempt.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: PodStatus,
    pub triggers_nonce_sync: Option<u16>,
}

impl ScriptedResponse {
    pub fn status(status: PodStatus) -> Self {
        Self {
            status,
            triggers_nonce_sync: None,
        }
    }

    pub fn nonce_sync(status: PodStatus, hint: u16) -> Self {
        Self {
            status,
            triggers_nonce_sync: Some(hint),
        }
    }
}

/// A provider that hands out one scripted response per call, in order, and
/// records the request body and exchange parameters it was asked to send
/// each time.
pub struct ScriptedExchangeProvider {
    script: Mutex<Vec<ScriptedResponse>>,
    sent: Arc<Mutex<Vec<RequestMessage>>>,
    sent_params: Arc<Mutex<Vec<ExchangeParameters>>>,
}

impl ScriptedExchangeProvider {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script),
            sent: Arc::new(Mutex::new(Vec::new())),
            sent_params: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn sent_requests(&self) -> Vec<RequestMessage> {
        self.sent.lock().await.clone()
    }

    /// The `ExchangeParameters` each attempt was issued with, in order
    /// (including nonce-resync retries).
    pub async fn sent_parameters(&self) -> Vec<ExchangeParameters> {
        self.sent_params.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.len()
    }
}

struct ScriptedExchange {
    response: Option<ScriptedResponse>,
    sent: Arc<Mutex<Vec<RequestMessage>>>,
}

#[async_trait]
impl MessageExchange for ScriptedExchange {
    async fn initialize_exchange(&mut self, _progress: &ExchangeProgress) -> pod_common::Result<()> {
        Ok(())
    }

    async fn get_response(
        &mut self,
        request: &RequestMessage,
        _progress: &ExchangeProgress,
    ) -> pod_common::Result<ResponseMessage> {
        self.sent.lock().await.push(request.clone());
        let scripted = self
            .response
            .take()
            .ok_or_else(|| pod_common::PodError::RadioRecvTimeout("script exhausted".to_string()))?;
        Ok(ResponseMessage {
            sequence: scripted.status.message_sequence,
            status: scripted.status,
            triggers_nonce_sync: scripted.triggers_nonce_sync,
        })
    }

    fn parse_response(&self, response: &ResponseMessage, pod: &mut PodState, _progress: &mut ExchangeProgress) {
        pod.last_status = Some(response.status.clone());
        pod.runtime_variables.nonce_sync = response.triggers_nonce_sync;
    }
}

#[async_trait]
impl MessageExchangeProvider for ScriptedExchangeProvider {
    async fn get_message_exchange(
        &self,
        parameters: &ExchangeParameters,
        _pod: &PodState,
    ) -> pod_common::Result<Box<dyn MessageExchange>> {
        let mut script = self.script.lock().await;
        if script.is_empty() {
            return Err(pod_common::PodError::RadioRecvTimeout(
                "no scripted response available".to_string(),
            ));
        }
        let response = script.remove(0);
        self.sent_params.lock().await.push(parameters.clone());
        Ok(Box::new(ScriptedExchange {
            response: Some(response),
            sent: self.sent.clone(),
        }))
    }
}

/// Records every saved exchange outcome, in order, for assertions.
#[derive(Default)]
pub struct InMemoryRepository {
    saved: Mutex<Vec<(PodState, ExchangeResult)>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn saved_count(&self) -> usize {
        self.saved.lock().await.len()
    }

    pub async fn last(&self) -> Option<(PodState, ExchangeResult)> {
        self.saved.lock().await.last().cloned()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save(&self, pod: &PodState, result: &ExchangeResult) -> pod_common::Result<()> {
        self.saved.lock().await.push((pod.clone(), result.clone()));
        Ok(())
    }
}
