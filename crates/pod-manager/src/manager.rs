//! The Pod Manager: orchestrator for one pod's therapy commands.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pod_common::config::PollingConfig;
use pod_common::{PodError, Result, Units};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, warn};

use crate::conversation::{CancellationToken, Conversation, RequestSource};
use crate::exchange::{
    BasalScheduleContext, ExchangeProgress, MessageExchangeProvider, ResponseMessage,
};
use crate::message::{AlertSlot, Beep, AlertRepeat, MessageBuilder, PodDateTime, RequestMessage, StatusRequestKind};
use crate::nonce::NonceGenerator;
use crate::parameters::{ExchangeParameters, TxPower};
use crate::progress::PodProgress;
use crate::repository::Repository;
use crate::status::{BasalState, BolusState, PodState};

/// Orchestrator for one pod. Holds the per-pod conversation mutex and
/// everything needed to compose builder + parameters + exchange into a
/// therapy operation.
pub struct PodManager {
    pod: Arc<AsyncMutex<PodState>>,
    provider: Arc<dyn MessageExchangeProvider>,
    repository: Arc<dyn Repository>,
    conversation_mutex: Arc<Semaphore>,
    nonce: Arc<AsyncMutex<NonceGenerator>>,
    polling: PollingConfig,
}

impl PodManager {
    pub fn new(
        pod: PodState,
        provider: Arc<dyn MessageExchangeProvider>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self::with_config(pod, provider, repository, PollingConfig::default())
    }

    pub fn with_config(
        pod: PodState,
        provider: Arc<dyn MessageExchangeProvider>,
        repository: Arc<dyn Repository>,
        polling: PollingConfig,
    ) -> Self {
        let nonce = NonceGenerator::new(pod.lot.unwrap_or(0), pod.serial.unwrap_or(0));
        Self {
            pod: Arc::new(AsyncMutex::new(pod)),
            provider,
            repository,
            conversation_mutex: Arc::new(Semaphore::new(1)),
            nonce: Arc::new(AsyncMutex::new(nonce)),
            polling,
        }
    }

    /// A read-only snapshot of the pod's current record.
    pub async fn snapshot(&self) -> PodState {
        self.pod.lock().await.clone()
    }

    // ------------------------------------------------------------------
    // Conversation lifecycle (spec §4.1.1)
    // ------------------------------------------------------------------

    /// Acquires the per-pod conversation mutex. `timeout_ms == 0` waits
    /// unboundedly; otherwise returns `None` if the wait times out.
    pub async fn start_conversation(
        &self,
        timeout_ms: u64,
        source: RequestSource,
    ) -> Option<Conversation> {
        let permit = if timeout_ms == 0 {
            self.conversation_mutex.clone().acquire_owned().await.ok()?
        } else {
            tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.conversation_mutex.clone().acquire_owned(),
            )
            .await
            .ok()?
            .ok()?
        };
        Some(Conversation::new(permit, source))
    }

    // ------------------------------------------------------------------
    // Core exchange primitive (spec §4.1.2)
    // ------------------------------------------------------------------

    /// Performs one exchange, including the one-shot nonce-resync retry.
    /// Never propagates an error to the caller: failures are captured onto
    /// the exchange progress and reported as `false`.
    pub async fn perform_exchange(
        &self,
        request: RequestMessage,
        parameters: ExchangeParameters,
        conversation: &mut Conversation,
        progress: Option<ExchangeProgress>,
    ) -> bool {
        let mut progress = progress.unwrap_or_else(|| conversation.new_exchange(request.clone()));
        progress.mark_running(Utc::now());

        let outcome = self.perform_exchange_inner(&request, &parameters, &mut progress).await;
        let (success, error) = match outcome {
            Ok(()) => (true, None),
            Err(e) => {
                warn!(error = %e, "exchange failed");
                (false, Some(e))
            }
        };
        progress.finish(Utc::now(), success, error);

        let exchange_result = progress.to_result();
        conversation.current_exchange = Some(progress);

        let pod_snapshot = self.snapshot().await;
        if let Err(e) = self.repository.save(&pod_snapshot, &exchange_result).await {
            warn!(error = %e, "failed to persist exchange result");
        }

        success
    }

    async fn perform_exchange_inner(
        &self,
        request: &RequestMessage,
        parameters: &ExchangeParameters,
        progress: &mut ExchangeProgress,
    ) -> Result<()> {
        let response = self.run_one_attempt(request, parameters, progress).await?;

        let nonce_sync = { self.pod.lock().await.runtime_variables.nonce_sync };
        if let Some(hint) = nonce_sync {
            debug!(sequence = response.sequence, "nonce resync requested, retrying");
            let retry_seq = (response.sequence + 15) % 16;
            let retry_nonce = {
                let mut nonce = self.nonce.lock().await;
                nonce.resync(hint);
                nonce.next_nonce()
            };
            let retry_params = parameters
                .clone()
                .with_message_sequence_override(retry_seq)
                .with_nonce(retry_nonce);
            self.run_one_attempt(request, &retry_params, progress).await?;

            let still_set = {
                let mut pod = self.pod.lock().await;
                let still_set = pod.runtime_variables.nonce_sync.is_some();
                pod.runtime_variables.nonce_sync = None;
                still_set
            };
            if still_set {
                return Err(PodError::PodResponseUnexpected(
                    "Nonce re-negotiation failed".to_string(),
                ));
            }
        }

        Ok(())
    }

    async fn run_one_attempt(
        &self,
        request: &RequestMessage,
        parameters: &ExchangeParameters,
        progress: &mut ExchangeProgress,
    ) -> Result<ResponseMessage> {
        let pod_snapshot = self.snapshot().await;
        let mut exchange = self.provider.get_message_exchange(parameters, &pod_snapshot).await?;
        exchange.initialize_exchange(progress).await?;
        let response = exchange.get_response(request, progress).await?;
        {
            let mut pod = self.pod.lock().await;
            exchange.parse_response(&response, &mut pod, progress);
        }
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Status refresh (spec §4.1.3)
    // ------------------------------------------------------------------

    pub async fn update_status_internal(&self, conversation: &mut Conversation) -> bool {
        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let request = MessageBuilder::new().status(StatusRequestKind::Standard);
        self.perform_exchange(request, params, conversation, None).await
    }

    /// `UpdateStatus(type=Standard)`: wraps `update_status_internal`.
    pub async fn update_status(&self, conversation: &mut Conversation) {
        self.update_status_internal(conversation).await;
    }

    // ------------------------------------------------------------------
    // Small state accessors used throughout the therapy operations
    // ------------------------------------------------------------------

    async fn current_progress(&self) -> Option<PodProgress> {
        self.pod.lock().await.progress()
    }

    async fn progress_and_not_delivered(&self) -> (Option<PodProgress>, Units) {
        let pod = self.pod.lock().await;
        let progress = pod.progress();
        let not_delivered = pod
            .last_status
            .as_ref()
            .map(|s| s.not_delivered_insulin)
            .unwrap_or(Units::ZERO);
        (progress, not_delivered)
    }

    async fn bolus_state_and_not_delivered(&self) -> (Option<BolusState>, Units) {
        let pod = self.pod.lock().await;
        let state = pod.last_status.as_ref().map(|s| s.bolus_state);
        let not_delivered = pod
            .last_status
            .as_ref()
            .map(|s| s.not_delivered_insulin)
            .unwrap_or(Units::ZERO);
        (state, not_delivered)
    }

    async fn next_nonce(&self) -> u32 {
        self.nonce.lock().await.next_nonce()
    }

    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = token.cancelled() => true,
        }
    }

    // ------------------------------------------------------------------
    // Precondition predicates (spec §4.1.5)
    // ------------------------------------------------------------------

    fn assert_basal_schedule_valid(schedule: &[Units]) -> Result<()> {
        if schedule.len() != 48 {
            return Err(PodError::InvalidParameter(format!(
                "basal schedule must have 48 entries, got {}",
                schedule.len()
            )));
        }
        for (i, entry) in schedule.iter().enumerate() {
            if entry.0 % Units::STEP_HUNDREDTHS != 0 || entry.0 < 5 || entry.0 > 3000 {
                return Err(PodError::InvalidParameter(format!(
                    "basal schedule entry {i} ({entry}) must be a multiple of 0.05 in [0.05, 30.0]"
                )));
            }
        }
        Ok(())
    }

    async fn assert_immediate_bolus_inactive(&self) -> Result<()> {
        let bolus_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.bolus_state)
        };
        if bolus_state == Some(BolusState::Immediate) {
            return Err(PodError::PodStateInvalidForCommand(
                "bolus in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn assert_immediate_bolus_active(&self) -> Result<()> {
        let bolus_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.bolus_state)
        };
        if bolus_state != Some(BolusState::Immediate) {
            return Err(PodError::PodStateInvalidForCommand(
                "no bolus in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn assert_not_paired(&self) -> Result<()> {
        let progress = self.current_progress().await;
        if progress.map(|p| p >= PodProgress::PairingSuccess).unwrap_or(false) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod already paired".to_string(),
            ));
        }
        Ok(())
    }

    async fn assert_paired(&self) -> Result<()> {
        let progress = self.current_progress().await;
        if progress.map(|p| p < PodProgress::PairingSuccess).unwrap_or(true) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod not paired".to_string(),
            ));
        }
        Ok(())
    }

    async fn assert_running_status(&self) -> Result<()> {
        let progress = self.current_progress().await;
        let ok = progress
            .map(|p| p >= PodProgress::Running && p <= PodProgress::RunningLow)
            .unwrap_or(false);
        if !ok {
            return Err(PodError::PodStateInvalidForCommand(
                "pod not in a running state".to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Therapy operations (spec §4.1.4)
    //
    // Each public operation catches every condition at its own boundary and
    // records it on the conversation rather than propagating a `Result` to
    // the caller, per the command layer's exception-as-control-flow design.
    // ------------------------------------------------------------------

    pub async fn pair(&self, conversation: &mut Conversation, utc_offset_minutes: i32) {
        if let Err(e) = self.pair_inner(conversation, utc_offset_minutes).await {
            conversation.record_exception(e);
        }
    }

    async fn pair_inner(&self, conversation: &mut Conversation, utc_offset_minutes: i32) -> Result<()> {
        self.assert_not_paired().await?;

        let progress = self.current_progress().await;
        if progress.map(|p| p <= PodProgress::TankFillCompleted).unwrap_or(true) {
            let radio_address = self.pod.lock().await.radio_address;
            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce)
                .with_address_overrides(0xFFFF_FFFF, radio_address)
                .with_tx_power(TxPower::A3BelowNormal)
                .without_auto_level_adjustment();
            let request = MessageBuilder::new().assign_address(radio_address);
            self.perform_exchange(request, params, conversation, None).await;

            let new_progress = self.current_progress().await;
            match new_progress {
                None => return Err(PodError::RadioRecvTimeout("no status returned".to_string())),
                Some(p) if p < PodProgress::TankFillCompleted => {
                    return Err(PodError::PodResponseUnexpected("not filled".to_string()))
                }
                _ => {}
            }
        }

        let progress = self.current_progress().await;
        if progress.map(|p| p < PodProgress::PairingSuccess).unwrap_or(true) {
            let now = Utc::now();
            {
                self.pod.lock().await.activation_date = Some(now);
            }
            let pod_date = PodDateTime::from_utc(now, utc_offset_minutes);
            let (lot, serial, radio_address) = {
                let pod = self.pod.lock().await;
                (pod.lot.unwrap_or(0), pod.serial.unwrap_or(0), pod.radio_address)
            };
            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce)
                .with_address_overrides(0xFFFF_FFFF, radio_address)
                .with_tx_power(TxPower::A3BelowNormal)
                .without_auto_level_adjustment()
                .with_message_sequence_override(1);
            let request = MessageBuilder::new().setup_pod(lot, serial, radio_address, pod_date);
            self.perform_exchange(request, params, conversation, None).await;
        }

        self.assert_paired().await
    }

    pub async fn activate(&self, conversation: &mut Conversation) {
        if let Err(e) = self.activate_inner(conversation).await {
            conversation.record_exception(e);
        }
    }

    // TODO: wire a pod-expiry warning once a scheduling collaborator exists
    // (left as an extension point, not implemented here).
    async fn activate_inner(&self, conversation: &mut Conversation) -> Result<()> {
        self.update_status_internal(conversation).await;
        let progress = self.current_progress().await;
        if progress.map(|p| p > PodProgress::ReadyForInjection).unwrap_or(false) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod already past ready-for-injection".to_string(),
            ));
        }

        if progress == Some(PodProgress::PairingSuccess) {
            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce).with_message_sequence_override(2);
            let slots = vec![AlertSlot {
                activate: true,
                alert_index: 7,
                alert_after_minutes: 5,
                alert_duration: 55,
                trigger_auto_off: false,
                beep: Beep::BipBeepFourTimes,
                repeat: AlertRepeat::OnceEveryFiveMinutes,
            }];
            let req = MessageBuilder::new().alert_setup(slots);
            self.perform_exchange(req, params, conversation, None).await;

            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce);
            let req = MessageBuilder::new().delivery_flags(0, 0);
            self.perform_exchange(req, params, conversation, None).await;

            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce);
            let req = MessageBuilder::new().prime_cannula();
            self.perform_exchange(req, params, conversation, None).await;

            let progress = self.current_progress().await;
            if progress != Some(PodProgress::Purging) {
                return Err(PodError::PodResponseUnexpected(
                    "expected Purging after prime_cannula".to_string(),
                ));
            }
        }

        loop {
            let (progress, not_delivered) = self.progress_and_not_delivered().await;
            if progress != Some(PodProgress::Purging) {
                break;
            }
            let delay_ms = not_delivered.ticks() as u64 * self.polling.purge_prime_ms_per_tick
                + self.polling.purge_prime_fixed_delay_ms;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.update_status_internal(conversation).await;
        }

        let progress = self.current_progress().await;
        if progress != Some(PodProgress::ReadyForInjection) {
            return Err(PodError::PodResponseUnexpected(
                "pod did not reach ReadyForInjection".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn inject_and_start(
        &self,
        conversation: &mut Conversation,
        basal_schedule: Vec<Units>,
        utc_offset_minutes: i32,
    ) {
        if let Err(e) = self
            .inject_and_start_inner(conversation, basal_schedule, utc_offset_minutes)
            .await
        {
            conversation.record_exception(e);
        }
    }

    async fn inject_and_start_inner(
        &self,
        conversation: &mut Conversation,
        basal_schedule: Vec<Units>,
        utc_offset_minutes: i32,
    ) -> Result<()> {
        self.update_status_internal(conversation).await;
        let progress = self.current_progress().await;
        if progress.map(|p| p >= PodProgress::Running).unwrap_or(false) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod already started".to_string(),
            ));
        }
        if progress.map(|p| p < PodProgress::ReadyForInjection).unwrap_or(true) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod not ready for injection".to_string(),
            ));
        }

        if progress == Some(PodProgress::ReadyForInjection) {
            Self::assert_basal_schedule_valid(&basal_schedule)?;

            let now = Utc::now();
            let pod_date = PodDateTime::from_utc(now, utc_offset_minutes);
            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce)
                .repeating_first_packet()
                .critical_with_followup();
            let req = MessageBuilder::new().basal_schedule(basal_schedule.clone(), pod_date);
            let ctx = BasalScheduleContext {
                entries: basal_schedule,
                pod_date_year: pod_date.year,
                utc_offset_minutes,
            };
            let progress_obj = conversation.new_exchange(req.clone()).with_basal_schedule(ctx);
            self.perform_exchange(req, params, conversation, Some(progress_obj)).await;

            let progress = self.current_progress().await;
            if progress != Some(PodProgress::BasalScheduleSet) {
                return Err(PodError::PodResponseUnexpected(
                    "expected BasalScheduleSet".to_string(),
                ));
            }

            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce);
            let slots = vec![
                AlertSlot::deactivated(7),
                AlertSlot {
                    activate: true,
                    alert_index: 0,
                    alert_after_minutes: 15,
                    alert_duration: 0,
                    trigger_auto_off: true,
                    beep: Beep::BipBeepFourTimes,
                    repeat: AlertRepeat::OnceEveryMinuteForFifteenMinutes,
                },
            ];
            let req = MessageBuilder::new().alert_setup(slots);
            self.perform_exchange(req, params, conversation, None).await;

            let nonce = self.next_nonce().await;
            let params = ExchangeParameters::standard(nonce);
            let req = MessageBuilder::new().insert_cannula();
            self.perform_exchange(req, params, conversation, None).await;

            let progress = self.current_progress().await;
            if progress != Some(PodProgress::Priming) {
                return Err(PodError::PodResponseUnexpected(
                    "expected Priming after insert_cannula".to_string(),
                ));
            }
            self.pod.lock().await.insertion_date = Some(Utc::now());
        }

        loop {
            let (progress, not_delivered) = self.progress_and_not_delivered().await;
            if progress != Some(PodProgress::Priming) {
                break;
            }
            let delay_ms = not_delivered.ticks() as u64 * self.polling.purge_prime_ms_per_tick
                + self.polling.purge_prime_fixed_delay_ms;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.update_status_internal(conversation).await;
        }

        let progress = self.current_progress().await;
        if progress != Some(PodProgress::Running) {
            return Err(PodError::PodResponseUnexpected(
                "pod did not reach Running".to_string(),
            ));
        }

        let delivered = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.delivered_insulin)
        };
        if let Some(delivered) = delivered {
            self.pod.lock().await.reservoir_used_for_priming = Some(delivered);
        }
        Ok(())
    }

    pub async fn acknowledge_alerts(&self, conversation: &mut Conversation, alert_mask: u8) {
        if let Err(e) = self.acknowledge_alerts_inner(conversation, alert_mask).await {
            conversation.record_exception(e);
        }
    }

    async fn acknowledge_alerts_inner(&self, conversation: &mut Conversation, alert_mask: u8) -> Result<()> {
        self.update_status_internal(conversation).await;
        self.assert_immediate_bolus_inactive().await?;

        let progress = self.current_progress().await;
        if !progress.map(|p| p.is_active()).unwrap_or(false) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod must be active".to_string(),
            ));
        }

        let current_mask = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.alert_mask)
                .unwrap_or(0)
        };
        if current_mask & alert_mask != alert_mask {
            return Err(PodError::PodStateInvalidForCommand(
                "requested alerts are not currently set".to_string(),
            ));
        }

        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().acknowledge_alerts(alert_mask);
        self.perform_exchange(req, params, conversation, None).await;

        let new_mask = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.alert_mask)
                .unwrap_or(0)
        };
        if new_mask & alert_mask != 0 {
            return Err(PodError::PodResponseUnexpected(
                "alerts were not cleared".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn set_temp_basal(&self, conversation: &mut Conversation, rate: Units, hours: f32) {
        if let Err(e) = self.set_temp_basal_inner(conversation, rate, hours).await {
            conversation.record_exception(e);
        }
    }

    async fn set_temp_basal_inner(&self, conversation: &mut Conversation, rate: Units, hours: f32) -> Result<()> {
        self.update_status_internal(conversation).await;
        self.assert_running_status().await?;
        self.assert_immediate_bolus_inactive().await?;

        self.cancel_temp_basal_if_active(conversation).await?;

        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().temp_basal(rate, hours);
        self.perform_exchange(req, params, conversation, None).await;

        let new_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.basal_state)
        };
        if new_state != Some(BasalState::Temporary) {
            return Err(PodError::PodResponseUnexpected(
                "temp basal did not activate".to_string(),
            ));
        }

        let result = conversation.current_exchange.as_ref().map(|p| p.to_result());
        self.pod.lock().await.last_temp_basal_result = result;
        Ok(())
    }

    pub async fn cancel_temp_basal(&self, conversation: &mut Conversation) {
        if let Err(e) = self.cancel_temp_basal_pub_inner(conversation).await {
            conversation.record_exception(e);
        }
    }

    async fn cancel_temp_basal_pub_inner(&self, conversation: &mut Conversation) -> Result<()> {
        self.update_status_internal(conversation).await;
        self.assert_running_status().await?;
        self.assert_immediate_bolus_inactive().await?;

        self.cancel_temp_basal_if_active(conversation).await?;

        let new_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.basal_state)
        };
        if new_state != Some(BasalState::Scheduled) {
            return Err(PodError::PodResponseUnexpected(
                "basal state not Scheduled after cancel".to_string(),
            ));
        }
        self.pod.lock().await.last_temp_basal_result = None;
        Ok(())
    }

    /// Shared by `SetTempBasal` and `CancelTempBasal`: if a temp basal is
    /// currently active, cancel it and require it actually cleared.
    async fn cancel_temp_basal_if_active(&self, conversation: &mut Conversation) -> Result<()> {
        let basal_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.basal_state)
        };
        if basal_state != Some(BasalState::Temporary) {
            return Ok(());
        }

        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().cancel_temp_basal();
        self.perform_exchange(req, params, conversation, None).await;

        let still_temp = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.basal_state)
        } == Some(BasalState::Temporary);
        if still_temp {
            return Err(PodError::PodResponseUnexpected(
                "temp basal still active after cancel".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn set_basal_schedule(
        &self,
        conversation: &mut Conversation,
        schedule: Vec<Units>,
        utc_offset_minutes: i32,
    ) {
        if let Err(e) = self
            .set_basal_schedule_inner(conversation, schedule, utc_offset_minutes)
            .await
        {
            conversation.record_exception(e);
        }
    }

    async fn set_basal_schedule_inner(
        &self,
        conversation: &mut Conversation,
        schedule: Vec<Units>,
        utc_offset_minutes: i32,
    ) -> Result<()> {
        // Validated before the preamble's status refresh: a malformed
        // schedule is a pure input error and must not cost a radio exchange.
        Self::assert_basal_schedule_valid(&schedule)?;

        self.update_status_internal(conversation).await;
        self.assert_running_status().await?;
        self.assert_immediate_bolus_inactive().await?;

        self.cancel_temp_basal_if_active(conversation).await?;

        let now = Utc::now();
        let pod_date = PodDateTime::from_utc(now, utc_offset_minutes);
        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().basal_schedule(schedule.clone(), pod_date);
        let ctx = BasalScheduleContext {
            entries: schedule,
            pod_date_year: pod_date.year,
            utc_offset_minutes,
        };
        let progress_obj = conversation.new_exchange(req.clone()).with_basal_schedule(ctx);
        self.perform_exchange(req, params, conversation, Some(progress_obj)).await;
        Ok(())
    }

    /// Delivers a bolus. Cancellation during the wait loop sends a fresh
    /// `cancel_bolus` exchange, not a re-send of the original bolus request.
    /// The specification flags the original source's behavior, re-issuing
    /// the bolus request on cancel, as a likely bug and leaves the choice
    /// explicit; this implementation sends `cancel_bolus`, matching the
    /// operation's own stated intent.
    pub async fn bolus(&self, conversation: &mut Conversation, amount: Units, wait_for_finish: bool) {
        if let Err(e) = self.bolus_inner(conversation, amount, wait_for_finish).await {
            conversation.record_exception(e);
        }
    }

    async fn bolus_inner(&self, conversation: &mut Conversation, amount: Units, wait_for_finish: bool) -> Result<()> {
        self.update_status_internal(conversation).await;
        self.assert_running_status().await?;
        self.assert_immediate_bolus_inactive().await?;

        if amount.0 < Units::STEP_HUNDREDTHS || amount.0 % Units::STEP_HUNDREDTHS != 0 || amount.0 > 3000 {
            return Err(PodError::InvalidParameter(format!(
                "bolus amount {amount} must be a multiple of 0.05 U in [0.05, 30.0]"
            )));
        }

        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().bolus(amount);
        self.perform_exchange(req, params, conversation, None).await;

        let bolus_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.bolus_state)
        };
        if bolus_state != Some(BolusState::Immediate) {
            return Err(PodError::PodResponseUnexpected(
                "bolus did not start".to_string(),
            ));
        }

        if !wait_for_finish {
            return Ok(());
        }

        loop {
            let (state, not_delivered) = self.bolus_state_and_not_delivered().await;
            if state != Some(BolusState::Immediate) {
                break;
            }

            let delay_ms =
                not_delivered.ticks() as u64 * self.polling.bolus_ms_per_tick + self.polling.bolus_fixed_delay_ms;
            let canceled = self
                .sleep_cancellable(Duration::from_millis(delay_ms), &conversation.cancellation_token)
                .await;

            if canceled {
                let nonce = self.next_nonce().await;
                let params = ExchangeParameters::standard(nonce);
                let req = MessageBuilder::new().cancel_bolus();
                let cancel_ok = self.perform_exchange(req, params, conversation, None).await;

                let state_after_cancel = {
                    self.pod
                        .lock()
                        .await
                        .last_status
                        .as_ref()
                        .map(|s| s.bolus_state)
                };
                if !cancel_ok || state_after_cancel == Some(BolusState::Immediate) {
                    conversation.cancel_failed();
                } else {
                    conversation.mark_canceled();
                }
                break;
            }

            self.update_status_internal(conversation).await;
        }

        if !conversation.canceled && !conversation.cancel_failed {
            let not_delivered = {
                self.pod
                    .lock()
                    .await
                    .last_status
                    .as_ref()
                    .map(|s| s.not_delivered_insulin)
                    .unwrap_or(Units::ZERO)
            };
            if !not_delivered.is_zero() {
                return Err(PodError::PodResponseUnexpected(
                    "bolus did not fully deliver".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub async fn cancel_bolus(&self, conversation: &mut Conversation) {
        if let Err(e) = self.cancel_bolus_inner(conversation).await {
            conversation.record_exception(e);
        }
    }

    async fn cancel_bolus_inner(&self, conversation: &mut Conversation) -> Result<()> {
        self.assert_running_status().await?;
        self.assert_immediate_bolus_active().await?;

        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().cancel_bolus();
        self.perform_exchange(req, params, conversation, None).await;

        let bolus_state = {
            self.pod
                .lock()
                .await
                .last_status
                .as_ref()
                .map(|s| s.bolus_state)
        };
        if bolus_state != Some(BolusState::Inactive) {
            return Err(PodError::PodResponseUnexpected(
                "bolus still active after cancel".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn deactivate(&self, conversation: &mut Conversation) {
        if let Err(e) = self.deactivate_inner(conversation).await {
            conversation.record_exception(e);
        }
    }

    async fn deactivate_inner(&self, conversation: &mut Conversation) -> Result<()> {
        self.assert_paired().await?;

        let progress = self.current_progress().await;
        if progress.map(|p| p >= PodProgress::Inactive).unwrap_or(false) {
            return Err(PodError::PodStateInvalidForCommand(
                "pod already deactivated".to_string(),
            ));
        }

        let nonce = self.next_nonce().await;
        let params = ExchangeParameters::standard(nonce);
        let req = MessageBuilder::new().deactivate();
        self.perform_exchange(req, params, conversation, None).await;

        let progress = self.current_progress().await;
        if progress != Some(PodProgress::Inactive) {
            return Err(PodError::PodResponseUnexpected(
                "pod did not deactivate".to_string(),
            ));
        }
        info!("pod deactivated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reserved surface (spec §4.1.4): present, unimplemented.
    // ------------------------------------------------------------------

    pub async fn configure_alerts(&self, conversation: &mut Conversation) {
        conversation.record_exception(PodError::NotImplemented("ConfigureAlerts".to_string()));
    }

    pub async fn start_extended_bolus(&self, conversation: &mut Conversation) {
        conversation.record_exception(PodError::NotImplemented("StartExtendedBolus".to_string()));
    }

    pub async fn cancel_extended_bolus(&self, conversation: &mut Conversation) {
        conversation.record_exception(PodError::NotImplemented("CancelExtendedBolus".to_string()));
    }

    pub async fn suspend_basal(&self, conversation: &mut Conversation) {
        conversation.record_exception(PodError::NotImplemented("SuspendBasal".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PodStatus;
    use crate::testing::{InMemoryRepository, ScriptedExchangeProvider, ScriptedResponse};

    fn running_status(not_delivered: Units, delivered: Units) -> PodStatus {
        PodStatus {
            progress: PodProgress::Running,
            basal_state: BasalState::Scheduled,
            bolus_state: BolusState::Inactive,
            alert_mask: 0,
            delivered_insulin: delivered,
            not_delivered_insulin: not_delivered,
            reservoir: Units::from_decimal(150.0).unwrap(),
            message_sequence: 0,
        }
    }

    fn make_manager(script: Vec<ScriptedResponse>) -> (PodManager, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let provider = Arc::new(ScriptedExchangeProvider::new(script));
        let pod = PodState::new(0x1234_5678).with_identity(11111, 22222);
        let manager = PodManager::new(pod, provider, repo.clone());
        (manager, repo)
    }

    #[tokio::test]
    async fn bolus_without_wait_succeeds_once_pod_reports_immediate() {
        let bolus_status = PodStatus {
            bolus_state: BolusState::Immediate,
            ..running_status(Units::from_decimal(0.5).unwrap(), Units::ZERO)
        };
        let script = vec![
            ScriptedResponse::status(running_status(Units::ZERO, Units::ZERO)),
            ScriptedResponse::status(bolus_status),
        ];
        let (manager, repo) = make_manager(script);

        let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
        manager
            .bolus(&mut conversation, Units::from_decimal(0.5).unwrap(), false)
            .await;

        assert!(!conversation.is_terminal(), "{:?}", conversation.exception);
        assert_eq!(repo.saved_count().await, 2);
    }

    #[tokio::test]
    async fn bolus_rejects_amount_not_on_the_step() {
        let script = vec![ScriptedResponse::status(running_status(Units::ZERO, Units::ZERO))];
        let (manager, _repo) = make_manager(script);

        let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
        manager.bolus(&mut conversation, Units(3), false).await;

        assert!(conversation.is_terminal());
        assert!(matches!(conversation.exception, Some(PodError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn bolus_rejects_while_already_delivering() {
        let busy_status = PodStatus {
            bolus_state: BolusState::Immediate,
            ..running_status(Units::from_decimal(0.2).unwrap(), Units::ZERO)
        };
        let script = vec![ScriptedResponse::status(busy_status)];
        let (manager, _repo) = make_manager(script);

        let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
        manager
            .bolus(&mut conversation, Units::from_decimal(1.0).unwrap(), false)
            .await;

        assert!(conversation.is_terminal());
        assert!(matches!(
            conversation.exception,
            Some(PodError::PodStateInvalidForCommand(_))
        ));
    }

    #[tokio::test]
    async fn set_basal_schedule_rejects_wrong_length() {
        let script = vec![ScriptedResponse::status(running_status(Units::ZERO, Units::ZERO))];
        let (manager, repo) = make_manager(script);

        let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
        let short_schedule = vec![Units::from_decimal(0.5).unwrap(); 47];
        manager.set_basal_schedule(&mut conversation, short_schedule, 0).await;

        assert!(conversation.is_terminal());
        assert!(matches!(conversation.exception, Some(PodError::InvalidParameter(_))));
        assert_eq!(repo.saved_count().await, 0, "invalid schedule must not cost a radio exchange");
    }

    #[tokio::test]
    async fn cancel_temp_basal_is_a_noop_when_nothing_is_running() {
        let script = vec![
            ScriptedResponse::status(running_status(Units::ZERO, Units::ZERO)),
            ScriptedResponse::status(running_status(Units::ZERO, Units::ZERO)),
        ];
        let (manager, _repo) = make_manager(script);

        let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
        manager.cancel_temp_basal(&mut conversation).await;

        assert!(!conversation.is_terminal(), "{:?}", conversation.exception);
    }

    #[tokio::test]
    async fn conversation_mutex_serializes_concurrent_operations() {
        let (manager, _repo) = make_manager(vec![]);
        let manager = Arc::new(manager);
        let first = manager.start_conversation(0, RequestSource::User).await.unwrap();

        let manager2 = manager.clone();
        let second = tokio::spawn(async move { manager2.start_conversation(50, RequestSource::User).await });

        assert!(second.await.unwrap().is_none());
        drop(first);
    }

    #[tokio::test]
    async fn nonce_resync_retries_once_then_succeeds() {
        let first_status = PodStatus {
            progress: PodProgress::PairingSuccess,
            ..running_status(Units::ZERO, Units::ZERO)
        };
        let second_status = PodStatus {
            progress: PodProgress::PairingSuccess,
            ..running_status(Units::ZERO, Units::ZERO)
        };
        let script = vec![
            ScriptedResponse::nonce_sync(first_status, 42),
            ScriptedResponse::status(second_status),
        ];
        let (manager, _repo) = make_manager(script);

        let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
        manager.update_status(&mut conversation).await;

        assert!(!conversation.is_terminal(), "{:?}", conversation.exception);
        let pod = manager.snapshot().await;
        assert!(pod.runtime_variables.nonce_sync.is_none());
    }
}
