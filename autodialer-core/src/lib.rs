use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use autodialer_config::DispatchConfig;
use autodialer_gateway::CallGateway;
use autodialer_parser::IntentParser;
use autodialer_store::{PhoneStore, StoreError};
use autodialer_types::{
    sanitize_message, CallAttempt, CallStatus, NewCallAttempt, PhoneNumber, PhoneRecord,
    RecordId, Statistics, DEFAULT_BULK_MESSAGE, DEFAULT_GREETING,
};

pub mod outcome;
pub mod wiring;
pub use outcome::{
    BatchFailure, BatchOutcome, BatchReport, DispatchError, Dispatched, Rejection, TextDispatch,
    UploadReport,
};

/// The orchestrator: the only component that mutates phone records.
///
/// Dispatch is sequential and serialized per record. A record that is
/// already in flight is refused with [`DispatchError::Busy`] rather than
/// dialled twice.
pub struct Dispatcher {
    store: Arc<dyn PhoneStore>,
    gateway: Arc<dyn CallGateway>,
    parser: IntentParser,
    batch_limit: usize,
    inter_call_delay: Duration,

    in_flight: Arc<StdMutex<HashSet<RecordId>>>,
    batch_gate: Mutex<()>,
    cancel_requested: AtomicBool,
    cancel_wakeup: Notify,
}

/// Claim on one record.
///
/// Armed while the record is `calling`. Dropping an armed claim means the
/// dispatch was abandoned mid-call: the record is moved to `failed` on a
/// background task and the id is released after that write.
struct InFlight {
    set: Arc<StdMutex<HashSet<RecordId>>>,
    store: Arc<dyn PhoneStore>,
    id: RecordId,
    armed: bool,
}

impl InFlight {
    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            release(&self.set, self.id);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(id = self.id, "dispatch abandoned outside a runtime; record left calling");
            release(&self.set, self.id);
            return;
        };
        let set = Arc::clone(&self.set);
        let store = Arc::clone(&self.store);
        let id = self.id;
        handle.spawn(async move {
            fail_abandoned(store.as_ref(), id).await;
            release(&set, id);
        });
    }
}

fn release(set: &StdMutex<HashSet<RecordId>>, id: RecordId) {
    if let Ok(mut set) = set.lock() {
        set.remove(&id);
    }
}

async fn fail_abandoned(store: &dyn PhoneStore, id: RecordId) {
    match store.get(id).await {
        Ok(Some(r)) if r.status == CallStatus::Calling => {
            match store.set_status(id, CallStatus::Failed).await {
                Ok(_) => tracing::warn!(id, "dispatch abandoned mid-call; record marked failed"),
                Err(e) => tracing::error!(id, error = %e, "could not fail abandoned dispatch"),
            }
        }
        Ok(_) => {}
        Err(e) => tracing::error!(id, error = %e, "could not fail abandoned dispatch"),
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PhoneStore>,
        gateway: Arc<dyn CallGateway>,
        parser: IntentParser,
        cfg: &DispatchConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            parser,
            batch_limit: cfg.batch_limit,
            inter_call_delay: cfg.inter_call_delay(),
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            batch_gate: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
            cancel_wakeup: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PhoneStore> {
        &self.store
    }

    pub fn parser(&self) -> &IntentParser {
        &self.parser
    }

    fn claim(&self, id: RecordId) -> Result<InFlight, DispatchError> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| DispatchError::Store(StoreError::Backend("in-flight lock poisoned".into())))?;
        if !set.insert(id) {
            return Err(DispatchError::Busy(id));
        }
        Ok(InFlight {
            set: Arc::clone(&self.in_flight),
            store: Arc::clone(&self.store),
            id,
            armed: false,
        })
    }

    /// Place one call for `record` and record the result.
    async fn dispatch(
        &self,
        record: &PhoneRecord,
        message: &str,
    ) -> Result<Dispatched, DispatchError> {
        let claim = self.claim(record.id)?;
        self.place(claim, record, message).await
    }

    async fn place(
        &self,
        mut claim: InFlight,
        record: &PhoneRecord,
        message: &str,
    ) -> Result<Dispatched, DispatchError> {
        self.store.set_status(record.id, CallStatus::Calling).await?;
        claim.arm();

        match self.gateway.place_call(&record.number, message).await {
            Ok(placed) => {
                let now = Utc::now();
                let record = self
                    .store
                    .mark_dispatched(record.id, &placed.reference_id, now)
                    .await?;
                claim.disarm();
                let attempt = self
                    .store
                    .append_attempt(NewCallAttempt {
                        phone_record_id: record.id,
                        status: placed.provider_status,
                        message: message.to_string(),
                        started_at: now,
                    })
                    .await?;
                tracing::info!(id = record.id, to = %record.number, sid = %placed.reference_id, "call dispatched");
                Ok(Dispatched { record, attempt })
            }
            Err(e) => {
                tracing::warn!(id = record.id, to = %record.number, error = %e, "call failed");
                match self.store.set_status(record.id, CallStatus::Failed).await {
                    Ok(_) => claim.disarm(),
                    Err(store_err) => {
                        tracing::error!(id = record.id, error = %store_err, "could not mark record failed")
                    }
                }
                Err(DispatchError::Gateway {
                    id: record.id,
                    message: e.message,
                })
            }
        }
    }

    async fn require(&self, id: RecordId) -> Result<PhoneRecord, DispatchError> {
        self.store
            .get(id)
            .await?
            .ok_or(DispatchError::NotFound(id))
    }

    /// Dial one record now. `message` defaults to the greeting.
    pub async fn call_now(
        &self,
        id: RecordId,
        message: Option<&str>,
    ) -> Result<Dispatched, DispatchError> {
        let record = self.require(id).await?;
        let message = sanitize_message(message.unwrap_or(DEFAULT_GREETING));
        self.dispatch(&record, &message).await
    }

    /// Dial every pending record, oldest first, up to the batch limit.
    ///
    /// Blocks for the whole batch. Failures are recorded per record and never
    /// stop the loop; only [`Dispatcher::cancel_batch`] does. A record that is
    /// in flight elsewhere, or no longer `pending` when the batch reaches it,
    /// is skipped.
    pub async fn call_all(&self, message: Option<&str>) -> Result<BatchOutcome, DispatchError> {
        let _gate = self
            .batch_gate
            .try_lock()
            .map_err(|_| DispatchError::BatchRunning)?;
        self.cancel_requested.store(false, Ordering::SeqCst);

        let pending = self.store.pending(self.batch_limit).await?;
        if pending.is_empty() {
            tracing::info!("no pending numbers");
            return Ok(BatchOutcome::NoPending);
        }

        let message = sanitize_message(message.unwrap_or(DEFAULT_BULK_MESSAGE));
        tracing::info!(count = pending.len(), "bulk dispatch starting");

        let mut report = BatchReport::default();
        for (i, record) in pending.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            if self.cancel_requested.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }

            let claim = match self.claim(record.id) {
                Ok(claim) => claim,
                Err(DispatchError::Busy(id)) => {
                    tracing::debug!(id, "in flight elsewhere; skipped");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let current = match self.store.get(record.id).await {
                Ok(Some(current)) if current.status == CallStatus::Pending => Ok(current),
                Ok(_) => {
                    tracing::debug!(id = record.id, "no longer pending; skipped");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => Err(DispatchError::from(e)),
            };

            report.attempted += 1;
            let result = match current {
                Ok(current) => self.place(claim, &current, &message).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    report.failures.push(BatchFailure {
                        id: record.id,
                        number: record.number.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "bulk dispatch finished"
        );
        Ok(BatchOutcome::Ran(report))
    }

    /// Ask a running batch to stop before its next call.
    pub fn cancel_batch(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel_wakeup.notify_waiters();
    }

    async fn pause(&self) {
        if self.inter_call_delay.is_zero() {
            return;
        }
        let wakeup = self.cancel_wakeup.notified();
        if self.cancel_requested.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.inter_call_delay) => {}
            _ = wakeup => {}
        }
    }

    /// Parse free text and dial the result.
    ///
    /// Without a number in the text, the most recently created record is the
    /// destination.
    pub async fn call_from_text(&self, text: &str) -> Result<TextDispatch, DispatchError> {
        let intent = self.parser.parse(text).await;

        let (number, used_fallback) = match &intent.phone {
            Some(n) => (n.clone(), false),
            None => match self.store.most_recent().await? {
                Some(recent) => (recent.number, true),
                None => return Err(DispatchError::NoDestination),
            },
        };

        let (record, created) = self.store.find_or_create(&number).await?;
        let dispatched = self.dispatch(&record, &intent.message).await?;
        Ok(TextDispatch {
            intent,
            created,
            used_fallback,
            dispatched,
        })
    }

    /// Add numbers separated by newlines or commas as `pending` records.
    pub async fn bulk_upload(&self, text: &str) -> Result<UploadReport, DispatchError> {
        let entries: Vec<&str> = text
            .split(['\n', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let mut report = UploadReport {
            ignored: entries.len().saturating_sub(self.batch_limit),
            ..UploadReport::default()
        };

        for raw in entries.into_iter().take(self.batch_limit) {
            let Some(number) = PhoneNumber::normalize(raw) else {
                report.rejected.push(Rejection {
                    input: raw.to_string(),
                    reason: "is not a valid Indian mobile number".into(),
                });
                continue;
            };
            match self.store.create(&number).await {
                Ok(record) => report.created.push(record),
                Err(StoreError::Duplicate(_)) => report.rejected.push(Rejection {
                    input: raw.to_string(),
                    reason: "has already been taken".into(),
                }),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    /// Put a failed record back in the queue.
    pub async fn reset(&self, id: RecordId) -> Result<PhoneRecord, DispatchError> {
        let record = self.require(id).await?;
        if record.status != CallStatus::Failed {
            return Err(DispatchError::Validation(format!(
                "only failed records can be reset; {} is {}",
                record.number, record.status
            )));
        }
        Ok(self.store.set_status(id, CallStatus::Pending).await?)
    }

    pub async fn list(&self) -> Result<Vec<PhoneRecord>, DispatchError> {
        Ok(self.store.list_newest_first().await?)
    }

    pub async fn statistics(&self) -> Result<Statistics, DispatchError> {
        Ok(self.store.statistics().await?)
    }

    pub async fn attempts(&self, id: RecordId) -> Result<Vec<CallAttempt>, DispatchError> {
        self.require(id).await?;
        Ok(self.store.attempts_for(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use autodialer_gateway::{GatewayError, PlacedCall};
    use autodialer_store::{InMemoryPhoneStore, SqlitePhoneStore};
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Gateway that succeeds unless told otherwise and logs every call.
    #[derive(Default)]
    struct ScriptedGateway {
        failures: StdMutex<VecDeque<Option<String>>>,
        calls: StdMutex<Vec<(PhoneNumber, String)>>,
        latency: Duration,
    }

    impl ScriptedGateway {
        /// `Some(msg)` fails that call; `None` succeeds. Unscripted calls succeed.
        fn scripted(script: Vec<Option<&str>>) -> Arc<Self> {
            Arc::new(Self {
                failures: StdMutex::new(script.into_iter().map(|s| s.map(String::from)).collect()),
                ..Self::default()
            })
        }

        fn slow(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency,
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<(PhoneNumber, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CallGateway for ScriptedGateway {
        async fn place_call(
            &self,
            destination: &PhoneNumber,
            message: &str,
        ) -> Result<PlacedCall, GatewayError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((destination.clone(), message.to_string()));
                calls.len()
            };
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            match self.failures.lock().unwrap().pop_front().flatten() {
                Some(msg) => Err(GatewayError::new(msg)),
                None => Ok(PlacedCall {
                    reference_id: format!("CA{n}"),
                    provider_status: "queued".into(),
                }),
            }
        }
    }

    fn num(s: &str) -> PhoneNumber {
        PhoneNumber::normalize(s).unwrap()
    }

    fn config(delay_ms: u64) -> DispatchConfig {
        DispatchConfig {
            inter_call_delay_ms: delay_ms,
            ..DispatchConfig::default()
        }
    }

    fn dispatcher(gateway: Arc<ScriptedGateway>, delay_ms: u64) -> Dispatcher {
        Dispatcher::new(
            Arc::new(InMemoryPhoneStore::new()),
            gateway,
            IntentParser::rule_based(),
            &config(delay_ms),
        )
    }

    async fn seed(d: &Dispatcher, numbers: &[&str]) -> Vec<PhoneRecord> {
        let mut out = Vec::new();
        for n in numbers {
            out.push(d.store().create(&num(n)).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn call_now_success_records_reference_and_attempt() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);
        let r = seed(&d, &["9876543210"]).await.remove(0);

        let done = d.call_now(r.id, None).await.unwrap();
        assert_eq!(done.record.status, CallStatus::Completed);
        assert_eq!(done.record.call_reference_id.as_deref(), Some("CA1"));
        assert!(done.record.called_at.is_some());
        assert_eq!(done.attempt.status, "queued");
        assert_eq!(done.attempt.message, DEFAULT_GREETING);
        assert_eq!(d.attempts(r.id).await.unwrap().len(), 1);
        assert_eq!(gw.calls(), vec![(num("9876543210"), DEFAULT_GREETING.to_string())]);
    }

    #[tokio::test]
    async fn call_now_failure_marks_failed_and_keeps_reference() {
        let gw = ScriptedGateway::scripted(vec![None, Some("number unreachable")]);
        let d = dispatcher(gw.clone(), 0);
        let r = seed(&d, &["9876543210"]).await.remove(0);

        d.call_now(r.id, Some("first")).await.unwrap();
        let err = d.call_now(r.id, Some("second")).await.unwrap_err();
        assert_eq!(err.to_string(), "Call failed: number unreachable");

        let after = d.store().get(r.id).await.unwrap().unwrap();
        assert_eq!(after.status, CallStatus::Failed);
        assert_eq!(after.call_reference_id.as_deref(), Some("CA1"));
        assert_eq!(d.attempts(r.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn call_now_unknown_record() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);
        assert!(matches!(
            d.call_now(7, None).await,
            Err(DispatchError::NotFound(7))
        ));
        assert!(gw.calls().is_empty());
    }

    #[tokio::test]
    async fn call_all_with_nothing_pending_places_no_calls() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);
        let r = seed(&d, &["9876543210"]).await;
        d.store().set_status(r[0].id, CallStatus::Failed).await.unwrap();

        let outcome = d.call_all(None).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::NoPending));
        assert!(gw.calls().is_empty());
    }

    #[tokio::test]
    async fn call_all_counts_every_record_once() {
        let gw = ScriptedGateway::scripted(vec![None, Some("busy line"), None]);
        let d = dispatcher(gw.clone(), 0);
        let seeded = seed(&d, &["9000000001", "9000000002", "9000000003"]).await;

        let BatchOutcome::Ran(report) = d.call_all(Some("sale today")).await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded + report.failed, 3);
        assert!(!report.cancelled);
        assert_eq!(report.failures[0].id, seeded[1].id);
        assert_eq!(report.failures[0].reason, "Call failed: busy line");

        let order: Vec<_> = gw.calls().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, seeded.iter().map(|r| r.number.clone()).collect::<Vec<_>>());
        assert!(gw.calls().iter().all(|(_, m)| m == "sale today"));

        let stats = d.statistics().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(d.attempts(seeded[0].id).await.unwrap().len(), 1);
        assert!(d.attempts(seeded[1].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn call_all_stops_at_batch_limit() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);
        for i in 0..105 {
            d.store()
                .create(&num(&format!("9{:09}", i)))
                .await
                .unwrap();
        }
        let BatchOutcome::Ran(report) = d.call_all(None).await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(report.attempted, 100);
        assert_eq!(gw.calls().len(), 100);
        assert_eq!(gw.calls()[0].1, DEFAULT_BULK_MESSAGE);
        assert_eq!(d.statistics().await.unwrap().pending, 5);
    }

    #[tokio::test]
    async fn call_all_pauses_between_calls_only() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 40);
        seed(&d, &["9000000001", "9000000002", "9000000003"]).await;

        let started = Instant::now();
        d.call_all(None).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "{elapsed:?}");
        assert_eq!(gw.calls().len(), 3);
    }

    #[tokio::test]
    async fn cancel_stops_batch_during_pause() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 10_000);
        seed(&d, &["9000000001", "9000000002", "9000000003"]).await;

        let (outcome, _) = tokio::join!(d.call_all(None), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            d.cancel_batch();
        });
        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch");
        };
        assert!(report.cancelled);
        assert_eq!(report.attempted, 1);
        assert_eq!(gw.calls().len(), 1);
        assert_eq!(d.statistics().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn concurrent_dispatch_of_same_record_is_refused() {
        let gw = ScriptedGateway::slow(Duration::from_millis(30));
        let d = dispatcher(gw.clone(), 0);
        let r = seed(&d, &["9876543210"]).await.remove(0);

        let (a, b) = tokio::join!(d.call_now(r.id, None), d.call_now(r.id, None));
        assert!(a.is_ok());
        assert!(matches!(b, Err(DispatchError::Busy(id)) if id == r.id));
        assert_eq!(gw.calls().len(), 1);

        // The claim is released once the first dispatch finishes.
        assert!(d.call_now(r.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn only_one_batch_at_a_time() {
        let gw = ScriptedGateway::slow(Duration::from_millis(30));
        let d = dispatcher(gw.clone(), 0);
        seed(&d, &["9000000001"]).await;

        let (a, b) = tokio::join!(d.call_all(None), d.call_all(None));
        assert!(a.is_ok());
        assert!(matches!(b, Err(DispatchError::BatchRunning)));
    }

    #[tokio::test]
    async fn text_with_number_and_message() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);

        let out = d
            .call_from_text("call 9876543210 and say hello world")
            .await
            .unwrap();
        assert!(out.created);
        assert!(!out.used_fallback);
        assert_eq!(out.dispatched.record.number, num("9876543210"));
        assert_eq!(out.dispatched.attempt.message, "hello world");
        assert_eq!(gw.calls(), vec![(num("9876543210"), "hello world".to_string())]);
    }

    #[tokio::test]
    async fn text_without_number_uses_most_recent_record() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);
        seed(&d, &["9000000001", "9876543210"]).await;

        let out = d.call_from_text("say the shop is open").await.unwrap();
        assert!(out.used_fallback);
        assert!(!out.created);
        assert_eq!(gw.calls(), vec![(num("+919876543210"), "the shop is open".to_string())]);
    }

    #[tokio::test]
    async fn text_without_any_destination() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 0);

        let err = d.call_from_text("just say hi").await.unwrap_err();
        assert!(matches!(err, DispatchError::NoDestination));
        assert!(gw.calls().is_empty());
        assert_eq!(d.statistics().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn text_dispatch_failure_surfaces_provider_message() {
        let gw = ScriptedGateway::scripted(vec![Some("invalid To number")]);
        let d = dispatcher(gw.clone(), 0);
        let err = d.call_from_text("call 9876543210").await.unwrap_err();
        assert_eq!(err.to_string(), "Call failed: invalid To number");
        let stats = d.statistics().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn upload_validates_and_deduplicates() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw, 0);

        let report = d
            .bulk_upload("9876543210, 12345\n\n+91 98765 43210\n7000000001,")
            .await
            .unwrap();
        assert_eq!(report.created.len(), 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].input, "12345");
        assert_eq!(report.rejected[1].reason, "has already been taken");
        assert_eq!(report.ignored, 0);
        assert!(report.created.iter().all(|r| r.status == CallStatus::Pending));
    }

    #[tokio::test]
    async fn upload_caps_entries() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw, 0);
        let text: Vec<String> = (0..103).map(|i| format!("9{:09}", i)).collect();

        let report = d.bulk_upload(&text.join("\n")).await.unwrap();
        assert_eq!(report.created.len(), 100);
        assert_eq!(report.ignored, 3);
    }

    #[tokio::test]
    async fn reset_only_from_failed() {
        let gw = ScriptedGateway::scripted(vec![Some("no answer")]);
        let d = dispatcher(gw, 0);
        let r = seed(&d, &["9876543210"]).await.remove(0);

        assert!(matches!(d.reset(r.id).await, Err(DispatchError::Validation(_))));
        d.call_now(r.id, None).await.unwrap_err();
        let back = d.reset(r.id).await.unwrap();
        assert_eq!(back.status, CallStatus::Pending);
    }

    #[tokio::test]
    async fn batch_skips_record_dialled_during_pause() {
        let gw = ScriptedGateway::scripted(vec![]);
        let d = dispatcher(gw.clone(), 200);
        let seeded = seed(&d, &["9000000001", "9000000002"]).await;

        let (outcome, single) = tokio::join!(d.call_all(None), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            d.call_now(seeded[1].id, Some("right away")).await
        });
        single.unwrap();
        let BatchOutcome::Ran(report) = outcome.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());

        let second: Vec<_> = gw
            .calls()
            .into_iter()
            .filter(|(n, _)| *n == seeded[1].number)
            .collect();
        assert_eq!(second, vec![(seeded[1].number.clone(), "right away".to_string())]);
        assert_eq!(d.attempts(seeded[1].id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_dispatch_leaves_record_failed() {
        let gw = ScriptedGateway::slow(Duration::from_millis(500));
        let d = dispatcher(gw.clone(), 0);
        let r = seed(&d, &["9000000001"]).await.remove(0);

        let cut_short = tokio::time::timeout(Duration::from_millis(50), d.call_now(r.id, None)).await;
        assert!(cut_short.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let after = d.store().get(r.id).await.unwrap().unwrap();
        assert_eq!(after.status, CallStatus::Failed);
        assert!(after.call_reference_id.is_none());
        assert!(d.attempts(r.id).await.unwrap().is_empty());

        let back = d.reset(r.id).await.unwrap();
        assert_eq!(back.status, CallStatus::Pending);
    }

    /// In-memory store whose first write of `failed` errors.
    struct FlakyStore {
        inner: InMemoryPhoneStore,
        fail_next_failed_write: AtomicBool,
    }

    #[async_trait]
    impl PhoneStore for FlakyStore {
        async fn create(&self, number: &PhoneNumber) -> Result<PhoneRecord, StoreError> {
            self.inner.create(number).await
        }

        async fn get(&self, id: RecordId) -> Result<Option<PhoneRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn find_by_number(
            &self,
            number: &PhoneNumber,
        ) -> Result<Option<PhoneRecord>, StoreError> {
            self.inner.find_by_number(number).await
        }

        async fn list_newest_first(&self) -> Result<Vec<PhoneRecord>, StoreError> {
            self.inner.list_newest_first().await
        }

        async fn most_recent(&self) -> Result<Option<PhoneRecord>, StoreError> {
            self.inner.most_recent().await
        }

        async fn pending(&self, limit: usize) -> Result<Vec<PhoneRecord>, StoreError> {
            self.inner.pending(limit).await
        }

        async fn set_status(
            &self,
            id: RecordId,
            status: CallStatus,
        ) -> Result<PhoneRecord, StoreError> {
            if status == CallStatus::Failed
                && self.fail_next_failed_write.swap(false, Ordering::SeqCst)
            {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.set_status(id, status).await
        }

        async fn mark_dispatched(
            &self,
            id: RecordId,
            reference_id: &str,
            called_at: chrono::DateTime<Utc>,
        ) -> Result<PhoneRecord, StoreError> {
            self.inner.mark_dispatched(id, reference_id, called_at).await
        }

        async fn append_attempt(&self, attempt: NewCallAttempt) -> Result<CallAttempt, StoreError> {
            self.inner.append_attempt(attempt).await
        }

        async fn attempts_for(&self, id: RecordId) -> Result<Vec<CallAttempt>, StoreError> {
            self.inner.attempts_for(id).await
        }

        async fn statistics(&self) -> Result<Statistics, StoreError> {
            self.inner.statistics().await
        }
    }

    #[tokio::test]
    async fn provider_error_survives_failed_status_write() {
        let gw = ScriptedGateway::scripted(vec![Some("busy line")]);
        let store = Arc::new(FlakyStore {
            inner: InMemoryPhoneStore::new(),
            fail_next_failed_write: AtomicBool::new(true),
        });
        let d = Dispatcher::new(store, gw, IntentParser::rule_based(), &config(0));
        let r = seed(&d, &["9000000001"]).await.remove(0);

        let err = d.call_now(r.id, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Call failed: busy line");

        // The background retry gets the record out of `calling`.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after = d.store().get(r.id).await.unwrap().unwrap();
        assert_eq!(after.status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn call_all_over_sqlite() {
        let gw = ScriptedGateway::scripted(vec![None, Some("busy line"), None]);
        let d = Dispatcher::new(
            Arc::new(SqlitePhoneStore::open_in_memory().unwrap()),
            gw.clone(),
            IntentParser::rule_based(),
            &config(0),
        );
        let seeded = seed(&d, &["9000000001", "9000000002", "9000000003"]).await;

        let BatchOutcome::Ran(report) = d.call_all(Some("sale today")).await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].id, seeded[1].id);

        let first = d.attempts(seeded[0].id).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, "sale today");
        assert_eq!(first[0].status, "queued");
        assert!(d.attempts(seeded[1].id).await.unwrap().is_empty());

        let third = d.store().get(seeded[2].id).await.unwrap().unwrap();
        assert_eq!(third.status, CallStatus::Completed);
        assert_eq!(third.call_reference_id.as_deref(), Some("CA3"));

        let stats = d.statistics().await.unwrap();
        assert_eq!((stats.completed, stats.failed, stats.pending), (2, 1, 0));
    }
}
