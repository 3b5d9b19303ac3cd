//! One push pass over the outbox

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::transport::{Delivered, Transport, TransportError};
use crate::db::Database;
use crate::error::Result;
use crate::models::{Operation, OutboxEntry, OutboxStatus};
use crate::util::{is_temporary_id, now_ms};

/// Mutable state of one dispatch pass
///
/// Owned by the caller so independent sessions never share bookkeeping.
/// Use a fresh context per pass: entries attempted once are not sent again
/// under the same context.
#[derive(Debug, Default)]
pub struct DispatchContext {
    attempted: HashSet<i64>,
    skipped: HashSet<i64>,
    outcomes: Vec<(i64, DispatchOutcome)>,
    current: Option<i64>,
    cancel: Arc<AtomicBool>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a cancellation flag with whoever may abort the pass
    pub fn with_cancel_flag(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Entry currently on the wire, if any
    pub const fn current_entry(&self) -> Option<i64> {
        self.current
    }

    /// Outcome per outbox entry, in dispatch order, entries left waiting last
    pub fn outcomes(&self) -> &[(i64, DispatchOutcome)] {
        &self.outcomes
    }
}

/// What happened to one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Synced,
    /// Failed below the retry ceiling, back to pending
    Retrying,
    /// Failed at the retry ceiling
    Failed,
    Conflict,
    /// Not sent: a temporary id it references has no mapping yet
    DependencyUnsatisfied,
}

/// Counters for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Transport calls made
    pub sent: usize,
    pub synced: usize,
    pub retrying: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Entries still waiting on a dependency at the end of the pass
    pub skipped: usize,
    pub cancelled: bool,
}

impl PassReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Synced => self.synced += 1,
            DispatchOutcome::Retrying => self.retrying += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Conflict => self.conflicts += 1,
            DispatchOutcome::DependencyUnsatisfied => self.skipped += 1,
        }
    }
}

/// A pending entry as it would go out right now
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEntry {
    /// Identifiers resolved with the mappings known so far
    pub entry: OutboxEntry,
    pub ready: bool,
}

/// Drives the outbox against a transport
pub struct SyncEngine<'a> {
    db: &'a Database,
}

impl<'a> SyncEngine<'a> {
    pub const fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Crash recovery; call once before the first pass
    pub fn startup(&self) -> Result<usize> {
        self.db.outbox().reset_in_progress()
    }

    /// Pending entries in dispatch order with their readiness
    pub fn plan(&self) -> Result<Vec<PlannedEntry>> {
        let outbox = self.db.outbox();
        outbox
            .get_pending_ordered()?
            .iter()
            .map(|entry| -> Result<PlannedEntry> {
                Ok(PlannedEntry {
                    ready: outbox.are_dependencies_satisfied(entry)?,
                    entry: outbox.resolve_payload_ids(entry)?,
                })
            })
            .collect()
    }

    /// Send pending entries until none is ready
    ///
    /// The queue is re-read after every send, so an entry skipped for an
    /// unmapped dependency goes out in the same pass once its parent syncs.
    /// Each entry is attempted at most once per pass. Cancellation is checked
    /// between entries; an interrupted send is recovered by [`Self::startup`].
    pub async fn push<T: Transport>(
        &self,
        transport: &T,
        ctx: &mut DispatchContext,
    ) -> Result<PassReport> {
        let outbox = self.db.outbox();
        let mut report = PassReport::default();

        loop {
            if ctx.is_cancelled() {
                report.cancelled = true;
                tracing::info!("Push pass cancelled");
                break;
            }

            let mut next = None;
            for entry in outbox.get_pending_ordered()? {
                if ctx.attempted.contains(&entry.seq) {
                    continue;
                }
                if outbox.are_dependencies_satisfied(&entry)? {
                    next = Some(entry);
                    break;
                }
                if ctx.skipped.insert(entry.seq) {
                    tracing::debug!(
                        "Outbox entry {} waits for {} unmapped dependencies",
                        entry.seq,
                        entry.dependencies.len()
                    );
                }
            }
            let Some(entry) = next else {
                break;
            };

            ctx.skipped.remove(&entry.seq);
            let outcome = self.dispatch(transport, ctx, &entry).await?;
            ctx.outcomes.push((entry.seq, outcome));
            report.sent += 1;
            report.record(outcome);
        }

        let mut waiting: Vec<i64> = ctx.skipped.iter().copied().collect();
        waiting.sort_unstable();
        for seq in waiting {
            ctx.outcomes
                .push((seq, DispatchOutcome::DependencyUnsatisfied));
            report.record(DispatchOutcome::DependencyUnsatisfied);
        }
        if report.sent > 0 {
            self.db.sync_meta().set_last_push_at(now_ms())?;
        }
        tracing::info!(
            "Push pass: {} sent, {} synced, {} retrying, {} failed, {} conflicts, {} waiting",
            report.sent,
            report.synced,
            report.retrying,
            report.failed,
            report.conflicts,
            report.skipped
        );
        Ok(report)
    }

    async fn dispatch<T: Transport>(
        &self,
        transport: &T,
        ctx: &mut DispatchContext,
        entry: &OutboxEntry,
    ) -> Result<DispatchOutcome> {
        ctx.attempted.insert(entry.seq);
        ctx.current = Some(entry.seq);
        let outcome = self.deliver(transport, entry.seq).await;
        ctx.current = None;
        outcome
    }

    async fn deliver<T: Transport>(&self, transport: &T, seq: i64) -> Result<DispatchOutcome> {
        let outbox = self.db.outbox();
        let entry = outbox.mark_in_progress(seq)?;
        let resolved = outbox.resolve_payload_ids(&entry)?;

        match transport.send(&resolved).await {
            Ok(delivered) => match self.acknowledge(&entry, delivered) {
                Ok(()) => Ok(DispatchOutcome::Synced),
                Err(error) => {
                    tracing::error!(
                        "Outbox entry {seq} was accepted but could not be recorded: {error}"
                    );
                    self.fail(seq, &format!("acknowledgement not recorded: {error}"))
                }
            },
            Err(TransportError::Conflict { server_version }) => {
                outbox.mark_conflict(seq, server_version)?;
                Ok(DispatchOutcome::Conflict)
            }
            Err(error) => self.fail(seq, &error.to_string()),
        }
    }

    fn fail(&self, seq: i64, error: &str) -> Result<DispatchOutcome> {
        let failed = self.db.outbox().mark_failed(seq, error)?;
        Ok(if failed.status == OutboxStatus::Failed {
            DispatchOutcome::Failed
        } else {
            DispatchOutcome::Retrying
        })
    }

    /// Map the created entity's id and repair references before the entry
    /// is marked synced, so no dependent can go out with a stale id
    fn acknowledge(&self, entry: &OutboxEntry, delivered: Delivered) -> Result<()> {
        if entry.operation == Operation::Create {
            if let Some(temp_id) = &entry.temp_id {
                match delivered.assigned_id() {
                    Some(server_id) if !is_temporary_id(&server_id) => {
                        self.db
                            .id_mapper()
                            .map_and_repair(&entry.entity_type, temp_id, &server_id)?;
                    }
                    _ => tracing::warn!(
                        "Server acknowledged {} {temp_id} without assigning an id",
                        entry.entity_type
                    ),
                }
            }
        }

        self.db.outbox().mark_synced(entry.seq, delivered.response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::config::SyncConfig;
    use crate::db::EntityRepository;
    use crate::schema::tests::youth_schema;
    use crate::tests::fields;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    /// Succeeds unless a failure was scripted for the entity id, handing out
    /// sequential server ids for creates
    #[derive(Default)]
    struct ScriptedTransport {
        failures: RefCell<HashMap<String, VecDeque<TransportError>>>,
        sent: RefCell<Vec<OutboxEntry>>,
        next_id: Cell<u64>,
        cancel_after_first: Option<Arc<AtomicBool>>,
    }

    impl ScriptedTransport {
        fn fail(&self, entity_id: &str, error: TransportError) {
            self.failures
                .borrow_mut()
                .entry(entity_id.to_string())
                .or_default()
                .push_back(error);
        }

        fn sent_ids(&self) -> Vec<String> {
            self.sent
                .borrow()
                .iter()
                .map(|entry| entry.entity_id.clone())
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, entry: &OutboxEntry) -> std::result::Result<Delivered, TransportError> {
            self.sent.borrow_mut().push(entry.clone());
            if let Some(cancel) = &self.cancel_after_first {
                cancel.store(true, Ordering::Relaxed);
            }

            let scripted = self
                .failures
                .borrow_mut()
                .get_mut(&entry.entity_id)
                .and_then(VecDeque::pop_front);
            if let Some(error) = scripted {
                return Err(error);
            }

            if entry.operation == Operation::Create {
                let id = self.next_id.get() + 100;
                self.next_id.set(self.next_id.get() + 1);
                return Ok(Delivered::created(
                    id.to_string(),
                    json!({ "id": id, "updated_at": 1_700_000_000_000_i64 }),
                ));
            }
            Ok(Delivered::new(Value::Null))
        }
    }

    fn setup() -> Database {
        Database::open_in_memory(youth_schema(), SyncConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_unrecordable_acknowledgement_fails_entry_and_pass_continues() {
        let db = setup();
        let repo = db.repository();
        // Server id 100 is already bound, so mapping the first create must fail
        db.id_mapper().add_mapping("groups", "temp_elsewhere", "100").unwrap();
        let troop = repo.create("groups", fields(json!({ "name": "Troop" }))).unwrap();
        let pack = repo.create("groups", fields(json!({ "name": "Pack" }))).unwrap();
        let transport = ScriptedTransport::default();

        let mut ctx = DispatchContext::new();
        let report = SyncEngine::new(&db).push(&transport, &mut ctx).await.unwrap();

        assert_eq!(transport.sent_ids(), vec![troop.id.clone(), pack.id.clone()]);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(ctx.current_entry(), None);

        let outbox = db.outbox();
        let pending = outbox.get_pending_ordered().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, troop.id);
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0]
            .last_error
            .as_deref()
            .is_some_and(|error| error.starts_with("acknowledgement not recorded")));
        assert_eq!(
            db.id_mapper().get_server_id("groups", &pack.id).unwrap().as_deref(),
            Some("101")
        );
        assert!(repo.get("groups", &troop.id).unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_push_maps_ids_through_the_graph() {
        let db = setup();
        let repo = db.repository();
        let group = repo.create("groups", fields(json!({ "name": "Troop" }))).unwrap();
        let ada = repo
            .create("participants", fields(json!({ "name": "Ada", "group_id": group.id })))
            .unwrap();
        repo.create("attendance", fields(json!({ "participant_id": ada.id })))
            .unwrap();

        let transport = ScriptedTransport::default();
        let engine = SyncEngine::new(&db);
        let report = engine
            .push(&transport, &mut DispatchContext::new())
            .await
            .unwrap();

        assert_eq!(report.sent, 3);
        assert_eq!(report.synced, 3);
        assert_eq!(report.skipped, 0);

        let sent = transport.sent.borrow();
        assert_eq!(sent[0].entity_type, "groups");
        assert_eq!(sent[1].payload["group_id"], json!("100"));
        assert_eq!(sent[2].payload["participant_id"], json!("101"));
        drop(sent);

        assert_eq!(db.outbox().pending_count().unwrap(), 0);
        let ada = repo.get("participants", "101").unwrap().unwrap();
        assert!(!ada.dirty);
        assert_eq!(ada.field("group_id"), Some(&json!("100")));
        assert!(db.sync_meta().last_push_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unsatisfied_entries_are_skipped_not_blocking() {
        let db = setup();
        let repo = db.repository();
        let group = repo.create("groups", fields(json!({ "name": "Troop" }))).unwrap();
        let ada = repo
            .create("participants", fields(json!({ "name": "Ada", "group_id": group.id })))
            .unwrap();
        let other = repo
            .create("participants", fields(json!({ "name": "Lin", "group_id": "55" })))
            .unwrap();

        let transport = ScriptedTransport::default();
        transport.fail(&group.id, TransportError::Network("offline".to_string()));

        let mut ctx = DispatchContext::new();
        let report = SyncEngine::new(&db).push(&transport, &mut ctx).await.unwrap();

        // The group failed, so Ada waits while the independent participant goes out
        assert_eq!(transport.sent_ids(), vec![group.id.clone(), other.id.clone()]);
        assert_eq!(report.retrying, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(report.skipped, 1);

        let plan = SyncEngine::new(&db).plan().unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan[0].ready);
        assert_eq!(plan[1].entry.entity_id, ada.id);
        assert!(!plan[1].ready);

        let outcomes: Vec<DispatchOutcome> = ctx.outcomes().iter().map(|(_, o)| *o).collect();
        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::Retrying,
                DispatchOutcome::Synced,
                DispatchOutcome::DependencyUnsatisfied
            ]
        );
        assert_eq!(ctx.outcomes()[2].0, plan[1].entry.seq);
    }

    #[tokio::test]
    async fn test_failed_entry_is_attempted_once_per_pass() {
        let db = setup();
        let group = db
            .repository()
            .create("groups", fields(json!({ "name": "Troop" })))
            .unwrap();
        let transport = ScriptedTransport::default();
        transport.fail(&group.id, TransportError::Rejected("bad name".to_string()));
        transport.fail(&group.id, TransportError::Rejected("bad name".to_string()));

        let engine = SyncEngine::new(&db);
        let first = engine.push(&transport, &mut DispatchContext::new()).await.unwrap();
        assert_eq!((first.sent, first.retrying), (1, 1));

        let second = engine.push(&transport, &mut DispatchContext::new()).await.unwrap();
        assert_eq!((second.sent, second.retrying), (1, 1));

        let third = engine.push(&transport, &mut DispatchContext::new()).await.unwrap();
        assert_eq!(third.synced, 1);

        let entry = db.outbox().list_by_status(OutboxStatus::Synced).unwrap();
        assert_eq!(entry[0].retry_count, 2);
        assert_eq!(entry[0].last_error, None);
    }

    #[tokio::test]
    async fn test_conflict_is_parked() {
        let db = setup();
        let repo = db.repository();
        repo.bulk_upsert("groups", &[json!({ "id": "100", "name": "Troop" })])
            .unwrap();
        repo.update("groups", "100", fields(json!({ "name": "Troop 7" })))
            .unwrap();

        let transport = ScriptedTransport::default();
        transport.fail(
            "100",
            TransportError::Conflict {
                server_version: json!({ "id": "100", "name": "Troop Seven" }),
            },
        );

        let engine = SyncEngine::new(&db);
        let report = engine.push(&transport, &mut DispatchContext::new()).await.unwrap();
        assert_eq!(report.conflicts, 1);

        // Never auto-retried
        let report = engine.push(&transport, &mut DispatchContext::new()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(db.conflicts().unresolved_count().unwrap(), 1);
        assert!(repo.get("groups", "100").unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_entries() {
        let db = setup();
        let repo = db.repository();
        repo.create("groups", fields(json!({ "name": "A" }))).unwrap();
        repo.create("groups", fields(json!({ "name": "B" }))).unwrap();

        let mut ctx = DispatchContext::new();
        let transport = ScriptedTransport {
            cancel_after_first: Some(ctx.cancel_handle()),
            ..ScriptedTransport::default()
        };

        let report = SyncEngine::new(&db).push(&transport, &mut ctx).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.sent, 1);
        assert_eq!(ctx.current_entry(), None);
        assert_eq!(db.outbox().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_startup_requeues_interrupted_entries() {
        let db = setup();
        db.repository()
            .create("groups", fields(json!({ "name": "A" })))
            .unwrap();
        let outbox = db.outbox();
        let seq = outbox.get_pending_ordered().unwrap()[0].seq;
        outbox.mark_in_progress(seq).unwrap();

        let engine = SyncEngine::new(&db);
        assert_eq!(engine.startup().unwrap(), 1);

        let transport = ScriptedTransport::default();
        let report = engine.push(&transport, &mut DispatchContext::new()).await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_replayed_create_maps_once() {
        let db = setup();
        let group = db
            .repository()
            .create("groups", fields(json!({ "name": "A" })))
            .unwrap();
        // Crash after the mapping was written but before the entry was marked
        db.id_mapper().map_and_repair("groups", &group.id, "100").unwrap();

        let transport = ScriptedTransport::default();
        let report = SyncEngine::new(&db)
            .push(&transport, &mut DispatchContext::new())
            .await
            .unwrap();

        assert_eq!(report.synced, 1);
        // The resolved entry went out under the permanent id
        assert_eq!(transport.sent_ids(), vec!["100".to_string()]);
        assert!(!db.repository().get("groups", "100").unwrap().unwrap().dirty);
    }
}
