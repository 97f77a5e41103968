//! The in-memory state store, single writer for call and extension state.
//!
//! All mutations funnel through [`StateStore::apply_event`], which merges a
//! normalized event into the in-memory record under a brief lock and then
//! writes the merged record through to SQLite. The lock is a plain
//! `std::sync::RwLock` and is never held across an `.await`; snapshot
//! accessors read memory only and never touch the database.
//!
//! Ordering between the webhook and reconciliation paths is resolved by
//! status rank, not arrival order: an event whose status ranks at or below
//! the stored one can only attach late fields (recording, end timestamp),
//! while a CDR is authoritative for the finished call and may enrich or
//! correct a record that already reached a terminal status.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tokio::task::spawn_blocking;

use switchboard_db::{self as db, DbError, DbPool};
use switchboard_pbx::PbxExtension;
use switchboard_types::{
    Call, CallDirection, CallEvent, CallStatus, EventKind, Extension, ExtensionEvent,
    ExtensionStatus, NormalizedEvent,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    /// A blocking persistence task panicked or was cancelled.
    #[error("persistence task failed: {0}")]
    Task(String),
}

/// A call update that survived the staleness check.
#[derive(Debug, Clone)]
pub struct AppliedCall {
    /// The merged record after the event was applied.
    pub call: Call,
    /// The extension record, when this event also changed presence.
    pub extension: Option<Extension>,
    /// True when this event created the record.
    pub created: bool,
    /// True when the call just became eligible for post-call processing:
    /// terminal status with a recording reference attached.
    pub ready_for_pipeline: bool,
}

/// Result of applying one normalized event.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The event changed state; subscribers should be notified.
    Applied(AppliedCall),
    /// Duplicate or out-of-order event with nothing new to contribute.
    /// Not an error; nothing is broadcast.
    Stale { call_id: String },
    /// An extension presence change (no call involved).
    ExtensionUpdated(Extension),
}

#[derive(Default)]
struct StateInner {
    calls: HashMap<String, Call>,
    extensions: HashMap<String, Extension>,
}

pub struct StateStore {
    pool: DbPool,
    inner: RwLock<StateInner>,
}

impl StateStore {
    /// Builds the store and warms it from the database: open (non-terminal)
    /// calls and all known extensions.
    pub async fn load(pool: DbPool) -> Result<Self, StoreError> {
        let warm_pool = pool.clone();
        let (calls, extensions) = run_blocking(move || {
            let conn = warm_pool.get()?;
            let calls = db::load_open_calls(&conn)?;
            let extensions = db::load_all_extensions(&conn)?;
            Ok::<_, DbError>((calls, extensions))
        })
        .await?;

        let mut inner = StateInner::default();
        for call in calls {
            inner.calls.insert(call.call_id.clone(), call);
        }
        for ext in extensions {
            inner.extensions.insert(ext.number.clone(), ext);
        }
        tracing::info!(
            open_calls = inner.calls.len(),
            extensions = inner.extensions.len(),
            "state store warmed from database"
        );

        Ok(Self {
            pool,
            inner: RwLock::new(inner),
        })
    }

    /// Applies one normalized event: merge in memory, then write through.
    pub async fn apply_event(&self, event: NormalizedEvent) -> Result<ApplyOutcome, StoreError> {
        match event {
            NormalizedEvent::Call(event) => self.apply_call_event(event).await,
            NormalizedEvent::Extension(event) => self.apply_extension_event(event).await,
        }
    }

    async fn apply_call_event(&self, event: CallEvent) -> Result<ApplyOutcome, StoreError> {
        // Merge under the lock; persistence happens after it is released.
        // Pre-merge snapshots are kept so a failed write-through can be
        // undone instead of leaving memory ahead of the database.
        let merged = {
            let mut inner = self.lock_write();
            let prev_call = inner.calls.get(&event.call_id).cloned();
            match merge_into(&mut inner.calls, &event) {
                Merge::Stale => {
                    tracing::debug!(
                        call_id = %event.call_id,
                        kind = event.kind.as_str(),
                        origin = event.origin.as_str(),
                        "stale event ignored"
                    );
                    return Ok(ApplyOutcome::Stale {
                        call_id: event.call_id,
                    });
                }
                Merge::Applied {
                    call,
                    created,
                    became_terminal,
                } => {
                    let prev_ext = call
                        .extension
                        .as_ref()
                        .and_then(|number| inner.extensions.get(number).cloned());
                    let extension =
                        update_extension_for_call(&mut inner.extensions, &call, &event);
                    (call, created, became_terminal, extension, prev_call, prev_ext)
                }
            }
        };
        let (mut call, created, became_terminal, extension, prev_call, prev_ext) = merged;

        // Write-through plus contact decoration, off the async runtime.
        let pool = self.pool.clone();
        let mut to_persist = call.clone();
        let ext_to_persist = extension.clone();
        let persisted = run_blocking(move || {
            let conn = pool.get()?;
            let contact_id = match to_persist.contact_id {
                Some(id) => Some(id),
                None => external_party(&to_persist)
                    .and_then(|number| db::lookup_contact(&conn, number).transpose())
                    .transpose()?
                    .map(|c| c.id),
            };
            to_persist.contact_id = contact_id;
            db::upsert_call(&conn, &to_persist)?;
            if let Some(ext) = &ext_to_persist {
                db::upsert_extension(&conn, ext)?;
            }
            Ok::<_, DbError>(contact_id)
        })
        .await;

        let contact_id = match persisted {
            Ok(contact_id) => contact_id,
            Err(e) => {
                // A redelivered event must not be judged stale against
                // state the database never saw, or a terminal call could
                // permanently miss persistence and its pipeline job.
                let ext_change = extension.map(|ext| (ext.number, prev_ext));
                self.undo_merge(&call, prev_call, ext_change);
                return Err(e);
            }
        };

        if contact_id.is_some() && call.contact_id.is_none() {
            call.contact_id = contact_id;
            let mut inner = self.lock_write();
            if let Some(stored) = inner.calls.get_mut(&call.call_id) {
                stored.contact_id = contact_id;
            }
        }

        let ready_for_pipeline = became_terminal && call.recording.is_some();
        tracing::debug!(
            call_id = %call.call_id,
            status = call.status.as_str(),
            version = call.version,
            created,
            ready_for_pipeline,
            "call event applied"
        );
        Ok(ApplyOutcome::Applied(AppliedCall {
            call,
            extension,
            created,
            ready_for_pipeline,
        }))
    }

    /// Restores the pre-merge snapshots after a failed write-through. Only
    /// the record this merge produced is replaced; a racing writer that has
    /// already advanced it keeps its newer state.
    fn undo_merge(
        &self,
        merged: &Call,
        prev_call: Option<Call>,
        ext_change: Option<(String, Option<Extension>)>,
    ) {
        let mut inner = self.lock_write();
        let ours = inner
            .calls
            .get(&merged.call_id)
            .is_some_and(|c| c.version == merged.version);
        if ours {
            match prev_call {
                Some(prev) => {
                    inner.calls.insert(merged.call_id.clone(), prev);
                }
                None => {
                    inner.calls.remove(&merged.call_id);
                }
            }
        }
        if let Some((number, prev_ext)) = ext_change {
            match prev_ext {
                Some(prev) => {
                    inner.extensions.insert(number, prev);
                }
                None => {
                    inner.extensions.remove(&number);
                }
            }
        }
    }

    async fn apply_extension_event(
        &self,
        event: ExtensionEvent,
    ) -> Result<ApplyOutcome, StoreError> {
        let (ext, prev) = {
            let mut inner = self.lock_write();
            let prev = inner.extensions.get(&event.extension).cloned();
            let ext = inner
                .extensions
                .entry(event.extension.clone())
                .or_insert_with(|| Extension::new(event.extension.clone()));
            ext.status = event.status;
            ext.registered = event.registered;
            ext.last_seen = Some(chrono::Utc::now());
            if !matches!(event.status, ExtensionStatus::Ringing | ExtensionStatus::OnCall) {
                ext.current_call_id = None;
                ext.current_caller = None;
            }
            (ext.clone(), prev)
        };

        let pool = self.pool.clone();
        let to_persist = ext.clone();
        if let Err(e) = run_blocking(move || {
            let conn = pool.get()?;
            db::upsert_extension(&conn, &to_persist)
        })
        .await
        {
            let mut inner = self.lock_write();
            match prev {
                Some(p) => {
                    inner.extensions.insert(event.extension.clone(), p);
                }
                None => {
                    inner.extensions.remove(&event.extension);
                }
            }
            return Err(e);
        }

        Ok(ApplyOutcome::ExtensionUpdated(ext))
    }

    /// Seeds extension records from the provider's directory listing,
    /// used at startup and by the periodic directory refresh. Returns the
    /// records that were created or changed.
    pub async fn seed_extensions(
        &self,
        listing: Vec<PbxExtension>,
    ) -> Result<Vec<Extension>, StoreError> {
        let changed = {
            let mut inner = self.lock_write();
            let mut changed = Vec::new();
            for entry in listing {
                let ext = inner
                    .extensions
                    .entry(entry.number.clone())
                    .or_insert_with(|| Extension::new(entry.number.clone()));
                let before = ext.clone();
                if entry.name.is_some() {
                    ext.name = entry.name;
                }
                if let Some(presence) = entry.presence.as_deref() {
                    ext.status = presence_to_status(presence);
                    ext.registered = ext.status != ExtensionStatus::Offline;
                }
                if *ext != before {
                    changed.push(ext.clone());
                }
            }
            changed
        };

        if !changed.is_empty() {
            let pool = self.pool.clone();
            let to_persist = changed.clone();
            run_blocking(move || {
                let conn = pool.get()?;
                for ext in &to_persist {
                    db::upsert_extension(&conn, ext)?;
                }
                Ok::<_, DbError>(())
            })
            .await?;
        }
        Ok(changed)
    }

    /// Point-in-time copy of one call. Never touches the database.
    pub fn snapshot_call(&self, call_id: &str) -> Option<Call> {
        self.lock_read().calls.get(call_id).cloned()
    }

    /// Point-in-time copy of one extension. Never touches the database.
    pub fn snapshot_extension(&self, number: &str) -> Option<Extension> {
        self.lock_read().extensions.get(number).cloned()
    }

    /// All in-memory (open) calls, newest first.
    pub fn active_calls(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self.lock_read().calls.values().cloned().collect();
        calls.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        calls
    }

    /// All known extensions ordered by number.
    pub fn extensions(&self) -> Vec<Extension> {
        let mut exts: Vec<Extension> = self.lock_read().extensions.values().cloned().collect();
        exts.sort_by(|a, b| a.number.cmp(&b.number));
        exts
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, StateInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, StateInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DbError> + Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
}

enum Merge {
    Applied {
        call: Call,
        created: bool,
        /// The event moved the call from a non-terminal to a terminal
        /// status, or backfilled a terminal record that had no recording.
        became_terminal: bool,
    },
    Stale,
}

/// Merges `event` into the call map. This is the ordering heart of the
/// store: creation rules, the status-rank gate, and field precedence all
/// live here.
fn merge_into(calls: &mut HashMap<String, Call>, event: &CallEvent) -> Merge {
    match calls.get_mut(&event.call_id) {
        None => {
            // Live terminal events for unknown ids are late stragglers; a
            // CDR, by contrast, is the backfill path and may create the
            // record even at a terminal status.
            if event.status.is_terminal() && event.kind != EventKind::Cdr {
                return Merge::Stale;
            }
            let call = new_call_from_event(event);
            let became_terminal = call.status.is_terminal();
            calls.insert(call.call_id.clone(), call.clone());
            Merge::Applied {
                call,
                created: true,
                became_terminal,
            }
        }
        Some(stored) => {
            let was_terminal_with_recording =
                stored.status.is_terminal() && stored.recording.is_some();
            let before = stored.clone();

            if event.status.rank() > stored.status.rank() {
                apply_transition(stored, event);
            } else if event.kind == EventKind::Cdr {
                // The CDR is the provider's authoritative account of the
                // finished call; it may correct a terminal record.
                apply_cdr(stored, event);
            } else {
                // At or below the stored rank, only late fields attach.
                if stored.recording.is_none() {
                    stored.recording = event.recording.clone();
                }
                if stored.end_time.is_none() {
                    stored.end_time = event.end_time;
                }
            }

            if *stored == before {
                return Merge::Stale;
            }
            stored.version = before.version + 1;
            let became_terminal = stored.status.is_terminal()
                && (!was_terminal_with_recording || !before.status.is_terminal());
            Merge::Applied {
                call: stored.clone(),
                created: false,
                became_terminal,
            }
        }
    }
}

fn new_call_from_event(event: &CallEvent) -> Call {
    let direction = event.direction.unwrap_or_else(|| infer_direction(event));
    let mut call = Call::new(event.call_id.clone(), direction, event.status);
    if let Some(start) = event.start_time {
        call.start_time = start;
    }
    apply_fields(&mut call, event);
    if event.status == CallStatus::Answered && call.answer_time.is_none() {
        call.answer_time = Some(chrono::Utc::now());
    }
    if event.status.is_terminal() {
        finish_call(&mut call, event);
    }
    call
}

/// A forward status transition: adopt the new status and merge fields.
fn apply_transition(stored: &mut Call, event: &CallEvent) {
    stored.status = event.status;
    apply_fields(stored, event);

    if event.status == CallStatus::Answered && stored.answer_time.is_none() {
        stored.answer_time = event.answer_time.or_else(|| Some(chrono::Utc::now()));
    }
    if event.status.is_terminal() {
        finish_call(stored, event);
    }
    // Direction conflicts outside the CDR path keep the stored value.
    if let Some(direction) = event.direction {
        if direction != stored.direction && event.kind != EventKind::Cdr {
            tracing::warn!(
                call_id = %stored.call_id,
                stored = stored.direction.as_str(),
                event = direction.as_str(),
                "conflicting direction from live event, keeping stored"
            );
        } else {
            stored.direction = direction;
        }
    }
}

/// CDR enrichment of an already-terminal record. Unlike live events, the
/// CDR overwrites timing, direction, and disposition.
fn apply_cdr(stored: &mut Call, event: &CallEvent) {
    stored.status = event.status;
    if let Some(direction) = event.direction {
        stored.direction = direction;
    }
    if let Some(start) = event.start_time {
        stored.start_time = start;
    }
    if event.answer_time.is_some() {
        stored.answer_time = event.answer_time;
    }
    apply_fields(stored, event);
    finish_call(stored, event);
}

/// Fills optional identity fields. Non-empty stored values win over live
/// events, but a CDR's values win over everything.
fn apply_fields(call: &mut Call, event: &CallEvent) {
    let authoritative = event.kind == EventKind::Cdr;

    if let Some(v) = &event.caller_number {
        if call.caller_number.is_empty() || authoritative {
            call.caller_number = v.clone();
        }
    }
    if let Some(v) = &event.callee_number {
        if call.callee_number.is_empty() || authoritative {
            call.callee_number = v.clone();
        }
    }
    fill(&mut call.caller_name, &event.caller_name, authoritative);
    fill(&mut call.callee_name, &event.callee_name, authoritative);
    fill(&mut call.trunk, &event.trunk, authoritative);
    fill(&mut call.extension, &event.extension, authoritative);
    if call.recording.is_none() {
        call.recording = event.recording.clone();
    }
    if call.extension.is_none() {
        call.extension = derive_extension(call);
    }
}

fn fill(slot: &mut Option<String>, value: &Option<String>, overwrite: bool) {
    if value.is_some() && (slot.is_none() || overwrite) {
        slot.clone_from(value);
    }
}

/// Settles timing fields on a terminal transition: end timestamp, total
/// duration, and ring time, recomputing from timestamps when the provider
/// did not send explicit values.
fn finish_call(call: &mut Call, event: &CallEvent) {
    if event.end_time.is_some() {
        call.end_time = event.end_time;
    } else if call.end_time.is_none() {
        call.end_time = Some(chrono::Utc::now());
    }

    if let Some(duration) = event.duration {
        call.duration = duration.max(0);
    } else if let Some(end) = call.end_time {
        call.duration = (end - call.start_time).num_seconds().max(0);
    }

    if let Some(ring) = event.ring_duration {
        call.ring_duration = ring.max(0);
    } else if let Some(answer) = call.answer_time {
        call.ring_duration = (answer - call.start_time).num_seconds().max(0);
    }
}

/// The extension is the internal leg: the callee of an inbound call, the
/// caller of an outbound one. Internal calls keep whichever side the
/// provider named explicitly.
fn derive_extension(call: &Call) -> Option<String> {
    let candidate = match call.direction {
        CallDirection::Inbound => &call.callee_number,
        CallDirection::Outbound => &call.caller_number,
        CallDirection::Internal => return None,
    };
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.clone())
    }
}

/// The external party of a call, used for contact-directory lookup.
fn external_party(call: &Call) -> Option<&str> {
    let number = match call.direction {
        CallDirection::Inbound => &call.caller_number,
        CallDirection::Outbound => &call.callee_number,
        CallDirection::Internal => return None,
    };
    if number.is_empty() {
        None
    } else {
        Some(number)
    }
}

/// Direction guess for live events that do not carry one: a short
/// dial-plan-looking origin number means the call left the PBX.
fn infer_direction(event: &CallEvent) -> CallDirection {
    let caller_internal = event.caller_number.as_deref().is_some_and(looks_internal);
    let callee_internal = event.callee_number.as_deref().is_some_and(looks_internal);
    match (caller_internal, callee_internal) {
        (true, true) => CallDirection::Internal,
        (true, false) => CallDirection::Outbound,
        _ => CallDirection::Inbound,
    }
}

fn looks_internal(number: &str) -> bool {
    number.len() <= 6 && number.chars().all(|c| c.is_ascii_digit())
}

/// Mirrors a call event onto the extension's presence record. CDR events
/// only release the extension they occupied; backfilled history must not
/// flip live presence.
fn update_extension_for_call(
    extensions: &mut HashMap<String, Extension>,
    call: &Call,
    event: &CallEvent,
) -> Option<Extension> {
    let number = call.extension.clone()?;
    let ext = extensions
        .entry(number.clone())
        .or_insert_with(|| Extension::new(number));
    let before = ext.clone();

    if event.kind == EventKind::Cdr {
        if ext.current_call_id.as_deref() == Some(call.call_id.as_str()) {
            ext.current_call_id = None;
            ext.current_caller = None;
            ext.status = ExtensionStatus::Available;
        }
    } else {
        ext.last_seen = Some(chrono::Utc::now());
        ext.registered = true;
        match call.status {
            CallStatus::Ringing => {
                ext.status = ExtensionStatus::Ringing;
                ext.current_call_id = Some(call.call_id.clone());
                ext.current_caller = Some(call.caller_number.clone());
            }
            CallStatus::Answered | CallStatus::OnHold => {
                ext.status = ExtensionStatus::OnCall;
                ext.current_call_id = Some(call.call_id.clone());
                ext.current_caller = Some(call.caller_number.clone());
            }
            status if status.is_terminal() => {
                if ext.current_call_id.as_deref() == Some(call.call_id.as_str())
                    || ext.current_call_id.is_none()
                {
                    ext.status = ExtensionStatus::Available;
                    ext.current_call_id = None;
                    ext.current_caller = None;
                }
            }
            _ => {}
        }
    }

    if *ext != before {
        Some(ext.clone())
    } else {
        None
    }
}

fn presence_to_status(presence: &str) -> ExtensionStatus {
    match presence.to_lowercase().as_str() {
        "available" | "idle" => ExtensionStatus::Available,
        "ringing" => ExtensionStatus::Ringing,
        "talking" | "on_call" => ExtensionStatus::OnCall,
        "busy" => ExtensionStatus::Busy,
        "do_not_disturb" | "dnd" => ExtensionStatus::Dnd,
        "unavailable" | "offline" => ExtensionStatus::Offline,
        _ => ExtensionStatus::Available,
    }
}
