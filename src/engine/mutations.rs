use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{resolve_bookable, resolve_chain};
use super::conflict::{check_no_conflict, validate_span};
use super::quota::check_quota;
use super::{BookingScope, Engine, EngineError, WalCommand, lifecycle};

fn validate_text(title: Option<&str>, description: Option<&str>) -> Result<(), EngineError> {
    if title.is_some_and(|t| t.len() > MAX_TITLE_LEN) {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

fn validate_attendees(count: u32, space: &Space) -> Result<(), EngineError> {
    if count == 0 {
        return Err(EngineError::Validation("attendees_count must be at least 1"));
    }
    if count > MAX_ATTENDEES {
        return Err(EngineError::LimitExceeded("too many attendees"));
    }
    if count > space.capacity {
        return Err(EngineError::Validation("attendees_count exceeds space capacity"));
    }
    Ok(())
}

fn authorize(actor: &Actor, reservation: &Reservation) -> Result<(), EngineError> {
    if actor.may_act_for(reservation.user_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}

/// The reservation as currently held in the locked scope.
fn current(scope: &BookingScope, id: Ulid) -> Result<Reservation, EngineError> {
    scope
        .schedule
        .get(id)
        .cloned()
        .ok_or(EngineError::NotFound(id))
}

fn record_outcome<T>(operation: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => {
            debug!(operation, "reservation rejected: {e}");
            observability::error_label(e)
        }
    };
    metrics::counter!(observability::RESERVATIONS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
}

impl Engine {
    /// Book a space for the acting user.
    ///
    /// Conflict and quota are checked while holding the user's ledger and
    /// the space's schedule, so two racing requests for the same slot (or
    /// the same user's last quota slot) serialize and exactly one wins.
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        request: NewReservation,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self.create_reservation_inner(actor, request, now).await;
        record_outcome("create", &result);
        result
    }

    async fn create_reservation_inner(
        &self,
        actor: &Actor,
        request: NewReservation,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let span = Span::checked(request.start, request.end)
            .ok_or(EngineError::Validation("start_time must be before end_time"))?;
        if span.start < now {
            return Err(EngineError::Validation("start_time is in the past"));
        }
        validate_span(&span)?;
        validate_text(request.title.as_deref(), request.description.as_deref())?;
        let attendees_count = request.attendees_count.unwrap_or(1);

        let _commit = self.commit_gate.read().await;
        let mut scope = self.lock_scope(actor.user_id, request.space_id).await?;
        if self.store.contains(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }

        let chain = resolve_bookable(&self.catalog, request.space_id).await?;
        validate_attendees(attendees_count, &chain.space)?;
        if scope.schedule.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many reservations on space"));
        }
        check_no_conflict(&scope.schedule, &span, None)?;
        check_quota(&scope.ledger, &span, None, &chain.rules())?;

        let reservation = Reservation {
            id: request.id,
            space_id: request.space_id,
            user_id: actor.user_id,
            span,
            title: request.title,
            description: request.description,
            attendees_count,
            status: ReservationStatus::Confirmed,
            created_by: actor.user_id,
            created_at: now,
            updated_by: None,
            updated_at: None,
            cancelled_by: None,
            cancelled_at: None,
            checked_in_by: None,
            checked_in_at: None,
            checked_out_by: None,
            checked_out_at: None,
        };
        self.persist_reservation(
            &mut scope,
            &Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )
        .await?;
        info!(
            reservation_id = %reservation.id,
            space_id = %reservation.space_id,
            user_id = %reservation.user_id,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Apply a partial edit. A changed interval is re-checked for conflict
    /// and quota with the reservation itself excluded.
    pub async fn update_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: ReservationPatch,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self.update_reservation_inner(actor, id, patch, now).await;
        record_outcome("update", &result);
        result
    }

    async fn update_reservation_inner(
        &self,
        actor: &Actor,
        id: Ulid,
        patch: ReservationPatch,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update"));
        }
        validate_text(patch.title.as_deref(), patch.description.as_deref())?;

        let _commit = self.commit_gate.read().await;
        let mut scope = self.lock_reservation(id).await?;
        let existing = current(&scope, id)?;
        authorize(actor, &existing)?;
        lifecycle::ensure_editable(&existing)?;

        let span = Span::checked(
            patch.start.unwrap_or(existing.span.start),
            patch.end.unwrap_or(existing.span.end),
        )
        .ok_or(EngineError::Validation("start_time must be before end_time"))?;

        let chain = resolve_chain(&self.catalog, existing.space_id).await?;
        let attendees_count = patch.attendees_count.unwrap_or(existing.attendees_count);
        if patch.attendees_count.is_some() {
            validate_attendees(attendees_count, &chain.space)?;
        }

        if span != existing.span {
            if span.start != existing.span.start && span.start < now {
                return Err(EngineError::Validation("start_time is in the past"));
            }
            if span.end != existing.span.end && span.end <= now {
                return Err(EngineError::Validation("end_time is in the past"));
            }
            validate_span(&span)?;
            check_no_conflict(&scope.schedule, &span, Some(id))?;
            check_quota(&scope.ledger, &span, Some(id), &chain.rules())?;
        }

        let event = Event::ReservationUpdated {
            id,
            space_id: existing.space_id,
            span,
            title: patch.title.or(existing.title),
            description: patch.description.or(existing.description),
            attendees_count,
            by: actor.user_id,
            at: now,
        };
        self.persist_reservation(&mut scope, &event).await?;
        current(&scope, id)
    }

    /// Cancel a confirmed or checked-in reservation.
    pub async fn cancel_reservation(
        &self,
        actor: &Actor,
        id: Ulid,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self.cancel_reservation_inner(actor, id, now).await;
        record_outcome("cancel", &result);
        result
    }

    async fn cancel_reservation_inner(
        &self,
        actor: &Actor,
        id: Ulid,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut scope = self.lock_reservation(id).await?;
        let existing = current(&scope, id)?;
        authorize(actor, &existing)?;
        lifecycle::cancel(&existing)?;

        let event = Event::ReservationCancelled {
            id,
            space_id: existing.space_id,
            by: actor.user_id,
            at: now,
        };
        self.persist_reservation(&mut scope, &event).await?;
        info!(reservation_id = %id, by = %actor.user_id, "reservation cancelled");
        current(&scope, id)
    }

    /// Check in within the building's window and record the audit entry.
    pub async fn check_in(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<CheckInRecord, EngineError> {
        let result = self.check_in_inner(actor, id, now).await;
        record_outcome("check_in", &result);
        result
    }

    async fn check_in_inner(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<CheckInRecord, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut scope = self.lock_reservation(id).await?;
        let existing = current(&scope, id)?;
        authorize(actor, &existing)?;
        let chain = resolve_chain(&self.catalog, existing.space_id).await?;
        lifecycle::check_in(&existing, now, chain.rules().check_in_window_ms())?;

        let event = Event::ReservationCheckedIn {
            id,
            space_id: existing.space_id,
            record_id: Ulid::new(),
            by: actor.user_id,
            at: now,
        };
        self.persist_reservation(&mut scope, &event).await?;
        self.store.check_in(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn check_out(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let result = self.check_out_inner(actor, id, now).await;
        record_outcome("check_out", &result);
        result
    }

    async fn check_out_inner(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut scope = self.lock_reservation(id).await?;
        let existing = current(&scope, id)?;
        authorize(actor, &existing)?;
        lifecycle::check_out(&existing)?;

        let event = Event::ReservationCheckedOut {
            id,
            space_id: existing.space_id,
            by: actor.user_id,
            at: now,
        };
        self.persist_reservation(&mut scope, &event).await?;
        current(&scope, id)
    }

    /// Rewrite the WAL as the minimal event set that reproduces current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = self.catalog.snapshot_events();
        let mut space_ids: Vec<Ulid> = self.schedules.iter().map(|e| *e.key()).collect();
        space_ids.sort();
        for space_id in space_ids {
            let Some(schedule) = self.schedule(&space_id) else {
                continue;
            };
            let guard = schedule.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }
        events.extend(
            self.store
                .check_in_records()
                .into_iter()
                .map(|record| Event::CheckInRecorded { record }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreFailure(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
