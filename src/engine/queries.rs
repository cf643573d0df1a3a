use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::resolve_chain;
use super::occupancy::occupancy;
use super::{Engine, EngineError};

fn validate_window(start: Ms, end: Ms) -> Result<(), EngineError> {
    if end < start {
        return Err(EngineError::Validation("period end must not be before period start"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

fn filter_status(reservations: &mut Vec<Reservation>, status: Option<ReservationStatus>) {
    if let Some(status) = status {
        reservations.retain(|r| r.status == status);
    }
}

impl Engine {
    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let key = self.store.key(id)?;
        let schedule = self.schedule(&key.space_id)?;
        let guard = schedule.read().await;
        guard.get(*id).cloned()
    }

    /// All reservations on a space, by start time.
    pub async fn reservations_for_space(
        &self,
        space_id: Ulid,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let schedule = self
            .schedule(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let mut out = schedule.read().await.reservations.clone();
        filter_status(&mut out, status);
        Ok(out)
    }

    /// All reservations a user owns, across spaces, by start time.
    pub async fn reservations_for_user(
        &self,
        user_id: Ulid,
        status: Option<ReservationStatus>,
    ) -> Vec<Reservation> {
        let mut by_space: BTreeMap<Ulid, Vec<Ulid>> = BTreeMap::new();
        for id in self.store.ids_for_user(&user_id) {
            if let Some(key) = self.store.key(&id) {
                by_space.entry(key.space_id).or_default().push(id);
            }
        }

        let mut out = Vec::new();
        for (space_id, ids) in by_space {
            let Some(schedule) = self.schedule(&space_id) else {
                continue;
            };
            let guard = schedule.read().await;
            out.extend(ids.iter().filter_map(|id| guard.get(*id).cloned()));
        }
        filter_status(&mut out, status);
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Reservations on any space whose start falls in `[start, end]`.
    pub async fn reservations_starting_in(&self, start: Ms, end: Ms) -> Result<Vec<Reservation>, EngineError> {
        validate_window(start, end)?;
        let schedules: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for schedule in schedules {
            let guard = schedule.read().await;
            let from = guard.reservations.partition_point(|r| r.span.start < start);
            out.extend(
                guard.reservations[from..]
                    .iter()
                    .take_while(|r| r.span.start <= end)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        Ok(out)
    }

    pub fn check_in_record(&self, reservation_id: &Ulid) -> Option<CheckInRecord> {
        self.store.check_in(reservation_id)
    }

    /// Utilization over `[start, end]` for a space, user, floor or building.
    pub async fn occupancy_report(
        &self,
        scope: OccupancyScope,
        start: Ms,
        end: Ms,
    ) -> Result<OccupancyStats, EngineError> {
        validate_window(start, end)?;
        match scope {
            OccupancyScope::Space(id) => {
                let schedule = self.schedule(&id).ok_or(EngineError::NotFound(id))?;
                let guard = schedule.read().await;
                Ok(occupancy(&guard.reservations, start, end, 1))
            }
            OccupancyScope::User(id) => {
                let reservations = self.reservations_for_user(id, None).await;
                Ok(occupancy(&reservations, start, end, 1))
            }
            OccupancyScope::Floor(id) => {
                if self.catalog.floor(&id).is_none() {
                    return Err(EngineError::NotFound(id));
                }
                let spaces = self.catalog.spaces_on_floor(&id);
                self.aggregate_occupancy(spaces, start, end).await
            }
            OccupancyScope::Building(id) => {
                if self.catalog.building(&id).is_none() {
                    return Err(EngineError::NotFound(id));
                }
                let spaces = self.catalog.spaces_in_building(&id);
                self.aggregate_occupancy(spaces, start, end).await
            }
        }
    }

    /// Pool reservations across the currently bookable spaces; each one
    /// contributes a full period's worth of available hours.
    async fn aggregate_occupancy(
        &self,
        space_ids: Vec<Ulid>,
        start: Ms,
        end: Ms,
    ) -> Result<OccupancyStats, EngineError> {
        let mut pooled = Vec::new();
        let mut units = 0usize;
        for space_id in space_ids {
            let chain = resolve_chain(&self.catalog, space_id).await?;
            if !chain.is_bookable() {
                continue;
            }
            let Some(schedule) = self.schedule(&space_id) else {
                continue;
            };
            units += 1;
            pooled.extend(schedule.read().await.reservations.iter().cloned());
        }
        Ok(occupancy(&pooled, start, end, units))
    }
}
