use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::Directory;
use super::conflict::live_reservations;
use super::{Engine, EngineError};

/// Buildings, floors, spaces and users, plus parent → children indexes.
pub struct Catalog {
    buildings: DashMap<Ulid, Building>,
    floors: DashMap<Ulid, Floor>,
    spaces: DashMap<Ulid, Space>,
    users: DashMap<Ulid, User>,
    floors_by_building: DashMap<Ulid, Vec<Ulid>>,
    spaces_by_floor: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn relink(index: &DashMap<Ulid, Vec<Ulid>>, child: Ulid, old_parent: Option<Ulid>, new_parent: Ulid) {
    if old_parent == Some(new_parent) {
        return;
    }
    if let Some(old) = old_parent
        && let Some(mut kids) = index.get_mut(&old)
    {
        kids.retain(|c| *c != child);
    }
    index.entry(new_parent).or_default().push(child);
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            buildings: DashMap::new(),
            floors: DashMap::new(),
            spaces: DashMap::new(),
            users: DashMap::new(),
            floors_by_building: DashMap::new(),
            spaces_by_floor: DashMap::new(),
        }
    }

    pub fn building(&self, id: &Ulid) -> Option<Building> {
        self.buildings.get(id).map(|e| e.value().clone())
    }

    pub fn floor(&self, id: &Ulid) -> Option<Floor> {
        self.floors.get(id).map(|e| e.value().clone())
    }

    pub fn space(&self, id: &Ulid) -> Option<Space> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.buildings.len() + self.floors.len() + self.spaces.len() + self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn floors_in_building(&self, building_id: &Ulid) -> Vec<Ulid> {
        self.floors_by_building
            .get(building_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn spaces_on_floor(&self, floor_id: &Ulid) -> Vec<Ulid> {
        self.spaces_by_floor
            .get(floor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn spaces_in_building(&self, building_id: &Ulid) -> Vec<Ulid> {
        self.floors_in_building(building_id)
            .iter()
            .flat_map(|floor_id| self.spaces_on_floor(floor_id))
            .collect()
    }

    pub fn apply(&self, event: &Event) {
        match event {
            Event::BuildingSaved { building } => {
                self.buildings.insert(building.id, building.clone());
            }
            Event::FloorSaved { floor } => {
                let previous = self.floors.insert(floor.id, floor.clone());
                relink(
                    &self.floors_by_building,
                    floor.id,
                    previous.map(|f| f.building_id),
                    floor.building_id,
                );
            }
            Event::SpaceSaved { space } => {
                let previous = self.spaces.insert(space.id, space.clone());
                relink(
                    &self.spaces_by_floor,
                    space.id,
                    previous.map(|s| s.floor_id),
                    space.floor_id,
                );
            }
            Event::UserSaved { user } => {
                self.users.insert(user.id, user.clone());
            }
            _ => {}
        }
    }

    /// Current catalog as events, parents before children.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.len());
        events.extend(self.users.iter().map(|e| Event::UserSaved {
            user: e.value().clone(),
        }));
        events.extend(self.buildings.iter().map(|e| Event::BuildingSaved {
            building: e.value().clone(),
        }));
        events.extend(self.floors.iter().map(|e| Event::FloorSaved {
            floor: e.value().clone(),
        }));
        events.extend(self.spaces.iter().map(|e| Event::SpaceSaved {
            space: e.value().clone(),
        }));
        events
    }
}

#[async_trait]
impl Directory for Catalog {
    async fn space(&self, id: Ulid) -> Option<Space> {
        Catalog::space(self, &id)
    }

    async fn floor(&self, id: Ulid) -> Option<Floor> {
        Catalog::floor(self, &id)
    }

    async fn building(&self, id: Ulid) -> Option<Building> {
        Catalog::building(self, &id)
    }
}

// ── Validation ───────────────────────────────────────────

fn require_admin(actor: &Actor) -> Result<(), EngineError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}

fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(what));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_building(building: &Building) -> Result<(), EngineError> {
    validate_name(&building.name, "building name is required")?;
    if let Some(address) = &building.address
        && address.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    if building.rules.max_concurrent_reservations > MAX_CONCURRENT_RESERVATIONS {
        return Err(EngineError::LimitExceeded("max_concurrent too large"));
    }
    if building.rules.check_in_window_minutes > MAX_CHECK_IN_WINDOW_MINUTES {
        return Err(EngineError::LimitExceeded("check_in_window too large"));
    }
    Ok(())
}

fn validate_space(space: &Space) -> Result<(), EngineError> {
    if let Some(name) = &space.name {
        validate_name(name, "space name must not be blank")?;
    }
    if space.capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1"));
    }
    if space.capacity > MAX_ATTENDEES {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_user(user: &User) -> Result<(), EngineError> {
    validate_name(&user.name, "user name is required")?;
    if user.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if !user.email.contains('@') {
        return Err(EngineError::Validation("email is invalid"));
    }
    Ok(())
}

// ── Catalog mutations ────────────────────────────────────

impl Engine {
    fn ensure_catalog_room(&self, exists: bool) -> Result<(), EngineError> {
        if !exists && self.catalog.len() >= MAX_CATALOG_ENTRIES {
            return Err(EngineError::LimitExceeded("too many catalog entries"));
        }
        Ok(())
    }

    /// Write-lock every schedule in `space_ids` (sorted, so concurrent
    /// deactivations can't deadlock) and fail if any still holds a live
    /// reservation. The guards keep new bookings out until the caller
    /// has persisted the deactivation.
    async fn lock_idle_spaces(
        &self,
        mut space_ids: Vec<Ulid>,
        owner: Ulid,
        now: Ms,
    ) -> Result<Vec<OwnedRwLockWriteGuard<SpaceSchedule>>, EngineError> {
        space_ids.sort();
        space_ids.dedup();
        let mut guards = Vec::with_capacity(space_ids.len());
        for id in space_ids {
            let Some(schedule) = self.schedule(&id) else {
                continue;
            };
            let guard = schedule.write_owned().await;
            if live_reservations(&guard, now).next().is_some() {
                return Err(EngineError::HasActiveReservations(owner));
            }
            guards.push(guard);
        }
        Ok(guards)
    }

    async fn any_live(&self, space_ids: &[Ulid], now: Ms) -> bool {
        for id in space_ids {
            if let Some(schedule) = self.schedule(id)
                && live_reservations(&*schedule.read().await, now).next().is_some()
            {
                return true;
            }
        }
        false
    }

    /// Fails with `HasActiveReservations` if the space holds a live reservation.
    pub async fn ensure_space_can_deactivate(&self, space_id: Ulid, now: Ms) -> Result<(), EngineError> {
        if self.catalog.space(&space_id).is_none() {
            return Err(EngineError::NotFound(space_id));
        }
        if self.any_live(&[space_id], now).await {
            return Err(EngineError::HasActiveReservations(space_id));
        }
        Ok(())
    }

    pub async fn ensure_floor_can_deactivate(&self, floor_id: Ulid, now: Ms) -> Result<(), EngineError> {
        if self.catalog.floor(&floor_id).is_none() {
            return Err(EngineError::NotFound(floor_id));
        }
        if self.any_live(&self.catalog.spaces_on_floor(&floor_id), now).await {
            return Err(EngineError::HasActiveReservations(floor_id));
        }
        Ok(())
    }

    pub async fn ensure_building_can_deactivate(
        &self,
        building_id: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        if self.catalog.building(&building_id).is_none() {
            return Err(EngineError::NotFound(building_id));
        }
        if self
            .any_live(&self.catalog.spaces_in_building(&building_id), now)
            .await
        {
            return Err(EngineError::HasActiveReservations(building_id));
        }
        Ok(())
    }

    pub async fn save_building(&self, actor: &Actor, building: Building, now: Ms) -> Result<(), EngineError> {
        require_admin(actor)?;
        validate_building(&building)?;
        let _commit = self.commit_gate.read().await;

        let existing = self.catalog.building(&building.id);
        self.ensure_catalog_room(existing.is_some())?;
        let deactivating = existing.is_some_and(|b| b.is_active) && !building.is_active;
        let _held = if deactivating {
            let spaces = self.catalog.spaces_in_building(&building.id);
            self.lock_idle_spaces(spaces, building.id, now).await?
        } else {
            Vec::new()
        };

        let id = building.id;
        self.persist_catalog(&Event::BuildingSaved { building }).await?;
        if deactivating {
            info!(building_id = %id, "building deactivated");
        }
        Ok(())
    }

    pub async fn save_floor(&self, actor: &Actor, floor: Floor, now: Ms) -> Result<(), EngineError> {
        require_admin(actor)?;
        let _commit = self.commit_gate.read().await;

        if self.catalog.building(&floor.building_id).is_none() {
            return Err(EngineError::NotFound(floor.building_id));
        }
        let existing = self.catalog.floor(&floor.id);
        self.ensure_catalog_room(existing.is_some())?;
        let deactivating = existing.is_some_and(|f| f.is_active) && !floor.is_active;
        let _held = if deactivating {
            let spaces = self.catalog.spaces_on_floor(&floor.id);
            self.lock_idle_spaces(spaces, floor.id, now).await?
        } else {
            Vec::new()
        };

        let id = floor.id;
        self.persist_catalog(&Event::FloorSaved { floor }).await?;
        if deactivating {
            info!(floor_id = %id, "floor deactivated");
        }
        Ok(())
    }

    pub async fn save_space(&self, actor: &Actor, space: Space, now: Ms) -> Result<(), EngineError> {
        require_admin(actor)?;
        validate_space(&space)?;
        let _commit = self.commit_gate.read().await;

        if self.catalog.floor(&space.floor_id).is_none() {
            return Err(EngineError::NotFound(space.floor_id));
        }
        let existing = self.catalog.space(&space.id);
        self.ensure_catalog_room(existing.is_some())?;
        let deactivating = existing.is_some_and(|s| s.is_active) && !space.is_active;
        let _held = if deactivating {
            self.lock_idle_spaces(vec![space.id], space.id, now).await?
        } else {
            Vec::new()
        };

        let id = space.id;
        self.persist_catalog(&Event::SpaceSaved { space }).await?;
        if deactivating {
            info!(space_id = %id, "space deactivated");
        }
        Ok(())
    }

    pub async fn save_user(&self, actor: &Actor, user: User) -> Result<(), EngineError> {
        require_admin(actor)?;
        validate_user(&user)?;
        let _commit = self.commit_gate.read().await;

        self.ensure_catalog_room(self.catalog.user(&user.id).is_some())?;
        self.persist_catalog(&Event::UserSaved { user }).await
    }

    pub async fn deactivate_space(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let space = self.catalog.space(&id).ok_or(EngineError::NotFound(id))?;
        if !space.is_active {
            return Ok(());
        }
        self.save_space(actor, Space { is_active: false, ..space }, now).await
    }

    pub async fn deactivate_floor(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let floor = self.catalog.floor(&id).ok_or(EngineError::NotFound(id))?;
        if !floor.is_active {
            return Ok(());
        }
        self.save_floor(actor, Floor { is_active: false, ..floor }, now).await
    }

    pub async fn deactivate_building(&self, actor: &Actor, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let building = self.catalog.building(&id).ok_or(EngineError::NotFound(id))?;
        if !building.is_active {
            return Ok(());
        }
        self.save_building(actor, Building { is_active: false, ..building }, now)
            .await
    }
}
