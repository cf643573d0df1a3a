use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Read access to the organizational hierarchy a space lives in.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn space(&self, id: Ulid) -> Option<Space>;
    async fn floor(&self, id: Ulid) -> Option<Floor>;
    async fn building(&self, id: Ulid) -> Option<Building>;
}

/// A space together with whatever part of its floor → building chain resolved.
#[derive(Debug, Clone)]
pub struct SpaceChain {
    pub space: Space,
    pub floor: Option<Floor>,
    pub building: Option<Building>,
}

impl SpaceChain {
    /// Bookable only if the space and every ancestor are active.
    /// A dangling floor or building reference is not bookable.
    pub fn is_bookable(&self) -> bool {
        match (&self.floor, &self.building) {
            (Some(floor), Some(building)) => is_bookable(&self.space, floor, building),
            _ => false,
        }
    }

    /// Booking rules come from the building; defaults when it is missing.
    pub fn rules(&self) -> BookingRules {
        self.building.as_ref().map(|b| b.rules).unwrap_or_default()
    }
}

pub fn is_bookable(space: &Space, floor: &Floor, building: &Building) -> bool {
    space.is_active && space.is_bookable && floor.is_active && building.is_active
}

/// Walk space → floor → building. Only a missing space is an error.
pub async fn resolve_chain<D: Directory + ?Sized>(
    directory: &D,
    space_id: Ulid,
) -> Result<SpaceChain, EngineError> {
    let space = directory
        .space(space_id)
        .await
        .ok_or(EngineError::NotFound(space_id))?;
    let floor = directory.floor(space.floor_id).await;
    let building = match &floor {
        Some(f) => directory.building(f.building_id).await,
        None => None,
    };
    Ok(SpaceChain {
        space,
        floor,
        building,
    })
}

/// Resolve the chain and require it to be bookable.
pub async fn resolve_bookable<D: Directory + ?Sized>(
    directory: &D,
    space_id: Ulid,
) -> Result<SpaceChain, EngineError> {
    let chain = resolve_chain(directory, space_id).await?;
    if !chain.is_bookable() {
        return Err(EngineError::SpaceUnavailable(space_id));
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeDirectory {
        spaces: HashMap<Ulid, Space>,
        floors: HashMap<Ulid, Floor>,
        buildings: HashMap<Ulid, Building>,
    }

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn space(&self, id: Ulid) -> Option<Space> {
            self.spaces.get(&id).cloned()
        }
        async fn floor(&self, id: Ulid) -> Option<Floor> {
            self.floors.get(&id).cloned()
        }
        async fn building(&self, id: Ulid) -> Option<Building> {
            self.buildings.get(&id).cloned()
        }
    }

    struct Ids {
        space: Ulid,
        floor: Ulid,
        building: Ulid,
    }

    fn hierarchy() -> (FakeDirectory, Ids) {
        let ids = Ids {
            space: Ulid::new(),
            floor: Ulid::new(),
            building: Ulid::new(),
        };
        let mut dir = FakeDirectory::default();
        dir.buildings.insert(
            ids.building,
            Building {
                id: ids.building,
                name: "HQ".into(),
                address: None,
                is_active: true,
                rules: BookingRules {
                    max_concurrent_reservations: 5,
                    check_in_window_minutes: 10,
                },
            },
        );
        dir.floors.insert(
            ids.floor,
            Floor {
                id: ids.floor,
                building_id: ids.building,
                floor_number: 3,
                is_active: true,
            },
        );
        dir.spaces.insert(
            ids.space,
            Space {
                id: ids.space,
                floor_id: ids.floor,
                name: Some("3.14".into()),
                kind: SpaceKind::Desk,
                capacity: 1,
                is_active: true,
                is_bookable: true,
            },
        );
        (dir, ids)
    }

    #[tokio::test]
    async fn active_chain_is_bookable() {
        let (dir, ids) = hierarchy();
        let chain = resolve_bookable(&dir, ids.space).await.unwrap();
        assert_eq!(chain.rules().max_concurrent_reservations, 5);
        assert_eq!(chain.rules().check_in_window_minutes, 10);
    }

    #[tokio::test]
    async fn each_flag_gates_bookability() {
        let cases: [fn(&mut FakeDirectory, &Ids); 4] = [
            |d, ids| d.spaces.get_mut(&ids.space).unwrap().is_active = false,
            |d, ids| d.spaces.get_mut(&ids.space).unwrap().is_bookable = false,
            |d, ids| d.floors.get_mut(&ids.floor).unwrap().is_active = false,
            |d, ids| d.buildings.get_mut(&ids.building).unwrap().is_active = false,
        ];
        for flip in cases {
            let (mut dir, ids) = hierarchy();
            flip(&mut dir, &ids);
            let result = resolve_bookable(&dir, ids.space).await;
            assert!(matches!(result, Err(EngineError::SpaceUnavailable(id)) if id == ids.space));
        }
    }

    #[tokio::test]
    async fn missing_space_is_not_found() {
        let (dir, _) = hierarchy();
        let result = resolve_bookable(&dir, Ulid::new()).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn dangling_floor_is_unavailable_with_default_rules() {
        let (mut dir, ids) = hierarchy();
        dir.floors.clear();
        let chain = resolve_chain(&dir, ids.space).await.unwrap();
        assert!(!chain.is_bookable());
        assert_eq!(chain.rules(), BookingRules::default());
    }
}
