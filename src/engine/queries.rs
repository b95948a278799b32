use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, ListingState};

fn listing_info(ls: &ListingState) -> ListingInfo {
    ListingInfo {
        id: ls.id,
        host_id: ls.host_id,
        title: ls.title.clone(),
        location: ls.location.clone(),
        description: ls.description.clone(),
        capacity: ls.capacity,
        available: ls.available_ranges(),
    }
}

impl Engine {
    /// Ordered snapshot of the listing's free ranges.
    pub async fn list_available_ranges(&self, listing_id: Ulid) -> Result<Vec<DateRange>, EngineError> {
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        Ok(guard.available_ranges())
    }

    pub async fn get_listing_info(&self, id: Ulid) -> Result<ListingInfo, EngineError> {
        let ls = self.get_listing(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.read().await;
        Ok(listing_info(&guard))
    }

    /// All listings, ordered by id.
    pub async fn list_listings(&self) -> Vec<ListingInfo> {
        // Collect the Arcs first so no DashMap shard is held across an await.
        let listings: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(listings.len());
        for ls in listings {
            let guard = ls.read().await;
            out.push(listing_info(&guard));
        }
        out.sort_by_key(|l| l.id);
        out
    }

    /// Every booking on the listing, in request order.
    pub async fn get_bookings(&self, listing_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let ls = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        Ok(guard.bookings().to_vec())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let listing_id = self.get_listing_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let ls = self.get_listing(&listing_id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.read().await;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All users, ordered by id.
    pub async fn list_users(&self) -> Vec<UserInfo> {
        let users = self.users.read().await;
        let mut out: Vec<UserInfo> = users.iter().map(|u| u.info()).collect();
        out.sort_by_key(|u| u.id);
        out
    }

    pub async fn get_user(&self, id: Ulid) -> Result<UserInfo, EngineError> {
        let users = self.users.read().await;
        users.get(&id).map(|u| u.info()).ok_or(EngineError::NotFound(id))
    }

    /// `(listing_id, title)` for each favorite whose listing still exists,
    /// oldest first.
    pub async fn get_favorites(&self, user_id: Ulid) -> Result<Vec<(Ulid, String)>, EngineError> {
        let favorites = {
            let users = self.users.read().await;
            users
                .get(&user_id)
                .map(|u| u.favorites.clone())
                .ok_or(EngineError::NotFound(user_id))?
        };
        let mut out = Vec::with_capacity(favorites.len());
        for listing_id in favorites {
            let Some(ls) = self.get_listing(&listing_id) else { continue };
            let guard = ls.read().await;
            out.push((listing_id, guard.title.clone()));
        }
        Ok(out)
    }
}
