use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::MAX_FAVORITES;
use crate::model::{FavoriteToggle, UserInfo};

use super::EngineError;

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub phone: String,
    /// Favorite listing ids, oldest first.
    pub favorites: Vec<Ulid>,
}

impl UserState {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            favorites: self.favorites.len(),
        }
    }
}

/// Registered users plus the unique indexes over username, email and phone.
///
/// Mutations are split into a fallible `check_*` and an infallible apply so the
/// engine can validate, write the WAL, then apply.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: HashMap<Ulid, UserState>,
    by_username: HashMap<String, Ulid>,
    by_email: HashMap<String, Ulid>,
    by_phone: HashMap<String, Ulid>,
}

impl UserDirectory {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<&UserState> {
        self.users.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserState> {
        self.users.values()
    }

    pub fn check_register(&self, id: &Ulid, username: &str, email: &str, phone: &str) -> Result<(), EngineError> {
        if self.users.contains_key(id) {
            return Err(EngineError::AlreadyExists(*id));
        }
        if self.by_username.contains_key(username) {
            return Err(EngineError::NameTaken("username", username.to_string()));
        }
        if self.by_email.contains_key(&email.to_lowercase()) {
            return Err(EngineError::NameTaken("email", email.to_string()));
        }
        if self.by_phone.contains_key(phone) {
            return Err(EngineError::NameTaken("phone", phone.to_string()));
        }
        Ok(())
    }

    pub fn register(&mut self, id: Ulid, username: String, email: String, phone: String) {
        self.by_username.insert(username.clone(), id);
        self.by_email.insert(email.to_lowercase(), id);
        self.by_phone.insert(phone.clone(), id);
        self.users.insert(
            id,
            UserState {
                id,
                username,
                email,
                phone,
                favorites: Vec::new(),
            },
        );
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<UserState> {
        let user = self.users.remove(id)?;
        self.by_username.remove(&user.username);
        self.by_email.remove(&user.email.to_lowercase());
        self.by_phone.remove(&user.phone);
        Some(user)
    }

    /// Check an update to `(username, email, phone)`. Only fields that differ
    /// from the user's current value are tested for uniqueness.
    pub fn check_update(&self, id: &Ulid, username: &str, email: &str, phone: &str) -> Result<(), EngineError> {
        let user = self.users.get(id).ok_or(EngineError::NotFound(*id))?;
        if username != user.username && self.by_username.contains_key(username) {
            return Err(EngineError::NameTaken("username", username.to_string()));
        }
        let email_key = email.to_lowercase();
        if email_key != user.email.to_lowercase() && self.by_email.contains_key(&email_key) {
            return Err(EngineError::NameTaken("email", email.to_string()));
        }
        if phone != user.phone && self.by_phone.contains_key(phone) {
            return Err(EngineError::NameTaken("phone", phone.to_string()));
        }
        Ok(())
    }

    /// Replace the user's fields and re-key the indexes. Unknown users are ignored.
    pub fn update(&mut self, id: &Ulid, username: String, email: String, phone: String) {
        let Some(user) = self.users.get_mut(id) else { return };
        self.by_username.remove(&user.username);
        self.by_email.remove(&user.email.to_lowercase());
        self.by_phone.remove(&user.phone);
        self.by_username.insert(username.clone(), *id);
        self.by_email.insert(email.to_lowercase(), *id);
        self.by_phone.insert(phone.clone(), *id);
        user.username = username;
        user.email = email;
        user.phone = phone;
    }

    /// Drop a deleted listing from every user's favorites.
    pub fn forget_listing(&mut self, listing_id: &Ulid) {
        for user in self.users.values_mut() {
            user.favorites.retain(|f| f != listing_id);
        }
    }

    /// What toggling would do, without doing it.
    pub fn check_toggle_favorite(&self, user_id: &Ulid, listing_id: &Ulid) -> Result<FavoriteToggle, EngineError> {
        let user = self.users.get(user_id).ok_or(EngineError::NotFound(*user_id))?;
        if user.favorites.contains(listing_id) {
            return Ok(FavoriteToggle::Removed);
        }
        if user.favorites.len() >= MAX_FAVORITES {
            return Err(EngineError::LimitExceeded("max 20 favorites allowed"));
        }
        Ok(FavoriteToggle::Added)
    }

    /// Flip membership. Unknown users are ignored.
    pub fn toggle_favorite(&mut self, user_id: &Ulid, listing_id: Ulid) -> Option<FavoriteToggle> {
        let user = self.users.get_mut(user_id)?;
        if let Some(pos) = user.favorites.iter().position(|f| *f == listing_id) {
            user.favorites.remove(pos);
            Some(FavoriteToggle::Removed)
        } else {
            user.favorites.push(listing_id);
            Some(FavoriteToggle::Added)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(id: Ulid) -> UserDirectory {
        let mut dir = UserDirectory::default();
        dir.register(id, "ada".into(), "Ada@example.com".into(), "+4670000001".into());
        dir
    }

    #[test]
    fn unique_fields_enforced() {
        let dir = directory_with(Ulid::new());
        let other = Ulid::new();
        assert!(matches!(
            dir.check_register(&other, "ada", "x@example.com", "1"),
            Err(EngineError::NameTaken("username", _))
        ));
        assert!(matches!(
            dir.check_register(&other, "bob", "ada@EXAMPLE.com", "1"),
            Err(EngineError::NameTaken("email", _))
        ));
        assert!(matches!(
            dir.check_register(&other, "bob", "bob@example.com", "+4670000001"),
            Err(EngineError::NameTaken("phone", _))
        ));
        assert!(dir.check_register(&other, "bob", "bob@example.com", "2").is_ok());
    }

    #[test]
    fn duplicate_id_rejected() {
        let id = Ulid::new();
        let dir = directory_with(id);
        assert!(matches!(
            dir.check_register(&id, "bob", "bob@example.com", "2"),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn remove_frees_unique_names() {
        let id = Ulid::new();
        let mut dir = directory_with(id);
        assert!(dir.remove(&id).is_some());
        assert!(dir.is_empty());
        assert!(dir.check_register(&Ulid::new(), "ada", "ada@example.com", "+4670000001").is_ok());
    }

    #[test]
    fn favorites_toggle_and_cap() {
        let id = Ulid::new();
        let mut dir = directory_with(id);
        let first = Ulid::new();
        assert_eq!(dir.toggle_favorite(&id, first), Some(FavoriteToggle::Added));
        assert_eq!(dir.check_toggle_favorite(&id, &first).unwrap(), FavoriteToggle::Removed);
        assert_eq!(dir.toggle_favorite(&id, first), Some(FavoriteToggle::Removed));

        for _ in 0..MAX_FAVORITES {
            dir.toggle_favorite(&id, Ulid::new());
        }
        assert!(matches!(
            dir.check_toggle_favorite(&id, &Ulid::new()),
            Err(EngineError::LimitExceeded(_))
        ));
        // Removing is still allowed at the cap.
        let existing = dir.get(&id).unwrap().favorites[0];
        assert_eq!(dir.check_toggle_favorite(&id, &existing).unwrap(), FavoriteToggle::Removed);
    }

    #[test]
    fn update_rechecks_only_changed_fields() {
        let id = Ulid::new();
        let mut dir = directory_with(id);
        let other = Ulid::new();
        dir.register(other, "bob".into(), "bob@example.com".into(), "2".into());

        // Keeping your own values (email in another case) is not a clash.
        assert!(dir.check_update(&id, "ada", "ADA@example.com", "+4670000001").is_ok());
        assert!(matches!(
            dir.check_update(&id, "bob", "ada@example.com", "+4670000001"),
            Err(EngineError::NameTaken("username", _))
        ));
        assert!(matches!(
            dir.check_update(&id, "ada", "Bob@Example.com", "+4670000001"),
            Err(EngineError::NameTaken("email", _))
        ));
        assert!(matches!(dir.check_update(&Ulid::new(), "x", "x@y", "9"), Err(EngineError::NotFound(_))));

        dir.update(&id, "ada2".into(), "ada2@example.com".into(), "3".into());
        assert_eq!(dir.get(&id).unwrap().username, "ada2");
        // Old names are released, new ones are taken.
        assert!(dir.check_register(&Ulid::new(), "ada", "ada@example.com", "+4670000001").is_ok());
        assert!(matches!(
            dir.check_register(&Ulid::new(), "ada2", "z@example.com", "4"),
            Err(EngineError::NameTaken("username", _))
        ));
    }

    #[test]
    fn forget_listing_frees_favorite_slots() {
        let id = Ulid::new();
        let mut dir = directory_with(id);
        let gone = Ulid::new();
        dir.toggle_favorite(&id, gone);
        for _ in 1..MAX_FAVORITES {
            dir.toggle_favorite(&id, Ulid::new());
        }
        assert!(dir.check_toggle_favorite(&id, &Ulid::new()).is_err());

        dir.forget_listing(&gone);
        assert_eq!(dir.get(&id).unwrap().info().favorites, MAX_FAVORITES - 1);
        assert_eq!(dir.check_toggle_favorite(&id, &Ulid::new()).unwrap(), FavoriteToggle::Added);
    }

    #[test]
    fn toggle_for_unknown_user() {
        let mut dir = UserDirectory::default();
        assert!(dir.toggle_favorite(&Ulid::new(), Ulid::new()).is_none());
        assert!(matches!(
            dir.check_toggle_favorite(&Ulid::new(), &Ulid::new()),
            Err(EngineError::NotFound(_))
        ));
    }
}
