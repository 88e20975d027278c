use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::error::StateError;
use crate::sessions::validate_name;

/// A named group. The member set is never empty while the group exists.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub creator: String,
    pub members: BTreeSet<String>,
}

pub struct GroupDirectory {
    groups: RwLock<HashMap<String, Group>>,
}

impl GroupDirectory {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Group>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Group>> {
        self.groups.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a group with `creator` as its only member. Returns the trimmed
    /// group name.
    pub fn create(&self, name: &str, creator: &str) -> Result<String, StateError> {
        let name = validate_name(name)?;
        let mut groups = self.write();
        if groups.contains_key(&name) {
            return Err(StateError::GroupExists(name));
        }

        groups.insert(
            name.clone(),
            Group {
                name: name.clone(),
                creator: creator.to_string(),
                members: BTreeSet::from([creator.to_string()]),
            },
        );
        info!("Group {} created by {}", name, creator);
        Ok(name)
    }

    pub fn join(&self, name: &str, user: &str) -> Result<(), StateError> {
        let mut groups = self.write();
        let group = groups
            .get_mut(name)
            .ok_or_else(|| StateError::GroupNotFound(name.to_string()))?;
        if !group.members.insert(user.to_string()) {
            return Err(StateError::AlreadyMember {
                group: name.to_string(),
                user: user.to_string(),
            });
        }
        info!("{} joined group {} ({} members)", user, name, group.members.len());
        Ok(())
    }

    /// Remove `user` from the group. Returns `true` when that emptied and
    /// deleted the group.
    pub fn leave(&self, name: &str, user: &str) -> Result<bool, StateError> {
        let mut groups = self.write();
        let group = groups
            .get_mut(name)
            .ok_or_else(|| StateError::GroupNotFound(name.to_string()))?;
        if !group.members.remove(user) {
            return Err(StateError::NotMember {
                group: name.to_string(),
                user: user.to_string(),
            });
        }

        if group.members.is_empty() {
            groups.remove(name);
            info!("{} left group {}; group deleted", user, name);
            return Ok(true);
        }
        info!("{} left group {}", user, name);
        Ok(false)
    }

    pub fn is_member(&self, name: &str, user: &str) -> bool {
        self.read()
            .get(name)
            .is_some_and(|group| group.members.contains(user))
    }

    /// Membership check that distinguishes a missing group from a non-member.
    pub fn require_member(&self, name: &str, user: &str) -> Result<(), StateError> {
        let groups = self.read();
        let group = groups
            .get(name)
            .ok_or_else(|| StateError::GroupNotFound(name.to_string()))?;
        if group.members.contains(user) {
            Ok(())
        } else {
            Err(StateError::NotMember {
                group: name.to_string(),
                user: user.to_string(),
            })
        }
    }

    /// Sorted member snapshot, or `None` if the group does not exist.
    pub fn members(&self, name: &str) -> Option<Vec<String>> {
        self.read()
            .get(name)
            .map(|group| group.members.iter().cloned().collect())
    }

    pub fn member_count(&self, name: &str) -> Option<usize> {
        self.read().get(name).map(|group| group.members.len())
    }

    /// Sorted names of all groups.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted names of the groups `user` belongs to.
    pub fn groups_of(&self, user: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .values()
            .filter(|group| group.members.contains(user))
            .map(|group| group.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for GroupDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_is_first_member() {
        let dir = GroupDirectory::new();
        assert_eq!(dir.create(" team ", "alice").unwrap(), "team");
        assert_eq!(dir.members("team").unwrap(), vec!["alice"]);
        assert_eq!(dir.read()["team"].creator, "alice");
        assert_eq!(
            dir.create("team", "bob"),
            Err(StateError::GroupExists("team".into()))
        );
        assert!(matches!(dir.create("a,b", "bob"), Err(StateError::InvalidName(_))));
    }

    #[test]
    fn join_rules() {
        let dir = GroupDirectory::new();
        dir.create("team", "alice").unwrap();
        dir.join("team", "bob").unwrap();
        assert_eq!(dir.member_count("team"), Some(2));
        assert!(dir.is_member("team", "bob"));

        let err = dir.join("team", "bob").unwrap_err();
        assert!(err.to_string().contains("already a member"));
        assert_eq!(
            dir.join("nope", "bob"),
            Err(StateError::GroupNotFound("nope".into()))
        );
    }

    #[test]
    fn last_member_leaving_deletes_group() {
        let dir = GroupDirectory::new();
        dir.create("team", "alice").unwrap();
        dir.join("team", "bob").unwrap();

        assert_eq!(dir.leave("team", "alice"), Ok(false));
        assert!(matches!(dir.leave("team", "alice"), Err(StateError::NotMember { .. })));
        assert_eq!(dir.leave("team", "bob"), Ok(true));

        assert!(dir.members("team").is_none());
        assert_eq!(dir.member_count("team"), None);
        let err = dir.join("team", "carol").unwrap_err();
        assert!(err.to_string().contains("group not found"));
    }

    #[test]
    fn listings_are_sorted() {
        let dir = GroupDirectory::new();
        dir.create("zeta", "alice").unwrap();
        dir.create("alpha", "bob").unwrap();
        dir.create("mid", "alice").unwrap();

        assert_eq!(dir.names(), vec!["alpha", "mid", "zeta"]);
        assert_eq!(dir.groups_of("alice"), vec!["mid", "zeta"]);
        assert!(dir.groups_of("carol").is_empty());
        assert_eq!(
            dir.require_member("alpha", "alice"),
            Err(StateError::NotMember {
                group: "alpha".into(),
                user: "alice".into(),
            })
        );
    }
}
