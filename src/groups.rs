//! Group membership resolution
//!
//! A backend belongs to at most one active group. Overlapping membership
//! between active groups is rejected when a document is loaded, so
//! [`resolve`] never has to pick between two candidates.

use crate::document::GroupRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Members of a group: a single backend name or an ordered list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupMembers {
    One(String),
    Many(Vec<String>),
}

impl Default for GroupMembers {
    fn default() -> Self {
        GroupMembers::Many(Vec::new())
    }
}

impl GroupMembers {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            GroupMembers::One(name) => std::slice::from_ref(name),
            GroupMembers::Many(names) => names,
        };
        slice.iter().map(String::as_str).filter(|name| !name.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|member| member == name)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend '{backend}' belongs to both active groups '{first}' and '{second}'")]
pub struct GroupConflict {
    pub backend: String,
    pub first: String,
    pub second: String,
}

/// First active group whose members include `name`
pub fn resolve<'a>(groups: &'a [GroupRecord], name: &str) -> Option<&'a GroupRecord> {
    groups
        .iter()
        .find(|group| group.active && group.container.contains(name))
}

/// Reject documents where one backend sits in two active groups
pub fn validate(groups: &[GroupRecord]) -> Result<(), GroupConflict> {
    let mut owner: HashMap<&str, &str> = HashMap::new();

    for group in groups.iter().filter(|g| g.active) {
        for member in group.container.iter() {
            match owner.get(member) {
                Some(first) if *first != group.name => {
                    return Err(GroupConflict {
                        backend: member.to_string(),
                        first: first.to_string(),
                        second: group.name.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    owner.insert(member, group.name.as_str());
                }
            }
        }
    }

    Ok(())
}
