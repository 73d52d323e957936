//! Ordered collections of item references.
//!
//! The member list lives in the listset's frontmatter. The functions here
//! edit a member vector in place; callers persist it through
//! [`ItemStore::set_members`](crate::store::ItemStore::set_members).

use std::str::FromStr;
use thiserror::Error;

use crate::error::StoreError;
use crate::models::{Item, ItemRef};
use crate::store::ItemStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListsetError {
    #[error("{0} is already a member")]
    Duplicate(ItemRef),
    #[error("a listset cannot contain itself")]
    SelfReference,
    #[error("position {pos} is out of range (listset has {len} members)")]
    OutOfRange { pos: usize, len: usize },
    #[error("unknown member action '{0}': use remove, up or down")]
    UnknownAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    Remove,
    Up,
    Down,
}

impl FromStr for MemberAction {
    type Err = ListsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove" => Ok(MemberAction::Remove),
            "up" => Ok(MemberAction::Up),
            "down" => Ok(MemberAction::Down),
            other => Err(ListsetError::UnknownAction(other.to_string())),
        }
    }
}

fn check(members: &[ItemRef], pos: usize) -> Result<(), ListsetError> {
    if pos < members.len() {
        Ok(())
    } else {
        Err(ListsetError::OutOfRange {
            pos,
            len: members.len(),
        })
    }
}

pub fn add(members: &mut Vec<ItemRef>, owner: &ItemRef, member: ItemRef) -> Result<(), ListsetError> {
    if &member == owner {
        return Err(ListsetError::SelfReference);
    }
    if members.contains(&member) {
        return Err(ListsetError::Duplicate(member));
    }
    members.push(member);
    Ok(())
}

pub fn remove(members: &mut Vec<ItemRef>, pos: usize) -> Result<ItemRef, ListsetError> {
    check(members, pos)?;
    Ok(members.remove(pos))
}

/// Moving the first member up is a no-op.
pub fn move_up(members: &mut [ItemRef], pos: usize) -> Result<(), ListsetError> {
    check(members, pos)?;
    if pos > 0 {
        members.swap(pos - 1, pos);
    }
    Ok(())
}

/// Moving the last member down is a no-op.
pub fn move_down(members: &mut [ItemRef], pos: usize) -> Result<(), ListsetError> {
    check(members, pos)?;
    if pos + 1 < members.len() {
        members.swap(pos, pos + 1);
    }
    Ok(())
}

pub fn move_to(members: &mut Vec<ItemRef>, from: usize, to: usize) -> Result<(), ListsetError> {
    check(members, from)?;
    check(members, to)?;
    let item = members.remove(from);
    members.insert(to, item);
    Ok(())
}

pub fn apply(members: &mut Vec<ItemRef>, pos: usize, action: MemberAction) -> Result<(), ListsetError> {
    match action {
        MemberAction::Remove => remove(members, pos).map(|_| ()),
        MemberAction::Up => move_up(members, pos),
        MemberAction::Down => move_down(members, pos),
    }
}

/// A member with its loaded item, or `None` when the ref dangles.
#[derive(Debug, Clone)]
pub struct ResolvedMember {
    pub position: usize,
    pub item_ref: ItemRef,
    pub item: Option<Item>,
}

pub fn resolve(store: &ItemStore, members: &[ItemRef]) -> Vec<ResolvedMember> {
    members
        .iter()
        .enumerate()
        .map(|(position, item_ref)| {
            let item = match store.get(item_ref) {
                Ok(item) => Some(item),
                Err(e) => {
                    if !matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_))) {
                        tracing::warn!(member = %item_ref, error = %e, "failed to load listset member");
                    }
                    None
                }
            };
            ResolvedMember {
                position,
                item_ref: item_ref.clone(),
                item,
            }
        })
        .collect()
}

/// Listsets that contain `member`, in store order.
pub fn containing(store: &ItemStore, member: &ItemRef) -> anyhow::Result<Vec<Item>> {
    Ok(store
        .list(crate::models::ItemKind::Listset)?
        .into_iter()
        .filter(|set| set.meta.members.contains(member))
        .collect())
}
