//! The fd store: file descriptors owned by units, kept by the manager.
//!
//! Listen sockets (and any other fd a unit hands us to keep) live here,
//! tagged with the owning unit and a role. The store is what survives
//! re-execution: before the manager execs itself every stored fd has its
//! close-on-exec flag cleared so the numbers stay valid in the new
//! process, and the serialization blob records which unit owns which fd.
//! Ownership transfers to children on spawn by duping the fds into the
//! child's fd table.

use std::collections::HashMap;

use log::{trace, warn};

use crate::sockets;
use crate::units::UnitId;

/// Why a unit owns an fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdRole {
    /// A listening socket fd, handed to activated services.
    Listen,
    /// An fd a unit asked the manager to hold on its behalf.
    Store,
}

impl FdRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Listen => "listen",
            Self::Store => "store",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "listen" => Some(Self::Listen),
            "store" => Some(Self::Store),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredFd {
    pub fd: i32,
    pub role: FdRole,
}

/// Unit id → owned fds, in insertion order (the order services see them
/// as fd 3 and up).
#[derive(Default)]
pub struct FdStore {
    fds: HashMap<UnitId, Vec<StoredFd>>,
}

impl FdStore {
    /// Take ownership of an fd for `owner`. The fd is marked
    /// close-on-exec; inheritance is arranged explicitly at spawn and
    /// re-execution time.
    pub fn insert(&mut self, owner: &UnitId, role: FdRole, fd: i32) {
        sockets::set_cloexec(fd, true);
        trace!("fd store: {owner} owns fd {fd} ({})", role.as_str());
        self.fds
            .entry(owner.clone())
            .or_default()
            .push(StoredFd { fd, role });
    }

    /// Re-adopt an fd recorded in the serialization blob. The number is
    /// already valid in this process (it survived the exec); flag it
    /// close-on-exec again so it does not leak into unrelated children.
    pub fn adopt(&mut self, owner: &UnitId, role: FdRole, fd: i32) {
        self.insert(owner, role, fd);
    }

    pub fn stored_for(&self, owner: &UnitId) -> &[StoredFd] {
        self.fds.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The listen fds of `owner`, for handing to an activated service.
    pub fn listen_fds_of(&self, owner: &UnitId) -> Vec<i32> {
        self.stored_for(owner)
            .iter()
            .filter(|stored| stored.role == FdRole::Listen)
            .map(|stored| stored.fd)
            .collect()
    }

    /// Drop `owner`'s fds from the store without closing them. Used when
    /// the caller takes over closing (socket shutdown).
    pub fn remove_unit(&mut self, owner: &UnitId) -> Vec<StoredFd> {
        self.fds.remove(owner).unwrap_or_default()
    }

    /// Drop and close everything `owner` had.
    pub fn close_unit(&mut self, owner: &UnitId) {
        for stored in self.remove_unit(owner) {
            trace!("fd store: closing fd {} of {owner}", stored.fd);
            sockets::close_raw_fd(stored.fd);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&UnitId, &StoredFd)> {
        self.fds
            .iter()
            .flat_map(|(owner, fds)| fds.iter().map(move |stored| (owner, stored)))
    }

    pub fn is_empty(&self) -> bool {
        self.fds.values().all(Vec::is_empty)
    }

    /// Clear close-on-exec on every stored fd so it survives the coming
    /// re-execution with its number intact.
    pub fn prepare_inherit(&self) {
        for (owner, stored) in self.entries() {
            trace!("fd store: inheriting fd {} of {owner} across exec", stored.fd);
            sockets::set_cloexec(stored.fd, false);
        }
    }

    /// Sanity hook for shutdown paths: anything left in the store is
    /// closed so nothing leaks.
    pub fn close_all(&mut self) {
        let owners: Vec<UnitId> = self.fds.keys().cloned().collect();
        if !owners.is_empty() {
            warn!("fd store: closing {} leftover owner(s)", owners.len());
        }
        for owner in owners {
            self.close_unit(&owner);
        }
    }
}
