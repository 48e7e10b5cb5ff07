//! Ordered replica sequences.
//!
//! A [`ReplicaList`] owns every known replica of one logical object. Order is
//! significant: the head is the currently preferred copy. Re-queueing moves
//! entries, and only the explicit superseded-copy filter removes them.

use vaultgrid_types::{ReplicaNumber, ReplicaRecord, ResourceName};

/// Result of moving a matching replica to the head of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// A match exists and is now the head.
    Moved,
    /// The list is non-empty but nothing matched.
    NoMatch,
    /// The list has no entries.
    Empty,
}

/// Owned, ordered sequence of replicas for one logical object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaList {
    items: Vec<ReplicaRecord>,
}

impl ReplicaList {
    pub fn new(items: Vec<ReplicaRecord>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn head(&self) -> Option<&ReplicaRecord> {
        self.items.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaRecord> {
        self.items.iter()
    }

    pub fn find(&self, pred: impl Fn(&ReplicaRecord) -> bool) -> Option<&ReplicaRecord> {
        self.items.iter().find(|&r| pred(r))
    }

    /// Moves the first replica matching `pred` to the head, keeping the
    /// relative order of everything else.
    pub fn move_to_front(&mut self, pred: impl Fn(&ReplicaRecord) -> bool) -> Requeue {
        if self.items.is_empty() {
            return Requeue::Empty;
        }
        match self.items.iter().position(pred) {
            Some(idx) => {
                self.items[..=idx].rotate_right(1);
                Requeue::Moved
            }
            None => Requeue::NoMatch,
        }
    }

    /// Moves the replica held by resource (or resource group) `name` to the head.
    pub fn requeue_by_resource(&mut self, name: &ResourceName) -> Requeue {
        self.move_to_front(|r| r.resource.answers_to(name))
    }

    /// Splits off superseded copies, as long as at least one good copy
    /// remains. Returns the kept list and the removed replicas.
    pub fn without_superseded(self) -> (Self, Vec<ReplicaRecord>) {
        if !self.items.iter().any(|r| !r.status.is_superseded()) {
            return (self, Vec::new());
        }
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .items
            .into_iter()
            .partition(|r| r.status.is_superseded());
        (Self::new(kept), removed)
    }

    /// Orders replicas for reading: good copies first, then by how cheaply
    /// each resource class can be read. The sort is stable.
    pub fn sorted_for_read(mut self) -> Self {
        self.items
            .sort_by_key(|r| (r.status.is_superseded(), r.class().read_rank()));
        self
    }

    /// Removes and returns the head.
    pub fn take_head(&mut self) -> Option<ReplicaRecord> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Removes and returns every replica matching `pred`, in list order.
    pub fn take_where(&mut self, pred: impl Fn(&ReplicaRecord) -> bool) -> Vec<ReplicaRecord> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|r| pred(r));
        self.items = kept;
        taken
    }

    /// Highest replica number in the list.
    pub fn max_replica_number(&self) -> Option<ReplicaNumber> {
        self.items.iter().map(|r| r.replica_number).max()
    }

    pub fn into_vec(self) -> Vec<ReplicaRecord> {
        self.items
    }
}

impl IntoIterator for ReplicaList {
    type Item = ReplicaRecord;
    type IntoIter = std::vec::IntoIter<ReplicaRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
