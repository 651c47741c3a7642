//! Bounded routing table.

use std::fmt;

use crate::protocol::Address;

/// Default number of routes a table holds.
pub const DEFAULT_TABLE_CAPACITY: usize = 10;

/// Lifecycle state of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteState {
    /// Slot unused.
    #[default]
    Invalid,
    /// Discovery in progress; `next_hop` is not yet confirmed.
    Discovering,
    /// Usable route.
    Valid,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Discovering => "discovering",
            Self::Valid => "valid",
        };
        f.write_str(name)
    }
}

/// One routing table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Final destination.
    pub dest: Address,
    /// Neighbour that frames for `dest` are handed to.
    pub next_hop: Address,
    /// Lifecycle state.
    pub state: RouteState,
    /// Stamp of the last add or update; larger is younger.
    pub age: u32,
}

impl RouteEntry {
    const EMPTY: Self = Self {
        dest: 0,
        next_hop: 0,
        state: RouteState::Invalid,
        age: 0,
    };

    /// Returns true if frames may be routed with this entry.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self.state, RouteState::Valid)
    }
}

/// Fixed-capacity table of routes, at most one per destination.
///
/// When the table is full, adding a new destination evicts the entry that
/// was added or updated longest ago.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    slots: Vec<RouteEntry>,
    clock: u32,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_CAPACITY)
    }
}

impl RoutingTable {
    /// Creates an empty table with room for `capacity` routes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![RouteEntry::EMPTY; capacity.max(1)],
            clock: 0,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of routes that are not `Invalid`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes().count()
    }

    /// Returns true if the table holds no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over routes that are not `Invalid`.
    pub fn routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.slots
            .iter()
            .filter(|entry| entry.state != RouteState::Invalid)
    }

    /// Adds or updates the route to `dest`.
    pub fn add_route_to(&mut self, dest: Address, next_hop: Address, state: RouteState) {
        self.clock = self.clock.wrapping_add(1);
        let age = self.clock;

        let index = self
            .position(dest)
            .or_else(|| {
                self.slots
                    .iter()
                    .position(|entry| entry.state == RouteState::Invalid)
            })
            .unwrap_or_else(|| self.oldest());
        let evicted = self.slots[index];
        if evicted.state != RouteState::Invalid && evicted.dest != dest {
            tracing::debug!("routing table full, evicting route to {}", evicted.dest);
        }
        self.slots[index] = RouteEntry {
            dest,
            next_hop,
            state,
            age,
        };
    }

    /// Returns the route to `dest` unless it is `Invalid`.
    #[must_use]
    pub fn get_route_to(&self, dest: Address) -> Option<&RouteEntry> {
        self.position(dest).map(|index| &self.slots[index])
    }

    /// Returns the next hop towards `dest` if a `Valid` route exists.
    #[must_use]
    pub fn next_hop(&self, dest: Address) -> Option<Address> {
        self.get_route_to(dest)
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.next_hop)
    }

    /// Deletes the route to `dest`. Returns false if there was none.
    pub fn delete_route_to(&mut self, dest: Address) -> bool {
        match self.position(dest) {
            Some(index) => {
                self.slots[index] = RouteEntry::EMPTY;
                true
            }
            None => false,
        }
    }

    /// Deletes the route that was added or updated longest ago.
    pub fn retire_oldest_route(&mut self) -> Option<RouteEntry> {
        if self.is_empty() {
            return None;
        }
        let index = self.oldest();
        let entry = self.slots[index];
        self.slots[index] = RouteEntry::EMPTY;
        Some(entry)
    }

    /// Deletes every route.
    pub fn clear(&mut self) {
        self.slots.fill(RouteEntry::EMPTY);
    }

    fn position(&self, dest: Address) -> Option<usize> {
        self.slots
            .iter()
            .position(|entry| entry.state != RouteState::Invalid && entry.dest == dest)
    }

    /// Index of the oldest live entry. Ages compare by distance from the
    /// clock so that wrapping keeps the order.
    fn oldest(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state != RouteState::Invalid)
            .max_by_key(|(_, entry)| self.clock.wrapping_sub(entry.age))
            .map_or(0, |(index, _)| index)
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>5} {:>8} {:>12}", "dest", "next hop", "state")?;
        for entry in self.routes() {
            writeln!(
                f,
                "{:>5} {:>8} {:>12}",
                entry.dest,
                entry.next_hop,
                entry.state.to_string()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut table = RoutingTable::default();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), DEFAULT_TABLE_CAPACITY);

        table.add_route_to(4, 2, RouteState::Valid);
        let entry = table.get_route_to(4).unwrap();
        assert_eq!(entry.next_hop, 2);
        assert!(entry.is_valid());
        assert_eq!(table.next_hop(4), Some(2));
        assert_eq!(table.get_route_to(5), None);
    }

    #[test]
    fn test_update_keeps_one_entry() {
        let mut table = RoutingTable::default();
        table.add_route_to(4, 2, RouteState::Valid);
        table.add_route_to(4, 3, RouteState::Valid);
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_hop(4), Some(3));
    }

    #[test]
    fn test_discovering_is_not_routable() {
        let mut table = RoutingTable::default();
        table.add_route_to(4, 2, RouteState::Discovering);
        assert_eq!(table.get_route_to(4).unwrap().state, RouteState::Discovering);
        assert_eq!(table.next_hop(4), None);
    }

    #[test]
    fn test_delete_and_clear() {
        let mut table = RoutingTable::default();
        table.add_route_to(4, 2, RouteState::Valid);
        table.add_route_to(5, 2, RouteState::Valid);

        assert!(table.delete_route_to(4));
        assert!(!table.delete_route_to(4));
        assert_eq!(table.len(), 1);

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let mut table = RoutingTable::new(3);
        table.add_route_to(1, 1, RouteState::Valid);
        table.add_route_to(2, 2, RouteState::Valid);
        table.add_route_to(3, 3, RouteState::Valid);
        // Refreshing 1 makes 2 the oldest
        table.add_route_to(1, 1, RouteState::Valid);
        table.add_route_to(4, 3, RouteState::Valid);

        assert_eq!(table.len(), 3);
        assert!(table.get_route_to(2).is_none());
        assert!(table.get_route_to(1).is_some());
        assert!(table.get_route_to(4).is_some());
    }

    #[test]
    fn test_deleted_slot_reused_before_eviction() {
        let mut table = RoutingTable::new(2);
        table.add_route_to(1, 1, RouteState::Valid);
        table.add_route_to(2, 2, RouteState::Valid);
        table.delete_route_to(2);
        table.add_route_to(3, 3, RouteState::Valid);
        assert!(table.get_route_to(1).is_some());
        assert!(table.get_route_to(3).is_some());
    }

    #[test]
    fn test_retire_oldest_route() {
        let mut table = RoutingTable::default();
        assert_eq!(table.retire_oldest_route(), None);
        table.add_route_to(7, 1, RouteState::Valid);
        table.add_route_to(8, 1, RouteState::Valid);
        assert_eq!(table.retire_oldest_route().map(|entry| entry.dest), Some(7));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_display() {
        let mut table = RoutingTable::default();
        table.add_route_to(4, 2, RouteState::Valid);
        let text = table.to_string();
        assert!(text.starts_with(" dest"));
        assert!(text.contains("    4        2        valid"));
    }
}
