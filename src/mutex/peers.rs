//! Peer group configuration and the deferred-reply bitset.
//!
//! The deferred set is a fixed-size bitset instead of a Vec<bool> for O(1)
//! operations and trivially cheap copies when a snapshot records it.

/// Maximum supported group size (64 peers).
/// Using a u64 bitset allows tracking every peer in one word.
pub const MAX_GROUP_SIZE: usize = 64;

/// A compact bitset over peer indices.
///
/// Bit `j` is set if peer `j` is tracked. Used for the deferred-reply set
/// (`waiting`): bit `j` set means peer `j`'s entry request is deferred here
/// until exit.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerBitset(u64);

impl PeerBitset {
    /// Create an empty bitset.
    #[inline]
    pub fn new() -> Self {
        PeerBitset(0)
    }

    /// Set the bit for a peer index.
    #[inline]
    pub fn insert(&mut self, peer: usize) {
        debug_assert!(peer < MAX_GROUP_SIZE, "peer index exceeds MAX_GROUP_SIZE");
        self.0 |= 1u64 << peer;
    }

    /// Check whether a peer's bit is set.
    #[inline]
    pub fn contains(&self, peer: usize) -> bool {
        debug_assert!(peer < MAX_GROUP_SIZE, "peer index exceeds MAX_GROUP_SIZE");
        (self.0 & (1u64 << peer)) != 0
    }

    /// True if any bit is set.
    #[inline]
    pub fn any(&self) -> bool {
        self.0 != 0
    }

    /// Clear every bit.
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Number of set bits.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Expand to a `Vec<bool>` of length `n`, the shape the snapshot
    /// record persists.
    pub fn to_vec(&self, n: usize) -> Vec<bool> {
        (0..n).map(|j| self.contains(j)).collect()
    }
}

impl std::fmt::Debug for PeerBitset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerBitset({:b})", self.0)
    }
}

/// The fixed peer group: an ordered address list and this peer's index
/// into it. Membership never changes after startup.
#[derive(Debug, Clone)]
pub struct PeerGroup {
    addresses: Vec<String>,
    id: usize,
}

impl PeerGroup {
    /// Create a group from the full address list and own index.
    ///
    /// # Panics
    /// Panics if the group is smaller than two, larger than
    /// MAX_GROUP_SIZE, or `id` is out of range. Group shape is a startup
    /// precondition, not a runtime condition.
    pub fn new(addresses: Vec<String>, id: usize) -> Self {
        assert!(addresses.len() >= 2, "a group needs at least two peers");
        assert!(
            addresses.len() <= MAX_GROUP_SIZE,
            "group size {} exceeds MAX_GROUP_SIZE {}",
            addresses.len(),
            MAX_GROUP_SIZE
        );
        assert!(
            id < addresses.len(),
            "peer id {} out of range for group of {}",
            id,
            addresses.len()
        );
        PeerGroup { addresses, id }
    }

    /// Number of peers in the group.
    #[inline]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// This peer's index.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Address of peer `j`.
    #[inline]
    pub fn addr(&self, j: usize) -> &str {
        &self.addresses[j]
    }

    /// This peer's own address.
    #[inline]
    pub fn self_addr(&self) -> &str {
        &self.addresses[self.id]
    }

    /// Iterate over every peer index except this one.
    pub fn others(&self) -> impl Iterator<Item = usize> + '_ {
        let id = self.id;
        (0..self.addresses.len()).filter(move |&j| j != id)
    }
}
