//! Pure bitwise permission engine.
//!
//! A [`PermissionSet`] is a 128-bit vector where each bit is one named
//! capability. All operations here are side-effect free; effective-permission
//! resolution against the database lives in [`crate::roles`].

use serde::{Deserialize, Serialize};

/// A single named capability. Bit positions are stable and must never be
/// reassigned; new flags take the next free position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// View tickets other than one's own.
    ViewTickets = 0,
    /// Claim open tickets.
    ClaimTickets = 1,
    /// Close any ticket, not just one's own.
    CloseAnyTicket = 2,
    /// Soft-delete tickets.
    DeleteTickets = 3,
    /// Read ticket transcripts.
    ViewTranscripts = 4,
    /// Create, edit and assign support roles.
    ManageRoles = 5,
    /// Add and remove blacklist entries.
    ManageBlacklist = 6,
    /// Edit guild-level ticket settings.
    ManageGuildSettings = 7,
    /// Manage ticket panels.
    ManagePanels = 8,
    /// Manage response tags.
    ManageTags = 9,
    /// Open tickets past the guild's per-user limit.
    BypassTicketLimit = 10,
    /// Perform lifecycle operations on behalf of another user.
    ActOnBehalf = 11,
}

/// All defined flags, in bit order.
pub const ALL_PERMISSIONS: &[Permission] = &[
    Permission::ViewTickets,
    Permission::ClaimTickets,
    Permission::CloseAnyTicket,
    Permission::DeleteTickets,
    Permission::ViewTranscripts,
    Permission::ManageRoles,
    Permission::ManageBlacklist,
    Permission::ManageGuildSettings,
    Permission::ManagePanels,
    Permission::ManageTags,
    Permission::BypassTicketLimit,
    Permission::ActOnBehalf,
];

impl Permission {
    /// The single-bit mask for this flag.
    pub fn bit(self) -> u128 {
        1u128 << (self as u32)
    }

    /// Stable string name, used in diagnostics and stored role definitions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewTickets => "view_tickets",
            Self::ClaimTickets => "claim_tickets",
            Self::CloseAnyTicket => "close_any_ticket",
            Self::DeleteTickets => "delete_tickets",
            Self::ViewTranscripts => "view_transcripts",
            Self::ManageRoles => "manage_roles",
            Self::ManageBlacklist => "manage_blacklist",
            Self::ManageGuildSettings => "manage_guild_settings",
            Self::ManagePanels => "manage_panels",
            Self::ManageTags => "manage_tags",
            Self::BypassTicketLimit => "bypass_ticket_limit",
            Self::ActOnBehalf => "act_on_behalf",
        }
    }

    /// Parse a flag from its stable name.
    pub fn from_str(s: &str) -> Option<Self> {
        ALL_PERMISSIONS.iter().copied().find(|p| p.as_str() == s)
    }
}

/// A set of granted capabilities.
///
/// Invariant: always a subset of [`PermissionSet::universe`]. Constructors mask
/// unknown bits so stored masks from older or newer schema versions cannot
/// smuggle undefined capabilities in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionSet(u128);

impl PermissionSet {
    /// The empty set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// The set of every defined flag.
    pub fn universe() -> Self {
        Self(ALL_PERMISSIONS.iter().fold(0u128, |acc, p| acc | p.bit()))
    }

    /// Build a set from a raw bit vector, masking undefined bits.
    pub fn from_bits(bits: u128) -> Self {
        Self(bits & Self::universe().0)
    }

    /// Build a set from a list of flags.
    pub fn from_flags(flags: &[Permission]) -> Self {
        Self(flags.iter().fold(0u128, |acc, p| acc | p.bit()))
    }

    /// Raw bit vector.
    pub fn bits(self) -> u128 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether a single flag is present.
    pub fn contains(self, flag: Permission) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Whether at least one of the given flags is present.
    pub fn contains_any(self, flags: &[Permission]) -> bool {
        flags.iter().any(|f| self.contains(*f))
    }

    /// Whether every one of the given flags is present.
    pub fn contains_all(self, flags: &[Permission]) -> bool {
        flags.iter().all(|f| self.contains(*f))
    }

    /// Set union with a single flag.
    pub fn with(self, flag: Permission) -> Self {
        Self(self.0 | flag.bit())
    }

    /// Set difference with a single flag.
    pub fn without(self, flag: Permission) -> Self {
        Self(self.0 & !flag.bit())
    }

    /// Bitwise-OR reduction over any number of sets. `cumulative([])` is empty.
    pub fn cumulative<I: IntoIterator<Item = PermissionSet>>(sets: I) -> Self {
        sets.into_iter().fold(Self::empty(), Self::union)
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Complement relative to the universe of defined flags.
    pub fn complement(self) -> Self {
        Self(!self.0 & Self::universe().0)
    }

    /// Names of every flag in the set, in bit order. For diagnostics.
    pub fn names(self) -> Vec<&'static str> {
        ALL_PERMISSIONS
            .iter()
            .filter(|p| self.contains(**p))
            .map(|p| p.as_str())
            .collect()
    }

    /// Fixed-width hex encoding used for database storage. SQLite integers are
    /// 64-bit, so masks are stored as 32-digit hex strings.
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    /// Decode a stored mask. Unknown bits are dropped per the subset invariant.
    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(Self::from_bits)
    }
}

impl std::fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.names().join(", "))
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_permission() -> impl Strategy<Value = Permission> {
        prop::sample::select(ALL_PERMISSIONS.to_vec())
    }

    fn arb_set() -> impl Strategy<Value = PermissionSet> {
        any::<u128>().prop_map(PermissionSet::from_bits)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// `with` always makes `contains` true; `without` always makes it false.
        #[test]
        fn prop_with_without(set in arb_set(), flag in arb_permission()) {
            prop_assert!(set.with(flag).contains(flag));
            prop_assert!(!set.without(flag).contains(flag));
        }

        /// OR-reduction is commutative and associative.
        #[test]
        fn prop_cumulative_order_independent(
            mut sets in prop::collection::vec(arb_set(), 0..8),
            seed in any::<u64>(),
        ) {
            let forward = PermissionSet::cumulative(sets.clone());

            // Deterministic shuffle from the seed.
            let len = sets.len();
            if len > 1 {
                let mut state = seed;
                for i in (1..len).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = (state % (i as u64 + 1)) as usize;
                    sets.swap(i, j);
                }
            }
            let shuffled = PermissionSet::cumulative(sets);
            prop_assert_eq!(forward, shuffled);
        }

        /// Every constructed set obeys the universe-subset invariant.
        #[test]
        fn prop_subset_of_universe(set in arb_set()) {
            prop_assert_eq!(set.intersection(PermissionSet::universe()), set);
        }

        /// Complement is an involution under the universe.
        #[test]
        fn prop_complement_involution(set in arb_set()) {
            prop_assert_eq!(set.complement().complement(), set);
        }

        /// Hex storage encoding round-trips exactly.
        #[test]
        fn prop_hex_round_trip(set in arb_set()) {
            prop_assert_eq!(PermissionSet::from_hex(&set.to_hex()), Some(set));
        }
    }
}
