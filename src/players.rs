//! Player Registry
//!
//! Directory of players known to the client, mutated only on the engine task
//! by inbound `player_info` and `social` messages. Collaborators read cloned
//! snapshots. Friend/foe relations and the moderator power level belong to
//! the logged-in user and are tracked here alongside the directory.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::PlayerInfoEntry;

/// Default rating mean for a player the server has told us nothing about.
pub const DEFAULT_RATING_MEAN: f64 = 1500.0;

/// Default rating deviation for an unrated player.
pub const DEFAULT_RATING_DEVIATION: f64 = 500.0;

/// One player directory record.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    /// Unique player id.
    pub id: u32,
    /// Login.
    pub login: String,
    /// Global rating mean.
    pub rating_mean: f64,
    /// Global rating deviation.
    pub rating_deviation: f64,
    /// Ladder rating mean.
    pub ladder_rating_mean: f64,
    /// Ladder rating deviation.
    pub ladder_rating_deviation: f64,
    /// Total games played.
    pub number_of_games: u32,
    /// Clan tag.
    pub clan: Option<String>,
    /// Country code.
    pub country: Option<String>,
}

impl Player {
    /// Create a record with default ratings.
    pub fn new(id: u32, login: impl Into<String>) -> Self {
        Self {
            id,
            login: login.into(),
            rating_mean: DEFAULT_RATING_MEAN,
            rating_deviation: DEFAULT_RATING_DEVIATION,
            ladder_rating_mean: DEFAULT_RATING_MEAN,
            ladder_rating_deviation: DEFAULT_RATING_DEVIATION,
            number_of_games: 0,
            clan: None,
            country: None,
        }
    }

    /// Merge the fields present in a directory update.
    fn apply(&mut self, entry: &PlayerInfoEntry) {
        if let Some(login) = &entry.login {
            self.login = login.clone();
        }
        if let Some((mean, deviation)) = entry.global_rating {
            self.rating_mean = mean;
            self.rating_deviation = deviation;
        }
        if let Some((mean, deviation)) = entry.ladder_rating {
            self.ladder_rating_mean = mean;
            self.ladder_rating_deviation = deviation;
        }
        if let Some(games) = entry.number_of_games {
            self.number_of_games = games;
        }
        if let Some(clan) = &entry.clan {
            self.clan = Some(clan.clone());
        }
        if let Some(country) = &entry.country {
            self.country = Some(country.clone());
        }
    }
}

/// The id→record directory plus the logged-in user's social state.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: BTreeMap<u32, Player>,
    me_id: Option<u32>,
    friends: BTreeSet<u32>,
    foes: BTreeSet<u32>,
    power: u8,
}

impl PlayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the logged-in user's record.
    pub fn insert_me(&mut self, player: Player) {
        self.me_id = Some(player.id);
        self.players.insert(player.id, player);
    }

    /// Id of the logged-in user, if any.
    pub fn me_id(&self) -> Option<u32> {
        self.me_id
    }

    /// Record of the logged-in user, if any.
    pub fn me(&self) -> Option<&Player> {
        self.me_id.and_then(|id| self.players.get(&id))
    }

    /// Look up a record by id.
    pub fn get(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    /// Whether an id is known.
    pub fn contains(&self, id: u32) -> bool {
        self.players.contains_key(&id)
    }

    /// Number of known players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Snapshot of all records, ordered by id.
    pub fn snapshot(&self) -> Vec<Player> {
        self.players.values().cloned().collect()
    }

    /// Apply a directory update: replace on first sight, merge thereafter.
    pub fn upsert(&mut self, entry: &PlayerInfoEntry) {
        self.players
            .entry(entry.id)
            .or_insert_with(|| Player::new(entry.id, entry.login.clone().unwrap_or_default()))
            .apply(entry);
    }

    /// Drop everything learned from the server except the logged-in user's
    /// record, which survives as a shell until the next login.
    pub fn clear_on_disconnect(&mut self) {
        let me = self.me_id;
        self.players.retain(|id, _| Some(*id) == me);
    }

    /// Mark `id` as a friend. No-op unless the id is known; idempotent.
    /// Returns whether the id was known.
    pub fn add_friend(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.friends.insert(id);
        true
    }

    /// Unmark `id` as a friend. No-op unless the id is known; idempotent.
    pub fn remove_friend(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.friends.remove(&id);
        true
    }

    /// Mark `id` as a foe. No-op unless the id is known; idempotent.
    pub fn add_foe(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.foes.insert(id);
        true
    }

    /// Unmark `id` as a foe. No-op unless the id is known; idempotent.
    pub fn remove_foe(&mut self, id: u32) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.foes.remove(&id);
        true
    }

    /// Replace the full friend set (from a `social` snapshot).
    pub fn set_friends(&mut self, friends: impl IntoIterator<Item = u32>) {
        self.friends = friends.into_iter().collect();
    }

    /// Replace the full foe set (from a `social` snapshot).
    pub fn set_foes(&mut self, foes: impl IntoIterator<Item = u32>) {
        self.foes = foes.into_iter().collect();
    }

    /// Whether `id` is a friend.
    pub fn is_friend(&self, id: u32) -> bool {
        self.friends.contains(&id)
    }

    /// Whether `id` is a foe.
    pub fn is_foe(&self, id: u32) -> bool {
        self.foes.contains(&id)
    }

    /// Update the logged-in user's moderator power level.
    pub fn set_power(&mut self, power: u8) {
        self.power = power;
    }

    /// Whether the logged-in user has moderation capabilities.
    pub fn has_admin_power(&self) -> bool {
        self.power >= 1
    }
}
