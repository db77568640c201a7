//! Authoritative game world of one area server.

use log::{debug, info};
use rand::Rng;
use shared::world::Direction;
use shared::{UserRecord, DUNGEON_SIZE_X, DUNGEON_SIZE_Y};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

pub const ATTACK_DAMAGE: RangeInclusive<i32> = 10..=20;
pub const NEW_PLAYER_HP: RangeInclusive<i32> = 100..=120;
pub const RESURRECT_HP: RangeInclusive<i32> = 30..=50;

/// A brand new player: full health, no experience, random location.
pub fn fresh_player<R: Rng>(name: &str, rng: &mut R) -> UserRecord {
    UserRecord::new(
        name,
        rng.gen_range(NEW_PLAYER_HP),
        0,
        rng.gen_range(0..DUNGEON_SIZE_X),
        rng.gen_range(0..DUNGEON_SIZE_Y),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackOutcome {
    pub damage: i32,
    /// Victim hp right after the hit; zero means the victim died.
    pub victim_hp: i32,
    /// Hp the victim came back with, if it died.
    pub resurrected_hp: Option<i32>,
}

#[derive(Debug, Default)]
pub struct World {
    players: BTreeMap<String, UserRecord>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player unless one with the same name is already in game.
    pub fn admit(&mut self, record: UserRecord) -> bool {
        if self.players.contains_key(&record.name) {
            return false;
        }
        info!(
            "{} entered at ({}, {}) hp={} exp={}",
            record.name, record.x, record.y, record.hp, record.exp
        );
        self.players.insert(record.name.clone(), record);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.players.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&UserRecord> {
        self.players.get(name)
    }

    pub fn move_player(&mut self, name: &str, direction: Direction) -> Option<UserRecord> {
        let player = self.players.get_mut(name)?;
        let location = player.location().step(direction);
        player.set_location(location);
        debug!("{} moved {:?} to ({}, {})", name, direction, location.x, location.y);
        Some(player.clone())
    }

    /// Resolves one attack. Unknown names and self-attacks do nothing.
    pub fn attack<R: Rng>(
        &mut self,
        attacker: &str,
        victim: &str,
        rng: &mut R,
    ) -> Option<AttackOutcome> {
        if attacker == victim || !self.players.contains_key(attacker) {
            return None;
        }
        let target = self.players.get_mut(victim)?;
        let damage = rng.gen_range(ATTACK_DAMAGE).min(target.hp);
        target.hp -= damage;
        let victim_hp = target.hp;
        let resurrected_hp = if victim_hp == 0 {
            target.hp = rng.gen_range(RESURRECT_HP);
            info!("{} was killed by {} and resurrected with {} hp", victim, attacker, target.hp);
            Some(target.hp)
        } else {
            None
        };

        if let Some(player) = self.players.get_mut(attacker) {
            player.exp += damage;
        }
        debug!("{} attacked {}: damage={} hp={}", attacker, victim, damage, victim_hp);

        Some(AttackOutcome {
            damage,
            victim_hp,
            resurrected_hp,
        })
    }

    pub fn remove(&mut self, name: &str) -> Option<UserRecord> {
        self.players.remove(name)
    }

    pub fn players(&self) -> impl Iterator<Item = &UserRecord> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
