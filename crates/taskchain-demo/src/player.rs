// A stand-in for a player database: records are kept as JSON blobs so loading
// and saving do real (de)serialization work off the main thread.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Coins granted on each login.
pub const LOGIN_BONUS: u64 = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayerRecord {
    pub name: String,
    pub coins: u64,
    pub logins: u32,
}

impl PlayerRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            coins: 0,
            logins: 0,
        }
    }

    /// Apply a login: count it and pay the bonus.
    pub fn reward_login(&mut self) {
        self.logins += 1;
        self.coins += LOGIN_BONUS;
    }
}

#[derive(Default)]
pub struct PlayerStore {
    records: DashMap<String, String>,
}

impl PlayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding `player-0 .. player-{count-1}`, except every
    /// `missing_every`-th player (if non-zero), which is left out.
    pub fn seeded(count: usize, missing_every: usize) -> Result<Self> {
        let store = Self::new();
        for index in 0..count {
            if missing_every != 0 && (index + 1) % missing_every == 0 {
                continue;
            }
            store.save(&PlayerRecord::new(player_name(index)))?;
        }
        Ok(store)
    }

    pub fn load(&self, name: &str) -> Result<Option<PlayerRecord>> {
        let Some(json) = self.records.get(name) else {
            return Ok(None);
        };
        let record = serde_json::from_str(json.value())
            .with_context(|| format!("Failed to deserialize player record for {}", name))?;
        Ok(Some(record))
    }

    pub fn save(&self, record: &PlayerRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .with_context(|| format!("Failed to serialize player record for {}", record.name))?;
        self.records.insert(record.name.clone(), json);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

pub fn player_name(index: usize) -> String {
    format!("player-{}", index)
}
