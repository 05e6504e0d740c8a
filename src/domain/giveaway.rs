use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::{seq::SliceRandom, Rng};
use serde::Serialize;

use super::broadcast::ModelError;

pub const MAX_WINNERS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GiveawayStatus {
    Active,
    Finished,
}

impl GiveawayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiveawayStatus::Active => "ACTIVE",
            GiveawayStatus::Finished => "FINISHED",
        }
    }
}

impl FromStr for GiveawayStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(GiveawayStatus::Active),
            "FINISHED" => Ok(GiveawayStatus::Finished),
            other => Err(ModelError::UnknownGiveawayStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WinnersMode {
    Count(u32),
    All,
}

impl WinnersMode {
    pub fn mode_str(&self) -> &'static str {
        match self {
            WinnersMode::Count(_) => "COUNT",
            WinnersMode::All => "ALL",
        }
    }

    pub fn count(&self) -> Option<u32> {
        match self {
            WinnersMode::Count(n) => Some(*n),
            WinnersMode::All => None,
        }
    }

    pub(crate) fn from_columns(mode: &str, count: Option<i64>) -> Result<Self, ModelError> {
        match mode {
            "ALL" => Ok(WinnersMode::All),
            "COUNT" => Ok(WinnersMode::Count(
                count.and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
            )),
            other => Err(ModelError::UnknownWinnersMode(other.to_string())),
        }
    }

    /// Parses admin input: `ALL` or a number in `1..=1000`.
    pub fn parse_input(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("all") {
            return Some(WinnersMode::All);
        }
        input
            .parse::<u32>()
            .ok()
            .filter(|n| (1..=MAX_WINNERS).contains(n))
            .map(WinnersMode::Count)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Giveaway {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub channel_username: String,
    pub winner_message: Option<String>,
    pub winners_mode: WinnersMode,
    pub ends_at: Option<DateTime<Utc>>,
    pub status: GiveawayStatus,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
}

impl Giveaway {
    pub fn is_active(&self) -> bool {
        self.status == GiveawayStatus::Active
    }
}

#[derive(Debug, Clone)]
pub struct NewGiveaway {
    pub title: String,
    pub description: Option<String>,
    pub channel_username: String,
    pub winner_message: Option<String>,
    pub winners_mode: WinnersMode,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_by: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub id: i64,
    pub giveaway_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub ticket_number: i64,
    pub joined_at: DateTime<Utc>,
    pub can_dm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub winners: Vec<i64>,
    /// False when the giveaway was already finished (or does not exist).
    pub newly_finished: bool,
}

/// Draws distinct winners from `user_ids`. `All` returns every entrant in
/// input order; a count larger than the entrant list is capped.
pub fn pick_winners<R: Rng + ?Sized>(user_ids: &[i64], mode: WinnersMode, rng: &mut R) -> Vec<i64> {
    match mode {
        WinnersMode::All => user_ids.to_vec(),
        WinnersMode::Count(n) => user_ids
            .choose_multiple(rng, n as usize)
            .copied()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn pick_winners_draws_distinct_entrants() {
        let entrants: Vec<i64> = (1..=20).collect();
        let mut rng = StdRng::seed_from_u64(7);

        let mut winners = pick_winners(&entrants, WinnersMode::Count(5), &mut rng);
        assert_eq!(winners.len(), 5);
        winners.sort_unstable();
        winners.dedup();
        assert_eq!(winners.len(), 5);
        assert!(winners.iter().all(|id| entrants.contains(id)));

        assert_eq!(
            pick_winners(&entrants[..3], WinnersMode::Count(10), &mut rng).len(),
            3
        );
        assert_eq!(pick_winners(&entrants, WinnersMode::All, &mut rng), entrants);
        assert!(pick_winners(&[], WinnersMode::Count(3), &mut rng).is_empty());
    }

    #[test]
    fn winners_input_accepts_all_and_bounded_counts() {
        assert_eq!(WinnersMode::parse_input("all"), Some(WinnersMode::All));
        assert_eq!(WinnersMode::parse_input(" 10 "), Some(WinnersMode::Count(10)));
        assert_eq!(WinnersMode::parse_input("1000"), Some(WinnersMode::Count(1000)));
        assert_eq!(WinnersMode::parse_input("0"), None);
        assert_eq!(WinnersMode::parse_input("1001"), None);
        assert_eq!(WinnersMode::parse_input("many"), None);
    }

    #[test]
    fn winners_mode_decodes_stored_columns() {
        assert_eq!(
            WinnersMode::from_columns("COUNT", Some(3)).unwrap(),
            WinnersMode::Count(3)
        );
        assert_eq!(WinnersMode::from_columns("ALL", None).unwrap(), WinnersMode::All);
        assert!(WinnersMode::from_columns("SOME", None).is_err());
    }
}
