pub mod broadcast;
pub mod giveaway;
pub mod types;

pub use broadcast::{
    BroadcastJob, BroadcastScope, JobCursor, JobProgress, JobStatus, JobUpdate, ModelError,
    NewBroadcastJob, Recipient,
};
pub use giveaway::{
    pick_winners, Finalized, Giveaway, GiveawayStatus, NewGiveaway, Participant, WinnersMode, MAX_WINNERS,
};
pub use types::{ChannelPost, GiveawayStats, OutboundMessage};
