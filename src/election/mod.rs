mod election_state;
mod primary_secondary;
mod rank;

pub use election_state::Role;
pub use primary_secondary::ElectionError;
pub use primary_secondary::PrimarySecondaryMonitor;
pub use primary_secondary::RoleChangeHandler;
pub use primary_secondary::ANNOUNCE_TOPIC;
pub use rank::RandomRanks;
pub use rank::RankSource;
