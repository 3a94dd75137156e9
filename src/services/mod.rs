pub mod accumulator;
pub mod continuation;
pub mod conversation;
pub mod database;
pub mod export;
pub mod ledger;
pub mod session;
pub mod settings;

pub use accumulator::{normalize, ResponseAccumulator};
pub use continuation::{ContinuationController, ContinuationPolicy, PendingTurn};
pub use database::Database;
pub use ledger::{ConversationStore, Ledger, LedgerError};
pub use session::{
    ConversationSession, SessionConfig, TurnContext, TurnError, TurnHandle, TurnOutcome,
    TurnState, TurnUpdate,
};
pub use settings::{AppSettings, SettingsService};
