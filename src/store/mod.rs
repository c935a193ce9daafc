//! Persistence layer — typed records, the `Database` trait, and the
//! libSQL backend.

pub mod libsql_backend;
pub mod migrations;
pub mod records;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use records::{
    CampaignStats, Contact, DueFollowUp, FollowUp, Interaction, OutboundMessage, StageTransition,
};
pub use traits::Database;
