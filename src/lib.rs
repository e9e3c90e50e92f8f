// Detection Summary - Library Entry Point
//
// Motion-triggered frame capture, budgeted best-frame selection, and a
// windowed result store for consumers waiting on an episode's outcome.

pub mod constants;
pub mod error;
pub mod config;
pub mod paths;
pub mod capture;
pub mod scoring;
pub mod selection;
pub mod bundle;
pub mod store;
pub mod jobs;
pub mod episode;

pub use bundle::ResultRecord;
pub use config::{StoreConfig, SummaryConfig};
pub use episode::{Collaborators, EpisodeEvent, EpisodeManager, TickOutcome};
pub use error::{Result, SummaryError};
pub use scoring::{ScoreFailure, ScoreResult};
pub use selection::{adaptive_select_and_score, Selection, SelectionMeta, SelectionParams};
pub use store::{ResultStore, WindowQuery};
