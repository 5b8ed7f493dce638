// CleanChat Core Services

pub mod text_processor;
pub mod config_store;
pub mod providers;
pub mod list_store;
pub mod domain_policy;
pub mod detection;

pub use text_processor::*;
pub use config_store::*;
pub use providers::*;
pub use list_store::{ListStore, RemoveOutcome};
pub use domain_policy::{normalize_domain, DomainPolicy};

pub use detection::{
    GuardAction,
    GuardEngine,
    PendingGuard,
    QuickVerdict,
    Submission,
};
