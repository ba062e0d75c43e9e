pub mod config;
pub mod credentials;
pub mod database;
pub mod dispatch;
pub mod followup;
pub mod ledger;
pub mod planner;
pub mod recipient;
pub mod replies;
pub mod smtp;
pub mod store;
pub mod summary;
pub mod template;

// Re-export commonly used types
pub use config::Config;
pub use database::CampaignDatabase;
pub use dispatch::{CancelFlag, DispatchError, DispatchSettings, Dispatcher, RunOutcome, SendOutcome, Sender};
pub use ledger::{Outcome, RecipientLedger};
pub use recipient::{Recipient, RecipientTable};
pub use store::CampaignStore;
pub use summary::{campaign_report, failure_details, summarize, CampaignReport, CampaignSummary};
pub use template::MessageTemplate;
