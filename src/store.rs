use thiserror::Error;

use crate::recipient::RecipientTable;

/// Suffix that derives the follow-up namespace from a campaign name.
pub const FOLLOW_UP_SUFFIX: &str = "#follow-up";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Campaign store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Failed to encode recipient fields: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid campaign name '{0}': must be non-empty and must not contain '#'")]
    InvalidCampaignName(String),
}

/// Persistence for the raw recipient table of each campaign.
pub trait CampaignStore {
    /// Replaces the stored table, creating the campaign if needed.
    fn save(&self, campaign: &str, table: &RecipientTable) -> Result<(), StoreError>;

    fn load(&self, campaign: &str) -> Result<Option<RecipientTable>, StoreError>;

    /// Adds recipients not yet in the stored table (first-wins) and returns how many were added.
    fn append(&self, campaign: &str, table: RecipientTable) -> Result<usize, StoreError> {
        let mut existing = self.load(campaign)?.unwrap_or_default();
        let added = existing.merge(table);
        self.save(campaign, &existing)?;
        Ok(added)
    }

    /// Names of all stored campaigns, sorted.
    fn campaigns(&self) -> Result<Vec<String>, StoreError>;
}

pub fn validate_campaign_name(name: &str) -> Result<&str, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains('#') {
        return Err(StoreError::InvalidCampaignName(name.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_campaign_name() {
        assert_eq!(validate_campaign_name("  spring-launch ").unwrap(), "spring-launch");
        assert!(validate_campaign_name("").is_err());
        assert!(validate_campaign_name("   ").is_err());
        assert!(validate_campaign_name("launch#follow-up").is_err());
    }
}
