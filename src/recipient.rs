use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecipientError {
    #[error("Failed to parse contact list: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Contact list must be a JSON array of objects")]
    NotAnArray,

    #[error("No email column detected in contact list (include one like 'email' or 'email address')")]
    NoEmailColumn,
}

/// A single row of an uploaded contact list, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactRecord {
    pub email: Option<String>,
    pub name: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ContactRecord {
    pub fn with_email(email: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            ..Self::default()
        }
    }

    pub fn named(email: &str, name: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// A validated campaign recipient. `email` is the dedup key within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Recipient {
    pub fn new(email: &str, name: Option<&str>) -> Result<Self, Rejection> {
        let email = normalize_email(email)?;
        Ok(Self {
            email,
            name: name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            extra: BTreeMap::new(),
        })
    }

    fn from_record(record: ContactRecord) -> Result<Self, Rejection> {
        let raw = record.email.ok_or(Rejection::MissingEmail)?;
        let mut recipient = Self::new(&raw, record.name.as_deref())?;
        recipient.extra = record.extra;
        Ok(recipient)
    }
}

/// Trims and lower-cases an address and checks it has a local part and a domain.
pub fn normalize_email(raw: &str) -> Result<String, Rejection> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(Rejection::MissingEmail);
    }

    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && !domain.is_empty()
                && !email.chars().any(char::is_whitespace) =>
        {
            Ok(email)
        }
        _ => Err(Rejection::InvalidEmail(raw.trim().to_string())),
    }
}

/// Why a contact row was excluded from a recipient table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingEmail,
    InvalidEmail(String),
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// Zero-based position of the row in the uploaded list.
    pub row: usize,
    pub rejection: Rejection,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rejection {
            Rejection::MissingEmail => write!(f, "row {}: missing email address", self.row),
            Rejection::InvalidEmail(email) => {
                write!(f, "row {}: invalid email address '{}'", self.row, email)
            }
            Rejection::Duplicate(email) => {
                write!(f, "row {}: duplicate of earlier entry '{}'", self.row, email)
            }
        }
    }
}

/// Ordered, duplicate-free list of campaign recipients.
///
/// Duplicates collapse first-wins: the earliest occurrence keeps its position
/// and fields, later ones are rejected.
#[derive(Debug, Clone, Default)]
pub struct RecipientTable {
    recipients: Vec<Recipient>,
    index: HashSet<String>,
}

impl PartialEq for RecipientTable {
    fn eq(&self, other: &Self) -> bool {
        self.recipients == other.recipients
    }
}

impl Eq for RecipientTable {}

impl RecipientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates raw rows, returning the accepted table plus one warning per rejected row.
    pub fn from_records<I>(records: I) -> (Self, Vec<ValidationWarning>)
    where
        I: IntoIterator<Item = ContactRecord>,
    {
        let mut table = Self::new();
        let mut warnings = Vec::new();

        for (row, record) in records.into_iter().enumerate() {
            match Recipient::from_record(record) {
                Ok(recipient) => {
                    let email = recipient.email.clone();
                    if !table.push(recipient) {
                        warnings.push(ValidationWarning {
                            row,
                            rejection: Rejection::Duplicate(email),
                        });
                    }
                }
                Err(rejection) => warnings.push(ValidationWarning { row, rejection }),
            }
        }

        (table, warnings)
    }

    /// Appends a recipient unless its email is already present. Returns whether it was added.
    pub fn push(&mut self, recipient: Recipient) -> bool {
        if !self.index.insert(recipient.email.clone()) {
            return false;
        }
        self.recipients.push(recipient);
        true
    }

    /// Appends every recipient of `other` not already present, keeping existing order.
    pub fn merge(&mut self, other: RecipientTable) -> usize {
        let mut added = 0;
        for recipient in other.recipients {
            if self.push(recipient) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Recipient> {
        self.recipients.iter()
    }

    pub fn as_slice(&self) -> &[Recipient] {
        &self.recipients
    }
}

impl FromIterator<Recipient> for RecipientTable {
    fn from_iter<T: IntoIterator<Item = Recipient>>(iter: T) -> Self {
        let mut table = Self::new();
        for recipient in iter {
            table.push(recipient);
        }
        table
    }
}

impl<'a> IntoIterator for &'a RecipientTable {
    type Item = &'a Recipient;
    type IntoIter = std::slice::Iter<'a, Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.recipients.iter()
    }
}

/// Parses an uploaded contact list: a JSON array of objects.
///
/// Keys are lower-cased and trimmed. The address column is `email` if present,
/// otherwise the first key (alphabetically) containing "email". `name` becomes
/// the display name and every other non-null field is kept as an extra.
pub fn parse_contacts_json(input: &str) -> Result<Vec<ContactRecord>, RecipientError> {
    let value: Value = serde_json::from_str(input)?;
    let rows = match value {
        Value::Array(rows) => rows,
        _ => return Err(RecipientError::NotAnArray),
    };

    let rows: Vec<BTreeMap<String, Value>> = rows
        .into_iter()
        .map(|row| match row {
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k.trim().to_lowercase(), v))
                .collect(),
            _ => BTreeMap::new(),
        })
        .collect();

    let email_column = find_email_column(&rows).ok_or(RecipientError::NoEmailColumn)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let mut record = ContactRecord::default();
            for (key, value) in row {
                let Some(text) = value_to_text(value) else {
                    continue;
                };
                if key == email_column {
                    record.email = Some(text);
                } else if key == "name" {
                    record.name = Some(text);
                } else {
                    record.extra.insert(key, text);
                }
            }
            record
        })
        .collect())
}

fn find_email_column(rows: &[BTreeMap<String, Value>]) -> Option<String> {
    let columns: std::collections::BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();
    if columns.iter().any(|c| c.as_str() == "email") {
        return Some("email".to_string());
    }
    columns
        .into_iter()
        .find(|c| c.contains("email"))
        .cloned()
}

fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ann@Example.COM ").unwrap(), "ann@example.com");
        assert_eq!(normalize_email(""), Err(Rejection::MissingEmail));
        assert_eq!(normalize_email("   "), Err(Rejection::MissingEmail));
        assert!(matches!(normalize_email("no-at-sign"), Err(Rejection::InvalidEmail(_))));
        assert!(matches!(normalize_email("@example.com"), Err(Rejection::InvalidEmail(_))));
        assert!(matches!(normalize_email("ann@"), Err(Rejection::InvalidEmail(_))));
        assert!(matches!(normalize_email("a nn@x.com"), Err(Rejection::InvalidEmail(_))));
    }

    #[test]
    fn test_duplicates_are_first_wins() {
        let records = vec![
            ContactRecord::named("a@x.com", "First"),
            ContactRecord::with_email("b@x.com"),
            ContactRecord::named("A@X.com", "Second"),
        ];

        let (table, warnings) = RecipientTable::from_records(records);

        assert_eq!(table.len(), 2);
        assert_eq!(table.as_slice()[0].email, "a@x.com");
        assert_eq!(table.as_slice()[0].name.as_deref(), Some("First"));
        assert_eq!(table.as_slice()[1].email, "b@x.com");
        assert_eq!(
            warnings,
            vec![ValidationWarning {
                row: 2,
                rejection: Rejection::Duplicate("a@x.com".to_string()),
            }]
        );
    }

    #[test]
    fn test_malformed_rows_are_reported() {
        let records = vec![
            ContactRecord::default(),
            ContactRecord::with_email("broken"),
            ContactRecord::with_email("ok@x.com"),
        ];

        let (table, warnings) = RecipientTable::from_records(records);

        assert_eq!(table.len(), 1);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].rejection, Rejection::MissingEmail);
        assert_eq!(warnings[1].row, 1);
        assert!(warnings[1].to_string().contains("invalid email"));
    }

    #[test]
    fn test_merge_keeps_existing_order() {
        let mut table: RecipientTable = ["a@x.com", "b@x.com"]
            .iter()
            .map(|e| Recipient::new(e, None).unwrap())
            .collect();
        let incoming: RecipientTable = ["b@x.com", "c@x.com"]
            .iter()
            .map(|e| Recipient::new(e, Some("New")).unwrap())
            .collect();

        let added = table.merge(incoming);

        assert_eq!(added, 1);
        let emails: Vec<&str> = table.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
        assert_eq!(table.as_slice()[1].name, None);
    }

    #[test]
    fn test_parse_contacts_json_detects_email_column() {
        let input = r#"[
            {"Email Address": "ann@x.com", " Name ": "Ann", "City": "Lagos", "age": 31},
            {"email address": "bob@x.com", "notes": null}
        ]"#;

        let records = parse_contacts_json(input).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].email.as_deref(), Some("ann@x.com"));
        assert_eq!(records[0].name.as_deref(), Some("Ann"));
        assert_eq!(records[0].extra.get("city").map(String::as_str), Some("Lagos"));
        assert_eq!(records[0].extra.get("age").map(String::as_str), Some("31"));
        assert!(records[1].extra.is_empty());
    }

    #[test]
    fn test_parse_contacts_json_errors() {
        assert!(matches!(
            parse_contacts_json(r#"{"email": "a@x.com"}"#),
            Err(RecipientError::NotAnArray)
        ));
        assert!(matches!(
            parse_contacts_json(r#"[{"phone": "123"}]"#),
            Err(RecipientError::NoEmailColumn)
        ));
        assert!(matches!(
            parse_contacts_json("not json"),
            Err(RecipientError::ParseError(_))
        ));
    }
}
