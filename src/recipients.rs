use crate::columns::{CanonicalField, ColumnMapping};
use crate::error::{DispatchError, DispatchResult};
use crate::table::RawTable;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
    pub company: String,
}

/// Cleaned recipients in input order. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientSet {
    recipients: Vec<Recipient>,
}

impl RecipientSet {
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Recipient> {
        self.recipients.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Recipient> {
        self.recipients.iter()
    }
}

impl<'a> IntoIterator for &'a RecipientSet {
    type Item = &'a Recipient;
    type IntoIter = std::slice::Iter<'a, Recipient>;

    fn into_iter(self) -> Self::IntoIter {
        self.recipients.iter()
    }
}

/// Projects the raw table onto the three canonical fields.
///
/// Rows missing any of name, email or company (after trimming) are dropped.
/// Returns `EmptyResult` when nothing survives.
pub fn build(table: &RawTable, mapping: &ColumnMapping) -> DispatchResult<RecipientSet> {
    let cell = |row: &crate::table::RawRow, field: CanonicalField| -> Option<String> {
        row.get(mapping.header_for(field))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let mut recipients = Vec::with_capacity(table.len());
    for (index, row) in table.rows().iter().enumerate() {
        let name = cell(row, CanonicalField::Name);
        let email = cell(row, CanonicalField::Email);
        let company = cell(row, CanonicalField::Company);

        match (name, email, company) {
            (Some(name), Some(email), Some(company)) => recipients.push(Recipient {
                name,
                email,
                company,
            }),
            _ => log::debug!(
                "Dropping data row {} with an empty name, email or company",
                index + 1
            ),
        }
    }

    let dropped = table.len() - recipients.len();
    if dropped > 0 {
        log::warn!("⚠️ Skipped {dropped} incomplete row(s) out of {}", table.len());
    }

    if recipients.is_empty() {
        return Err(DispatchError::EmptyResult);
    }

    log::info!("📊 {} recipient(s) ready", recipients.len());
    Ok(RecipientSet { recipients })
}
