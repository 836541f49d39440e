use crate::error::{DispatchError, DispatchResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;

lazy_static! {
    static ref HEADER_NOISE: Regex = Regex::new(r"[\s\-_]+").unwrap();
}

/// The three recipient attributes the engine works with, whatever the
/// spreadsheet calls them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalField {
    Name,
    Email,
    Company,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 3] = [
        CanonicalField::Name,
        CanonicalField::Email,
        CanonicalField::Company,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Name => "name",
            CanonicalField::Email => "email",
            CanonicalField::Company => "company",
        }
    }

    /// Substrings searched for in a normalized header, in priority order.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::Name => &["name", "hrname", "candidate", "person"],
            CanonicalField::Email => &["email", "mail"],
            CanonicalField::Company => &["company", "organization", "org", "employer"],
        }
    }

    fn matches(&self, normalized_header: &str) -> bool {
        self.keywords()
            .iter()
            .any(|keyword| normalized_header.contains(keyword))
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which original header feeds each canonical field. Always complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    name: String,
    email: String,
    company: String,
}

impl ColumnMapping {
    pub fn header_for(&self, field: CanonicalField) -> &str {
        match field {
            CanonicalField::Name => &self.name,
            CanonicalField::Email => &self.email,
            CanonicalField::Company => &self.company,
        }
    }
}

/// Lower-cases a header and strips whitespace, hyphens and underscores.
pub fn normalize_header(header: &str) -> String {
    HEADER_NOISE.replace_all(&header.to_lowercase(), "").into_owned()
}

/// Maps spreadsheet headers onto the canonical fields.
///
/// Each field takes the first header (in the given order) whose normalized
/// form contains one of its keywords. Fields are resolved independently, so a
/// later header that also qualifies never displaces an earlier match.
pub fn resolve<S: AsRef<str>>(headers: &[S]) -> DispatchResult<ColumnMapping> {
    let normalized: Vec<String> = headers
        .iter()
        .map(|header| normalize_header(header.as_ref()))
        .collect();

    let mut found: [Option<&str>; 3] = [None; 3];
    let mut missing = Vec::new();

    for (slot, field) in found.iter_mut().zip(CanonicalField::ALL) {
        let position = normalized.iter().position(|header| field.matches(header));
        match position {
            Some(index) => {
                let original = headers[index].as_ref();
                log::debug!("Column '{original}' resolved as {field}");
                *slot = Some(original);
            }
            None => missing.push(field),
        }
    }

    match found {
        [Some(name), Some(email), Some(company)] => {
            if name == email || name == company || email == company {
                log::warn!(
                    "One header feeds several fields \
                     (name='{name}', email='{email}', company='{company}')"
                );
            }
            Ok(ColumnMapping {
                name: name.to_string(),
                email: email.to_string(),
                company: company.to_string(),
            })
        }
        _ => Err(DispatchError::Resolution {
            missing,
            headers: headers.iter().map(|h| h.as_ref().to_string()).collect(),
        }),
    }
}
