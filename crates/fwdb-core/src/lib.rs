//! Core contact model, identity keys and reconciliation modes for FWDB.

use std::fmt;
use std::str::FromStr;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fwdb-core";

/// Persisted table name.
pub const TABLE_NAME: &str = "contacts_data";

/// Required spreadsheet columns, in canonical order.
pub const REQUIRED_COLUMNS: [&str; 6] = ["Company", "Name", "Surname", "Email", "Position", "Phone"];

/// Rendering used for blank values in change tables.
pub const EMPTY_MARKER: &str = "(empty)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    Company,
    Name,
    Surname,
    Email,
    Position,
    Phone,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::Company,
        Column::Name,
        Column::Surname,
        Column::Email,
        Column::Position,
        Column::Phone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Company => "Company",
            Column::Name => "Name",
            Column::Surname => "Surname",
            Column::Email => "Email",
            Column::Position => "Position",
            Column::Phone => "Phone",
        }
    }

    pub fn value(self, record: &ContactRecord) -> &str {
        match self {
            Column::Company => &record.company,
            Column::Name => &record.name,
            Column::Surname => &record.surname,
            Column::Email => &record.email,
            Column::Position => &record.position,
            Column::Phone => &record.phone,
        }
    }

    pub fn value_mut(self, record: &mut ContactRecord) -> &mut String {
        match self {
            Column::Company => &mut record.company,
            Column::Name => &mut record.name,
            Column::Surname => &mut record.surname,
            Column::Email => &mut record.email,
            Column::Position => &mut record.position,
            Column::Phone => &mut record.phone,
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical contact row. Every field is text; blank means empty string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactRecord {
    #[serde(rename = "Company", default)]
    pub company: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Surname", default)]
    pub surname: String,
    #[serde(rename = "Email", default)]
    pub email: String,
    #[serde(rename = "Position", default)]
    pub position: String,
    #[serde(rename = "Phone", default)]
    pub phone: String,
}

impl ContactRecord {
    /// Build a record from values given in `Column::ALL` order.
    pub fn from_values(values: [String; 6]) -> Self {
        let [company, name, surname, email, position, phone] = values;
        Self {
            company,
            name,
            surname,
            email,
            position,
            phone,
        }
    }

    pub fn values(&self) -> [&str; 6] {
        Column::ALL.map(|c| c.value(self))
    }

    pub fn key(&self) -> EmailKey {
        EmailKey::from_email(&self.email)
    }

    /// Email with any link markup stripped, for display next to diff entries.
    pub fn display_email(&self) -> String {
        canonicalize_identity_text(&self.email).trim().to_string()
    }

    /// True when every column matches after trimming surrounding whitespace.
    pub fn same_content(&self, other: &ContactRecord) -> bool {
        Column::ALL
            .iter()
            .all(|c| c.value(self).trim() == c.value(other).trim())
    }

    pub fn is_blank(&self) -> bool {
        self.values().iter().all(|v| v.trim().is_empty())
    }
}

/// Identity of a contact: `lower(trim(email))` after markup extraction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailKey(String);

impl EmailKey {
    pub fn from_email(email: &str) -> Self {
        Self(canonicalize_identity_text(email).trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EmailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip mail-link markup (`<a href="mailto:x">x</a>`) down to the bare
/// address. Values without anchor markup are returned unchanged.
pub fn canonicalize_identity_text(raw: &str) -> String {
    if !raw.to_ascii_lowercase().contains("<a") {
        return raw.to_string();
    }
    let Ok(anchor) = Selector::parse("a") else {
        return raw.to_string();
    };
    let fragment = Html::parse_fragment(raw);
    let Some(node) = fragment.select(&anchor).next() else {
        return raw.to_string();
    };

    let text = node.text().collect::<String>();
    let text = text.trim();
    if !text.is_empty() {
        return text.to_string();
    }

    node.value()
        .attr("href")
        .and_then(mailto_address)
        .unwrap_or_else(|| raw.to_string())
}

fn mailto_address(href: &str) -> Option<String> {
    let href = href.trim();
    let prefix = href.get(..7)?;
    if !prefix.eq_ignore_ascii_case("mailto:") {
        return None;
    }
    let address = href[7..].split('?').next().unwrap_or_default().trim();
    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

/// Reconciliation policy for an incoming batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Update matches, insert new identities, keep everything untouched.
    #[default]
    Replace,
    /// Insert new identities only; matches are reported as duplicates.
    Append,
}

impl UpdateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateMode::Replace => "replace",
            UpdateMode::Append => "append",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown update mode '{0}' (expected 'replace' or 'append')")]
pub struct UnknownUpdateMode(pub String);

impl FromStr for UpdateMode {
    type Err = UnknownUpdateMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(UpdateMode::Replace),
            "append" => Ok(UpdateMode::Append),
            other => Err(UnknownUpdateMode(other.to_string())),
        }
    }
}

/// Render a trimmed value for change tables, marking blanks distinctly.
pub fn display_value(value: &str) -> &str {
    if value.is_empty() {
        EMPTY_MARKER
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(email: &str, name: &str) -> ContactRecord {
        ContactRecord {
            email: email.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn email_key_is_trimmed_and_lowercased() {
        assert_eq!(EmailKey::from_email("  A@X.COM ").as_str(), "a@x.com");
        assert_eq!(
            contact("a@x.com", "Jo").key(),
            contact(" A@X.COM ", "Joe").key()
        );
    }

    #[test]
    fn anchor_text_wins_over_href() {
        let raw = r#"<a href="mailto:other@x.com">Jane@X.com</a>"#;
        assert_eq!(canonicalize_identity_text(raw), "Jane@X.com");
        assert_eq!(EmailKey::from_email(raw).as_str(), "jane@x.com");
    }

    #[test]
    fn empty_anchor_falls_back_to_mailto_href() {
        let raw = r#"<a href="mailto:sales@x.com?subject=hi"></a>"#;
        assert_eq!(canonicalize_identity_text(raw), "sales@x.com");
    }

    #[test]
    fn plain_and_unparseable_values_pass_through() {
        assert_eq!(canonicalize_identity_text("b@x.com"), "b@x.com");
        assert_eq!(canonicalize_identity_text("<abbr>"), "<abbr>");
        assert_eq!(canonicalize_identity_text(r#"<a href="/x"></a>"#), r#"<a href="/x"></a>"#);
    }

    #[test]
    fn columns_follow_required_order() {
        let names = Column::ALL.map(Column::as_str);
        assert_eq!(names, REQUIRED_COLUMNS);

        let mut record = ContactRecord::from_values(
            ["Acme", "Jo", "Doe", "jo@acme.io", "CTO", "123"].map(String::from),
        );
        assert_eq!(record.values(), ["Acme", "Jo", "Doe", "jo@acme.io", "CTO", "123"]);
        *Column::Phone.value_mut(&mut record) = "456".into();
        assert_eq!(record.phone, "456");
    }

    #[test]
    fn same_content_ignores_surrounding_whitespace() {
        let a = contact("a@x.com", "Jo ");
        let b = contact(" a@x.com", "Jo");
        assert!(a.same_content(&b));
        assert!(!a.same_content(&contact("a@x.com", "Joe")));
    }

    #[test]
    fn update_mode_parses_case_insensitively() {
        assert_eq!("Replace".parse::<UpdateMode>(), Ok(UpdateMode::Replace));
        assert_eq!(" APPEND ".parse::<UpdateMode>(), Ok(UpdateMode::Append));
        assert!("merge".parse::<UpdateMode>().is_err());
    }

    #[test]
    fn records_serialize_with_column_headers() {
        let json = serde_json::to_value(contact("a@x.com", "Jo")).unwrap();
        assert_eq!(json["Email"], "a@x.com");
        assert_eq!(json["Company"], "");
        assert_eq!(display_value(""), EMPTY_MARKER);
        assert_eq!(display_value("x"), "x");
    }
}
