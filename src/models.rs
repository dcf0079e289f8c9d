use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display value for an empty label.
pub const UNLABELED: &str = "unlabeled";

/// Actor recorded on entries produced by polling.
pub const SYSTEM_ACTOR: &str = "System";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Lead {
    pub id: String,
    pub date: String,
    pub name: String,
    pub phone: String,
    pub source: String,
    pub current_label: String,
    pub sub_label: String,
    pub local_client: String,
    pub campaign: String,
    pub ad_set: String,
    pub ad: String,
    pub media: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub ad_link: String,
    pub device: String,
    pub notes: String,
    pub history: Vec<HistoryEntry>,
}

impl Lead {
    /// Copies the spreadsheet-owned fields from `other`, keeping identity and history.
    pub fn absorb_fields(&mut self, other: &Lead) {
        self.date = other.date.clone();
        self.name = other.name.clone();
        self.phone = other.phone.clone();
        self.source = other.source.clone();
        self.current_label = other.current_label.clone();
        self.sub_label = other.sub_label.clone();
        self.local_client = other.local_client.clone();
        self.campaign = other.campaign.clone();
        self.ad_set = other.ad_set.clone();
        self.ad = other.ad.clone();
        self.media = other.media.clone();
        self.reference = other.reference.clone();
        self.ad_link = other.ad_link.clone();
        self.device = other.device.clone();
        self.notes = other.notes.clone();
    }

    pub fn display_label(&self) -> &str {
        display_label(&self.current_label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub history_id: String,
    pub lead_id: String,
    pub lead_name: String,
    pub previous_label: String,
    pub new_label: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HistoryEntry {
    /// Builds a fresh entry with a new entry id and idempotency key.
    pub fn new(
        lead_id: &str,
        lead_name: &str,
        previous_label: &str,
        new_label: &str,
        actor: &str,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let millis = timestamp.timestamp_millis();
        Self {
            id: format!("hist-{millis}-{}", random_suffix(6)),
            history_id: history_id_for(lead_id, timestamp),
            lead_id: lead_id.to_string(),
            lead_name: lead_name.to_string(),
            previous_label: display_label(previous_label).to_string(),
            new_label: display_label(new_label).to_string(),
            timestamp,
            actor: actor.to_string(),
            reason,
        }
    }

    /// Row order used by the history export and the append endpoint.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.timestamp.to_rfc3339(),
            self.lead_id.clone(),
            self.lead_name.clone(),
            self.previous_label.clone(),
            self.new_label.clone(),
            self.actor.clone(),
            self.reason.clone().unwrap_or_default(),
            self.history_id.clone(),
        ]
    }
}

/// One detected or declared transition, before it becomes a history entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelChange {
    pub lead_id: String,
    pub lead_name: String,
    pub previous_label: String,
    pub new_label: String,
}

pub fn history_id_for(lead_id: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{lead_id}-{}-{}",
        timestamp.timestamp_millis(),
        random_suffix(6)
    )
}

fn random_suffix(len: usize) -> String {
    use rand::{Rng, distributions::Alphanumeric};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

pub fn normalize_label(label: &str) -> &str {
    label.trim()
}

/// Comparison key: trimmed, lowercased, with the unlabeled sentinel folded to "".
pub fn label_key(label: &str) -> String {
    let trimmed = normalize_label(label);
    if trimmed.eq_ignore_ascii_case(UNLABELED) {
        return String::new();
    }
    trimmed.to_lowercase()
}

pub fn labels_equal(a: &str, b: &str) -> bool {
    label_key(a) == label_key(b)
}

pub fn display_label(label: &str) -> &str {
    let trimmed = normalize_label(label);
    if trimmed.is_empty() { UNLABELED } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_comparison_ignores_case_and_whitespace() {
        assert!(labels_equal("  QUALIFICADO ", "qualificado"));
        assert!(labels_equal("", UNLABELED));
        assert!(labels_equal("   ", "Unlabeled"));
        assert!(!labels_equal("NOVO", "FECHADO"));
    }

    #[test]
    fn new_entry_uses_display_labels_and_lead_scoped_history_id() {
        let ts = Utc::now();
        let entry = HistoryEntry::new("L1", "Ana", "", " NOVO ", SYSTEM_ACTOR, None, ts);
        assert_eq!(entry.previous_label, UNLABELED);
        assert_eq!(entry.new_label, "NOVO");
        assert!(entry.history_id.starts_with(&format!("L1-{}-", ts.timestamp_millis())));
        assert_eq!(entry.to_row().len(), 8);
    }

    #[test]
    fn history_ids_differ_for_the_same_instant() {
        let ts = Utc::now();
        assert_ne!(history_id_for("L1", ts), history_id_for("L1", ts));
    }
}
