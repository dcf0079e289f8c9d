//! Read-only views over a tenant's leads: filters, headline numbers,
//! attribution rankings, weekly conversion and kanban grouping.

use crate::models::{Lead, UNLABELED};
use chrono::{Duration, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_CONVERSION_LABELS: [&str; 3] = ["FECHADO", "GANHO", "CONCLUIDO"];
const QUALIFIED_MARKERS: [&str; 2] = ["qualificado", "orçamento"];

#[derive(Clone, Debug, Default)]
pub struct LeadFilter {
    pub search: Option<String>,
    pub label: Option<String>,
    pub source: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        if let Some(term) = self.search.as_deref().map(str::to_lowercase)
            && !term.is_empty()
            && ![&lead.name, &lead.phone, &lead.source]
                .iter()
                .any(|field| field.to_lowercase().contains(&term))
        {
            return false;
        }
        if let Some(label) = &self.label
            && lead.current_label.trim() != label.trim()
        {
            return false;
        }
        if let Some(source) = &self.source
            && lead.source != *source
        {
            return false;
        }
        if self.start.is_some() || self.end.is_some() {
            let Some(date) = parse_lead_date(&lead.date) else {
                return false;
            };
            if self.start.is_some_and(|start| date < start) || self.end.is_some_and(|end| date > end) {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, leads: &'a [Lead]) -> Vec<&'a Lead> {
        leads.iter().filter(|lead| self.matches(lead)).collect()
    }
}

/// `dd/mm/yyyy` (time part ignored) or ISO `yyyy-mm-dd`.
pub fn parse_lead_date(value: &str) -> Option<NaiveDate> {
    let day = value.split_whitespace().next()?;
    NaiveDate::parse_from_str(day, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(day.get(..10).unwrap_or(day), "%Y-%m-%d"))
        .ok()
}

/// Conversion vocabulary compared case-insensitively; the defaults apply
/// when a client has none configured.
pub fn conversion_keys(labels: &[String]) -> Vec<String> {
    if labels.is_empty() {
        return DEFAULT_CONVERSION_LABELS
            .iter()
            .map(|label| label.to_lowercase())
            .collect();
    }
    labels.iter().map(|label| label.trim().to_lowercase()).collect()
}

fn is_converted(lead: &Lead, keys: &[String]) -> bool {
    let label = lead.current_label.trim().to_lowercase();
    !label.is_empty() && keys.contains(&label)
}

fn is_qualified(lead: &Lead) -> bool {
    let label = lead.current_label.trim().to_lowercase();
    QUALIFIED_MARKERS.iter().any(|marker| label.contains(marker))
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DashboardStats {
    pub total: usize,
    pub unlabeled: usize,
    pub qualified: usize,
    pub converted: usize,
    pub conversion_rate: f64,
    pub by_source: BTreeMap<String, usize>,
}

pub fn dashboard_stats(leads: &[&Lead], conversion_labels: &[String]) -> DashboardStats {
    let keys = conversion_keys(conversion_labels);
    let mut stats = DashboardStats {
        total: leads.len(),
        ..DashboardStats::default()
    };
    for lead in leads {
        if lead.current_label.trim().is_empty() {
            stats.unlabeled += 1;
        }
        if is_qualified(lead) {
            stats.qualified += 1;
        }
        if is_converted(lead, &keys) {
            stats.converted += 1;
        }
        *stats.by_source.entry(lead.source.clone()).or_insert(0) += 1;
    }
    stats.conversion_rate = percent(stats.converted, stats.total);
    stats
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributionField {
    Campaign,
    AdSet,
    Ad,
    AdLink,
}

impl AttributionField {
    fn value<'a>(&self, lead: &'a Lead) -> &'a str {
        match self {
            AttributionField::Campaign => &lead.campaign,
            AttributionField::AdSet => &lead.ad_set,
            AttributionField::Ad => &lead.ad,
            AttributionField::AdLink => &lead.ad_link,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttributionRow {
    pub value: String,
    pub count: usize,
    pub percentage: f64,
}

/// Most frequent non-empty values of `field`; percentages are of all `leads`.
pub fn top_attribution(leads: &[&Lead], field: AttributionField, limit: usize) -> Vec<AttributionRow> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for lead in leads {
        let value = field.value(lead).trim();
        if !value.is_empty() {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    let mut rows: Vec<AttributionRow> = counts
        .into_iter()
        .map(|(value, count)| AttributionRow {
            value: value.to_string(),
            count,
            percentage: percent(count, leads.len()),
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    rows.truncate(limit);
    rows
}

#[derive(Clone, Debug, PartialEq)]
pub struct WeeklyConversion {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub leads: usize,
    pub converted: usize,
    pub rate: f64,
}

/// Four seven-day windows ending on `today`, oldest first.
pub fn weekly_conversion(leads: &[&Lead], today: NaiveDate, conversion_labels: &[String]) -> Vec<WeeklyConversion> {
    let keys = conversion_keys(conversion_labels);
    (0..4)
        .rev()
        .map(|week| {
            let end = today - Duration::days(week * 7);
            let start = end - Duration::days(6);
            let in_window: Vec<&&Lead> = leads
                .iter()
                .filter(|lead| parse_lead_date(&lead.date).is_some_and(|d| d >= start && d <= end))
                .collect();
            let converted = in_window.iter().filter(|lead| is_converted(lead, &keys)).count();
            WeeklyConversion {
                start,
                end,
                leads: in_window.len(),
                converted,
                rate: percent(converted, in_window.len()),
            }
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct KanbanColumn {
    pub label: String,
    pub lead_ids: Vec<String>,
}

/// One column per distinct trimmed label, sorted, plus an "unlabeled" column
/// when some lead has no label.
pub fn kanban_columns(leads: &[&Lead]) -> Vec<KanbanColumn> {
    let labels: BTreeSet<&str> = leads
        .iter()
        .map(|lead| match lead.current_label.trim() {
            "" => UNLABELED,
            label => label,
        })
        .collect();
    labels
        .into_iter()
        .map(|label| KanbanColumn {
            label: label.to_string(),
            lead_ids: leads
                .iter()
                .filter(|lead| lead.display_label() == label)
                .map(|lead| lead.id.clone())
                .collect(),
        })
        .collect()
}
