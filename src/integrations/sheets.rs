use crate::models::{HistoryEntry, Lead};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_SOURCE: &str = "Google Sheets";
const DEFAULT_DEVICE: &str = "desktop";

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("could not read spreadsheet {sheet_id}: {reason}")]
    Fetch { sheet_id: String, reason: String },
    #[error("spreadsheet export has no data rows")]
    EmptyData,
}

impl SheetError {
    pub fn message(&self) -> String {
        match self {
            SheetError::Fetch { reason, .. } => format!(
                "Could not access the spreadsheet ({reason}). Check that it is published and public."
            ),
            SheetError::EmptyData => "The spreadsheet has no data rows.".to_string(),
        }
    }
}

/// Where CSV exports come from. The HTTP implementation is the only one
/// outside tests.
pub trait SheetSource: Send + Sync {
    fn fetch_csv(&self, sheet_id: &str, gid: u64) -> Result<String, SheetError>;
}

pub struct HttpSheetSource {
    client: Client,
    base_url: String,
}

impl HttpSheetSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SheetError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SheetError::Fetch {
                sheet_id: String::new(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn export_url(&self, sheet_id: &str, gid: u64) -> String {
        format!("{}/{}/export?format=csv&gid={}", self.base_url, sheet_id, gid)
    }
}

impl SheetSource for HttpSheetSource {
    fn fetch_csv(&self, sheet_id: &str, gid: u64) -> Result<String, SheetError> {
        let url = self.export_url(sheet_id, gid);
        debug!(%url, "fetching spreadsheet export");
        let fetch_err = |reason: String| SheetError::Fetch {
            sheet_id: sheet_id.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", resp.status())));
        }
        // Private sheets answer with a sign-in page instead of CSV.
        let is_html = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));
        if is_html {
            return Err(fetch_err("sheet is not public".to_string()));
        }
        resp.text().map_err(|e| fetch_err(e.to_string()))
    }
}

/// Typed view over a spreadsheet source for one tenant.
#[derive(Clone)]
pub struct SpreadsheetReader {
    source: Arc<dyn SheetSource>,
    leads_gid: u64,
    history_gid: u64,
}

impl SpreadsheetReader {
    pub fn new(source: Arc<dyn SheetSource>, leads_gid: u64, history_gid: u64) -> Self {
        Self {
            source,
            leads_gid,
            history_gid,
        }
    }

    pub fn fetch_leads(&self, sheet_id: &str) -> Result<Vec<Lead>, SheetError> {
        let csv = self.source.fetch_csv(sheet_id, self.leads_gid)?;
        let leads = parse_leads(&csv)?;
        info!(sheet_id, leads = leads.len(), "leads fetched from spreadsheet");
        Ok(leads)
    }

    pub fn fetch_history(&self, sheet_id: &str) -> Result<Vec<HistoryEntry>, SheetError> {
        let csv = self.source.fetch_csv(sheet_id, self.history_gid)?;
        parse_history(&csv)
    }

    pub fn fetch_raw(&self, sheet_id: &str) -> Result<String, SheetError> {
        self.source.fetch_csv(sheet_id, self.leads_gid)
    }
}

/// Splits CSV text into trimmed cells. Quoted cells may contain commas,
/// doubled quotes, and line breaks. Blank lines are dropped.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => record.push(std::mem::take(&mut cell).trim().to_string()),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                record.push(std::mem::take(&mut cell).trim().to_string());
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => cell.push(c),
        }
    }
    if !cell.is_empty() || !record.is_empty() {
        record.push(cell.trim().to_string());
        push_record(&mut records, record);
    }
    records
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    if record.iter().any(|cell| !cell.is_empty()) {
        records.push(record);
    }
}

/// Lowercases, folds Portuguese diacritics, and drops everything but letters
/// and digits, so "Etapa Etiquetas", "etapaEtiquetas" and "ETAPA_ETIQUETAS" agree.
pub fn normalize_header(header: &str) -> String {
    header
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

struct ColumnSpec {
    aliases: &'static [&'static str],
    position: Option<usize>,
}

const fn col(aliases: &'static [&'static str], position: usize) -> ColumnSpec {
    ColumnSpec {
        aliases,
        position: Some(position),
    }
}

const LEAD_ID: usize = 0;
const LEAD_DATE: usize = 1;
const LEAD_NAME: usize = 2;
const LEAD_PHONE: usize = 3;
const LEAD_SOURCE: usize = 4;
const LEAD_LABEL: usize = 5;
const LEAD_SUB_LABEL: usize = 6;
const LEAD_LOCAL_CLIENT: usize = 7;
const LEAD_CAMPAIGN: usize = 8;
const LEAD_AD_SET: usize = 9;
const LEAD_AD: usize = 10;
const LEAD_MEDIA: usize = 11;
const LEAD_REF: usize = 12;
const LEAD_AD_LINK: usize = 13;
const LEAD_DEVICE: usize = 14;
const LEAD_NOTES: usize = 15;

const LEAD_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        aliases: &["id", "leadid"],
        position: None,
    },
    col(&["data", "date"], 0),
    col(&["nome", "name"], 1),
    col(&["telefone", "phone"], 2),
    col(&["origem", "source"], 3),
    col(&["etapaetiquetas", "etiqueta", "etiquetas", "label"], 4),
    col(&["etapaaltas", "sublabel"], 5),
    col(&["clientelocal", "localclient"], 6),
    col(&["campanha", "campaign"], 7),
    col(&["conjunto", "adset"], 8),
    col(&["anuncio", "ad"], 9),
    col(&["media", "midia"], 10),
    col(&["ref", "reference"], 11),
    col(&["linkanuncio", "adlink"], 12),
    col(&["dispositivo", "device"], 13),
    col(&["observacoes", "notes"], 14),
];

const HIST_TIMESTAMP: usize = 0;
const HIST_LEAD_ID: usize = 1;
const HIST_LEAD_NAME: usize = 2;
const HIST_PREVIOUS: usize = 3;
const HIST_NEW: usize = 4;
const HIST_ACTOR: usize = 5;
const HIST_REASON: usize = 6;
const HIST_HISTORY_ID: usize = 7;

const HISTORY_COLUMNS: &[ColumnSpec] = &[
    col(&["timestamp", "dataalteracao", "datahora", "data"], 0),
    col(&["leadid", "idlead"], 1),
    col(&["leadname", "nomelead", "nome"], 2),
    col(&["previouslabel", "etiquetaanterior"], 3),
    col(&["newlabel", "etiquetanova"], 4),
    col(&["actor", "usuario", "user"], 5),
    col(&["reason", "motivo"], 6),
    col(&["historyid"], 7),
];

/// Column indices resolved from a header row, or positional when the header
/// names none of the known columns.
struct ColumnMap {
    indices: Vec<Option<usize>>,
}

impl ColumnMap {
    fn resolve(header: &[String], specs: &[ColumnSpec]) -> Self {
        let normalized: Vec<String> = header.iter().map(|h| normalize_header(h)).collect();
        let by_name: Vec<Option<usize>> = specs
            .iter()
            .map(|spec| {
                spec.aliases
                    .iter()
                    .find_map(|alias| normalized.iter().position(|h| h == alias))
            })
            .collect();

        if by_name.iter().any(Option::is_some) {
            return Self { indices: by_name };
        }
        debug!("no known header names; using positional columns");
        Self {
            indices: specs.iter().map(|spec| spec.position).collect(),
        }
    }

    fn get<'a>(&self, row: &'a [String], field: usize) -> &'a str {
        self.indices
            .get(field)
            .copied()
            .flatten()
            .and_then(|idx| row.get(idx))
            .map(|cell| cell.trim())
            .unwrap_or("")
    }
}

pub fn parse_leads(text: &str) -> Result<Vec<Lead>, SheetError> {
    let records = parse_csv(text);
    if records.len() < 2 {
        return Err(SheetError::EmptyData);
    }
    let columns = ColumnMap::resolve(&records[0], LEAD_COLUMNS);

    let leads = records[1..]
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let field = |f: usize| columns.get(row, f).to_string();
            let or_default = |f: usize, default: &str| {
                let value = columns.get(row, f);
                if value.is_empty() { default.to_string() } else { value.to_string() }
            };
            let name = field(LEAD_NAME);
            let phone = field(LEAD_PHONE);
            Lead {
                id: synthesize_lead_id(columns.get(row, LEAD_ID), &phone, &name, idx + 1),
                date: field(LEAD_DATE),
                name,
                phone,
                source: or_default(LEAD_SOURCE, DEFAULT_SOURCE),
                current_label: field(LEAD_LABEL),
                sub_label: field(LEAD_SUB_LABEL),
                local_client: field(LEAD_LOCAL_CLIENT),
                campaign: field(LEAD_CAMPAIGN),
                ad_set: field(LEAD_AD_SET),
                ad: field(LEAD_AD),
                media: field(LEAD_MEDIA),
                reference: field(LEAD_REF),
                ad_link: field(LEAD_AD_LINK),
                device: or_default(LEAD_DEVICE, DEFAULT_DEVICE),
                notes: field(LEAD_NOTES),
                history: Vec::new(),
            }
        })
        .collect();
    Ok(leads)
}

/// Stable identity for a spreadsheet row: explicit id, else phone digits,
/// else row number plus a name slug.
fn synthesize_lead_id(explicit: &str, phone: &str, name: &str, row: usize) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() >= 8 {
        return format!("tel-{digits}");
    }
    let slug: String = normalize_header(name).chars().take(24).collect();
    format!("sheet-{row}-{slug}")
}

pub fn parse_history(text: &str) -> Result<Vec<HistoryEntry>, SheetError> {
    let records = parse_csv(text);
    if records.len() < 2 {
        return Err(SheetError::EmptyData);
    }
    let columns = ColumnMap::resolve(&records[0], HISTORY_COLUMNS);

    let mut entries = Vec::new();
    for (idx, row) in records[1..].iter().enumerate() {
        let lead_id = columns.get(row, HIST_LEAD_ID);
        let raw_ts = columns.get(row, HIST_TIMESTAMP);
        let Some(timestamp) = parse_timestamp(raw_ts) else {
            warn!(row = idx + 2, value = raw_ts, "history row with unreadable timestamp skipped");
            continue;
        };
        let new_label = columns.get(row, HIST_NEW);
        let history_id = match columns.get(row, HIST_HISTORY_ID) {
            "" => format!(
                "{lead_id}-{}-{}",
                timestamp.timestamp_millis(),
                normalize_header(new_label)
            ),
            id => id.to_string(),
        };
        let reason = columns.get(row, HIST_REASON);
        entries.push(HistoryEntry {
            id: format!("remote-{history_id}"),
            history_id,
            lead_id: lead_id.to_string(),
            lead_name: columns.get(row, HIST_LEAD_NAME).to_string(),
            previous_label: columns.get(row, HIST_PREVIOUS).to_string(),
            new_label: new_label.to_string(),
            timestamp,
            actor: columns.get(row, HIST_ACTOR).to_string(),
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        });
    }
    Ok(entries)
}

/// RFC 3339, or a naive `yyyy-mm-dd HH:MM:SS` / `dd/mm/yyyy HH:MM:SS` read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y, %H:%M:%S",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_respects_quotes() {
        let rows = parse_csv("a,b\n\"x, y\",\"say \"\"hi\"\"\"\n\n\"multi\nline\",z\r\n");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["x, y".to_string(), "say \"hi\"".to_string()]);
        assert_eq!(rows[2][0], "multi\nline");
    }

    #[test]
    fn headers_are_matched_case_and_accent_insensitively() {
        assert_eq!(normalize_header("Etapa Etiquetas"), "etapaetiquetas");
        assert_eq!(normalize_header("etapaEtiquetas"), "etapaetiquetas");
        assert_eq!(normalize_header("Observações"), "observacoes");
    }

    #[test]
    fn parse_leads_by_header_name() {
        let csv = "Nome,Data,Telefone,Etapa Etiquetas,Campanha\n\
                   \"Souza, Ana\",01/02/2025,55 11 98888-7777,QUALIFICADO,Verao\n\
                   Bruno,02/02/2025,,,\n";
        let leads = parse_leads(csv).expect("leads");
        assert_eq!(leads.len(), 2);
        assert_eq!(leads[0].name, "Souza, Ana");
        assert_eq!(leads[0].current_label, "QUALIFICADO");
        assert_eq!(leads[0].campaign, "Verao");
        assert_eq!(leads[0].id, "tel-5511988887777");
        assert_eq!(leads[0].source, "Google Sheets");
        assert_eq!(leads[1].current_label, "");
        assert_eq!(leads[1].id, "sheet-2-bruno");
    }

    #[test]
    fn parse_leads_falls_back_to_positions_for_unknown_headers() {
        let csv = "c0,c1,c2,c3,c4\n03/03/2025,Carla,11999990000,Instagram,NOVO\n";
        let leads = parse_leads(csv).expect("leads");
        assert_eq!(leads[0].date, "03/03/2025");
        assert_eq!(leads[0].name, "Carla");
        assert_eq!(leads[0].source, "Instagram");
        assert_eq!(leads[0].current_label, "NOVO");
    }

    #[test]
    fn missing_label_column_defaults_to_empty() {
        let leads = parse_leads("Nome,Telefone\nDiego,123\n").expect("leads");
        assert_eq!(leads[0].current_label, "");
    }

    #[test]
    fn header_only_export_is_empty_data() {
        assert!(matches!(parse_leads("Nome,Telefone\n"), Err(SheetError::EmptyData)));
        assert!(matches!(parse_history(""), Err(SheetError::EmptyData)));
    }

    #[test]
    fn parse_history_reads_rows_and_skips_bad_timestamps() {
        let csv = "timestamp,leadId,leadName,previousLabel,newLabel,actor,reason,historyId\n\
                   2025-03-01T10:00:00Z,L1,Ana,unlabeled,NOVO,System,,L1-1-abc\n\
                   not-a-date,L1,Ana,NOVO,CONTATO,System,,L1-2-def\n\
                   01/03/2025 11:00:00,L2,Bia,NOVO,FECHADO,maria,ligou,\n";
        let entries = parse_history(csv).expect("history");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].history_id, "L1-1-abc");
        assert_eq!(entries[0].reason, None);
        assert_eq!(entries[1].actor, "maria");
        assert_eq!(entries[1].reason.as_deref(), Some("ligou"));
        assert!(entries[1].history_id.starts_with("L2-"));
    }
}
