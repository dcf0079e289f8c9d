//! Client registry: pulls tenant definitions from a published configuration
//! sheet, merges them into the local config, and writes the registry back.

use crate::config::ClientConfig;
use crate::integrations::sheets::{SheetError, normalize_header, parse_csv};
use crate::integrations::webapp::{HistoryTransport, TransmissionError, deliver};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client name is empty")]
    EmptyName,
    #[error("a client named {0} already exists")]
    DuplicateName(String),
    #[error("unknown client: {0}")]
    Unknown(String),
}

impl ClientError {
    pub fn message(&self) -> String {
        match self {
            ClientError::EmptyName => "Enter a name for the client.".to_string(),
            ClientError::DuplicateName(name) => {
                format!("A client named \"{name}\" already exists.")
            }
            ClientError::Unknown(key) => format!("No client matches \"{key}\"."),
        }
    }
}

fn sheet_url_regex() -> &'static Regex {
    static SHEET_URL: OnceLock<Regex> = OnceLock::new();
    SHEET_URL.get_or_init(|| Regex::new(r"/spreadsheets/d/([a-zA-Z0-9_-]+)").expect("sheet url pattern"))
}

fn id_param_regex() -> &'static Regex {
    static ID_PARAM: OnceLock<Regex> = OnceLock::new();
    ID_PARAM.get_or_init(|| Regex::new(r"[?&]id=([a-zA-Z0-9_-]+)").expect("id parameter pattern"))
}

fn bare_id_regex() -> &'static Regex {
    static BARE_ID: OnceLock<Regex> = OnceLock::new();
    BARE_ID.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("bare id pattern"))
}

/// Spreadsheet id from a sharing URL, an `?id=` URL, or an id on its own.
pub fn extract_sheet_id(url_or_id: &str) -> Option<String> {
    let value = url_or_id.trim();
    [sheet_url_regex(), id_param_regex()]
        .iter()
        .find_map(|re| re.captures(value))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| bare_id_regex().is_match(value).then(|| value.to_string()))
}

/// Reads the client configuration sheet. Rows without an id or name get
/// generated ones so they can still be merged.
pub fn parse_client_sheet(csv: &str) -> Result<Vec<ClientConfig>, SheetError> {
    let records = parse_csv(csv);
    if records.len() < 2 {
        return Err(SheetError::EmptyData);
    }
    let headers: Vec<String> = records[0].iter().map(|h| normalize_header(h)).collect();
    let column = |names: &[&str]| names.iter().find_map(|n| headers.iter().position(|h| h == n));

    let id_col = column(&["id"]);
    let name_col = column(&["nome", "name"]);
    let sheet_col = column(&["sheetid", "planilhaid"]);
    let history_col = column(&["historicosheetid", "historysheetid"]);
    let webapp_col = column(&["historicowebappurl", "historywebappurl", "webappurl"]);
    let labels_col = column(&["etiquetasconversao", "conversionlabels"]);
    let updated_col = column(&["ultimaatualizacao", "updatedat"]);

    let stamp = Utc::now();
    let clients = records[1..]
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let cell = |col: Option<usize>| {
                col.and_then(|c| row.get(c))
                    .map(|v| v.trim().to_string())
                    .unwrap_or_default()
            };
            let or_else = |value: String, fallback: String| {
                if value.is_empty() { fallback } else { value }
            };
            let sheet_id = cell(sheet_col);
            ClientConfig {
                id: or_else(cell(id_col), format!("client_{}_{}", stamp.timestamp_millis(), idx + 1)),
                name: or_else(cell(name_col), format!("Cliente {}", idx + 1)),
                sheet_id: extract_sheet_id(&sheet_id).unwrap_or(sheet_id),
                history_sheet_id: cell(history_col),
                history_webapp_url: cell(webapp_col),
                conversion_labels: cell(labels_col)
                    .split(',')
                    .map(|label| label.trim().to_string())
                    .filter(|label| !label.is_empty())
                    .collect(),
                updated_at: or_else(cell(updated_col), stamp.to_rfc3339()),
            }
        })
        .collect::<Vec<_>>();

    debug!(clients = clients.len(), "client sheet parsed");
    Ok(clients)
}

/// Remote clients override local ones matched by id or case-insensitive
/// name. Only non-empty remote fields replace local values, and a local id
/// is never replaced since tenant state is stored under it.
pub fn merge_clients(local: &[ClientConfig], remote: &[ClientConfig]) -> Vec<ClientConfig> {
    let mut merged = local.to_vec();
    for incoming in remote {
        let existing = merged.iter_mut().find(|c| {
            c.id == incoming.id || c.name.trim().eq_ignore_ascii_case(incoming.name.trim())
        });
        match existing {
            Some(client) => {
                info!(client = %incoming.name, "merging client from configuration sheet");
                overlay(&mut client.name, &incoming.name);
                overlay(&mut client.sheet_id, &incoming.sheet_id);
                overlay(&mut client.history_sheet_id, &incoming.history_sheet_id);
                overlay(&mut client.history_webapp_url, &incoming.history_webapp_url);
                overlay(&mut client.updated_at, &incoming.updated_at);
                if !incoming.conversion_labels.is_empty() {
                    client.conversion_labels = incoming.conversion_labels.clone();
                }
            }
            None => {
                info!(client = %incoming.name, "adding client from configuration sheet");
                merged.push(incoming.clone());
            }
        }
    }
    merged
}

fn overlay(target: &mut String, value: &str) {
    if !value.trim().is_empty() {
        *target = value.trim().to_string();
    }
}

/// New client with a `client_<millis>` id. Names are unique ignoring case.
pub fn create_client(
    existing: &[ClientConfig],
    name: &str,
    sheet: Option<&str>,
) -> Result<ClientConfig, ClientError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ClientError::EmptyName);
    }
    if existing.iter().any(|c| c.name.trim().eq_ignore_ascii_case(name)) {
        return Err(ClientError::DuplicateName(name.to_string()));
    }

    let now = Utc::now();
    let base = format!("client_{}", now.timestamp_millis());
    let mut id = base.clone();
    let mut suffix = 1;
    while existing.iter().any(|c| c.id == id) {
        suffix += 1;
        id = format!("{base}_{suffix}");
    }

    let sheet_id = sheet
        .map(|s| extract_sheet_id(s).unwrap_or_else(|| s.trim().to_string()))
        .unwrap_or_default();
    info!(client = name, id = %id, "client created");
    Ok(ClientConfig {
        id,
        name: name.to_string(),
        sheet_id,
        updated_at: now.to_rfc3339(),
        ..ClientConfig::default()
    })
}

/// Removes the client matched by exact id, then case-insensitive name.
pub fn remove_client(
    clients: &mut Vec<ClientConfig>,
    id_or_name: &str,
) -> Result<ClientConfig, ClientError> {
    let key = id_or_name.trim();
    let position = clients
        .iter()
        .position(|c| c.id == key)
        .or_else(|| clients.iter().position(|c| c.name.trim().eq_ignore_ascii_case(key)))
        .ok_or_else(|| ClientError::Unknown(key.to_string()))?;
    let removed = clients.remove(position);
    info!(client = %removed.name, id = %removed.id, "client removed");
    Ok(removed)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistryPayload<'a> {
    action: &'static str,
    sheet_id: &'a str,
    clients: Vec<RegistryRow<'a>>,
}

/// Column names match what [`parse_client_sheet`] reads back.
#[derive(Serialize)]
struct RegistryRow<'a> {
    id: &'a str,
    nome: &'a str,
    #[serde(rename = "sheetId")]
    sheet_id: &'a str,
    #[serde(rename = "historicoSheetId")]
    history_sheet_id: &'a str,
    #[serde(rename = "historicoWebappUrl")]
    history_webapp_url: &'a str,
    #[serde(rename = "etiquetasConversao")]
    conversion_labels: String,
    #[serde(rename = "ultimaAtualizacao")]
    updated_at: &'a str,
}

/// Rewrites the registry sheet with `clients`. An empty registry is not sent,
/// so a fresh install never blanks a shared sheet.
pub fn export_clients(
    clients: &[ClientConfig],
    sheet_id: &str,
    endpoint: &str,
    transports: &[Arc<dyn HistoryTransport>],
) -> Result<Option<&'static str>, TransmissionError> {
    if clients.is_empty() {
        debug!("no clients to export");
        return Ok(None);
    }
    let payload = RegistryPayload {
        action: "updateClients",
        sheet_id: sheet_id.trim(),
        clients: clients
            .iter()
            .map(|c| RegistryRow {
                id: &c.id,
                nome: &c.name,
                sheet_id: &c.sheet_id,
                history_sheet_id: &c.history_sheet_id,
                history_webapp_url: &c.history_webapp_url,
                conversion_labels: c.conversion_labels.join(", "),
                updated_at: &c.updated_at,
            })
            .collect(),
    };
    let payload = serde_json::to_string(&payload).map_err(|e| {
        TransmissionError::AllStrategiesFailed {
            attempts: 0,
            last: format!("payload serialization: {e}"),
        }
    })?;

    match deliver(endpoint, &payload, transports) {
        Ok(strategy) => {
            info!(clients = clients.len(), strategy, "client registry exported");
            Ok(Some(strategy))
        }
        Err(e) => {
            warn!(error = %e, "client registry export failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FailingTransport, RecordingTransport, client};

    #[test]
    fn sheet_ids_come_from_urls_or_bare_ids() {
        assert_eq!(
            extract_sheet_id("https://docs.google.com/spreadsheets/d/1AbC-d_9/edit#gid=0").as_deref(),
            Some("1AbC-d_9")
        );
        assert_eq!(
            extract_sheet_id("https://drive.google.com/open?id=XyZ_123").as_deref(),
            Some("XyZ_123")
        );
        assert_eq!(extract_sheet_id("  plainId42 ").as_deref(), Some("plainId42"));
        assert_eq!(extract_sheet_id("not a sheet"), None);
    }

    #[test]
    fn client_sheet_rows_become_configs() {
        let csv = "id,nome,accessKey,sheetId,historicoSheetId,etiquetasConversao,ultimaAtualizacao\n\
                   c1,Clinica Sol,k1,https://docs.google.com/spreadsheets/d/abc123/edit,hist1,\"FECHADO, GANHO\",2025-01-01\n\
                   ,Loja Lua,,def456,,,\n";
        let clients = parse_client_sheet(csv).expect("clients");

        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].sheet_id, "abc123");
        assert_eq!(clients[0].history_sheet_id, "hist1");
        assert_eq!(clients[0].conversion_labels, vec!["FECHADO".to_string(), "GANHO".to_string()]);
        assert!(clients[1].id.starts_with("client_"));
        assert!(clients[1].conversion_labels.is_empty());
    }

    #[test]
    fn merge_matches_by_id_or_name_and_keeps_local_values() {
        let local = vec![ClientConfig {
            id: "c1".to_string(),
            name: "Clinica Sol".to_string(),
            sheet_id: "old".to_string(),
            history_webapp_url: "https://example.test/exec".to_string(),
            ..ClientConfig::default()
        }];
        let remote = vec![
            ClientConfig {
                id: "other-id".to_string(),
                name: "clinica sol".to_string(),
                sheet_id: "new".to_string(),
                ..ClientConfig::default()
            },
            ClientConfig {
                id: "c2".to_string(),
                name: "Loja Lua".to_string(),
                ..ClientConfig::default()
            },
        ];

        let merged = merge_clients(&local, &remote);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].sheet_id, "new");
        assert_eq!(merged[0].history_webapp_url, "https://example.test/exec");
        assert_eq!(merged[1].id, "c2");
    }

    #[test]
    fn created_clients_get_unique_ids_and_names() {
        let mut existing = vec![client("c1")];
        let url = "https://docs.google.com/spreadsheets/d/abc123/edit";
        let created = create_client(&existing, "  Loja Lua ", Some(url)).expect("created");
        assert!(created.id.starts_with("client_"));
        assert_eq!(created.name, "Loja Lua");
        assert_eq!(created.sheet_id, "abc123");

        existing.push(created.clone());
        let second = create_client(&existing, "Outra", None).expect("second");
        assert_ne!(second.id, created.id);
        assert!(second.sheet_id.is_empty());

        assert!(matches!(
            create_client(&existing, "LOJA LUA", None),
            Err(ClientError::DuplicateName(_))
        ));
        assert!(matches!(create_client(&existing, "   ", None), Err(ClientError::EmptyName)));
    }

    #[test]
    fn clients_are_removed_by_id_or_name() {
        let mut clients = vec![client("c1"), client("c2"), client("c3")];

        assert_eq!(remove_client(&mut clients, "c2").expect("by id").id, "c2");
        assert_eq!(remove_client(&mut clients, "client C3").expect("by name").id, "c3");
        assert!(matches!(remove_client(&mut clients, "c9"), Err(ClientError::Unknown(_))));
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn export_sends_the_registry_in_the_import_layout() {
        let recorder = Arc::new(RecordingTransport::new("form"));
        let transports = vec![
            Arc::new(FailingTransport::new("beacon")) as Arc<dyn HistoryTransport>,
            recorder.clone() as Arc<dyn HistoryTransport>,
        ];
        let mut sol = client("c1");
        sol.conversion_labels = vec!["FECHADO".to_string(), "GANHO".to_string()];

        let strategy = export_clients(&[sol], "registry", "https://example.test/exec", &transports)
            .expect("exported");
        assert_eq!(strategy, Some("form"));

        let payloads = recorder.payloads();
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&payloads[0]).expect("json");
        assert_eq!(value["action"], "updateClients");
        assert_eq!(value["sheetId"], "registry");
        assert_eq!(value["clients"][0]["nome"], "Client c1");
        assert_eq!(value["clients"][0]["etiquetasConversao"], "FECHADO, GANHO");
    }

    #[test]
    fn empty_registry_is_not_exported() {
        let recorder = Arc::new(RecordingTransport::new("form"));
        let transports = vec![recorder.clone() as Arc<dyn HistoryTransport>];

        let strategy = export_clients(&[], "registry", "https://example.test/exec", &transports)
            .expect("nothing to do");
        assert_eq!(strategy, None);
        assert!(recorder.payloads().is_empty());
    }

    #[test]
    fn export_reports_when_every_transport_fails() {
        let failing = Arc::new(FailingTransport::new("beacon"));
        let transports = vec![failing.clone() as Arc<dyn HistoryTransport>];

        let clients = [client("c1")];
        let result = export_clients(&clients, "registry", "https://example.test/exec", &transports);
        assert!(matches!(
            result,
            Err(TransmissionError::AllStrategiesFailed { attempts: 1, .. })
        ));
        assert_eq!(failing.calls(), 1);
        assert!(matches!(
            export_clients(&clients, "registry", " ", &transports),
            Err(TransmissionError::NoEndpoint)
        ));
    }
}
