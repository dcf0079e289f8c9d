//! Compares a fetched lead snapshot against the last label recorded in local
//! history and produces the set of transitions to record.
//!
//! Rows are matched to local leads by id, then by name, then by word overlap.
//! The word-overlap step is a heuristic for rows whose synthetic id changed
//! between imports; similar names can be matched to the wrong lead.

use crate::history::HistoryStore;
use crate::models::{LabelChange, Lead, display_label, labels_equal};
use std::collections::HashSet;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    Id,
    Name,
    Fuzzy,
    Unmatched,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeadMatch {
    pub fetched_id: String,
    /// Local identity the row resolves to; the fetched id when unmatched.
    pub lead_id: String,
    pub kind: MatchKind,
}

/// Several local leads shared words with a fetched row; the first strongest won.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchAmbiguity {
    pub fetched_id: String,
    pub fetched_name: String,
    pub candidates: Vec<String>,
    pub chosen: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionReport {
    pub changes: Vec<LabelChange>,
    pub matches: Vec<LeadMatch>,
    pub ambiguities: Vec<MatchAmbiguity>,
}

pub fn detect(fetched: &[Lead], store: &HistoryStore) -> DetectionReport {
    let mut report = DetectionReport::default();
    let mut claimed: HashSet<String> = HashSet::new();

    for row in fetched {
        let (lead_id, kind) = match resolve(row, store.leads(), &claimed, &mut report.ambiguities) {
            Some((local, kind)) => (local.id.clone(), kind),
            None => (row.id.clone(), MatchKind::Unmatched),
        };
        claimed.insert(lead_id.clone());

        let previous = store.find_last_label(&lead_id);
        if !labels_equal(&previous, &row.current_label) {
            report.changes.push(LabelChange {
                lead_id: lead_id.clone(),
                lead_name: row.name.trim().to_string(),
                previous_label: display_label(&previous).to_string(),
                new_label: display_label(&row.current_label).to_string(),
            });
        }
        report.matches.push(LeadMatch {
            fetched_id: row.id.clone(),
            lead_id,
            kind,
        });
    }

    report
}

fn resolve<'a>(
    row: &Lead,
    locals: &'a [Lead],
    claimed: &HashSet<String>,
    ambiguities: &mut Vec<MatchAmbiguity>,
) -> Option<(&'a Lead, MatchKind)> {
    if let Some(local) = locals.iter().find(|l| l.id == row.id) {
        return Some((local, MatchKind::Id));
    }

    let name = row.name.trim();
    if name.is_empty() {
        return None;
    }
    let unclaimed: Vec<&'a Lead> = locals.iter().filter(|l| !claimed.contains(&l.id)).collect();

    if let Some(local) = unclaimed
        .iter()
        .find(|l| l.name.trim().eq_ignore_ascii_case(name))
    {
        return Some((*local, MatchKind::Name));
    }

    let wanted = name_tokens(name);
    if wanted.is_empty() {
        return None;
    }
    let scored: Vec<(&'a Lead, usize)> = unclaimed
        .into_iter()
        .map(|l| (l, shared_tokens(&wanted, &name_tokens(&l.name))))
        .filter(|(_, score)| *score > 0)
        .collect();

    let best_score = scored.iter().map(|(_, score)| *score).max()?;
    let chosen = scored
        .iter()
        .find(|(_, score)| *score == best_score)
        .map(|(lead, _)| *lead)?;

    if scored.len() > 1 {
        let ambiguity = MatchAmbiguity {
            fetched_id: row.id.clone(),
            fetched_name: name.to_string(),
            candidates: scored.iter().map(|(l, _)| l.id.clone()).collect(),
            chosen: chosen.id.clone(),
        };
        warn!(
            fetched_id = %ambiguity.fetched_id,
            name = %ambiguity.fetched_name,
            candidates = ?ambiguity.candidates,
            chosen = %ambiguity.chosen,
            "ambiguous fuzzy lead match"
        );
        ambiguities.push(ambiguity);
    }
    Some((chosen, MatchKind::Fuzzy))
}

/// Lowercased words longer than three characters.
pub fn name_tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 3)
        .map(str::to_string)
        .collect()
}

fn shared_tokens(a: &[String], b: &[String]) -> usize {
    let b: HashSet<&String> = b.iter().collect();
    let a: HashSet<&String> = a.iter().collect();
    a.intersection(&b).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNLABELED;
    use crate::storage::StateHandle;
    use crate::test_support::{entry_at, lead};

    fn store(leads: Vec<Lead>) -> HistoryStore {
        let mut store = HistoryStore::load("t1", StateHandle::in_memory()).expect("load");
        for lead in leads {
            store.upsert_lead(lead);
        }
        store
    }

    #[test]
    fn first_label_is_recorded_as_change_from_unlabeled() {
        let store = store(vec![lead("L1", "Ana Souza", "")]);
        let report = detect(&[lead("L1", "Ana Souza", "NOVO")], &store);

        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].previous_label, UNLABELED);
        assert_eq!(report.changes[0].new_label, "NOVO");
    }

    #[test]
    fn unknown_lead_with_label_produces_one_change() {
        let store = store(vec![]);
        let report = detect(&[lead("L9", "Novo Lead", "QUALIFICADO")], &store);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.matches[0].kind, MatchKind::Unmatched);
    }

    #[test]
    fn unlabeled_rows_without_history_are_not_changes() {
        let store = store(vec![lead("L1", "Ana", "")]);
        assert!(detect(&[lead("L1", "Ana", "  ")], &store).changes.is_empty());
    }

    #[test]
    fn comparison_uses_history_and_ignores_case() {
        let mut store = store(vec![lead("L1", "Ana", "stale")]);
        store.append(entry_at("L1", "", "QUALIFICADO", 0));

        assert!(detect(&[lead("L1", "Ana", " qualificado ")], &store).changes.is_empty());

        let report = detect(&[lead("L1", "Ana", "FECHADO")], &store);
        assert_eq!(report.changes[0].previous_label, "QUALIFICADO");
    }

    #[test]
    fn falls_back_to_exact_name_when_ids_differ() {
        let mut store = store(vec![lead("local-1", "Carla Dias", "")]);
        store.append(entry_at("local-1", "", "NOVO", 0));

        let report = detect(&[lead("sheet-4-carla", "carla dias", "NOVO")], &store);
        assert!(report.changes.is_empty());
        assert_eq!(report.matches[0].lead_id, "local-1");
        assert_eq!(report.matches[0].kind, MatchKind::Name);
    }

    // Word overlap is a best-effort heuristic: these cases pin its current
    // behavior, not a guarantee of correct identity.
    #[test]
    fn fuzzy_match_prefers_most_shared_words() {
        let store = store(vec![
            lead("a", "Maria Fernanda Lima", ""),
            lead("b", "Maria Fernanda Costa Lima", ""),
        ]);
        let report = detect(&[lead("x", "Fernanda Costa Lima", "NOVO")], &store);

        assert_eq!(report.matches[0].kind, MatchKind::Fuzzy);
        assert_eq!(report.matches[0].lead_id, "b");
        assert_eq!(report.ambiguities.len(), 1);
        assert_eq!(report.ambiguities[0].chosen, "b");
    }

    #[test]
    fn fuzzy_match_ignores_short_words() {
        let store = store(vec![lead("a", "Ana de Sa", "")]);
        let report = detect(&[lead("x", "Ana Sa", "NOVO")], &store);
        assert_eq!(report.matches[0].kind, MatchKind::Unmatched);
    }

    #[test]
    fn fuzzy_tie_picks_first_candidate() {
        let store = store(vec![lead("a", "Joao Pereira", ""), lead("b", "Pedro Pereira", "")]);
        let report = detect(&[lead("x", "Pereira", "NOVO")], &store);
        assert_eq!(report.matches[0].lead_id, "a");
        assert_eq!(report.ambiguities[0].candidates, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn a_local_lead_is_claimed_once_per_snapshot() {
        let store = store(vec![lead("a", "Bruno Alves", "")]);
        let report = detect(
            &[lead("x", "Bruno Alves", "NOVO"), lead("y", "Bruno Alves", "NOVO")],
            &store,
        );
        assert_eq!(report.matches[0].lead_id, "a");
        assert_eq!(report.matches[1].lead_id, "y");
    }
}
