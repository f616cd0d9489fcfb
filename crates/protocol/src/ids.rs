//! Canonical node identities. Every graph upsert is keyed by one of these,
//! which is what makes re-ingestion idempotent.

pub fn person_id(deputado_id: i64) -> String {
    format!("camara:person:{deputado_id}")
}

pub fn bill_id(proposicao_id: i64) -> String {
    format!("camara:bill:{proposicao_id}")
}

pub fn vote_event_id(votacao_id: &str) -> String {
    format!("camara:vote_event:{}", votacao_id.trim())
}

pub fn vote_action_id(vote_event: &str, person: &str) -> String {
    format!("camara:vote_action:{vote_event}:{person}")
}

pub fn expense_id(source_row: &str) -> String {
    format!("camara:expense:{}", source_row.trim())
}

/// Supplier names arrive with inconsistent casing and spacing; collapse
/// both so the same organization always maps to one node.
pub fn organization_id(name_or_id: &str) -> String {
    let normalized = name_or_id
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if normalized.is_empty() {
        return "camara:org:UNKNOWN".to_owned();
    }
    format!("camara:org:{normalized}")
}

pub fn party_id(sigla: &str) -> String {
    format!("camara:party:{}", sigla.trim())
}

pub fn state_id(uf: &str) -> String {
    format!("camara:state:{}", uf.trim())
}
