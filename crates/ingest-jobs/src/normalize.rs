//! Mapping from the upstream Portuguese field names into the normalized
//! entities, tolerant of both the live-API and bulk-dataset spellings.

use legisarc_protocol::ids;
use legisarc_protocol::types::{parse_date, Bill, Expense, Person, VoteAction, VoteEvent};
use serde_json::Value;

pub fn opt_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub fn opt_i64(value: &Value, key: &str) -> Option<i64> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn opt_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn normalize_person(dados: &Value) -> Option<Person> {
    let source_id = opt_i64(dados, "id")?;
    let ultimo = dados.get("ultimoStatus").cloned().unwrap_or(Value::Null);
    Some(Person {
        id: ids::person_id(source_id),
        source_id,
        name: opt_string(dados, "nomeCivil")
            .or_else(|| opt_string(dados, "nome"))
            .or_else(|| opt_string(&ultimo, "nome")),
        electoral_name: opt_string(&ultimo, "nomeEleitoral"),
        party: opt_string(&ultimo, "siglaPartido"),
        state: opt_string(&ultimo, "siglaUf"),
        photo_url: opt_string(&ultimo, "urlFoto"),
        email: opt_string(&ultimo, "email"),
    })
}

pub fn normalize_bill(row: &Value) -> Option<Bill> {
    let source_id = opt_i64(row, "id").or_else(|| opt_i64(row, "idProposicao"))?;
    Some(Bill {
        id: ids::bill_id(source_id),
        source_id,
        bill_type: opt_string(row, "siglaTipo"),
        number: opt_i64(row, "numero"),
        year: opt_i64(row, "ano"),
        summary: opt_string(row, "ementa"),
        presented_at: row.get("dataApresentacao").and_then(parse_date),
        uri: opt_string(row, "uri"),
    })
}

pub fn normalize_vote_event(row: &Value) -> Option<VoteEvent> {
    let source_id = opt_string(row, "id").or_else(|| opt_string(row, "idVotacao"))?;
    let approved = match row.get("aprovacao") {
        Some(Value::Bool(b)) => Some(i64::from(*b)),
        _ => opt_i64(row, "aprovacao"),
    };
    Some(VoteEvent {
        id: ids::vote_event_id(&source_id),
        source_id,
        registered_at: opt_string(row, "dataHoraRegistro"),
        approved,
        description: opt_string(row, "descricao"),
        bill_id: opt_i64(row, "idProposicao").map(ids::bill_id),
        uri: opt_string(row, "uri"),
    })
}

pub fn normalize_vote_action(voto: &Value, vote_event_id: &str, person_id: &str) -> VoteAction {
    VoteAction {
        id: ids::vote_action_id(vote_event_id, person_id),
        vote_event_id: vote_event_id.to_owned(),
        person_id: person_id.to_owned(),
        position: opt_string(voto, "tipoVoto").or_else(|| opt_string(voto, "voto")),
        party_orientation: opt_string(voto, "orientacaoBancada"),
    }
}

/// The legislator behind a nominal vote row: nested `deputado_.id` in the
/// live API, flat `idDeputado` in the bulk dataset.
pub fn vote_legislator_id(voto: &Value) -> Option<i64> {
    voto.get("deputado_")
        .and_then(|dep| opt_i64(dep, "id"))
        .or_else(|| opt_i64(voto, "idDeputado"))
}

pub fn normalize_expense(row: &Value, legislator_id: i64) -> Expense {
    let source_id = opt_string(row, "codDocumento").unwrap_or_else(|| {
        // no document code: derive a stable synthetic row identity
        format!(
            "{legislator_id}:{}:{}:{}:{}",
            opt_string(row, "ano").unwrap_or_default(),
            opt_string(row, "mes").unwrap_or_default(),
            opt_string(row, "valorDocumento").unwrap_or_default(),
            opt_string(row, "nomeFornecedor").unwrap_or_default(),
        )
    });
    let supplier_key = opt_string(row, "cnpjCpfFornecedor")
        .or_else(|| opt_string(row, "nomeFornecedor"))
        .unwrap_or_default();
    Expense {
        id: ids::expense_id(&source_id),
        source_id,
        person_id: ids::person_id(legislator_id),
        organization_id: ids::organization_id(&supplier_key),
        value: opt_f64(row, "valorLiquido").or_else(|| opt_f64(row, "valorDocumento")),
        document_date: row.get("dataDocumento").and_then(parse_date),
        year: opt_i64(row, "ano"),
        month: opt_i64(row, "mes"),
        supplier_name: opt_string(row, "nomeFornecedor"),
        expense_type: opt_string(row, "tipoDespesa"),
    }
}
