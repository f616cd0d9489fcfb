//! Static-dataset fallback: when live windows fail, per-year bulk files
//! (JSON for bills/votes, CSV for expenses) recover the rows. Every
//! dataset touch leaves a marker payload in the archive under the
//! dataset source, even when the file turns out unusable.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use legisarc_graph_writer::GraphWriter;
use legisarc_protocol::endpoints;
use legisarc_protocol::ids;
use legisarc_protocol::types::{parse_date, CoverageGap, Params, SOURCE_CAMARA_DATASET};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::jobs::IngestJobs;
use crate::normalize::{
    normalize_bill, normalize_expense, normalize_vote_action, normalize_vote_event, opt_string,
    vote_legislator_id,
};

/// Per-year bulk dataset URL templates. `{year}` is substituted; an
/// unset template means the corresponding fallback is unavailable.
#[derive(Clone, Debug, Default)]
pub struct DatasetConfig {
    pub bills_url_template: Option<String>,
    pub votes_url_template: Option<String>,
    pub votes_nominal_url_template: Option<String>,
    pub expenses_url_template: Option<String>,
    pub expenses_csv_delimiter: Option<u8>,
}

impl DatasetConfig {
    pub fn delimiter(&self) -> u8 {
        self.expenses_csv_delimiter.unwrap_or(b',')
    }
}

fn template_url(template: &str, year: i32) -> String {
    template.replace("{year}", &year.to_string())
}

/// Bulk files come either as a bare array or wrapped under `dados`/`data`.
fn static_records(payload: &Value) -> Vec<Value> {
    let rows = match payload {
        Value::Array(rows) => rows.as_slice(),
        Value::Object(obj) => obj
            .get("dados")
            .or_else(|| obj.get("data"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };
    rows.iter().filter(|row| row.is_object()).cloned().collect()
}

fn marker_params(year: i32, url: &str) -> Params {
    let mut params = Params::new();
    params.insert("year".to_owned(), year.to_string());
    params.insert("url".to_owned(), url.to_owned());
    params
}

fn years_of(from: NaiveDate, to: NaiveDate) -> std::ops::RangeInclusive<i32> {
    from.year()..=to.year()
}

fn row_in_window(row: &Value, keys: &[&str], from: NaiveDate, to: NaiveDate) -> bool {
    for key in keys {
        if let Some(date) = row.get(*key).and_then(parse_date) {
            return date >= from && date <= to;
        }
    }
    // undated rows pass through rather than silently vanish
    true
}

impl<G: GraphWriter> IngestJobs<G> {
    /// Fetch one dataset year, archive the marker, and hand back the
    /// body when it is actually usable.
    fn dataset_year(
        &self,
        batch_id: &str,
        marker_endpoint: &str,
        template: &str,
        year: i32,
    ) -> Result<Option<String>> {
        let url = template_url(template, year);
        let (status, body) = self.client.get_text(&url)?;
        self.archive.add_payload_from(
            SOURCE_CAMARA_DATASET,
            batch_id,
            marker_endpoint,
            &marker_params(year, &url),
            Some(&year.to_string()),
            status,
            &json!({"metadata": {"url": url, "year": year, "status_code": status}}),
        )?;
        if status != 200 || body.trim().is_empty() {
            warn!(year, status, endpoint = marker_endpoint, "dataset year unusable");
            return Ok(None);
        }
        Ok(Some(body))
    }

    pub(crate) fn bills_static_fallback(
        &self,
        batch_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<u64> {
        let Some(template) = self.datasets.bills_url_template.clone() else {
            return Ok(0);
        };
        let mut recovered = 0_u64;
        for year in years_of(window_start, window_end) {
            let endpoint = endpoints::dataset_proposicoes(year);
            let Some(body) = self.dataset_year(batch_id, &endpoint, &template, year)? else {
                continue;
            };
            let payload: Value = match serde_json::from_str(&body) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(year, error = %err, "bills dataset is not valid JSON");
                    continue;
                }
            };
            for row in static_records(&payload) {
                if !row_in_window(&row, &["dataApresentacao", "data"], window_start, window_end) {
                    continue;
                }
                if let Some(bill) = normalize_bill(&row) {
                    self.graph.upsert_bill(&bill)?;
                    recovered += 1;
                }
            }
        }
        info!(recovered, %window_start, %window_end, "bills window recovered from dataset");
        Ok(recovered)
    }

    pub(crate) fn votes_static_fallback(
        &self,
        batch_id: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
        selected: &[i64],
    ) -> Result<(u64, u64)> {
        let Some(events_template) = self.datasets.votes_url_template.clone() else {
            return Ok((0, 0));
        };
        let mut events = 0_u64;
        let mut actions = 0_u64;
        // source event id -> graph node id, for linking nominal rows
        let mut event_nodes: HashMap<String, String> = HashMap::new();

        for year in years_of(window_start, window_end) {
            let endpoint = endpoints::dataset_votacoes(year);
            let Some(body) = self.dataset_year(batch_id, &endpoint, &events_template, year)?
            else {
                continue;
            };
            let payload: Value = match serde_json::from_str(&body) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(year, error = %err, "votes dataset is not valid JSON");
                    continue;
                }
            };
            for row in static_records(&payload) {
                let dated = row_in_window(
                    &row,
                    &["data", "dataHoraRegistro", "dataVotacao", "dataHoraVotacao"],
                    window_start,
                    window_end,
                );
                if !dated {
                    continue;
                }
                let source_id = match opt_string(&row, "id").or_else(|| opt_string(&row, "idVotacao"))
                {
                    Some(id) => id,
                    None => continue,
                };
                if let Some(event) = normalize_vote_event(&row) {
                    self.graph.upsert_vote_event(&event)?;
                    event_nodes.insert(source_id, event.id.clone());
                    events += 1;
                }
            }
        }

        if let Some(nominal_template) = self.datasets.votes_nominal_url_template.clone() {
            for year in years_of(window_start, window_end) {
                let endpoint = endpoints::dataset_votacoes_votos(year);
                let Some(body) = self.dataset_year(batch_id, &endpoint, &nominal_template, year)?
                else {
                    continue;
                };
                if event_nodes.is_empty() {
                    continue;
                }
                let payload: Value = match serde_json::from_str(&body) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(year, error = %err, "nominal votes dataset is not valid JSON");
                        continue;
                    }
                };
                for row in static_records(&payload) {
                    let votacao_id = match opt_string(&row, "idVotacao")
                        .or_else(|| opt_string(&row, "id"))
                    {
                        Some(id) => id,
                        None => continue,
                    };
                    let Some(event_node_id) = event_nodes.get(&votacao_id) else {
                        continue;
                    };
                    let Some(dep_id) = vote_legislator_id(&row) else {
                        continue;
                    };
                    if !selected.is_empty() && !selected.contains(&dep_id) {
                        continue;
                    }
                    let action =
                        normalize_vote_action(&row, event_node_id, &ids::person_id(dep_id));
                    self.graph.upsert_vote_action(&action)?;
                    actions += 1;
                }
            }
        }

        info!(events, actions, %window_start, %window_end, "votes window recovered from dataset");
        Ok((events, actions))
    }

    pub(crate) fn expenses_dataset_fallback(
        &self,
        batch_id: &str,
        legislator_ids: &[i64],
        gaps: &[CoverageGap],
    ) -> Result<u64> {
        let Some(template) = self.datasets.expenses_url_template.clone() else {
            return Ok(0);
        };
        let years: BTreeSet<i32> = gaps.iter().filter_map(|gap| gap.year).collect();
        let dep_set: BTreeSet<i64> = legislator_ids.iter().copied().collect();
        let mut recovered = 0_u64;

        for year in years {
            let endpoint = endpoints::dataset_despesas(year);
            let Some(body) = self.dataset_year(batch_id, &endpoint, &template, year)? else {
                continue;
            };
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(self.datasets.delimiter())
                .flexible(true)
                .from_reader(body.as_bytes());
            let headers = reader
                .headers()
                .context("read expenses dataset header")?
                .clone();
            for record in reader.records() {
                let record = record.context("read expenses dataset row")?;
                let row: HashMap<String, String> = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect();
                let Some(dep_id) = dataset_legislator_id(&row) else {
                    continue;
                };
                if !dep_set.contains(&dep_id) {
                    continue;
                }
                let Some(shape) = dataset_expense_shape(&row, dep_id, year) else {
                    continue;
                };
                let expense = normalize_expense(&shape, dep_id);
                self.graph.upsert_expense(&expense)?;
                recovered += 1;
            }
        }
        info!(recovered, "expenses recovered from dataset");
        Ok(recovered)
    }
}

fn first_of<'a>(row: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| row.get(*key))
        .map(String::as_str)
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// The legislator id column has drifted across dataset vintages.
fn dataset_legislator_id(row: &HashMap<String, String>) -> Option<i64> {
    first_of(
        row,
        &[
            "idDeputado",
            "id_deputado",
            "ideCadastro",
            "ide_cadastro",
            "nuDeputadoId",
            "deputado_id",
        ],
    )
    .and_then(|raw| raw.parse().ok())
}

/// Reshape a CSV row into the live-API expense shape so one normalizer
/// covers both paths. Rows without any monetary value are dropped.
fn dataset_expense_shape(row: &HashMap<String, String>, dep_id: i64, year: i32) -> Option<Value> {
    let month = first_of(row, &["mes", "month", "numMes", "nuMes"]).unwrap_or("");
    let value = first_of(
        row,
        &[
            "valorDocumento",
            "valor_documento",
            "vlrDocumento",
            "valorLiquido",
            "vlrLiquido",
        ],
    )?;
    let supplier = first_of(row, &["nomeFornecedor", "txtFornecedor", "fornecedor"]).unwrap_or("");
    let cnpj = first_of(
        row,
        &["cnpjCpfFornecedor", "cnpj_cpf_fornecedor", "cpfCnpjFornecedor"],
    )
    .unwrap_or("");
    let document = first_of(row, &["codDocumento", "cod_documento", "documento"])
        .map(str::to_owned)
        .unwrap_or_else(|| format!("dataset:{dep_id}:{year}:{month}:{value}:{supplier}"));
    let document_date = first_of(row, &["dataDocumento", "data_documento", "dtDocumento"]);
    let expense_type = first_of(row, &["tipoDespesa", "tipo_despesa", "descricao"]);

    let mut shape = Map::new();
    shape.insert("codDocumento".to_owned(), Value::from(document));
    shape.insert("ano".to_owned(), Value::from(year.to_string()));
    shape.insert("mes".to_owned(), Value::from(month));
    shape.insert("valorDocumento".to_owned(), Value::from(value));
    shape.insert("valorLiquido".to_owned(), Value::from(value));
    shape.insert("nomeFornecedor".to_owned(), Value::from(supplier));
    shape.insert("cnpjCpfFornecedor".to_owned(), Value::from(cnpj));
    if let Some(date) = document_date {
        shape.insert("dataDocumento".to_owned(), Value::from(date));
    }
    if let Some(kind) = expense_type {
        shape.insert("tipoDespesa".to_owned(), Value::from(kind));
    }
    Some(Value::Object(shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_records_accepts_bare_arrays_and_wrappers() {
        assert_eq!(static_records(&json!([{"id": 1}, 7])).len(), 1);
        assert_eq!(static_records(&json!({"dados": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert_eq!(static_records(&json!({"data": [{"id": 3}]})).len(), 1);
        assert!(static_records(&json!({"other": []})).is_empty());
        assert!(static_records(&json!("texto")).is_empty());
    }

    #[test]
    fn dataset_legislator_id_reads_legacy_columns() {
        let mut row = HashMap::new();
        row.insert("ideCadastro".to_owned(), " 204554 ".to_owned());
        assert_eq!(dataset_legislator_id(&row), Some(204554));

        let mut blank = HashMap::new();
        blank.insert("idDeputado".to_owned(), "".to_owned());
        blank.insert("nuDeputadoId".to_owned(), "77".to_owned());
        assert_eq!(dataset_legislator_id(&blank), Some(77));

        assert_eq!(dataset_legislator_id(&HashMap::new()), None);
    }

    #[test]
    fn dataset_shape_requires_a_value_and_synthesizes_document_ids() {
        let mut row = HashMap::new();
        row.insert("mes".to_owned(), "4".to_owned());
        row.insert("vlrDocumento".to_owned(), "120.50".to_owned());
        row.insert("txtFornecedor".to_owned(), "Posto da Esquina".to_owned());
        let shape = dataset_expense_shape(&row, 204554, 2023).expect("shape");
        assert_eq!(
            shape["codDocumento"],
            "dataset:204554:2023:4:120.50:Posto da Esquina"
        );
        assert_eq!(shape["ano"], "2023");
        assert_eq!(shape["valorLiquido"], "120.50");

        let mut valueless = HashMap::new();
        valueless.insert("mes".to_owned(), "4".to_owned());
        assert!(dataset_expense_shape(&valueless, 1, 2023).is_none());
    }

    #[test]
    fn window_filter_keeps_undated_rows() {
        let from = NaiveDate::from_ymd_opt(2023, 1, 1).expect("date");
        let to = NaiveDate::from_ymd_opt(2023, 3, 31).expect("date");
        let dated = json!({"dataApresentacao": "2023-02-01"});
        let outside = json!({"dataApresentacao": "2023-07-01"});
        let undated = json!({"ementa": "sem data"});
        assert!(row_in_window(&dated, &["dataApresentacao"], from, to));
        assert!(!row_in_window(&outside, &["dataApresentacao"], from, to));
        assert!(row_in_window(&undated, &["dataApresentacao"], from, to));
    }
}
