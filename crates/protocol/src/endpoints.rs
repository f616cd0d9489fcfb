//! Upstream Camara dos Deputados open-data endpoints.

pub const DEPUTADOS_ENDPOINT: &str = "/deputados";
pub const PROPOSICOES_ENDPOINT: &str = "/proposicoes";
pub const VOTACOES_ENDPOINT: &str = "/votacoes";

pub const DEFAULT_BASE_URL: &str = "https://dadosabertos.camara.leg.br/api/v2";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

pub fn deputado_details(deputado_id: i64) -> String {
    format!("/deputados/{deputado_id}")
}

pub fn votacao_details(votacao_id: &str) -> String {
    format!("/votacoes/{votacao_id}")
}

pub fn votacao_votos(votacao_id: &str) -> String {
    format!("/votacoes/{votacao_id}/votos")
}

pub fn proposicao_details(proposicao_id: i64) -> String {
    format!("/proposicoes/{proposicao_id}")
}

pub fn despesas(deputado_id: i64) -> String {
    format!("/deputados/{deputado_id}/despesas")
}

/// Pseudo endpoints under which bulk static-dataset fetches are archived,
/// keeping fallback payloads distinguishable from live API payloads.
pub fn dataset_proposicoes(year: i32) -> String {
    format!("/datasets/proposicoes/{year}")
}

pub fn dataset_votacoes(year: i32) -> String {
    format!("/datasets/votacoes/{year}")
}

pub fn dataset_votacoes_votos(year: i32) -> String {
    format!("/datasets/votacoesVotos/{year}")
}

pub fn dataset_despesas(year: i32) -> String {
    format!("/datasets/despesas/{year}")
}
