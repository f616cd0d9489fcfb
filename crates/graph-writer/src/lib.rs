//! Graph store seam: idempotent upsert-by-id writes consumed by the
//! ingestion jobs, plus the read surface the reconciler audits through.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use legisarc_protocol::ids;
use legisarc_protocol::types::{Bill, Expense, Person, VoteAction, VoteEvent};
use serde_json::{json, Value};

pub const LABEL_PERSON: &str = "Person";
pub const LABEL_BILL: &str = "Bill";
pub const LABEL_VOTE_EVENT: &str = "VoteEvent";
pub const LABEL_VOTE_ACTION: &str = "VoteAction";
pub const LABEL_EXPENSE: &str = "Expense";
pub const LABEL_ORGANIZATION: &str = "Organization";
pub const LABEL_PARTY: &str = "Party";
pub const LABEL_STATE: &str = "State";

pub const EDGE_MEMBER_OF: &str = "MEMBER_OF";
pub const EDGE_REPRESENTS: &str = "REPRESENTS";
pub const EDGE_ON_BILL: &str = "ON_BILL";
pub const EDGE_IN_EVENT: &str = "IN_EVENT";
pub const EDGE_CAST: &str = "CAST";
pub const EDGE_HAS_EXPENSE: &str = "HAS_EXPENSE";
pub const EDGE_PAID_TO: &str = "PAID_TO";

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub props: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub kind: String,
    pub from: String,
    pub to: String,
}

pub trait GraphWriter: Send + Sync {
    fn ensure_constraints(&self) -> Result<()>;
    fn upsert_person(&self, person: &Person) -> Result<()>;
    fn upsert_bill(&self, bill: &Bill) -> Result<()>;
    fn upsert_vote_event(&self, event: &VoteEvent) -> Result<()>;
    fn upsert_vote_action(&self, action: &VoteAction) -> Result<()>;
    fn upsert_expense(&self, expense: &Expense) -> Result<()>;
}

pub trait GraphReader: Send + Sync {
    fn count(&self, label: &str) -> Result<i64>;
    fn nodes(&self, label: &str) -> Result<Vec<GraphNode>>;
    fn edge_exists(&self, kind: &str, from: &str, to: &str) -> Result<bool>;
}

#[derive(Default)]
struct GraphState {
    nodes: HashMap<String, Vec<GraphNode>>,
    edges: Vec<GraphEdge>,
}

/// In-memory graph used by the smoke entrypoint and by tests. Upserts
/// replace the node with the same id; everything else appends.
#[derive(Clone, Default)]
pub struct MemoryGraph {
    state: Arc<RwLock<GraphState>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert_node(&self, label: &str, id: &str, props: Value) {
        let mut state = recover_write(&self.state);
        let bucket = state.nodes.entry(label.to_owned()).or_default();
        if let Some(existing) = bucket.iter_mut().find(|node| node.id == id) {
            existing.props = props;
        } else {
            bucket.push(GraphNode {
                id: id.to_owned(),
                label: label.to_owned(),
                props,
            });
        }
    }

    /// Appends a node without the id-uniqueness scan. Exists so audits
    /// can be exercised against a deliberately corrupted graph.
    pub fn insert_unchecked(&self, label: &str, id: &str, props: Value) {
        let mut state = recover_write(&self.state);
        state.nodes.entry(label.to_owned()).or_default().push(GraphNode {
            id: id.to_owned(),
            label: label.to_owned(),
            props,
        });
    }

    fn add_edge(&self, kind: &str, from: &str, to: &str) {
        let edge = GraphEdge {
            kind: kind.to_owned(),
            from: from.to_owned(),
            to: to.to_owned(),
        };
        let mut state = recover_write(&self.state);
        if !state.edges.contains(&edge) {
            state.edges.push(edge);
        }
    }
}

impl GraphWriter for MemoryGraph {
    fn ensure_constraints(&self) -> Result<()> {
        // uniqueness is enforced by the upsert scan itself
        Ok(())
    }

    fn upsert_person(&self, person: &Person) -> Result<()> {
        self.upsert_node(LABEL_PERSON, &person.id, serde_json::to_value(person)?);
        if let Some(party) = person.party.as_deref().filter(|p| !p.trim().is_empty()) {
            let party_id = ids::party_id(party);
            self.upsert_node(LABEL_PARTY, &party_id, json!({"id": party_id, "sigla": party}));
            self.add_edge(EDGE_MEMBER_OF, &person.id, &party_id);
        }
        if let Some(state) = person.state.as_deref().filter(|s| !s.trim().is_empty()) {
            let state_id = ids::state_id(state);
            self.upsert_node(LABEL_STATE, &state_id, json!({"id": state_id, "uf": state}));
            self.add_edge(EDGE_REPRESENTS, &person.id, &state_id);
        }
        Ok(())
    }

    fn upsert_bill(&self, bill: &Bill) -> Result<()> {
        self.upsert_node(LABEL_BILL, &bill.id, serde_json::to_value(bill)?);
        Ok(())
    }

    fn upsert_vote_event(&self, event: &VoteEvent) -> Result<()> {
        self.upsert_node(LABEL_VOTE_EVENT, &event.id, serde_json::to_value(event)?);
        if let Some(bill_id) = event.bill_id.as_deref() {
            self.add_edge(EDGE_ON_BILL, &event.id, bill_id);
        }
        Ok(())
    }

    fn upsert_vote_action(&self, action: &VoteAction) -> Result<()> {
        self.upsert_node(LABEL_VOTE_ACTION, &action.id, serde_json::to_value(action)?);
        self.add_edge(EDGE_CAST, &action.person_id, &action.id);
        self.add_edge(EDGE_IN_EVENT, &action.id, &action.vote_event_id);
        Ok(())
    }

    fn upsert_expense(&self, expense: &Expense) -> Result<()> {
        self.upsert_node(LABEL_EXPENSE, &expense.id, serde_json::to_value(expense)?);
        let org_props = json!({
            "id": expense.organization_id,
            "name": expense.supplier_name,
        });
        self.upsert_node(LABEL_ORGANIZATION, &expense.organization_id, org_props);
        self.add_edge(EDGE_HAS_EXPENSE, &expense.person_id, &expense.id);
        self.add_edge(EDGE_PAID_TO, &expense.id, &expense.organization_id);
        Ok(())
    }
}

impl GraphReader for MemoryGraph {
    fn count(&self, label: &str) -> Result<i64> {
        let state = recover_read(&self.state);
        Ok(state.nodes.get(label).map(|b| b.len() as i64).unwrap_or(0))
    }

    fn nodes(&self, label: &str) -> Result<Vec<GraphNode>> {
        let state = recover_read(&self.state);
        Ok(state.nodes.get(label).cloned().unwrap_or_default())
    }

    fn edge_exists(&self, kind: &str, from: &str, to: &str) -> Result<bool> {
        let state = recover_read(&self.state);
        Ok(state
            .edges
            .iter()
            .any(|e| e.kind == kind && e.from == from && e.to == to))
    }
}

fn recover_write(lock: &RwLock<GraphState>) -> std::sync::RwLockWriteGuard<'_, GraphState> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn recover_read(lock: &RwLock<GraphState>) -> std::sync::RwLockReadGuard<'_, GraphState> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_person(id: i64) -> Person {
        Person {
            id: ids::person_id(id),
            source_id: id,
            name: Some("Fulana de Tal".to_owned()),
            electoral_name: Some("Fulana".to_owned()),
            party: Some("XYZ".to_owned()),
            state: Some("SP".to_owned()),
            photo_url: None,
            email: None,
        }
    }

    #[test]
    fn person_upsert_is_idempotent_and_materializes_membership() {
        let graph = MemoryGraph::new();
        let person = sample_person(204554);
        graph.upsert_person(&person).expect("upsert");
        graph.upsert_person(&person).expect("upsert again");

        assert_eq!(graph.count(LABEL_PERSON).expect("count"), 1);
        assert_eq!(graph.count(LABEL_PARTY).expect("count"), 1);
        assert_eq!(graph.count(LABEL_STATE).expect("count"), 1);
        assert!(graph
            .edge_exists(EDGE_MEMBER_OF, &person.id, &ids::party_id("XYZ"))
            .expect("edge"));
        assert!(graph
            .edge_exists(EDGE_REPRESENTS, &person.id, &ids::state_id("SP"))
            .expect("edge"));
    }

    #[test]
    fn vote_action_links_person_and_event() {
        let graph = MemoryGraph::new();
        let event_id = ids::vote_event_id("2270800-43");
        let person_id = ids::person_id(1);
        let action = VoteAction {
            id: ids::vote_action_id(&event_id, &person_id),
            vote_event_id: event_id.clone(),
            person_id: person_id.clone(),
            position: Some("Sim".to_owned()),
            party_orientation: None,
        };
        graph.upsert_vote_action(&action).expect("upsert");
        assert!(graph.edge_exists(EDGE_CAST, &person_id, &action.id).expect("edge"));
        assert!(graph
            .edge_exists(EDGE_IN_EVENT, &action.id, &event_id)
            .expect("edge"));
    }

    #[test]
    fn unchecked_insert_permits_duplicate_ids() {
        let graph = MemoryGraph::new();
        graph.insert_unchecked(LABEL_BILL, "camara:bill:1", json!({"id": "camara:bill:1"}));
        graph.insert_unchecked(LABEL_BILL, "camara:bill:1", json!({"id": "camara:bill:1"}));
        assert_eq!(graph.count(LABEL_BILL).expect("count"), 2);
    }
}
