pub mod types {
    pub use legisarc_protocol::types::*;
}

pub mod endpoints {
    pub use legisarc_protocol::endpoints::*;
}

pub mod error {
    pub use legisarc_protocol::error::*;
}

pub mod ids {
    pub use legisarc_protocol::ids::*;
}

pub mod proof {
    pub use legisarc_proof::*;
}

pub mod fetch {
    pub use legisarc_fetch_client::*;
}

pub mod archive {
    pub use legisarc_archive_core::*;
}

pub mod graph {
    pub use legisarc_graph_writer::*;
}

pub mod jobs {
    pub use legisarc_ingest_jobs::*;
}

pub mod reconcile {
    pub use legisarc_reconcile::*;
}

#[path = "../../cli/cli.rs"]
pub mod cli;
