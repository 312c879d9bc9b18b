//! STEP exchange through truck-stepio
//!
//! Output is exact B-rep. Input shells keep the reader's own curve and
//! surface types, so they are only ever meshed, never modeled with.

use std::sync::Arc;

use truck_meshalgo::prelude::*;
use truck_modeling::Solid;
use truck_stepio::out::{CompleteStepDisplay, StepHeaderDescriptor, StepModel};
use truck_stepio::r#in::Table;
use truck_topology::compress::CompressedSolid;

use super::mesh::{self, MeshedShell};
use crate::kernel::{ReadStatus, Triangulation};

/// Meshes an imported shell at a given tolerance
pub(crate) type Mesher = Arc<dyn Fn(f64) -> Triangulation + Send + Sync>;

pub(crate) struct StepRoot {
    pub faces: usize,
    pub mesher: Mesher,
}

pub(crate) struct StepContents {
    pub status: ReadStatus,
    pub roots: Vec<StepRoot>,
    pub messages: Vec<String>,
}

/// Parse Part 21 text; every shell becomes one root
pub(crate) fn read(text: &str) -> StepContents {
    let Some(table) = Table::from_step(text) else {
        return StepContents {
            status: ReadStatus::Error,
            roots: Vec::new(),
            messages: vec!["not a STEP file or unsupported schema".into()],
        };
    };

    let mut holders: Vec<_> = table.shell.iter().collect();
    holders.sort_by_key(|(id, _)| **id);

    let mut roots = Vec::with_capacity(holders.len());
    let mut messages = Vec::new();
    for (id, holder) in holders {
        match table.to_compressed_shell(holder) {
            Ok(shell) => {
                let faces = shell.faces.len();
                let mesher: Mesher = Arc::new(move |tolerance| {
                    let meshed: MeshedShell = shell.robust_triangulation(tolerance);
                    let mut out = Triangulation::default();
                    mesh::collect(&meshed, &mut out);
                    out
                });
                roots.push(StepRoot { faces, mesher });
            }
            Err(_) => messages.push(format!("shell #{id} has unsupported geometry")),
        }
    }

    StepContents {
        status: ReadStatus::Done,
        roots,
        messages,
    }
}

/// All shells of all solids in one model
pub(crate) fn write(solids: &[Solid]) -> String {
    let boundaries = solids
        .iter()
        .flat_map(|solid| solid.compress().boundaries)
        .collect();
    let compressed = CompressedSolid { boundaries };
    CompleteStepDisplay::new(StepModel::from(&compressed), StepHeaderDescriptor::default())
        .to_string()
}
