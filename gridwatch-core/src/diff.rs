//! Baseline/diff engine: turns two snapshots into classified change records.
//!
//! Classification follows one rule table. External-reference evidence comes
//! from the snapshot's resolved placeholder table, never from matching path
//! text inside the formula; substring heuristics both over- and under-match
//! arbitrary formula syntax.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::snapshot::{CellContent, Snapshot};

/// How a cell difference is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Plain value edit: no formula on either side, values differ.
    DirectValueChange,
    /// The formula text itself changed.
    FormulaChange,
    /// Formula unchanged, value moved, and the formula cites a resolved
    /// external workbook: the linked file was updated.
    ExternalRefUpdate,
    /// Formula unchanged, value moved, no external evidence: recalculation
    /// fallout rather than an intentional edit.
    IndirectChange,
    /// Cell added or removed.
    StructuralChange,
}

/// One classified difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sheet: String,
    pub cell: String,
    pub kind: ChangeKind,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub old_formula: Option<String>,
    pub new_formula: Option<String>,
    /// Resolved external workbook paths the cell's formula cites, when the
    /// classification is external-reference related.
    pub external_refs: Vec<String>,
}

/// Which change kinds are surfaced to the change log. Indirect changes are
/// suppressed by default (usually recalculation noise), but the noise/signal
/// boundary is a judgment call the operator may need to tune per workbook,
/// so every kind is a switch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffPolicy {
    pub track_direct_value_changes: bool,
    pub track_formula_changes: bool,
    pub track_external_ref_updates: bool,
    pub track_structural_changes: bool,
    pub surface_indirect_changes: bool,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            track_direct_value_changes: true,
            track_formula_changes: true,
            track_external_ref_updates: true,
            track_structural_changes: true,
            surface_indirect_changes: false,
        }
    }
}

impl DiffPolicy {
    fn surfaces(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::DirectValueChange => self.track_direct_value_changes,
            ChangeKind::FormulaChange => self.track_formula_changes,
            ChangeKind::ExternalRefUpdate => self.track_external_ref_updates,
            ChangeKind::StructuralChange => self.track_structural_changes,
            ChangeKind::IndirectChange => self.surface_indirect_changes,
        }
    }
}

/// Result of one diff cycle.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Records that passed the policy filter, in (sheet, cell) order.
    pub surfaced: Vec<ChangeRecord>,
    /// Differences observed but filtered by policy (still counted so
    /// operators can see drift volume).
    pub suppressed: usize,
    /// Last-modified-by author of the current snapshot, for attribution.
    pub author: Option<String>,
    /// Unconditionally the current snapshot: even suppressed drift advances
    /// the baseline so repeated polling never re-reports it.
    pub new_baseline: Snapshot,
}

#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    policy: DiffPolicy,
}

impl DiffEngine {
    pub fn new(policy: DiffPolicy) -> Self {
        Self { policy }
    }

    /// Compare `current` against the persisted baseline. With no baseline the
    /// current snapshot is adopted silently; first observation is not a
    /// change. Pure with respect to its inputs: the same pair always yields
    /// the same records and the same resulting baseline.
    pub fn evaluate(&self, current: &Snapshot, baseline: Option<&Snapshot>) -> Evaluation {
        let Some(baseline) = baseline else {
            return Evaluation {
                surfaced: Vec::new(),
                suppressed: 0,
                author: current.last_author.clone(),
                new_baseline: current.clone(),
            };
        };

        let mut surfaced = Vec::new();
        let mut suppressed = 0;

        let sheet_names: std::collections::BTreeSet<&String> = baseline
            .sheets
            .keys()
            .chain(current.sheets.keys())
            .collect();

        for sheet in sheet_names {
            let old_cells = baseline.sheets.get(sheet);
            let new_cells = current.sheets.get(sheet);

            let addresses: std::collections::BTreeSet<&String> = old_cells
                .map(|cells| cells.keys().collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter()
                .chain(
                    new_cells
                        .map(|cells| cells.keys().collect::<Vec<_>>())
                        .unwrap_or_default(),
                )
                .collect();

            for address in addresses {
                let old = old_cells.and_then(|cells| cells.get(address));
                let new = new_cells.and_then(|cells| cells.get(address));
                let Some(kind) = classify(old, new, current) else {
                    continue;
                };

                if !self.policy.surfaces(kind) {
                    suppressed += 1;
                    continue;
                }

                let formula = new.or(old).and_then(|cell| cell.formula.as_deref());
                let external_refs = match kind {
                    ChangeKind::ExternalRefUpdate => formula
                        .map(|f| resolved_refs(f, current))
                        .unwrap_or_default(),
                    _ => Vec::new(),
                };

                surfaced.push(ChangeRecord {
                    sheet: sheet.clone(),
                    cell: address.clone(),
                    kind,
                    old_value: old.and_then(|cell| cell.value.clone()),
                    new_value: new.and_then(|cell| cell.value.clone()),
                    old_formula: old.and_then(|cell| cell.formula.clone()),
                    new_formula: new.and_then(|cell| cell.formula.clone()),
                    external_refs,
                });
            }
        }

        Evaluation {
            surfaced,
            suppressed,
            author: current.last_author.clone(),
            new_baseline: current.clone(),
        }
    }
}

fn classify(
    old: Option<&CellContent>,
    new: Option<&CellContent>,
    current: &Snapshot,
) -> Option<ChangeKind> {
    match (old, new) {
        (None, None) => None,
        (None, Some(_)) | (Some(_), None) => Some(ChangeKind::StructuralChange),
        (Some(old), Some(new)) => {
            if old == new {
                return None;
            }
            if old.formula != new.formula {
                return Some(ChangeKind::FormulaChange);
            }
            if old.value == new.value {
                // Only the array-formula flag moved; treat as formula-level.
                return Some(ChangeKind::FormulaChange);
            }
            match new.formula.as_deref() {
                None => Some(ChangeKind::DirectValueChange),
                Some(formula) => {
                    if has_external_evidence(formula, current) {
                        Some(ChangeKind::ExternalRefUpdate)
                    } else {
                        Some(ChangeKind::IndirectChange)
                    }
                }
            }
        }
    }
}

/// `[n]Sheet!` placeholders cited by cross-workbook formulas.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\][A-Za-z0-9_]+!").unwrap());

fn placeholder_indices(formula: &str) -> impl Iterator<Item = u32> + '_ {
    PLACEHOLDER
        .captures_iter(formula)
        .filter_map(|caps| caps[1].parse().ok())
}

fn has_external_evidence(formula: &str, snapshot: &Snapshot) -> bool {
    placeholder_indices(formula).any(|index| {
        snapshot
            .external_refs
            .get(&index)
            .is_some_and(|path| !path.is_empty())
    })
}

fn resolved_refs(formula: &str, snapshot: &Snapshot) -> Vec<String> {
    let mut refs: Vec<String> = placeholder_indices(formula)
        .filter_map(|index| snapshot.external_refs.get(&index))
        .filter(|path| !path.is_empty())
        .cloned()
        .collect();
    refs.dedup();
    refs
}
