//! Transparent face ordering.
//!
//! Reproduces a legacy painter's-algorithm order: faces are bucketed by
//! depth and, when the model carries render priorities, interleaved across
//! twelve discrete priority classes.
//!
//! # Invariants
//! - Within one depth bucket, faces keep their input order.
//! - Output is far to near; depths are clamped into `[0, MAX_DIAMETER)`.
//! - A static alpha model is sorted by at most one thread per frame.

mod alpha;
mod faces;
mod sorter;

pub use alpha::{AlphaModel, AlphaPlacement, SortedFaces, TileSpan};
pub use faces::{FLAT_FACE, HIDDEN_FACE, ModelFaces, pack_face, unpack_face};
pub use sorter::{FacePrioritySorter, MAX_DIAMETER, PRIORITY_CLASSES};

pub fn crate_info() -> &'static str {
    "zonestream-sort v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("sort"));
    }
}
