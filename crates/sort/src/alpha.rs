use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use glam::IVec3;
use parking_lot::{Mutex, MutexGuard};
use zonestream_common::CameraAngles;

use crate::faces::{ModelFaces, pack_face, unpack_face};
use crate::sorter::FacePrioritySorter;

const UNCLAIMED: u8 = 0;
const CLAIMED: u8 = 1;
const COMPLETED: u8 = 2;

/// Tile range a model spans, in tiles relative to its zone's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub lx: i8,
    pub lz: i8,
    pub ux: i8,
    pub uz: i8,
}

impl TileSpan {
    /// Whether the span reaches outside the 8×8 tiles of its own zone.
    pub fn crosses_zones(&self) -> bool {
        (self.lx >> 3) != (self.ux >> 3) || (self.lz >> 3) != (self.uz >> 3)
    }
}

/// Where an alpha model sits and where its vertices start in the zone's
/// alpha buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaPlacement {
    pub id: i32,
    /// Zone-local position in scene units.
    pub position: IVec3,
    pub level: u8,
    pub roof_id: i32,
    pub span: Option<TileSpan>,
    pub start_vertex: u32,
}

impl AlphaPlacement {
    pub fn at(position: IVec3) -> Self {
        Self {
            id: -1,
            position,
            level: 0,
            roof_id: 0,
            span: None,
            start_vertex: 0,
        }
    }
}

/// Sorted vertex indices of one static alpha model, shared between the
/// model, its temporary copies and the sort job.
///
/// The claim word goes unclaimed → claimed → completed once per frame.
#[derive(Debug, Default)]
pub struct SortedFaces {
    indices: Mutex<Vec<u32>>,
    state: AtomicU8,
}

impl SortedFaces {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: Mutex::new(Vec::with_capacity(capacity)),
            state: AtomicU8::new(UNCLAIMED),
        }
    }

    /// Take the right to sort this frame. Only one caller wins.
    pub fn claim(&self) -> bool {
        self.state
            .compare_exchange(UNCLAIMED, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn complete(&self) {
        self.state.store(COMPLETED, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    pub fn reset(&self) {
        self.state.store(UNCLAIMED, Ordering::Release);
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u32>> {
        self.indices.lock()
    }
}

/// A transparent sub-object of a zone.
#[derive(Debug, Clone)]
pub struct AlphaModel {
    pub id: i32,
    pub position: IVec3,
    pub level: u8,
    pub roof_id: i32,
    pub span: Option<TileSpan>,
    /// For temporary copies, the zone drawing it minus the source zone.
    pub zone_offset: (i8, i8),
    pub start_vertex: u32,
    pub vertex_count: u32,
    pub radius: i32,
    flags: u8,
    packed_faces: Option<Arc<[i32]>>,
    priorities: Option<Arc<[u8]>>,
    sorted: Option<Arc<SortedFaces>>,
}

impl AlphaModel {
    /// Drawn from a closer zone this frame.
    pub const SKIP: u8 = 1;
    /// Temporary copy placed in a closer zone.
    pub const TEMP: u8 = 2;
    pub const SORT_COMPLETED: u8 = 4;

    /// Collect the transparent faces of a model. Returns `None` when the
    /// model has none.
    ///
    /// Face centroids are re-centred on the model and shifted right until
    /// every component fits the packed layout.
    pub fn build(
        faces: &ModelFaces<'_>,
        placement: AlphaPlacement,
        force_transparency: bool,
    ) -> Option<Self> {
        let face_count = faces.face_count();
        let mut min = IVec3::splat(i32::MAX);
        let mut max = IVec3::splat(i32::MIN);
        let mut alpha_faces = 0usize;
        for face in 0..face_count {
            if !faces.is_alpha(face, force_transparency) {
                continue;
            }
            let sum = IVec3::from_array(faces.corner_sum(face));
            min = min.min(sum);
            max = max.max(sum);
            alpha_faces += 1;
        }
        if alpha_faces == 0 {
            return None;
        }

        let center = (min + max) / 6;
        let extent = |lo: i32, hi: i32, c: i32| (hi / 3 - c).max(lo / -3 - c);
        let size = extent(min.x, max.x, center.x)
            .max(extent(min.y, max.y, center.y) * 2)
            .max(extent(min.z, max.z, center.z));
        let mut shift: i32 = 0;
        let mut v = size >> 10;
        while v > 0 {
            shift += 1;
            v >>= 1;
        }

        let mut packed = Vec::with_capacity(alpha_faces);
        let mut priorities = faces.priorities.map(|_| Vec::with_capacity(alpha_faces));
        for face in 0..face_count {
            if !faces.is_alpha(face, force_transparency) {
                continue;
            }
            let c = (IVec3::from_array(faces.corner_sum(face)) / 3 - center) >> shift;
            packed.push(pack_face(c.x, c.y, c.z));
            if let (Some(out), Some(source)) = (priorities.as_mut(), faces.priorities) {
                out.push(source.get(face).copied().unwrap_or(0));
            }
        }

        tracing::trace!(id = placement.id, faces = alpha_faces, shift, "alpha model built");
        Some(Self::from_packed(placement, packed, priorities))
    }

    /// An alpha model over already packed faces. The radius is derived from
    /// the packed positions.
    pub fn from_packed(placement: AlphaPlacement, packed: Vec<i32>, priorities: Option<Vec<u8>>) -> Self {
        let max_sq = packed
            .iter()
            .map(|&p| {
                let (x, y, z) = unpack_face(p);
                x * x + y * y + z * z
            })
            .max()
            .unwrap_or(0);
        let face_count = packed.len();
        Self {
            id: placement.id,
            position: placement.position,
            level: placement.level,
            roof_id: placement.roof_id,
            span: placement.span,
            zone_offset: (0, 0),
            start_vertex: placement.start_vertex,
            vertex_count: (face_count * 3) as u32,
            radius: 2 + (max_sq as f64).sqrt() as i32,
            flags: 0,
            packed_faces: Some(packed.into()),
            priorities: priorities.map(Into::into),
            sorted: Some(Arc::new(SortedFaces::with_capacity(face_count * 3))),
        }
    }

    /// Geometry written already sorted, such as a dynamic object's alpha
    /// faces. Drawn as a plain range and never re-sorted.
    pub fn presorted(placement: AlphaPlacement, vertex_count: u32) -> Self {
        Self {
            id: placement.id,
            position: placement.position,
            level: placement.level,
            roof_id: placement.roof_id,
            span: None,
            zone_offset: (0, 0),
            start_vertex: placement.start_vertex,
            vertex_count,
            radius: 0,
            flags: 0,
            packed_faces: None,
            priorities: None,
            sorted: None,
        }
    }

    /// A copy to be drawn from another zone. Shares packed and sorted faces.
    pub fn temp_copy(&self, zone_offset: (i8, i8)) -> Self {
        Self {
            zone_offset,
            flags: Self::TEMP,
            ..self.clone()
        }
    }

    pub fn flags(&self) -> u8 {
        if self.is_sorted() {
            self.flags | Self::SORT_COMPLETED
        } else {
            self.flags
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.flags & Self::SKIP != 0
    }

    pub fn mark_skipped(&mut self) {
        self.flags |= Self::SKIP;
    }

    /// Temporary copies and presorted geometry are removed after each frame.
    pub fn is_temp(&self) -> bool {
        self.packed_faces.is_none() || self.flags & Self::TEMP != 0
    }

    pub fn needs_sort(&self) -> bool {
        !self.is_skipped() && !self.is_temp() && self.sorted.is_some()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted.as_ref().is_some_and(|s| s.is_completed())
    }

    /// Sort this model if nobody has claimed it this frame.
    pub fn try_sort(&self, sorter: &mut FacePrioritySorter, angles: CameraAngles) -> bool {
        let Some(sorted) = &self.sorted else {
            return false;
        };
        if !sorted.claim() {
            return false;
        }
        sorter.sort_static_faces_by_distance(self, angles);
        sorted.complete();
        true
    }

    /// Clear per-frame state: skip flag and sort claim.
    pub fn reset_frame_state(&mut self) {
        self.flags &= !(Self::SKIP | Self::SORT_COMPLETED);
        if let Some(sorted) = &self.sorted {
            sorted.reset();
        }
    }

    pub fn face_count(&self) -> usize {
        (self.vertex_count / 3) as usize
    }

    pub fn packed_faces(&self) -> Option<&[i32]> {
        self.packed_faces.as_deref()
    }

    pub fn priorities(&self) -> Option<&[u8]> {
        self.priorities.as_deref()
    }

    pub fn sorted_faces(&self) -> Option<&SortedFaces> {
        self.sorted.as_deref()
    }

    pub fn shares_sorted_faces(&self, other: &AlphaModel) -> bool {
        match (&self.sorted, &other.sorted) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Snapshot of the sorted indices.
    pub fn sorted_indices(&self) -> Vec<u32> {
        self.sorted.as_ref().map(|s| s.lock().clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mesh {
        xs: Vec<f32>,
        ys: Vec<f32>,
        zs: Vec<f32>,
        a: Vec<u32>,
        b: Vec<u32>,
        c: Vec<u32>,
        colors: Vec<i32>,
        alpha: Vec<u8>,
        priorities: Vec<u8>,
    }

    impl Mesh {
        /// One small triangle per centre, every other face transparent.
        fn new(centers: &[[f32; 3]]) -> Self {
            let mut mesh = Mesh {
                xs: Vec::new(),
                ys: Vec::new(),
                zs: Vec::new(),
                a: Vec::new(),
                b: Vec::new(),
                c: Vec::new(),
                colors: Vec::new(),
                alpha: Vec::new(),
                priorities: Vec::new(),
            };
            for (i, [x, y, z]) in centers.iter().copied().enumerate() {
                let base = mesh.xs.len() as u32;
                for (dx, dz) in [(-1.0, -1.0), (2.0, -1.0), (-1.0, 2.0)] {
                    mesh.xs.push(x + dx);
                    mesh.ys.push(y);
                    mesh.zs.push(z + dz);
                }
                mesh.a.push(base);
                mesh.b.push(base + 1);
                mesh.c.push(base + 2);
                mesh.colors.push(0x1234);
                mesh.alpha.push(if i % 2 == 0 { 128 } else { 0 });
                mesh.priorities.push(i as u8);
            }
            mesh
        }

        fn faces(&self) -> ModelFaces<'_> {
            ModelFaces {
                vertices_x: &self.xs,
                vertices_y: &self.ys,
                vertices_z: &self.zs,
                indices_a: &self.a,
                indices_b: &self.b,
                indices_c: &self.c,
                colors_c: &self.colors,
                transparencies: Some(&self.alpha),
                priorities: Some(&self.priorities),
                radius: 0,
            }
        }
    }

    #[test]
    fn build_keeps_only_alpha_faces() {
        let mesh = Mesh::new(&[[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [20.0, 0.0, 0.0]]);
        let model = AlphaModel::build(&mesh.faces(), AlphaPlacement::at(IVec3::ZERO), false).unwrap();
        assert_eq!(model.packed_faces().unwrap().len(), 2);
        assert_eq!(model.vertex_count, 6);
        assert_eq!(model.priorities(), Some(&[0u8, 2][..]));
        // Centres at x = 0 and 20 around a centroid of 10.
        assert_eq!(unpack_face(model.packed_faces().unwrap()[0]).0, -10);
        assert_eq!(model.radius, 12);
    }

    #[test]
    fn forced_transparency_takes_every_visible_face() {
        let mut mesh = Mesh::new(&[[0.0, 0.0, 0.0], [10.0, 0.0, 0.0]]);
        mesh.colors[0] = crate::faces::HIDDEN_FACE;
        let model = AlphaModel::build(&mesh.faces(), AlphaPlacement::at(IVec3::ZERO), true).unwrap();
        assert_eq!(model.face_count(), 1);
    }

    #[test]
    fn opaque_models_have_no_alpha_model() {
        let mut mesh = Mesh::new(&[[0.0, 0.0, 0.0]]);
        mesh.alpha[0] = 0;
        assert!(AlphaModel::build(&mesh.faces(), AlphaPlacement::at(IVec3::ZERO), false).is_none());
    }

    #[test]
    fn wide_models_are_quantised_to_fit() {
        let mesh = Mesh::new(&[[-4000.0, 0.0, 0.0], [0.0, 0.0, 0.0], [4000.0, 0.0, 0.0]]);
        let model = AlphaModel::build(&mesh.faces(), AlphaPlacement::at(IVec3::ZERO), false).unwrap();
        for &p in model.packed_faces().unwrap() {
            let (x, _, _) = unpack_face(p);
            assert!((-1024..1024).contains(&x));
        }
        assert!(model.radius < 1100);
    }

    #[test]
    fn only_one_claimant_sorts() {
        let mesh = Mesh::new(&[[0.0, 0.0, 0.0], [5.0, 0.0, 5.0], [9.0, 0.0, 1.0]]);
        let model = AlphaModel::build(&mesh.faces(), AlphaPlacement::at(IVec3::ZERO), true).unwrap();
        let mut sorter = FacePrioritySorter::new();
        let angles = CameraAngles::new(0, 128);
        assert!(model.try_sort(&mut sorter, angles));
        assert!(!model.try_sort(&mut sorter, angles));
        assert!(model.is_sorted());
        assert_ne!(model.flags() & AlphaModel::SORT_COMPLETED, 0);
        assert_eq!(model.sorted_indices().len(), 9);

        let mut model = model;
        model.reset_frame_state();
        assert!(!model.is_sorted());
        assert!(model.try_sort(&mut sorter, angles));
    }

    #[test]
    fn temp_copies_share_sorted_output() {
        let mesh = Mesh::new(&[[0.0, 0.0, 0.0]]);
        let mut model = AlphaModel::build(&mesh.faces(), AlphaPlacement::at(IVec3::ZERO), false).unwrap();
        let copy = model.temp_copy((1, 0));
        model.mark_skipped();
        assert!(copy.is_temp());
        assert!(!model.is_temp());
        assert!(copy.shares_sorted_faces(&model));
        assert!(model.is_skipped() && !model.needs_sort());
        model.reset_frame_state();
        assert!(!model.is_skipped());
    }

    #[test]
    fn presorted_models_are_temporary() {
        let model = AlphaModel::presorted(AlphaPlacement::at(IVec3::new(1, 2, 3)), 12);
        assert!(model.is_temp());
        assert!(!model.needs_sort());
        assert_eq!(model.face_count(), 4);
        let mut sorter = FacePrioritySorter::new();
        assert!(!model.try_sort(&mut sorter, CameraAngles::default()));
    }

    #[test]
    fn span_crossing() {
        let inside = TileSpan { lx: 1, lz: 1, ux: 6, uz: 7 };
        let across = TileSpan { lx: 6, lz: 1, ux: 9, uz: 2 };
        assert!(!inside.crosses_zones());
        assert!(across.crosses_zones());
    }
}
