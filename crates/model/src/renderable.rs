use std::ops::Deref;

use parking_lot::MappedRwLockReadGuard;
use zonestream_common::Tint;
use zonestream_sort::ModelFaces;

/// A borrowed geometry array, either a plain slice or a slice behind a
/// read guard of a snapshot field.
pub enum ArrayRef<'a, T> {
    Borrowed(&'a [T]),
    Guarded(MappedRwLockReadGuard<'a, [T]>),
}

impl<T> Deref for ArrayRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            ArrayRef::Borrowed(slice) => slice,
            ArrayRef::Guarded(guard) => guard,
        }
    }
}

impl<'a, T> From<&'a [T]> for ArrayRef<'a, T> {
    fn from(slice: &'a [T]) -> Self {
        ArrayRef::Borrowed(slice)
    }
}

/// Geometry consumed read-only by baking, snapshotting and sorting.
///
/// Vertex arrays have `vertex_count` entries and face arrays `face_count`.
/// A `colors_c` entry of `-2` hides a face; `-1` marks it flat shaded.
pub trait Renderable: Send + Sync {
    /// Stable identity, used to look up display overrides.
    fn id(&self) -> u64;
    fn vertex_count(&self) -> usize;
    fn face_count(&self) -> usize;
    fn radius(&self) -> i32;
    fn model_height(&self) -> i32;

    /// Recolour baked into this instance.
    fn tint(&self) -> Tint {
        Tint::NONE
    }

    fn vertices_x(&self) -> ArrayRef<'_, f32>;
    fn vertices_y(&self) -> ArrayRef<'_, f32>;
    fn vertices_z(&self) -> ArrayRef<'_, f32>;

    fn face_indices_a(&self) -> ArrayRef<'_, u32>;
    fn face_indices_b(&self) -> ArrayRef<'_, u32>;
    fn face_indices_c(&self) -> ArrayRef<'_, u32>;

    fn face_colors_a(&self) -> ArrayRef<'_, i32>;
    fn face_colors_b(&self) -> ArrayRef<'_, i32>;
    fn face_colors_c(&self) -> ArrayRef<'_, i32>;

    fn face_transparencies(&self) -> Option<ArrayRef<'_, u8>>;
    /// Texture id per face, `-1` for untextured.
    fn face_textures(&self) -> Option<ArrayRef<'_, i16>>;
    fn face_priorities(&self) -> Option<ArrayRef<'_, u8>>;

    fn vertex_normals_x(&self) -> Option<ArrayRef<'_, i32>>;
    fn vertex_normals_y(&self) -> Option<ArrayRef<'_, i32>>;
    fn vertex_normals_z(&self) -> Option<ArrayRef<'_, i32>>;
}

/// Borrow the arrays the sorter needs and hand them to `f` as [`ModelFaces`].
pub fn with_model_faces<R>(renderable: &dyn Renderable, f: impl FnOnce(&ModelFaces<'_>) -> R) -> R {
    let (xs, ys, zs) = (
        renderable.vertices_x(),
        renderable.vertices_y(),
        renderable.vertices_z(),
    );
    let (a, b, c) = (
        renderable.face_indices_a(),
        renderable.face_indices_b(),
        renderable.face_indices_c(),
    );
    let colors_c = renderable.face_colors_c();
    let transparencies = renderable.face_transparencies();
    let priorities = renderable.face_priorities();
    let faces = ModelFaces {
        vertices_x: &xs,
        vertices_y: &ys,
        vertices_z: &zs,
        indices_a: &a,
        indices_b: &b,
        indices_c: &c,
        colors_c: &colors_c,
        transparencies: transparencies.as_deref(),
        priorities: priorities.as_deref(),
        radius: renderable.radius(),
    };
    f(&faces)
}
