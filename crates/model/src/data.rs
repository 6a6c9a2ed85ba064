use glam::Vec3;
use serde::{Deserialize, Serialize};
use zonestream_common::Tint;

use crate::renderable::{ArrayRef, Renderable};

/// Owned geometry, the in-memory form of a renderable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelData {
    pub id: u64,
    pub radius: i32,
    pub model_height: i32,
    pub tint: Tint,
    pub vertices_x: Vec<f32>,
    pub vertices_y: Vec<f32>,
    pub vertices_z: Vec<f32>,
    pub indices_a: Vec<u32>,
    pub indices_b: Vec<u32>,
    pub indices_c: Vec<u32>,
    pub colors_a: Vec<i32>,
    pub colors_b: Vec<i32>,
    pub colors_c: Vec<i32>,
    pub transparencies: Option<Vec<u8>>,
    pub textures: Option<Vec<i16>>,
    pub priorities: Option<Vec<u8>>,
    pub normals_x: Option<Vec<i32>>,
    pub normals_y: Option<Vec<i32>>,
    pub normals_z: Option<Vec<i32>>,
}

impl ModelData {
    /// An axis-aligned box centred on the origin in x/z, resting on y = 0
    /// and extending to y = -height. Twelve flat-shaded faces.
    pub fn cuboid(id: u64, half_extent: f32, height: f32, color: i32, transparency: u8) -> Self {
        let mut model = ModelData {
            id,
            ..ModelData::default()
        };
        for corner in 0..8 {
            let x = if corner & 1 == 0 { -half_extent } else { half_extent };
            let y = if corner & 2 == 0 { 0.0 } else { -height };
            let z = if corner & 4 == 0 { -half_extent } else { half_extent };
            model.push_vertex(Vec3::new(x, y, z));
        }
        const FACES: [[u32; 3]; 12] = [
            [0, 1, 5], [0, 5, 4], // bottom
            [2, 6, 7], [2, 7, 3], // top
            [0, 2, 3], [0, 3, 1], // -z
            [4, 5, 7], [4, 7, 6], // +z
            [0, 4, 6], [0, 6, 2], // -x
            [1, 3, 7], [1, 7, 5], // +x
        ];
        for [a, b, c] in FACES {
            model.push_face([a, b, c], [color, 0, -1]);
        }
        if transparency != 0 {
            model.transparencies = Some(vec![transparency; FACES.len()]);
        }
        model.compute_bounds();
        model
    }

    pub fn push_vertex(&mut self, position: Vec3) -> u32 {
        self.vertices_x.push(position.x);
        self.vertices_y.push(position.y);
        self.vertices_z.push(position.z);
        (self.vertices_x.len() - 1) as u32
    }

    pub fn push_face(&mut self, indices: [u32; 3], colors: [i32; 3]) -> usize {
        self.indices_a.push(indices[0]);
        self.indices_b.push(indices[1]);
        self.indices_c.push(indices[2]);
        self.colors_a.push(colors[0]);
        self.colors_b.push(colors[1]);
        self.colors_c.push(colors[2]);
        self.indices_a.len() - 1
    }

    pub fn with_priorities(mut self, priorities: Vec<u8>) -> Self {
        self.priorities = Some(priorities);
        self
    }

    pub fn with_tint(mut self, tint: Tint) -> Self {
        self.tint = tint;
        self
    }

    /// Recompute `radius` (horizontal) and `model_height` from the vertices.
    pub fn compute_bounds(&mut self) {
        let mut radius_sq = 0.0f32;
        let mut height = 0.0f32;
        for i in 0..self.vertices_x.len() {
            let (x, y, z) = (self.vertices_x[i], self.vertices_y[i], self.vertices_z[i]);
            radius_sq = radius_sq.max(x * x + z * z);
            height = height.max(-y);
        }
        self.radius = radius_sq.sqrt().ceil() as i32;
        self.model_height = height.ceil() as i32;
    }
}

fn optional<T>(values: &Option<Vec<T>>) -> Option<ArrayRef<'_, T>> {
    values.as_deref().map(ArrayRef::Borrowed)
}

impl Renderable for ModelData {
    fn id(&self) -> u64 {
        self.id
    }

    fn vertex_count(&self) -> usize {
        self.vertices_x.len()
    }

    fn face_count(&self) -> usize {
        self.indices_a.len()
    }

    fn radius(&self) -> i32 {
        self.radius
    }

    fn model_height(&self) -> i32 {
        self.model_height
    }

    fn tint(&self) -> Tint {
        self.tint
    }

    fn vertices_x(&self) -> ArrayRef<'_, f32> {
        ArrayRef::Borrowed(&self.vertices_x)
    }

    fn vertices_y(&self) -> ArrayRef<'_, f32> {
        ArrayRef::Borrowed(&self.vertices_y)
    }

    fn vertices_z(&self) -> ArrayRef<'_, f32> {
        ArrayRef::Borrowed(&self.vertices_z)
    }

    fn face_indices_a(&self) -> ArrayRef<'_, u32> {
        ArrayRef::Borrowed(&self.indices_a)
    }

    fn face_indices_b(&self) -> ArrayRef<'_, u32> {
        ArrayRef::Borrowed(&self.indices_b)
    }

    fn face_indices_c(&self) -> ArrayRef<'_, u32> {
        ArrayRef::Borrowed(&self.indices_c)
    }

    fn face_colors_a(&self) -> ArrayRef<'_, i32> {
        ArrayRef::Borrowed(&self.colors_a)
    }

    fn face_colors_b(&self) -> ArrayRef<'_, i32> {
        ArrayRef::Borrowed(&self.colors_b)
    }

    fn face_colors_c(&self) -> ArrayRef<'_, i32> {
        ArrayRef::Borrowed(&self.colors_c)
    }

    fn face_transparencies(&self) -> Option<ArrayRef<'_, u8>> {
        optional(&self.transparencies)
    }

    fn face_textures(&self) -> Option<ArrayRef<'_, i16>> {
        optional(&self.textures)
    }

    fn face_priorities(&self) -> Option<ArrayRef<'_, u8>> {
        optional(&self.priorities)
    }

    fn vertex_normals_x(&self) -> Option<ArrayRef<'_, i32>> {
        optional(&self.normals_x)
    }

    fn vertex_normals_y(&self) -> Option<ArrayRef<'_, i32>> {
        optional(&self.normals_y)
    }

    fn vertex_normals_z(&self) -> Option<ArrayRef<'_, i32>> {
        optional(&self.normals_z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuboid_shape() {
        let model = ModelData::cuboid(7, 64.0, 100.0, 0x2233, 0);
        assert_eq!(model.vertex_count(), 8);
        assert_eq!(model.face_count(), 12);
        assert_eq!(model.radius, 91);
        assert_eq!(model.model_height, 100);
        assert!(model.face_transparencies().is_none());
        assert!(model.face_colors_c().iter().all(|&c| c == -1));
    }

    #[test]
    fn transparent_cuboid_marks_every_face() {
        let model = ModelData::cuboid(1, 10.0, 10.0, 5, 100);
        let alpha = model.face_transparencies().unwrap();
        assert_eq!(alpha.len(), 12);
        assert!(alpha.iter().all(|&a| a == 100));
    }

    #[test]
    fn deserializes_sparse_json() {
        let model: ModelData = serde_json::from_str(
            r#"{ "id": 3, "vertices_x": [0, 1, 0], "vertices_y": [0, 0, 0], "vertices_z": [0, 0, 1],
                 "indices_a": [0], "indices_b": [1], "indices_c": [2],
                 "colors_a": [10], "colors_b": [0], "colors_c": [-1] }"#,
        )
        .unwrap();
        assert_eq!(model.face_count(), 1);
        assert_eq!(model.tint, Tint::NONE);
        assert!(model.face_priorities().is_none());
    }
}
