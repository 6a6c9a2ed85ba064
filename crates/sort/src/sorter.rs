use zonestream_common::CameraAngles;

use crate::alpha::AlphaModel;
use crate::faces::{ModelFaces, unpack_face};

/// Depth buckets available to one sort; models at least this wide are not sorted.
pub const MAX_DIAMETER: usize = 6000;
/// Discrete render priority classes. Classes 10 and 11 interleave with the rest.
pub const PRIORITY_CLASSES: usize = 12;

const NONE: i32 = -1;

/// Reusable scratch for painter's-order sorting.
///
/// Buckets are intrusive singly linked lists (`head`, `tail`, `next`) so a
/// sort touches only the occupied depth range. A sorter is not shared
/// between threads; pool one per worker instead.
pub struct FacePrioritySorter {
    head: Vec<i32>,
    tail: Vec<i32>,
    next: Vec<i32>,
    depths: Vec<i32>,
    visible: Vec<u32>,
    classes: [Vec<u32>; PRIORITY_CLASSES],
    class_depth_sums: [i64; PRIORITY_CLASSES],
    dynamic_depths: [Vec<i32>; 2],
    output: Vec<u32>,
}

impl Default for FacePrioritySorter {
    fn default() -> Self {
        Self::new()
    }
}

impl FacePrioritySorter {
    pub fn new() -> Self {
        Self {
            head: vec![NONE; MAX_DIAMETER],
            tail: vec![NONE; MAX_DIAMETER],
            next: Vec::new(),
            depths: Vec::new(),
            visible: Vec::new(),
            classes: Default::default(),
            class_depth_sums: [0; PRIORITY_CLASSES],
            dynamic_depths: Default::default(),
            output: Vec::new(),
        }
    }

    /// Order `visible` far to near. `depths` and `priorities` are indexed by
    /// face id.
    pub fn sort_faces(
        &mut self,
        visible: &[u32],
        depths: &[i32],
        priorities: Option<&[u8]>,
    ) -> &[u32] {
        self.sort_into_output(visible, depths, priorities);
        &self.output
    }

    /// Per-face bucket depth of a model seen from `angles`: the rotated
    /// centroid depth offset by the model radius.
    pub fn compute_face_depths(&mut self, faces: &ModelFaces<'_>, angles: CameraAngles) -> &[i32] {
        let (yaw_sin, yaw_cos) = (angles.yaw_sin() as i64, angles.yaw_cos() as i64);
        let (pitch_sin, pitch_cos) = (angles.pitch_sin() as i64, angles.pitch_cos() as i64);
        let radius = faces.radius.max(0);
        let far = (2 * radius).min(MAX_DIAMETER as i32 - 1);

        self.depths.clear();
        for face in 0..faces.face_count() {
            let [x, y, z] = faces.centroid(face).map(i64::from);
            let t = (z * yaw_cos - x * yaw_sin) >> 16;
            let depth = ((y * pitch_sin + t * pitch_cos) >> 16) as i32 + radius;
            self.depths.push(depth.clamp(0, far));
        }
        &self.depths
    }

    /// Depth and priority sort of a model's visible faces.
    pub fn sort_model_faces(
        &mut self,
        visible: &[u32],
        faces: &ModelFaces<'_>,
        angles: CameraAngles,
    ) -> &[u32] {
        self.compute_face_depths(faces, angles);
        let depths = std::mem::take(&mut self.depths);
        self.sort_into_output(visible, &depths, faces.priorities);
        self.depths = depths;
        &self.output
    }

    /// Sort a static alpha model into its shared output as vertex index
    /// triples `start + 3*face + {0, 1, 2}`. Returns the number of indices.
    ///
    /// Models too wide for the bucket table are emitted in face order.
    pub fn sort_static_faces_by_distance(&mut self, model: &AlphaModel, angles: CameraAngles) -> usize {
        let (Some(packed), Some(sorted)) = (model.packed_faces(), model.sorted_faces()) else {
            return 0;
        };
        let start = model.start_vertex;
        let radius = model.radius;
        let diameter = 1 + 2 * radius;
        let mut out = sorted.lock();
        out.clear();

        if diameter as usize >= MAX_DIAMETER {
            for face in 0..packed.len() as u32 {
                let base = start + 3 * face;
                out.extend_from_slice(&[base, base + 1, base + 2]);
            }
            return out.len();
        }

        let (yaw_sin, yaw_cos) = (angles.yaw_sin(), angles.yaw_cos());
        let (pitch_sin, pitch_cos) = (angles.pitch_sin(), angles.pitch_cos());
        self.depths.clear();
        self.depths.extend(packed.iter().map(|&p| {
            let (x, y, z) = unpack_face(p);
            let t = (z * yaw_cos - x * yaw_sin) >> 16;
            let depth = ((y * pitch_sin + t * pitch_cos) >> 16) + radius;
            depth.clamp(0, diameter - 1)
        }));

        let depths = std::mem::take(&mut self.depths);
        let mut visible = std::mem::take(&mut self.visible);
        visible.clear();
        visible.extend(0..packed.len() as u32);
        self.sort_into_output(&visible, &depths, model.priorities());
        self.depths = depths;
        self.visible = visible;

        for &face in &self.output {
            let base = start + 3 * face;
            out.extend_from_slice(&[base, base + 1, base + 2]);
        }
        out.len()
    }

    fn sort_into_output(&mut self, visible: &[u32], depths: &[i32], priorities: Option<&[u8]>) {
        self.output.clear();
        if visible.is_empty() {
            return;
        }

        self.next.clear();
        self.next.resize(visible.len(), NONE);
        let mut min = MAX_DIAMETER - 1;
        let mut max = 0;
        for (slot, &face) in visible.iter().enumerate() {
            let depth = depths[face as usize].clamp(0, MAX_DIAMETER as i32 - 1) as usize;
            let slot = slot as i32;
            if self.head[depth] == NONE {
                self.head[depth] = slot;
            } else {
                self.next[self.tail[depth] as usize] = slot;
            }
            self.tail[depth] = slot;
            min = min.min(depth);
            max = max.max(depth);
        }

        match priorities {
            None => {
                let output = &mut self.output;
                walk_far_to_near(&self.head, &self.next, visible, min, max, |face, _| {
                    output.push(face);
                });
            }
            Some(priorities) => self.emit_by_priority(visible, priorities, min, max),
        }

        self.head[min..=max].fill(NONE);
        self.tail[min..=max].fill(NONE);
    }

    fn emit_by_priority(&mut self, visible: &[u32], priorities: &[u8], min: usize, max: usize) {
        let Self {
            head,
            next,
            classes,
            class_depth_sums,
            dynamic_depths,
            output,
            ..
        } = self;
        for class in classes.iter_mut() {
            class.clear();
        }
        for list in dynamic_depths.iter_mut() {
            list.clear();
        }
        *class_depth_sums = [0; PRIORITY_CLASSES];

        walk_far_to_near(head, next, visible, min, max, |face, depth| {
            let class = priorities
                .get(face as usize)
                .map_or(0, |&p| (p as usize).min(PRIORITY_CLASSES - 1));
            classes[class].push(face);
            if class < 10 {
                class_depth_sums[class] += depth as i64;
            } else {
                dynamic_depths[class - 10].push(depth as i32);
            }
        });

        let average = |a: usize, b: usize| -> i64 {
            let count = classes[a].len() + classes[b].len();
            if count == 0 {
                0
            } else {
                (class_depth_sums[a] + class_depth_sums[b]) / count as i64
            }
        };
        let avg12 = average(1, 2);
        let avg34 = average(3, 4);
        let avg68 = average(6, 8);

        // Classes 10 and 11 form one far-to-near stream consumed in that order.
        let (tens, elevens) = classes.split_at(11);
        let dynamic_faces = &tens[10];
        let elevens = &elevens[0];
        let dynamic_len = dynamic_faces.len() + elevens.len();
        let dynamic_at = |i: usize| -> (u32, i64) {
            if i < dynamic_faces.len() {
                (dynamic_faces[i], dynamic_depths[0][i] as i64)
            } else {
                let j = i - dynamic_faces.len();
                (elevens[j], dynamic_depths[1][j] as i64)
            }
        };

        let mut drawn = 0;
        for (class, faces) in tens.iter().take(10).enumerate() {
            let threshold = match class {
                0 => Some(avg12),
                3 => Some(avg34),
                5 => Some(avg68),
                _ => None,
            };
            if let Some(threshold) = threshold {
                while drawn < dynamic_len {
                    let (face, depth) = dynamic_at(drawn);
                    if depth <= threshold {
                        break;
                    }
                    output.push(face);
                    drawn += 1;
                }
            }
            output.extend_from_slice(faces);
        }
        while drawn < dynamic_len {
            output.push(dynamic_at(drawn).0);
            drawn += 1;
        }
    }
}

fn walk_far_to_near(
    head: &[i32],
    next: &[i32],
    visible: &[u32],
    min: usize,
    max: usize,
    mut f: impl FnMut(u32, usize),
) {
    for depth in (min..=max).rev() {
        let mut slot = head[depth];
        while slot != NONE {
            f(visible[slot as usize], depth);
            slot = next[slot as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpha::AlphaPlacement;
    use crate::faces::pack_face;
    use glam::IVec3;

    #[test]
    fn depth_order_without_priorities() {
        let mut sorter = FacePrioritySorter::new();
        let order = sorter.sort_faces(&[0, 1, 2, 3], &[5, 1, 9, 3], None);
        assert_eq!(order, &[2, 0, 3, 1]);
    }

    #[test]
    fn equal_depths_keep_input_order() {
        let mut sorter = FacePrioritySorter::new();
        let order = sorter.sort_faces(&[3, 1, 2, 0], &[7, 7, 7, 7], None);
        assert_eq!(order, &[3, 1, 2, 0]);
    }

    #[test]
    fn higher_priority_drawn_last() {
        let mut sorter = FacePrioritySorter::new();
        let order = sorter.sort_faces(&[0, 1], &[4, 4], Some(&[9, 0]));
        assert_eq!(order, &[1, 0]);
    }

    #[test]
    fn only_visible_faces_are_emitted() {
        let mut sorter = FacePrioritySorter::new();
        let order = sorter.sort_faces(&[1, 3], &[0, 2, 0, 8], None);
        assert_eq!(order, &[3, 1]);
    }

    #[test]
    fn scratch_is_reset_between_sorts() {
        let mut sorter = FacePrioritySorter::new();
        sorter.sort_faces(&[0, 1], &[100, 200], None);
        let order = sorter.sort_faces(&[0, 1], &[200, 100], None).to_vec();
        assert_eq!(order, vec![0, 1]);
        assert!(sorter.head.iter().all(|&h| h == NONE));
    }

    #[test]
    fn out_of_range_depths_are_clamped() {
        let mut sorter = FacePrioritySorter::new();
        let order = sorter.sort_faces(&[0, 1, 2], &[-50, 100_000, 10], None);
        assert_eq!(order, &[1, 2, 0]);
    }

    #[test]
    fn dynamic_faces_interleave_before_class_zero() {
        // Class 10 face at depth 50 is farther than the class 1/2 average (20),
        // so it is drawn before class 0.
        let mut sorter = FacePrioritySorter::new();
        let depths = [10, 20, 20, 50, 5];
        let priorities = [0, 1, 2, 10, 10];
        let order = sorter.sort_faces(&[0, 1, 2, 3, 4], &depths, Some(&priorities));
        assert_eq!(order, &[3, 0, 1, 2, 4]);
    }

    #[test]
    fn class_eleven_follows_class_ten() {
        let mut sorter = FacePrioritySorter::new();
        let depths = [30, 60, 90, 1];
        let priorities = [3, 11, 10, 0];
        // avg12 = 0 and avg34 = 30; both dynamic faces are deeper than avg12.
        let order = sorter.sort_faces(&[0, 1, 2, 3], &depths, Some(&priorities));
        assert_eq!(order, &[2, 1, 3, 0]);
    }

    #[test]
    fn dynamic_faces_wait_for_their_threshold() {
        let mut sorter = FacePrioritySorter::new();
        // avg12 = 100, avg34 = 40: the class 10 face at 60 waits until class 3.
        let depths = [100, 40, 60, 0];
        let priorities = [1, 3, 10, 0];
        let order = sorter.sort_faces(&[0, 1, 2, 3], &depths, Some(&priorities));
        assert_eq!(order, &[3, 0, 2, 1]);
    }

    #[test]
    fn model_depths_follow_yaw() {
        let xs = [0.0, 3.0, 0.0, 0.0, 3.0, 0.0];
        let ys = [0.0; 6];
        let zs = [30.0, 30.0, 33.0, -30.0, -30.0, -27.0];
        let a = [0u32, 3];
        let b = [1u32, 4];
        let c = [2u32, 5];
        let colors = [0, 0];
        let faces = ModelFaces {
            vertices_x: &xs,
            vertices_y: &ys,
            vertices_z: &zs,
            indices_a: &a,
            indices_b: &b,
            indices_c: &c,
            colors_c: &colors,
            transparencies: None,
            priorities: None,
            radius: 40,
        };
        let mut sorter = FacePrioritySorter::new();
        let facing = CameraAngles::new(0, 0);
        let depths = sorter.compute_face_depths(&faces, facing).to_vec();
        assert!(depths[0] > depths[1]);
        assert_eq!(sorter.sort_model_faces(&[0, 1], &faces, facing), &[0, 1]);

        let behind = CameraAngles::new(1024, 0);
        assert_eq!(sorter.sort_model_faces(&[0, 1], &faces, behind), &[1, 0]);
    }

    #[test]
    fn static_sort_emits_vertex_triples() {
        let packed = vec![pack_face(0, 0, -10), pack_face(0, 0, 10), pack_face(0, 0, 0)];
        let model = AlphaModel::from_packed(
            AlphaPlacement {
                start_vertex: 30,
                ..AlphaPlacement::at(IVec3::ZERO)
            },
            packed,
            None,
        );
        let mut sorter = FacePrioritySorter::new();
        let written = sorter.sort_static_faces_by_distance(&model, CameraAngles::new(0, 0));
        assert_eq!(written, 9);
        let sorted = model.sorted_indices();
        assert_eq!(sorted, vec![33, 34, 35, 36, 37, 38, 30, 31, 32]);
    }

    #[test]
    fn oversized_static_models_are_unsorted() {
        let packed = vec![pack_face(0, 0, 5), pack_face(0, 0, -5), pack_face(0, 0, 0)];
        let mut model = AlphaModel::from_packed(AlphaPlacement::at(IVec3::ZERO), packed, None);
        model.radius = 3000;
        let mut sorter = FacePrioritySorter::new();
        sorter.sort_static_faces_by_distance(&model, CameraAngles::new(512, 128));
        assert_eq!(model.sorted_indices(), (0..9).collect::<Vec<u32>>());
    }
}
