use glam::Vec3;
use zonestream_common::{CameraAngles, Tint, cos, sin};
use zonestream_render::{BufferKind, DrawRange, DrawWriter, GpuSink, PackedVertex, SinkError};
use zonestream_sort::{FLAT_FACE, FacePrioritySorter, HIDDEN_FACE};

use crate::renderable::{ArrayRef, Renderable, with_model_faces};

/// Face normals without vertex normals are scaled to this length.
const FACE_NORMAL_LENGTH: f32 = 256.0;

/// Where a renderable is drawn: a translation and a yaw in angle units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Placement {
    pub offset: Vec3,
    pub orientation: i32,
}

impl Placement {
    pub fn at(offset: Vec3) -> Self {
        Self {
            offset,
            orientation: 0,
        }
    }
}

/// Visible faces per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaceCounts {
    pub opaque: usize,
    pub alpha: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacePass {
    Opaque,
    Alpha,
}

/// Scratch reused by uploads: a sorter and face index buffers.
#[derive(Default)]
pub struct UploadContext {
    pub sorter: FacePrioritySorter,
    pub visible: Vec<u32>,
    pub order: Vec<u32>,
}

/// Turns a renderable's faces into packed vertices for one placement.
pub struct FaceWriter<'a> {
    xs: ArrayRef<'a, f32>,
    ys: ArrayRef<'a, f32>,
    zs: ArrayRef<'a, f32>,
    indices: [ArrayRef<'a, u32>; 3],
    colors: [ArrayRef<'a, i32>; 3],
    transparencies: Option<ArrayRef<'a, u8>>,
    textures: Option<ArrayRef<'a, i16>>,
    normals: Option<[ArrayRef<'a, i32>; 3]>,
    offset: Vec3,
    sin: f32,
    cos: f32,
    tint: Tint,
    force_transparency: bool,
}

impl<'a> FaceWriter<'a> {
    /// `tint` replaces the renderable's own tint unless it is [`Tint::NONE`].
    pub fn new(
        renderable: &'a dyn Renderable,
        placement: Placement,
        tint: Tint,
        force_transparency: bool,
    ) -> Self {
        let normals = match (
            renderable.vertex_normals_x(),
            renderable.vertex_normals_y(),
            renderable.vertex_normals_z(),
        ) {
            (Some(x), Some(y), Some(z)) => Some([x, y, z]),
            _ => None,
        };
        Self {
            xs: renderable.vertices_x(),
            ys: renderable.vertices_y(),
            zs: renderable.vertices_z(),
            indices: [
                renderable.face_indices_a(),
                renderable.face_indices_b(),
                renderable.face_indices_c(),
            ],
            colors: [
                renderable.face_colors_a(),
                renderable.face_colors_b(),
                renderable.face_colors_c(),
            ],
            transparencies: renderable.face_transparencies(),
            textures: renderable.face_textures(),
            normals,
            offset: placement.offset,
            sin: sin(placement.orientation) as f32 / 65536.0,
            cos: cos(placement.orientation) as f32 / 65536.0,
            tint: if tint.is_none() { renderable.tint() } else { tint },
            force_transparency,
        }
    }

    pub fn face_count(&self) -> usize {
        self.indices
            .iter()
            .map(|i| i.len())
            .chain([self.colors[2].len()])
            .min()
            .unwrap_or(0)
    }

    fn transparency(&self, face: usize) -> u8 {
        self.transparencies
            .as_ref()
            .and_then(|t| t.get(face).copied())
            .unwrap_or(0)
    }

    fn pass_of(&self, face: usize) -> Option<FacePass> {
        if self.colors[2][face] == HIDDEN_FACE {
            None
        } else if self.force_transparency || self.transparency(face) != 0 {
            Some(FacePass::Alpha)
        } else {
            Some(FacePass::Opaque)
        }
    }

    pub fn counts(&self) -> FaceCounts {
        let mut counts = FaceCounts::default();
        for face in 0..self.face_count() {
            match self.pass_of(face) {
                Some(FacePass::Opaque) => counts.opaque += 1,
                Some(FacePass::Alpha) => counts.alpha += 1,
                None => {}
            }
        }
        counts
    }

    /// Write the faces of `pass`, in `order` when given, else in face order.
    /// Returns the number of faces handed to `writer`.
    pub fn write_pass(
        &self,
        pass: FacePass,
        order: Option<&[u32]>,
        writer: &mut DrawWriter<'_>,
    ) -> Result<usize, SinkError> {
        let mut written = 0;
        let face_count = self.face_count();
        let mut emit = |face: usize| -> Result<(), SinkError> {
            if face < face_count && self.pass_of(face) == Some(pass) {
                writer.put_face(self.face_vertices(face))?;
                written += 1;
            }
            Ok(())
        };
        match order {
            Some(order) => order.iter().try_for_each(|&f| emit(f as usize))?,
            None => (0..face_count).try_for_each(&mut emit)?,
        }
        Ok(written)
    }

    fn rotate(&self, x: f32, z: f32) -> (f32, f32) {
        (z * self.sin + x * self.cos, z * self.cos - x * self.sin)
    }

    fn position(&self, vertex: usize) -> Vec3 {
        let (x, z) = self.rotate(self.xs[vertex], self.zs[vertex]);
        Vec3::new(x, self.ys[vertex], z) + self.offset
    }

    fn vertex_normal(&self, vertex: usize) -> Option<[i16; 4]> {
        let [nx, ny, nz] = self.normals.as_ref()?;
        let (x, y, z) = (*nx.get(vertex)?, *ny.get(vertex)?, *nz.get(vertex)?);
        if x == 0 && y == 0 && z == 0 {
            return None;
        }
        let (rx, rz) = self.rotate(x as f32, z as f32);
        Some([clamp_i16(rx), clamp_i16(y as f32), clamp_i16(rz), 0])
    }

    fn face_vertices(&self, face: usize) -> [PackedVertex; 3] {
        let corners = self.indices.each_ref().map(|i| i[face] as usize);
        let positions = corners.map(|v| self.position(v));

        let flat = self.colors[2][face] == FLAT_FACE;
        let face_normal = {
            let n = (positions[1] - positions[0]).cross(positions[2] - positions[0]);
            let n = n.normalize_or_zero() * FACE_NORMAL_LENGTH;
            [clamp_i16(n.x), clamp_i16(n.y), clamp_i16(n.z), 0]
        };

        let texture = self
            .textures
            .as_ref()
            .and_then(|t| t.get(face).copied())
            .filter(|&t| t >= 0);
        let alpha = (self.transparency(face) as u32) << 24;

        std::array::from_fn(|corner| {
            let hsl = if flat {
                self.colors[0][face]
            } else {
                self.colors[corner][face]
            };
            let (hsl, material) = match texture {
                Some(texture) => (hsl, texture as u32 + 1),
                None => (self.tint.apply(hsl), 0),
            };
            let normal = if flat {
                face_normal
            } else {
                self.vertex_normal(corners[corner]).unwrap_or(face_normal)
            };
            PackedVertex {
                position: positions[corner].to_array(),
                color: alpha | (hsl as u32 & 0xFFFF),
                normal,
                material,
            }
        })
    }
}

fn clamp_i16(value: f32) -> i16 {
    value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Frame-local draws of one dynamic renderable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicDraw {
    pub opaque: Option<DrawRange>,
    pub alpha: Option<DrawRange>,
    pub dropped_faces: usize,
}

/// Write a dynamic renderable into frame buffers: opaque faces in face
/// order, transparent faces sorted far to near for `angles`.
pub fn upload_dynamic(
    ctx: &mut UploadContext,
    sink: &dyn GpuSink,
    renderable: &dyn Renderable,
    placement: Placement,
    angles: CameraAngles,
    tint: Tint,
    force_transparency: bool,
) -> Result<DynamicDraw, SinkError> {
    let writer = FaceWriter::new(renderable, placement, tint, force_transparency);
    let counts = writer.counts();
    let mut draw = DynamicDraw::default();

    if counts.opaque > 0 {
        let mut out = DrawWriter::begin_draw(sink, BufferKind::FrameOpaque, counts.opaque)?;
        writer.write_pass(FacePass::Opaque, None, &mut out)?;
        draw.dropped_faces += out.dropped_faces();
        draw.opaque = Some(out.end()?);
    }

    if counts.alpha > 0 {
        // The model is yawed by its orientation, so sort as if the camera were.
        let view = CameraAngles::new(angles.yaw + placement.orientation, angles.pitch);
        let UploadContext {
            sorter,
            visible,
            order,
        } = ctx;
        with_model_faces(renderable, |faces| {
            faces.visible_faces(visible);
            let sorted = sorter.sort_model_faces(visible, faces, view);
            order.clear();
            order.extend(
                sorted
                    .iter()
                    .copied()
                    .filter(|&f| faces.is_alpha(f as usize, force_transparency)),
            );
        });

        let mut out = DrawWriter::begin_draw(sink, BufferKind::FrameAlpha, counts.alpha)?;
        writer.write_pass(FacePass::Alpha, Some(&order[..]), &mut out)?;
        draw.dropped_faces += out.dropped_faces();
        draw.alpha = Some(out.end()?);
    }

    tracing::trace!(
        id = renderable.id(),
        opaque = counts.opaque,
        alpha = counts.alpha,
        "dynamic renderable uploaded"
    );
    Ok(draw)
}
