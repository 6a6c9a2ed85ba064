/// `colors_c` value of a face that is never drawn.
pub const HIDDEN_FACE: i32 = -2;
/// `colors_c` value of a flat-shaded face: colour A applies to all corners.
pub const FLAT_FACE: i32 = -1;

const X_BITS: u32 = 11;
const Y_BITS: u32 = 10;
const Z_BITS: u32 = 11;

/// Pack a quantised face centroid into 32 bits: x in `[31:21]`, y in
/// `[20:11]`, z in `[10:0]`, each two's complement.
pub fn pack_face(x: i32, y: i32, z: i32) -> i32 {
    ((x & ((1 << X_BITS) - 1)) << (Y_BITS + Z_BITS))
        | ((y & ((1 << Y_BITS) - 1)) << Z_BITS)
        | (z & ((1 << Z_BITS) - 1))
}

/// Inverse of [`pack_face`], sign-extending each component.
pub fn unpack_face(packed: i32) -> (i32, i32, i32) {
    (
        packed >> (Y_BITS + Z_BITS),
        (packed << X_BITS) >> (X_BITS + Z_BITS),
        (packed << (X_BITS + Y_BITS)) >> (X_BITS + Y_BITS),
    )
}

/// Borrowed view of the arrays the sorter and alpha builder read.
#[derive(Debug, Clone, Copy)]
pub struct ModelFaces<'a> {
    pub vertices_x: &'a [f32],
    pub vertices_y: &'a [f32],
    pub vertices_z: &'a [f32],
    pub indices_a: &'a [u32],
    pub indices_b: &'a [u32],
    pub indices_c: &'a [u32],
    pub colors_c: &'a [i32],
    pub transparencies: Option<&'a [u8]>,
    pub priorities: Option<&'a [u8]>,
    pub radius: i32,
}

impl ModelFaces<'_> {
    pub fn face_count(&self) -> usize {
        self.indices_a
            .len()
            .min(self.indices_b.len())
            .min(self.indices_c.len())
            .min(self.colors_c.len())
    }

    pub fn is_hidden(&self, face: usize) -> bool {
        self.colors_c[face] == HIDDEN_FACE
    }

    /// Whether a visible face belongs in the transparent pass.
    pub fn is_alpha(&self, face: usize, force_transparency: bool) -> bool {
        if self.is_hidden(face) {
            return false;
        }
        force_transparency
            || self
                .transparencies
                .and_then(|t| t.get(face))
                .is_some_and(|&t| t != 0)
    }

    /// Indices of every face that is not hidden, in face order.
    pub fn visible_faces(&self, out: &mut Vec<u32>) {
        out.clear();
        out.extend((0..self.face_count()).filter(|&f| !self.is_hidden(f)).map(|f| f as u32));
    }

    /// Sum of the three corner positions, truncated to integers.
    pub fn corner_sum(&self, face: usize) -> [i32; 3] {
        let (a, b, c) = (
            self.indices_a[face] as usize,
            self.indices_b[face] as usize,
            self.indices_c[face] as usize,
        );
        [
            (self.vertices_x[a] + self.vertices_x[b] + self.vertices_x[c]) as i32,
            (self.vertices_y[a] + self.vertices_y[b] + self.vertices_y[c]) as i32,
            (self.vertices_z[a] + self.vertices_z[b] + self.vertices_z[c]) as i32,
        ]
    }

    /// Integer centroid of a face.
    pub fn centroid(&self, face: usize) -> [i32; 3] {
        let [x, y, z] = self.corner_sum(face);
        [x / 3, y / 3, z / 3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_keeps_signed_components() {
        for &(x, y, z) in &[(0, 0, 0), (-1, -1, -1), (1023, 511, 1023), (-1024, -512, -1024), (17, -3, -200)] {
            assert_eq!(unpack_face(pack_face(x, y, z)), (x, y, z));
        }
    }

    #[test]
    fn components_occupy_their_bit_ranges() {
        assert_eq!(pack_face(1, 0, 0), 1 << 21);
        assert_eq!(pack_face(0, 1, 0), 1 << 11);
        assert_eq!(pack_face(0, 0, 1), 1);
    }

    #[test]
    fn hidden_and_alpha_faces() {
        let xs = [0.0, 3.0, 0.0];
        let ys = [0.0, 0.0, 3.0];
        let zs = [0.0; 3];
        let idx = [0u32, 0];
        let idx_b = [1u32, 1];
        let idx_c = [2u32, 2];
        let colors = [HIDDEN_FACE, 100];
        let transparency = [200u8, 0];
        let faces = ModelFaces {
            vertices_x: &xs,
            vertices_y: &ys,
            vertices_z: &zs,
            indices_a: &idx,
            indices_b: &idx_b,
            indices_c: &idx_c,
            colors_c: &colors,
            transparencies: Some(&transparency),
            priorities: None,
            radius: 3,
        };
        assert!(!faces.is_alpha(0, true));
        assert!(!faces.is_alpha(1, false));
        assert!(faces.is_alpha(1, true));

        let mut visible = Vec::new();
        faces.visible_faces(&mut visible);
        assert_eq!(visible, vec![1]);
        assert_eq!(faces.centroid(1), [1, 1, 0]);
    }
}
