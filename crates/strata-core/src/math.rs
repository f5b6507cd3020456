//! Transform encoding helpers.

use glam::{Affine3A, Vec3A};

/// Row-major 3x4 affine matrix, the layout ray tracing backends expect for
/// instance and motion transforms.
///
/// Row `r` holds `[x_axis[r], y_axis[r], z_axis[r], translation[r]]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RowMajor3x4(pub [f32; 12]);

impl RowMajor3x4 {
    /// Identity transform.
    pub const IDENTITY: Self = Self([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
    ]);

    /// Encode an affine transform.
    #[inline]
    pub fn from_affine(xfm: &Affine3A) -> Self {
        let x = xfm.matrix3.x_axis;
        let y = xfm.matrix3.y_axis;
        let z = xfm.matrix3.z_axis;
        let p = xfm.translation;
        Self([
            x.x, y.x, z.x, p.x, //
            x.y, y.y, z.y, p.y, //
            x.z, y.z, z.z, p.z, //
        ])
    }

    /// Decode back into an affine transform.
    #[inline]
    pub fn to_affine(&self) -> Affine3A {
        let m = &self.0;
        Affine3A::from_cols(
            Vec3A::new(m[0], m[4], m[8]),
            Vec3A::new(m[1], m[5], m[9]),
            Vec3A::new(m[2], m[6], m[10]),
            Vec3A::new(m[3], m[7], m[11]),
        )
    }

    /// Raw row-major values.
    #[inline]
    pub const fn as_array(&self) -> &[f32; 12] {
        &self.0
    }
}

impl Default for RowMajor3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Affine3A> for RowMajor3x4 {
    fn from(xfm: Affine3A) -> Self {
        Self::from_affine(&xfm)
    }
}
