//! Geometries referenced by bottom-level groups.

use crate::error::{AccelError, Result};
use crate::state::RefCount;
use strata_core::{DeviceId, GeomId};
use strata_gpu::GeometryInput;

/// Primitive kind of a geometry and of the bottom-level groups holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeomKind {
    /// Indexed triangle meshes.
    Triangles,
    /// User primitives described by bounding boxes.
    User,
}

impl GeomKind {
    /// Whether `input` is of this kind.
    pub const fn matches(self, input: &GeometryInput) -> bool {
        matches!(
            (self, input),
            (Self::Triangles, GeometryInput::Triangles(_))
                | (Self::User, GeometryInput::CustomPrimitives(_))
        )
    }
}

/// Provides the per-device build input of a geometry.
///
/// Vertex, index and bounding box buffers are owned by the source; they must
/// stay alive on a device for as long as structures built from them are
/// refit there.
pub trait GeometrySource: Send + Sync {
    /// Build input on `device`.
    fn build_input(&self, device: DeviceId) -> Result<GeometryInput>;
}

impl<F> GeometrySource for F
where
    F: Fn(DeviceId) -> Result<GeometryInput> + Send + Sync,
{
    fn build_input(&self, device: DeviceId) -> Result<GeometryInput> {
        self(device)
    }
}

/// A geometry whose device buffers were uploaded up front.
#[derive(Debug, Clone)]
pub struct StaticGeometry {
    inputs: Vec<GeometryInput>,
}

impl StaticGeometry {
    /// One input per device, in device order.
    pub fn new(inputs: Vec<GeometryInput>) -> Self {
        Self { inputs }
    }

    /// The same input on every device.
    pub fn uniform(input: GeometryInput, device_count: usize) -> Self {
        Self {
            inputs: vec![input; device_count],
        }
    }
}

impl GeometrySource for StaticGeometry {
    fn build_input(&self, device: DeviceId) -> Result<GeometryInput> {
        self.inputs.get(device.index()).copied().ok_or_else(|| {
            AccelError::Configuration(format!("static geometry has no input for {device}"))
        })
    }
}

/// A registered geometry.
pub struct Geom {
    id: GeomId,
    kind: GeomKind,
    source: Box<dyn GeometrySource>,
    pub(crate) ref_count: RefCount,
}

impl Geom {
    pub(crate) fn new(id: GeomId, kind: GeomKind, source: Box<dyn GeometrySource>) -> Self {
        Self {
            id,
            kind,
            source,
            ref_count: RefCount::default(),
        }
    }

    pub const fn id(&self) -> GeomId {
        self.id
    }

    pub const fn kind(&self) -> GeomKind {
        self.kind
    }

    /// Number of group slots currently holding this geometry.
    pub fn reference_count(&self) -> u32 {
        self.ref_count.get()
    }

    /// Build input on `device`, checked against the geometry's kind.
    pub fn build_input(&self, device: DeviceId) -> Result<GeometryInput> {
        let input = self.source.build_input(device)?;
        if !self.kind.matches(&input) {
            return Err(AccelError::Configuration(format!(
                "{} is a {:?} geometry but provided a mismatched build input on {device}",
                self.id, self.kind
            )));
        }
        Ok(input)
    }
}

impl std::fmt::Debug for Geom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geom")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ref_count", &self.ref_count.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{DeviceAddress, SlotTable};
    use strata_gpu::{AabbInput, TriangleInput};

    fn aabbs() -> GeometryInput {
        GeometryInput::CustomPrimitives(AabbInput {
            aabbs: DeviceAddress(0x1000),
            primitive_count: 4,
            stride: 24,
        })
    }

    #[test]
    fn kind_must_match_input() {
        let id = GeomId(SlotTable::new().insert(()).unwrap());
        let user = Geom::new(id, GeomKind::User, Box::new(StaticGeometry::uniform(aabbs(), 2)));
        assert!(user.build_input(DeviceId(1)).is_ok());
        assert!(user.build_input(DeviceId(2)).is_err());

        let tris = Geom::new(id, GeomKind::Triangles, Box::new(StaticGeometry::uniform(aabbs(), 1)));
        assert!(matches!(
            tris.build_input(DeviceId(0)),
            Err(AccelError::Configuration(_))
        ));
    }

    #[test]
    fn closures_are_sources() {
        let source = |device: DeviceId| -> Result<GeometryInput> {
            Ok(GeometryInput::Triangles(TriangleInput {
                vertices: DeviceAddress(0x100 * u64::from(device.0 + 1)),
                vertex_count: 3,
                vertex_stride: 12,
                indices: DeviceAddress(0x2000),
                triangle_count: 1,
            }))
        };
        let id = GeomId(SlotTable::new().insert(()).unwrap());
        let geom = Geom::new(id, GeomKind::Triangles, Box::new(source));
        let GeometryInput::Triangles(t) = geom.build_input(DeviceId(1)).unwrap() else {
            panic!("expected triangles");
        };
        assert_eq!(t.vertices, DeviceAddress(0x200));
    }
}
