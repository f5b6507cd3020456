//! Two-level acceleration structure management.
//!
//! A [`Scene`] owns bottom-level geometry groups and top-level instance
//! groups by stable handle and builds, refits and destroys their
//! acceleration structures on every device of a
//! [`DeviceSet`](strata_gpu::DeviceSet).
//!
//! # Example
//!
//! ```ignore
//! use strata_accel::{AccelConfig, GeomKind, Scene, StaticGeometry};
//!
//! let scene = Scene::new(devices, AccelConfig::default());
//! let geom = scene.create_geom(GeomKind::User, StaticGeometry::uniform(input, 1))?;
//! let blas = scene.create_user_geom_group(1)?;
//! scene.geom_group_set_child(blas, 0, Some(geom))?;
//! scene.build_accel(blas)?;
//!
//! let tlas = scene.create_instance_group(1)?;
//! scene.instance_group_set_child(tlas, 0, Some(blas))?;
//! scene.build_accel(tlas)?;
//! let root = scene.traversable(tlas, DeviceId(0))?;
//! ```

pub mod config;
pub mod error;
pub mod geom;
pub mod geom_group;
pub mod group;
pub mod instance_group;
pub mod motion;
pub mod scene;
pub mod state;

pub use config::{AccelConfig, AccelConfigBuilder};
pub use error::{AccelError, Result};
pub use geom::{Geom, GeomKind, GeometrySource, StaticGeometry};
pub use geom_group::GeomGroup;
pub use group::{Group, GroupKind};
pub use instance_group::InstanceGroup;
pub use scene::Scene;
pub use state::BuildState;
