//! Geometry utilities: SE(3) transforms, SO(3) Jacobians, sphere
//! parameterisation, and linear triangulation.

pub mod se3;
pub mod so3;
pub mod stereographic;
pub mod triangulation;

pub use se3::SE3;
pub use so3::{left_jacobian_so3_inv, right_jacobian_so3, right_jacobian_so3_inv, skew};
pub use stereographic::StereographicParam;
pub use triangulation::triangulate;
