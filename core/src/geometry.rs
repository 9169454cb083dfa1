use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics in pixels, together with the image size they refer to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Square pixels, focal length equal to the larger image side, principal point at the centre.
    pub fn new_ideal(width: u32, height: u32) -> Self {
        let f = width.max(height) as f64;
        Self {
            fx: f,
            fy: f,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            width,
            height,
        }
    }

    /// Reads fx, fy, cx, cy out of a 3x3 camera matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>, width: u32, height: u32) -> Self {
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], width, height)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy].iter().all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
    }

    pub fn pixel_to_normalized(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    pub fn normalized_to_pixel(&self, point: &Point2<f64>) -> Point2<f64> {
        Point2::new(point.x * self.fx + self.cx, point.y * self.fy + self.cy)
    }
}

/// Brown–Conrady lens distortion: radial `k1, k2, k3`, tangential `p1, p2`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Coefficients in the conventional `[k1, k2, p1, p2, k3]` order.
    pub fn from_array(c: [f64; 5]) -> Self {
        Self::new(c[0], c[1], c[2], c[3], c[4])
    }

    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.to_array().iter().all(|c| *c == 0.0)
    }

    /// Distorts a point given in normalized image coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    /// Inverts [`Distortion::apply`] by fixed-point iteration.
    pub fn remove(&self, xd: f64, yd: f64) -> (f64, f64) {
        if self.is_zero() {
            return (xd, yd);
        }
        let mut x = xd;
        let mut y = yd;
        for _ in 0..50 {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let nx = (xd - dx) / radial;
            let ny = (yd - dy) / radial;
            let step = (nx - x).abs() + (ny - y).abs();
            x = nx;
            y = ny;
            if step < 1e-15 {
                break;
            }
        }
        (x, y)
    }
}

/// Intrinsics plus lens distortion of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Distortion,
}

impl CameraModel {
    pub fn new(intrinsics: CameraIntrinsics, distortion: Distortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Projects a point expressed in the camera frame. `None` behind the camera.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= 1e-12 {
            return None;
        }
        let (xd, yd) = self
            .distortion
            .apply(point.x / point.z, point.y / point.z);
        Some(self.intrinsics.normalized_to_pixel(&Point2::new(xd, yd)))
    }

    /// Projects a board/world point seen under `pose`.
    pub fn project_with_pose(&self, pose: &Pose, point: &Point3<f64>) -> Option<Point2<f64>> {
        self.project(&pose.transform_point(point))
    }

    /// Undistorted normalized coordinates of a pixel.
    pub fn undistort_pixel(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let n = self.intrinsics.pixel_to_normalized(pixel);
        let (x, y) = self.distortion.remove(n.x, n.y);
        Point2::new(x, y)
    }
}

/// Rigid transform from board (world) coordinates into camera coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    pub fn from_rotation_vector(rvec: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(rodrigues_to_rotation_matrix(rvec), translation)
    }

    pub fn rotation_vector(&self) -> Vector3<f64> {
        rotation_matrix_to_rodrigues(&self.rotation)
    }

    /// `[rx, ry, rz, tx, ty, tz]`, the layout used by the solvers.
    pub fn to_params(&self) -> [f64; 6] {
        let r = self.rotation_vector();
        [
            r[0],
            r[1],
            r[2],
            self.translation[0],
            self.translation[1],
            self.translation[2],
        ]
    }

    pub fn from_params(p: &[f64]) -> Self {
        Self::from_rotation_vector(
            &Vector3::new(p[0], p[1], p[2]),
            Vector3::new(p[3], p[4], p[5]),
        )
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * point.coords + self.translation)
    }

    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.transpose();
        Self::new(r_inv, -r_inv * self.translation)
    }

    /// `self ∘ inner`: applies `inner` first, then `self`.
    pub fn compose(&self, inner: &Pose) -> Self {
        Self::new(
            self.rotation * inner.rotation,
            self.rotation * inner.translation + self.translation,
        )
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

pub fn rodrigues_to_rotation_matrix(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*rvec).into_inner()
}

pub fn rotation_matrix_to_rodrigues(r: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(r).scaled_axis()
}

/// Closest proper rotation (Frobenius norm) to an arbitrary 3x3 matrix.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Some(r)
}

/// Rotation angle of `r` in degrees.
pub fn rotation_angle_deg(r: &Matrix3<f64>) -> f64 {
    rotation_matrix_to_rodrigues(r).norm().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ideal_intrinsics_use_the_larger_side() {
        for (w, h) in [(640, 480), (480, 640)] {
            let k = CameraIntrinsics::new_ideal(w, h);
            assert_eq!((k.fx, k.fy), (640.0, 640.0));
            assert_eq!((k.cx, k.cy), (w as f64 / 2.0, h as f64 / 2.0));
        }
    }

    #[test]
    fn distortion_remove_inverts_apply() {
        let d = Distortion::new(-0.28, 0.09, 0.001, -0.0005, -0.01);
        for &(x, y) in &[(0.0, 0.0), (0.3, -0.2), (-0.45, 0.35), (0.1, 0.5)] {
            let (xd, yd) = d.apply(x, y);
            let (xu, yu) = d.remove(xd, yd);
            assert!((xu - x).abs() < 1e-9, "x {x} -> {xu}");
            assert!((yu - y).abs() < 1e-9, "y {y} -> {yu}");
        }
    }

    #[test]
    fn pose_compose_and_inverse() {
        let a = Pose::from_rotation_vector(&Vector3::new(0.1, -0.2, 0.3), Vector3::new(1.0, 2.0, 3.0));
        let b = Pose::from_rotation_vector(&Vector3::new(-0.05, 0.4, 0.0), Vector3::new(-4.0, 0.5, 9.0));
        let p = Point3::new(0.3, -1.2, 2.5);
        let composed = a.compose(&b).transform_point(&p);
        let chained = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, chained, epsilon = 1e-12);

        let back = a.inverse().transform_point(&a.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn pose_params_roundtrip() {
        let pose = Pose::from_rotation_vector(&Vector3::new(0.2, 0.1, -0.3), Vector3::new(5.0, -1.0, 40.0));
        let back = Pose::from_params(&pose.to_params());
        assert_relative_eq!(back.rotation, pose.rotation, epsilon = 1e-12);
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
    }

    #[test]
    fn nearest_rotation_fixes_scaled_matrix() {
        let r = rodrigues_to_rotation_matrix(&Vector3::new(0.0, 0.3, 0.1));
        let noisy = r * 1.7;
        let fixed = nearest_rotation(&noisy).unwrap();
        assert_relative_eq!(fixed, r, epsilon = 1e-9);
        assert!((fixed.determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn camera_model_projects_principal_ray_to_principal_point() {
        let model = CameraModel::new(
            CameraIntrinsics::new(800.0, 780.0, 320.0, 240.0, 640, 480),
            Distortion::new(-0.2, 0.05, 0.0, 0.0, 0.0),
        );
        let px = model.project(&Point3::new(0.0, 0.0, 5.0)).unwrap();
        assert_relative_eq!(px, Point2::new(320.0, 240.0), epsilon = 1e-12);
        assert!(model.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
    }
}
