// src/render/camera.rs
use cgmath::*;

#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: cgmath::Matrix4<f32> = cgmath::Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.5,
    0.0, 0.0, 0.0, 1.0,
);

/// Radians per pixel of mouse drag.
pub const ROTATION_SPEED: f32 = 0.002;
/// Fraction of the distance covered by one scroll line.
pub const SCROLL_SPEED: f32 = 0.05;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable, Debug)]
pub struct CameraUniform {
    /// Eye position, homogeneous for 16 byte alignment.
    pub view_position: [f32; 4],
    pub view_proj: [[f32; 4]; 4],
    /// Camera right vector; `w` is the world-space point radius.
    pub right: [f32; 4],
    pub up: [f32; 4],
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self {
            view_position: [0.0; 4],
            view_proj: Matrix4::identity().into(),
            right: [1.0, 0.0, 0.0, 0.004],
            up: [0.0, 1.0, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrbitCamera {
    pub distance: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub target: Vector3<f32>,
    pub aspect: f32,
    pub fovy: Rad<f32>,
    pub znear: f32,
    pub zfar: f32,
    pub point_size: f32,
    pub min_distance: f32,
    pub max_distance: f32,
}

impl OrbitCamera {
    pub fn new(distance: f32, pitch: f32, yaw: f32, aspect: f32) -> Self {
        Self {
            distance,
            pitch,
            yaw,
            target: Vector3::zero(),
            aspect,
            fovy: Deg(45.0).into(),
            znear: 0.01,
            zfar: 100.0,
            point_size: 0.004,
            min_distance: 0.1,
            max_distance: 20.0,
        }
    }

    pub fn eye(&self) -> Vector3<f32> {
        Vector3::new(
            self.distance * self.yaw.sin() * self.pitch.cos(),
            self.distance * self.pitch.sin(),
            self.distance * self.yaw.cos() * self.pitch.cos(),
        ) + self.target
    }

    /// Orbits by a mouse drag of `(dx, dy)` pixels.
    pub fn rotate(&mut self, dx: f32, dy: f32) {
        let limit = std::f32::consts::FRAC_PI_2 - 0.01;
        self.yaw -= dx * ROTATION_SPEED;
        self.pitch = (self.pitch + dy * ROTATION_SPEED).clamp(-limit, limit);
    }

    /// Moves toward the target for positive `lines`.
    pub fn zoom(&mut self, lines: f32) {
        let distance = self.distance * (1.0 - lines * SCROLL_SPEED);
        self.distance = distance.clamp(self.min_distance, self.max_distance);
    }

    pub fn resize_projection(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn build_view_projection_matrix(&self) -> Matrix4<f32> {
        let view = Matrix4::look_at_rh(
            Point3::from_vec(self.eye()),
            Point3::from_vec(self.target),
            Vector3::unit_y(),
        );
        let proj = OPENGL_TO_WGPU_MATRIX * perspective(self.fovy, self.aspect, self.znear, self.zfar);
        proj * view
    }

    pub fn uniform(&self) -> CameraUniform {
        let eye = self.eye();
        let forward = (self.target - eye).normalize();
        let right = forward.cross(Vector3::unit_y()).normalize();
        let up = right.cross(forward);
        CameraUniform {
            view_position: [eye.x, eye.y, eye.z, 1.0],
            view_proj: self.build_view_projection_matrix().into(),
            right: [right.x, right.y, right.z, self.point_size],
            up: [up.x, up.y, up.z, 0.0],
        }
    }
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self::new(2.5, 0.0, 0.0, 1280.0 / 720.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_camera_looks_down_z() {
        let camera = OrbitCamera::default();
        let eye = camera.eye();
        assert!(eye.x.abs() < 1e-6 && eye.y.abs() < 1e-6);
        assert!((eye.z - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_zoom_and_pitch_are_clamped() {
        let mut camera = OrbitCamera::default();
        for _ in 0..200 {
            camera.zoom(1.0);
        }
        assert_eq!(camera.distance, camera.min_distance);
        camera.rotate(0.0, 1e6);
        assert!(camera.pitch < std::f32::consts::FRAC_PI_2);
    }

    #[test]
    fn test_origin_projects_to_screen_center() {
        let camera = OrbitCamera::default();
        let clip = camera.build_view_projection_matrix() * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert!((clip.x / clip.w).abs() < 1e-5);
        assert!((clip.y / clip.w).abs() < 1e-5);
        let depth = clip.z / clip.w;
        assert!((0.0..=1.0).contains(&depth));
    }

    #[test]
    fn test_billboard_axes_are_orthonormal() {
        let mut camera = OrbitCamera::default();
        camera.rotate(300.0, -150.0);
        let u = camera.uniform();
        let right = Vector3::new(u.right[0], u.right[1], u.right[2]);
        let up = Vector3::new(u.up[0], u.up[1], u.up[2]);
        assert!((right.magnitude() - 1.0).abs() < 1e-5);
        assert!((up.magnitude() - 1.0).abs() < 1e-5);
        assert!(right.dot(up).abs() < 1e-5);
        assert_eq!(u.right[3], camera.point_size);
    }

    #[test]
    fn test_resize_ignores_zero_height() {
        let mut camera = OrbitCamera::default();
        camera.resize_projection(800, 0);
        assert!((camera.aspect - 1280.0 / 720.0).abs() < 1e-6);
        camera.resize_projection(800, 800);
        assert_eq!(camera.aspect, 1.0);
    }
}
