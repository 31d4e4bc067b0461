// Orbit camera - spin/tilt angles around an eye point
//
// The projection follows Vulkan conventions directly: Y is negated and the
// depth range maps [front, back] onto [0, 1].

use glam::{Mat4, Vec3, Vec4};

pub struct Camera {
    /// Rotation around the vertical axis, degrees
    pub spin: f32,
    /// Rotation around the horizontal axis, degrees
    pub tilt: f32,
    /// Half-height of the view frustum at distance 1
    pub ry: f32,
    pub front: f32,
    pub back: f32,
    pub eye: Vec3,
    /// Set whenever the pose changes; the renderer drops temporal history
    modified: bool,
    mouse_pos: (f32, f32),
    pub dragging: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            spin: -20.0,
            tilt: 10.66,
            ry: 0.57,
            front: 0.1,
            back: 1000.0,
            eye: Vec3::new(2.29, 1.68, 6.64),
            modified: false,
            mouse_pos: (0.0, 0.0),
            dragging: false,
        }
    }
}

impl Camera {
    pub fn perspective(&self, aspect: f32) -> Mat4 {
        let rx = self.ry * aspect;
        let (front, back) = (self.front, self.back);
        Mat4::from_cols(
            Vec4::new(1.0 / rx, 0.0, 0.0, 0.0),
            Vec4::new(0.0, -1.0 / self.ry, 0.0, 0.0), // Vulkan draws y upside-down
            Vec4::new(0.0, 0.0, -back / (back - front), -1.0),
            Vec4::new(0.0, 0.0, -(front * back) / (back - front), 0.0),
        )
    }

    pub fn view_matrix(&self) -> Mat4 {
        let spin = Mat4::from_rotation_y(self.spin.to_radians());
        let tilt = Mat4::from_rotation_x(self.tilt.to_radians());
        let tran = Mat4::from_translation(-self.eye);
        tilt * spin * tran
    }

    pub fn eye_move_by(&mut self, step: Vec3) {
        self.eye += step;
        self.modified = true;
    }

    /// Move in the ground plane relative to the current spin heading.
    pub fn move_relative(&mut self, forward: f32, strafe: f32, lift: f32) {
        let rad = self.spin.to_radians();
        let ahead = Vec3::new(rad.sin(), 0.0, -rad.cos());
        let side = Vec3::new(rad.cos(), 0.0, rad.sin());
        self.eye_move_by(ahead * forward + side * strafe + Vec3::Y * lift);
    }

    pub fn set_mouse_position(&mut self, x: f32, y: f32) {
        self.mouse_pos = (x, y);
    }

    pub fn mouse_move(&mut self, x: f32, y: f32) {
        let (px, py) = self.mouse_pos;
        self.spin += (x - px) / 3.0;
        self.tilt += (y - py) / 3.0;
        self.mouse_pos = (x, y);
        self.modified = true;
    }

    /// Report and clear the modified flag.
    pub fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_maps_depth_range_to_zero_one() {
        let camera = Camera::default();
        let proj = camera.perspective(1.0);

        let near = proj * Vec4::new(0.0, 0.0, -camera.front, 1.0);
        let far = proj * Vec4::new(0.0, 0.0, -camera.back, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-4);
    }

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        let proj = camera.perspective(1.0);
        let up = proj * Vec4::new(0.0, 1.0, -1.0, 1.0);
        // World-up projects to negative clip-space y under Vulkan conventions
        assert!(up.y / up.w < 0.0);
    }

    #[test]
    fn mouse_drag_changes_pose_and_flags_history() {
        let mut camera = Camera::default();
        camera.set_mouse_position(10.0, 10.0);
        camera.mouse_move(16.0, 10.0);
        assert!((camera.spin - (-18.0)).abs() < 1e-4);
        assert!(camera.take_modified());
        assert!(!camera.take_modified());
    }
}
