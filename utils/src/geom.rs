// Plain-old-data geometry types
//
// These cross the shared memory and wire boundaries, so they are
// all repr(C) with position-stable layouts. No methods here do
// anything clever, they only exist to cut down on struct literal
// noise at the call sites.

/// A two component vector, used for quad layer sizes
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x: x, y: y }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn zero() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

/// A rotation quaternion. The identity is (0, 0, 0, 1).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

/// A 6-DoF pose: orientation plus position
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            orientation: Quat::identity(),
            position: Vec3::zero(),
        }
    }
}

/// Field of view, expressed as the four half angles in radians.
/// Left and down are negative for a symmetric frustum.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    /// A symmetric fov covering `half_angle` radians in every
    /// direction from center
    pub fn symmetric(half_angle: f32) -> Self {
        Self {
            angle_left: -half_angle,
            angle_right: half_angle,
            angle_up: half_angle,
            angle_down: -half_angle,
        }
    }
}

/// A normalized sub-rect into a swapchain image. (0,0,1,1) and
/// the all-zero rect both mean "the whole image".
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn zero() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 0.0,
            h: 0.0,
        }
    }

    /// True when this rect selects the entire image
    pub fn is_full(&self) -> bool {
        *self == Rect::zero()
            || (self.x == 0.0 && self.y == 0.0 && self.w == 1.0 && self.h == 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_pose() {
        let p = Pose::identity();
        assert_eq!(p.orientation.w, 1.0);
        assert_eq!(p.position, Vec3::zero());
    }

    #[test]
    fn full_rects() {
        assert!(Rect::zero().is_full());
        let full = Rect {
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
        };
        assert!(full.is_full());
        let sub = Rect {
            x: 0.25,
            y: 0.0,
            w: 0.5,
            h: 1.0,
        };
        assert!(!sub.is_full());
    }
}
