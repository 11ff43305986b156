//! 几何原语
//!
//! 刚体等距变换、摆动/扭转分解、角度工具与射线求交。
//! 所有可能产生 NaN 的地方都有 epsilon 保护，退化输入返回恒等/无交。

pub mod qcp;

use glam::{Quat, Vec3};
use std::f32::consts::PI;

/// 数值退化判定阈值
pub const EPSILON: f32 = 1.0e-6;

// ============================================================================
// 刚体等距变换
// ============================================================================

/// 刚体等距变换（旋转 + 平移，无缩放）
///
/// 空间帧的值类型。全局变换 = 父全局 ∘ 本地。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Iso {
    pub rotation: Quat,
    pub translation: Vec3,
}

impl Iso {
    /// 恒等变换
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    #[inline]
    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self { rotation, translation }
    }

    /// 复合变换：先 rhs 后 self
    #[inline]
    pub fn mul(&self, rhs: &Iso) -> Iso {
        Iso {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }

    /// 逆变换
    #[inline]
    pub fn inverse(&self) -> Iso {
        let inv_rot = self.rotation.conjugate();
        Iso {
            rotation: inv_rot,
            translation: inv_rot * -self.translation,
        }
    }

    /// 变换一个点
    #[inline]
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.rotation * p + self.translation
    }

    /// 变换一个方向（忽略平移）
    #[inline]
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        self.rotation * v
    }

    /// 基向量（列）：0=X, 1=Y, 2=Z
    #[inline]
    pub fn basis(&self, axis: usize) -> Vec3 {
        match axis {
            0 => self.rotation * Vec3::X,
            1 => self.rotation * Vec3::Y,
            _ => self.rotation * Vec3::Z,
        }
    }
}

impl Default for Iso {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ============================================================================
// 四元数工具
// ============================================================================

/// 规范化四元数的轴角表示，保证角度落在 [0, π]
///
/// glam 的 `to_axis_angle` 可能返回 (π, 2π] 的长弧，换用反向轴的短弧。
#[inline]
pub fn to_shortest_axis_angle(q: Quat) -> (Vec3, f32) {
    let (axis, angle) = q.normalize().to_axis_angle();
    if angle > PI {
        (-axis, 2.0 * PI - angle)
    } else {
        (axis, angle)
    }
}

/// 把旋转角钳制到 `max_angle` 以内（几何短弧角度）
///
/// 退化旋转（接近恒等）原样返回。
pub fn clamp_rotation(q: Quat, max_angle: f32) -> Quat {
    let (axis, angle) = to_shortest_axis_angle(q);
    if angle <= max_angle || axis.length_squared() < EPSILON {
        q
    } else {
        Quat::from_axis_angle(axis, max_angle)
    }
}

/// 摆动/扭转分解：`q = swing * twist`，twist 绕 `axis`
///
/// `axis` 必须为单位向量。投影退化时（旋转轴与 axis 垂直）twist 为恒等。
pub fn swing_twist(q: Quat, axis: Vec3) -> (Quat, Quat) {
    let qv = Vec3::new(q.x, q.y, q.z);
    let proj = axis * qv.dot(axis);
    let twist_raw = Quat::from_xyzw(proj.x, proj.y, proj.z, q.w);
    if twist_raw.length_squared() < EPSILON {
        // 纯 180° 摆动，无扭转分量
        return (q.normalize(), Quat::IDENTITY);
    }
    let twist = twist_raw.normalize();
    let swing = q * twist.conjugate();
    (swing.normalize(), twist)
}

/// 绕 `axis` 的带符号扭转角，范围 (-π, π]
#[inline]
pub fn twist_angle_about(q: Quat, axis: Vec3) -> f32 {
    let (_, twist) = swing_twist(q, axis);
    let qv = Vec3::new(twist.x, twist.y, twist.z);
    2.0 * qv.dot(axis).atan2(twist.w)
}

/// 由两个单位方向构造最短弧旋转
///
/// 反平行输入选取任一垂直轴旋转 π；退化输入返回恒等。
pub fn rotation_between(from: Vec3, to: Vec3) -> Quat {
    let from = from.normalize_or_zero();
    let to = to.normalize_or_zero();
    if from.length_squared() < EPSILON || to.length_squared() < EPSILON {
        return Quat::IDENTITY;
    }
    let dot = from.dot(to).clamp(-1.0, 1.0);
    if dot > 1.0 - EPSILON {
        return Quat::IDENTITY;
    }
    if dot < -1.0 + EPSILON {
        // 反平行：任取垂直轴
        let axis = from.any_orthonormal_vector();
        return Quat::from_axis_angle(axis, PI);
    }
    let axis = from.cross(to).normalize_or_zero();
    if axis.length_squared() < EPSILON {
        return Quat::IDENTITY;
    }
    Quat::from_axis_angle(axis, dot.acos())
}

// ============================================================================
// 角度工具
// ============================================================================

/// 角度归一化到 [0, 2π)
#[inline]
pub fn normalize_angle(angle: f32) -> f32 {
    let mut r = angle % (2.0 * PI);
    if r < 0.0 {
        r += 2.0 * PI;
    }
    r
}

/// 计算角度差（考虑周期性），范围 (-π, π]
#[inline]
pub fn angle_diff(a: f32, b: f32) -> f32 {
    let mut diff = normalize_angle(a) - normalize_angle(b);
    if diff > PI {
        diff -= 2.0 * PI;
    } else if diff < -PI {
        diff += 2.0 * PI;
    }
    diff
}

// ============================================================================
// 射线
// ============================================================================

/// 射线（按直线参与求交）
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub heading: Vec3,
}

impl Ray {
    #[inline]
    pub fn new(origin: Vec3, heading: Vec3) -> Self {
        Self { origin, heading }
    }

    /// 由两点构造
    #[inline]
    pub fn from_points(p1: Vec3, p2: Vec3) -> Self {
        Self { origin: p1, heading: p2 - p1 }
    }

    /// 与三点确定的平面求交（按无限直线）
    ///
    /// 直线与平面近似平行时返回 None。
    pub fn intersects_plane(&self, a: Vec3, b: Vec3, c: Vec3) -> Option<Vec3> {
        let normal = (b - a).cross(c - a);
        let denom = normal.dot(self.heading);
        if denom.abs() < EPSILON {
            return None;
        }
        let t = normal.dot(a - self.origin) / denom;
        Some(self.origin + self.heading * t)
    }

    /// 与原点处单位球求交（按无限直线），最多两个交点
    pub fn intersects_unit_sphere(&self) -> Option<(Vec3, Vec3)> {
        let d = self.heading;
        let o = self.origin;
        let a = d.length_squared();
        if a < EPSILON {
            return None;
        }
        let b = 2.0 * o.dot(d);
        let c = o.length_squared() - 1.0;
        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return None;
        }
        let sq = disc.sqrt();
        let t1 = (-b - sq) / (2.0 * a);
        let t2 = (-b + sq) / (2.0 * a);
        Some((o + d * t1, o + d * t2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_compose_inverse() {
        let a = Iso::new(Quat::from_rotation_y(0.7), Vec3::new(1.0, 2.0, 3.0));
        let b = Iso::new(Quat::from_rotation_x(-0.3), Vec3::new(0.5, 0.0, -1.0));
        let p = Vec3::new(0.2, -0.4, 1.1);

        // 复合 = 逐个施加
        let composed = a.mul(&b).transform_point(p);
        let stepped = a.transform_point(b.transform_point(p));
        assert!((composed - stepped).length() < 1e-5);

        // 逆变换还原
        let back = a.inverse().transform_point(a.transform_point(p));
        assert!((back - p).length() < 1e-5);
    }

    #[test]
    fn test_swing_twist_roundtrip() {
        let q = Quat::from_euler(glam::EulerRot::XYZ, 0.4, 1.1, -0.6);
        let (swing, twist) = swing_twist(q, Vec3::Y);

        // swing * twist 还原
        let recomposed = swing * twist;
        assert!(recomposed.dot(q).abs() > 1.0 - 1e-5);

        // twist 轴与 Y 共线
        let tv = Vec3::new(twist.x, twist.y, twist.z);
        assert!(tv.cross(Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_twist_angle_pure_twist() {
        let q = Quat::from_rotation_y(1.3);
        let angle = twist_angle_about(q, Vec3::Y);
        assert!((angle - 1.3).abs() < 1e-5);
    }

    #[test]
    fn test_clamp_rotation() {
        let q = Quat::from_rotation_z(1.0);
        let clamped = clamp_rotation(q, 0.25);
        let (axis, angle) = to_shortest_axis_angle(clamped);
        assert!((angle - 0.25).abs() < 1e-5);
        assert!((axis - Vec3::Z).length() < 1e-4);

        // 小于上限的旋转不变
        let small = Quat::from_rotation_z(0.1);
        assert_eq!(clamp_rotation(small, 0.25), small);
    }

    #[test]
    fn test_rotation_between() {
        let r = rotation_between(Vec3::X, Vec3::Y);
        assert!((r * Vec3::X - Vec3::Y).length() < 1e-5);

        // 反平行
        let r = rotation_between(Vec3::Y, -Vec3::Y);
        assert!((r * Vec3::Y + Vec3::Y).length() < 1e-4);
    }

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(-0.5) - (2.0 * PI - 0.5)).abs() < 1e-6);
        assert!((normalize_angle(2.0 * PI + 0.25) - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_ray_unit_sphere() {
        // 穿过球心的直线交于 ±heading
        let ray = Ray::new(Vec3::new(0.0, 0.0, -5.0), Vec3::Z);
        let (p1, p2) = ray.intersects_unit_sphere().unwrap();
        assert!((p1.length() - 1.0).abs() < 1e-5);
        assert!((p2.length() - 1.0).abs() < 1e-5);
        assert!((p1 - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-4);

        // 不相交
        let miss = Ray::new(Vec3::new(0.0, 2.0, -5.0), Vec3::Z);
        assert!(miss.intersects_unit_sphere().is_none());
    }

    #[test]
    fn test_ray_plane() {
        let ray = Ray::new(Vec3::new(0.0, 5.0, 0.0), -Vec3::Y);
        let hit = ray
            .intersects_plane(Vec3::ZERO, Vec3::X, Vec3::Z)
            .unwrap();
        assert!(hit.length() < 1e-5);
    }
}
