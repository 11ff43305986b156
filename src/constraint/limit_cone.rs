//! 限制锥
//!
//! 球窝约束合法摆动区的基本单元：单位方向 + 角半径 + 软垫比例。
//! 相邻两锥之间由一对相切圆界定过渡走廊；相切圆数据在锥被编辑时
//! 预计算一次，存放在序列中靠前的那个锥上。

use glam::{Quat, Vec3};
use std::f32::consts::PI;

use crate::math::{rotation_between, Ray, EPSILON};

/// 限制锥
#[derive(Clone, Debug)]
pub struct LimitCone {
    /// 锥轴（单位向量，约束本地系）
    control_point: Vec3,
    /// 角半径（弧度）
    radius: f32,
    radius_cos: f32,
    /// 软垫比例 (0,1]，回拉步使用的"舒适"半径 = radius × cushion
    cushion: f32,
    cushion_cos: f32,

    // ========================================
    // 指向下一锥的相切圆（update_tangent_handles 维护）
    // ========================================
    /// 弧法线正侧的相切圆心
    tangent_center_1: Vec3,
    /// 弧法线负侧的相切圆心
    tangent_center_2: Vec3,
    tangent_radius: f32,
    tangent_radius_cos: f32,
    /// 相切圆数据是否有效（锥轴近平行时无走廊）
    edge_valid: bool,
}

impl LimitCone {
    /// 创建限制锥
    ///
    /// 方向归一化；半径钳到 (ε, π]；软垫钳到 (0, 1]。
    pub fn new(direction: Vec3, radius: f32, cushion: f32) -> Self {
        let control_point = direction.normalize_or_zero();
        let control_point = if control_point.length_squared() < EPSILON {
            Vec3::Y
        } else {
            control_point
        };
        let radius = radius.clamp(EPSILON, PI);
        let cushion = if cushion <= 0.0 { 1.0 } else { cushion.min(1.0) };
        Self {
            control_point,
            radius,
            radius_cos: radius.cos(),
            cushion,
            cushion_cos: (radius * cushion).cos(),
            tangent_center_1: Vec3::ZERO,
            tangent_center_2: Vec3::ZERO,
            tangent_radius: 0.0,
            tangent_radius_cos: 1.0,
            edge_valid: false,
        }
    }

    #[inline]
    pub fn control_point(&self) -> Vec3 {
        self.control_point
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    #[inline]
    pub fn radius_cos(&self) -> f32 {
        self.radius_cos
    }

    #[inline]
    pub fn cushion(&self) -> f32 {
        self.cushion
    }

    #[inline]
    pub fn cushion_cos(&self) -> f32 {
        self.cushion_cos
    }

    #[inline]
    pub fn tangent_radius(&self) -> f32 {
        self.tangent_radius
    }

    /// 方向是否落在本锥的扫掠范围内
    #[inline]
    pub fn in_bounds(&self, dir: Vec3) -> bool {
        dir.dot(self.control_point) >= self.radius_cos
    }

    /// 锥边界上距 dir 最近的点：锥轴沿大圆向 dir 转过 radius
    pub fn closest_on_boundary(&self, dir: Vec3) -> Vec3 {
        let axis = self.control_point.cross(dir);
        let axis = if axis.length_squared() < EPSILON {
            // dir 与锥轴共线（含对踵），任取垂直轴
            self.control_point.any_orthonormal_vector()
        } else {
            axis.normalize()
        };
        Quat::from_axis_angle(axis, self.radius) * self.control_point
    }

    // ========================================
    // 相切圆几何
    // ========================================

    /// 重算指向 `next` 的相切圆
    ///
    /// 走廊半径 t = (π − (r_i + r_{i+1})) / 2。圆心由两锥接触点平面的
    /// 交线与单位球求交闭式解出；锥轴近平行时走廊退化，标记边无效。
    pub fn update_tangent_handles(&mut self, next: &LimitCone) {
        self.edge_valid = false;

        let a = self.control_point;
        let b = next.control_point;
        let arc_normal = a.cross(b);
        if arc_normal.length_squared() < EPSILON {
            // 近平行 / 对踵：无确定的弧平面
            return;
        }
        let arc_normal_unit = arc_normal.normalize();

        let t_radius = (PI - (self.radius + next.radius)) * 0.5;
        if t_radius < EPSILON {
            // 两锥半径之和覆盖半球，无走廊
            return;
        }

        let boundary_plus_t_a = self.radius + t_radius;
        let boundary_plus_t_b = next.radius + t_radius;

        // 本锥接触点平面：锥轴缩到接触圆高度 + 平面内两点
        let scaled_axis_a = a * boundary_plus_t_a.cos();
        let plane_dir1_a = Quat::from_axis_angle(arc_normal_unit, boundary_plus_t_a) * a;
        let plane_dir2_a = Quat::from_axis_angle(a, PI * 0.5) * plane_dir1_a;

        let scaled_axis_b = b * boundary_plus_t_b.cos();
        let plane_dir1_b = Quat::from_axis_angle(arc_normal_unit, boundary_plus_t_b) * b;
        let plane_dir2_b = Quat::from_axis_angle(b, PI * 0.5) * plane_dir1_b;

        // 下一锥平面内的两条线与本锥平面求交，得到两平面交线上的两点
        let ray1 = Ray::from_points(plane_dir1_b, scaled_axis_b);
        let ray2 = Ray::from_points(plane_dir1_b, plane_dir2_b);

        let i1 = match ray1.intersects_plane(scaled_axis_a, plane_dir1_a, plane_dir2_a) {
            Some(p) => p,
            None => return,
        };
        let i2 = match ray2.intersects_plane(scaled_axis_a, plane_dir1_a, plane_dir2_a) {
            Some(p) => p,
            None => return,
        };

        // 交线与单位球求交即两个相切圆心
        let (s1, s2) = match Ray::from_points(i1, i2).intersects_unit_sphere() {
            Some(pair) => pair,
            None => return,
        };

        // 按弧法线侧别规范化：1 在正侧，2 在负侧
        let (c1, c2) = if s1.dot(arc_normal_unit) >= 0.0 { (s1, s2) } else { (s2, s1) };

        self.tangent_center_1 = c1;
        self.tangent_center_2 = c2;
        self.tangent_radius = t_radius;
        self.tangent_radius_cos = t_radius.cos();
        self.edge_valid = true;
    }

    /// dir 所在侧的相切圆心（弧法线分隔两侧）
    #[inline]
    fn side_tangent_center(&self, next: &LimitCone, dir: Vec3) -> Vec3 {
        let arc_normal = self.control_point.cross(next.control_point);
        if dir.dot(arc_normal) < 0.0 {
            self.tangent_center_2
        } else {
            self.tangent_center_1
        }
    }

    /// dir 的方位是否落在本锥与 next 之间的"透镜"楔形里
    ///
    /// 分离平面测试：两锥轴叉积定侧，再用锥轴与该侧相切圆心的
    /// 叉积界定两条大圆边。
    pub fn in_wedge(&self, next: &LimitCone, dir: Vec3) -> bool {
        if !self.edge_valid {
            return false;
        }
        let a = self.control_point;
        let b = next.control_point;
        let arc_normal = a.cross(b);
        let c = self.side_tangent_center(next, dir);
        if dir.dot(arc_normal) < 0.0 {
            dir.dot(a.cross(c)) > 0.0 && dir.dot(c.cross(b)) > 0.0
        } else {
            dir.dot(a.cross(c)) < 0.0 && dir.dot(c.cross(b)) < 0.0
        }
    }

    /// dir 是否在 本锥 ∪ 走廊 ∪ next 的合法区内
    pub fn in_bounds_from_this_to_next(&self, next: &LimitCone, dir: Vec3) -> bool {
        if self.in_bounds(dir) || next.in_bounds(dir) {
            return true;
        }
        if !self.edge_valid {
            return false;
        }
        // 相切圆内部是非法区
        if dir.dot(self.tangent_center_1) > self.tangent_radius_cos
            || dir.dot(self.tangent_center_2) > self.tangent_radius_cos
        {
            return false;
        }
        self.in_wedge(next, dir)
    }

    /// 走廊边界上距 dir 最近的点（dir 在楔形内且陷入相切圆时）
    ///
    /// 把该侧相切圆心沿大圆向 dir 转过走廊半径。
    pub fn corridor_boundary_point(&self, next: &LimitCone, dir: Vec3) -> Option<Vec3> {
        if !self.edge_valid || !self.in_wedge(next, dir) {
            return None;
        }
        let c = self.side_tangent_center(next, dir);
        if dir.dot(c) <= self.tangent_radius_cos {
            return None;
        }
        let axis = c.cross(dir);
        let axis = if axis.length_squared() < EPSILON {
            c.any_orthonormal_vector()
        } else {
            axis.normalize()
        };
        Some(Quat::from_axis_angle(axis, self.tangent_radius) * c)
    }

    /// 合法区"脊线"上距 dir 最近的点（回拉用）
    ///
    /// 楔形内投影到两锥轴的大圆弧；楔形外取较近的锥轴。
    pub fn path_point(&self, next: &LimitCone, dir: Vec3) -> Vec3 {
        if self.edge_valid && self.in_wedge(next, dir) {
            let n = self.control_point.cross(next.control_point);
            if n.length_squared() >= EPSILON {
                let n = n.normalize();
                let projected = dir - n * dir.dot(n);
                if projected.length_squared() >= EPSILON {
                    return projected.normalize();
                }
            }
        }
        if dir.dot(self.control_point) >= dir.dot(next.control_point) {
            self.control_point
        } else {
            next.control_point
        }
    }

    /// 锥轴旋到给定方向（工具，测试用）
    pub fn rotation_to(&self, dir: Vec3) -> Quat {
        rotation_between(self.control_point, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_bounds() {
        let cone = LimitCone::new(Vec3::Y, 0.5, 1.0);
        assert!(cone.in_bounds(Vec3::Y));
        let inside = Quat::from_rotation_z(0.3) * Vec3::Y;
        let outside = Quat::from_rotation_z(0.8) * Vec3::Y;
        assert!(cone.in_bounds(inside));
        assert!(!cone.in_bounds(outside));
    }

    #[test]
    fn test_closest_on_boundary() {
        // 半径 r 的锥，候选在 2r 处，贴合点应正好在距轴 r 的大圆上
        let r = 0.4;
        let cone = LimitCone::new(Vec3::Y, r, 1.0);
        let candidate = Quat::from_rotation_z(2.0 * r) * Vec3::Y;
        let snapped = cone.closest_on_boundary(candidate);
        let angle_to_axis = snapped.dot(Vec3::Y).clamp(-1.0, 1.0).acos();
        assert!((angle_to_axis - r).abs() < 1e-4);
        // 贴合点在轴与候选确定的大圆上
        let plane_normal = Vec3::Y.cross(candidate).normalize();
        assert!(snapped.dot(plane_normal).abs() < 1e-4);
    }

    #[test]
    fn test_tangent_handles() {
        // 两个等半径锥，夹角 θ > 2r：走廊半径 = (π − 2r)/2
        let r = 0.3;
        let theta = 1.2;
        let a = LimitCone::new(Vec3::Y, r, 1.0);
        let b_dir = Quat::from_rotation_z(-theta) * Vec3::Y;
        let b = LimitCone::new(b_dir, r, 1.0);
        let mut a = a;
        a.update_tangent_handles(&b);

        assert!((a.tangent_radius() - (PI - 2.0 * r) * 0.5).abs() < 1e-5);

        // 相切圆心必须与两锥都正好相距 r + t
        let expect = r + a.tangent_radius();
        for c in [a.tangent_center_1, a.tangent_center_2] {
            assert!((c.length() - 1.0).abs() < 1e-3);
            let to_a = c.dot(a.control_point()).clamp(-1.0, 1.0).acos();
            let to_b = c.dot(b.control_point()).clamp(-1.0, 1.0).acos();
            assert!((to_a - expect).abs() < 1e-3, "to_a={} expect={}", to_a, expect);
            assert!((to_b - expect).abs() < 1e-3, "to_b={} expect={}", to_b, expect);
        }
    }

    #[test]
    fn test_degenerate_parallel_cones() {
        let mut a = LimitCone::new(Vec3::Y, 0.3, 1.0);
        let b = LimitCone::new(Vec3::Y, 0.3, 1.0);
        a.update_tangent_handles(&b);
        // 近平行锥无走廊，但不会产生 NaN
        assert!(!a.in_wedge(&b, Vec3::X));
        assert!(a.in_bounds_from_this_to_next(&b, Vec3::Y));
    }

    #[test]
    fn test_corridor_midpoint() {
        // 两锥之间大圆中点在走廊脊线上，应当合法
        let r = 0.25;
        let theta = 1.4;
        let mut a = LimitCone::new(Vec3::Y, r, 1.0);
        let b = LimitCone::new(Quat::from_rotation_z(-theta) * Vec3::Y, r, 1.0);
        a.update_tangent_handles(&b);

        let midpoint = Quat::from_rotation_z(-theta / 2.0) * Vec3::Y;
        assert!(a.in_bounds_from_this_to_next(&b, midpoint));

        // 从中点朝相切圆心偏转：越过圆边界即非法
        let t = a.tangent_radius();
        let c = a.tangent_center_1;
        let d0 = midpoint.dot(c).clamp(-1.0, 1.0).acos();
        let axis = midpoint.cross(c).normalize();

        let still_legal = Quat::from_axis_angle(axis, d0 - t - 0.02) * midpoint;
        assert!(a.in_bounds_from_this_to_next(&b, still_legal.normalize()));

        let inside_circle = Quat::from_axis_angle(axis, d0 - t + 0.02) * midpoint;
        assert!(!a.in_bounds_from_this_to_next(&b, inside_circle.normalize()));
    }
}
