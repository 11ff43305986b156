//! 球窝约束 (Kusudama)
//!
//! 合法摆动区 = 有序限制锥序列的扫掠并集加上相邻锥之间的相切
//! 走廊（只有相邻锥相连，锥序有意义），另加一个绕约束本地 Y 轴
//! 的轴向扭转窗口。
//!
//! 贴合顺序：先朝向修正，再扭转修正。

use glam::{Quat, Vec3};
use std::f32::consts::TAU;

use super::{Constraint, LimitCone};
use crate::math::{
    normalize_angle, rotation_between, swing_twist, twist_angle_about, Iso, EPSILON,
};

/// 球窝约束
#[derive(Clone, Debug, Default)]
pub struct Kusudama {
    limit_cones: Vec<LimitCone>,
    /// 扭转窗口起点（弧度）
    min_axial_angle: f32,
    /// 扭转窗口宽度 [0, 2π]
    range: f32,
    axially_constrained: bool,
}

impl Kusudama {
    pub fn new() -> Self {
        Self {
            limit_cones: Vec::new(),
            min_axial_angle: 0.0,
            range: TAU,
            axially_constrained: false,
        }
    }

    // ========================================
    // 编辑
    // ========================================

    /// 追加一个限制锥并重算相切圆
    pub fn add_limit_cone(&mut self, direction: Vec3, radius: f32, cushion: f32) {
        self.limit_cones.push(LimitCone::new(direction, radius, cushion));
        self.update_tangent_handles();
    }

    /// 设置扭转窗口（最小角 + 角范围）
    pub fn set_axial_limits(&mut self, min_axial_angle: f32, range: f32) {
        self.min_axial_angle = normalize_angle(min_axial_angle);
        self.range = range.clamp(0.0, TAU);
        self.axially_constrained = true;
    }

    /// 关闭扭转窗口
    pub fn disable_axial_limits(&mut self) {
        self.axially_constrained = false;
    }

    /// 重算全部相邻锥对的相切圆（每次锥编辑后调用一次）
    pub fn update_tangent_handles(&mut self) {
        for i in 0..self.limit_cones.len().saturating_sub(1) {
            let (head, tail) = self.limit_cones.split_at_mut(i + 1);
            head[i].update_tangent_handles(&tail[0]);
        }
    }

    #[inline]
    pub fn limit_cones(&self) -> &[LimitCone] {
        &self.limit_cones
    }

    #[inline]
    pub fn orientationally_constrained(&self) -> bool {
        !self.limit_cones.is_empty()
    }

    #[inline]
    pub fn axially_constrained(&self) -> bool {
        self.axially_constrained
    }

    #[inline]
    pub fn min_axial_angle(&self) -> f32 {
        self.min_axial_angle
    }

    #[inline]
    pub fn axial_range(&self) -> f32 {
        self.range
    }

    // ========================================
    // 区域查询
    // ========================================

    /// 候选方向（约束本地系）的合法性与最近合法点
    ///
    /// 合法 ⇔ 在某个锥的扫掠内，或在相邻锥对的相切走廊内。
    /// 非法时在各锥边界最近点与各走廊边界最近点中取与候选
    /// 夹角最小者。零长候选视为合法（无修正）。
    pub fn point_in_limits(&self, dir: Vec3) -> (bool, Vec3) {
        let d = dir.normalize_or_zero();
        if d.length_squared() < EPSILON || self.limit_cones.is_empty() {
            return (true, dir);
        }

        if self.limit_cones.len() == 1 {
            let cone = &self.limit_cones[0];
            return if cone.in_bounds(d) {
                (true, d)
            } else {
                (false, cone.closest_on_boundary(d))
            };
        }

        for i in 0..self.limit_cones.len() - 1 {
            if self.limit_cones[i].in_bounds_from_this_to_next(&self.limit_cones[i + 1], d) {
                return (true, d);
            }
        }

        // 非法：收集候选边界点，取余弦最大
        let mut best = self.limit_cones[0].closest_on_boundary(d);
        let mut best_cos = best.dot(d);
        for cone in &self.limit_cones[1..] {
            let p = cone.closest_on_boundary(d);
            let c = p.dot(d);
            if c > best_cos {
                best = p;
                best_cos = c;
            }
        }
        for i in 0..self.limit_cones.len() - 1 {
            if let Some(p) =
                self.limit_cones[i].corridor_boundary_point(&self.limit_cones[i + 1], d)
            {
                let c = p.dot(d);
                if c > best_cos {
                    best = p;
                    best_cos = c;
                }
            }
        }
        (false, best)
    }

    /// 合法区"脊线"上距 dir 最近的点（回拉的舒适姿态方向）
    pub fn point_on_path_sequence(&self, dir: Vec3) -> Vec3 {
        let d = dir.normalize_or_zero();
        if d.length_squared() < EPSILON || self.limit_cones.is_empty() {
            return dir;
        }
        if self.limit_cones.len() == 1 {
            return self.limit_cones[0].control_point();
        }
        let mut best = self.limit_cones[0].control_point();
        let mut best_cos = best.dot(d);
        for i in 0..self.limit_cones.len() - 1 {
            let p = self.limit_cones[i].path_point(&self.limit_cones[i + 1], d);
            let c = p.dot(d);
            if c > best_cos {
                best = p;
                best_cos = c;
            }
        }
        best
    }

    /// dir 是否已落在某个锥的软垫（舒适）半径内
    fn in_cushion(&self, dir: Vec3) -> bool {
        self.limit_cones
            .iter()
            .any(|c| dir.dot(c.control_point()) >= c.cushion_cos())
    }

    // ========================================
    // 扭转
    // ========================================

    /// 扭转角归一化到窗口起点起算的 [0, 2π)
    fn twist_from_min(&self, align: Quat) -> f32 {
        let twist = twist_angle_about(align, Vec3::Y);
        normalize_angle(normalize_angle(twist) - self.min_axial_angle)
    }

    /// 扭转修正：窗口外旋向较近的窗口边界
    ///
    /// `align` 为骨骼旋转在扭转参考系本地的表达，返回修正后的本地旋转。
    fn corrected_twist(&self, align: Quat, target_from_min: Option<f32>) -> Option<Quat> {
        let from_min = self.twist_from_min(align);
        let new_from_min = match target_from_min {
            Some(t) => t,
            None => {
                if from_min <= self.range {
                    return None;
                }
                let dist_past = from_min - self.range;
                let dist_to_min = TAU - from_min;
                if dist_to_min < dist_past {
                    0.0
                } else {
                    self.range
                }
            }
        };
        let (swing, _) = swing_twist(align, Vec3::Y);
        let corrected =
            swing * Quat::from_rotation_y(self.min_axial_angle + new_from_min);
        Some(corrected.normalize())
    }
}

impl Constraint for Kusudama {
    fn snap(&self, bone_global: &Iso, swing_global: &Iso, twist_global: &Iso) -> Quat {
        let mut total = Quat::IDENTITY;
        let mut current_rot = bone_global.rotation;

        // 朝向修正
        if self.orientationally_constrained() {
            let y_global = current_rot * Vec3::Y;
            let local_y = swing_global.rotation.conjugate() * y_global;
            let (legal, nearest) = self.point_in_limits(local_y);
            if !legal {
                let corrected_global = swing_global.rotation * nearest;
                let rot = rotation_between(y_global, corrected_global);
                total = rot;
                current_rot = (rot * current_rot).normalize();
            }
        }

        // 扭转修正
        if self.axially_constrained {
            let align = (twist_global.rotation.conjugate() * current_rot).normalize();
            if let Some(corrected_align) = self.corrected_twist(align, None) {
                let corrected_global = (twist_global.rotation * corrected_align).normalize();
                let rot = (corrected_global * current_rot.conjugate()).normalize();
                total = (rot * total).normalize();
            }
        }

        total
    }

    fn pull_back_toward_comfort(
        &self,
        bone_global: &Iso,
        swing_global: &Iso,
        twist_global: &Iso,
    ) -> Quat {
        let mut total = Quat::IDENTITY;
        let mut current_rot = bone_global.rotation;

        // 朝向拉向脊线；软垫半径内视为已舒适
        if self.orientationally_constrained() {
            let y_global = current_rot * Vec3::Y;
            let local_y = (swing_global.rotation.conjugate() * y_global).normalize_or_zero();
            if local_y.length_squared() >= EPSILON && !self.in_cushion(local_y) {
                let comfort = self.point_on_path_sequence(local_y);
                let rot = rotation_between(y_global, swing_global.rotation * comfort);
                total = rot;
                current_rot = (rot * current_rot).normalize();
            }
        }

        // 扭转拉向窗口中心
        if self.axially_constrained {
            let align = (twist_global.rotation.conjugate() * current_rot).normalize();
            let center = self.range * 0.5;
            if (self.twist_from_min(align) - center).abs() > EPSILON {
                if let Some(corrected_align) = self.corrected_twist(align, Some(center)) {
                    let corrected_global =
                        (twist_global.rotation * corrected_align).normalize();
                    let rot = (corrected_global * current_rot.conjugate()).normalize();
                    total = (rot * total).normalize();
                }
            }
        }

        total
    }
}
