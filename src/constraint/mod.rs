//! 关节约束
//!
//! 约束是一个能力边界：求解器只通过 [`Constraint`] 的两个操作
//! 使用调用方的具体约束对象。球窝约束 (Kusudama) 是当前唯一的
//! 实现，但边界允许其它变体。

mod kusudama;
mod limit_cone;

pub use kusudama::Kusudama;
pub use limit_cone::LimitCone;

use glam::Quat;

use crate::math::Iso;

/// 约束能力
///
/// 两个操作都接收骨骼仿真帧与约束参考系的全局位姿，返回一个
/// 施加于骨骼帧的全局修正旋转（绕骨骼原点）。
pub trait Constraint {
    /// 合法性贴合：先做朝向修正，再做扭转修正
    ///
    /// 位姿已经合法时返回恒等。
    fn snap(&self, bone_global: &Iso, swing_global: &Iso, twist_global: &Iso) -> Quat;

    /// 回拉：指向合法区"舒适"中心的完整修正旋转
    ///
    /// 调用方负责按回拉衰减把幅度钳制成部分步进。
    fn pull_back_toward_comfort(
        &self,
        bone_global: &Iso,
        swing_global: &Iso,
        twist_global: &Iso,
    ) -> Quat;
}
