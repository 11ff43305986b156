//! 分段式 QCP 逆运动学引擎
//!
//! 核心设计思想：
//! - SkeletonState: 调用方提供的骨架状态边界（骨骼/变换/目标/约束记录）
//! - Segment: 在效应器与分叉处把骨骼树切分为可求解的段
//! - ShadowSkeleton: 一次性仿真副本，自末梢向根扫描求解
//! - Qcp: 加权刚体叠合拟合，每个骨骼级求解步的数值原语
//! - Kusudama: 球窝约束（相切锥序列 + 轴向扭转窗口）
//!
//! 求解流程：注册 SkeletonState → 分段 → 构建影子骨架 →
//! `solve(iterations)` 扫描遍历数组 → 写回权威变换。

pub mod config;
pub mod constraint;
pub mod math;
pub mod skeleton;
pub mod solver;
pub mod state;

pub use config::{get_config, set_config, with_config, SolverConfig};
pub use constraint::{Constraint, Kusudama, LimitCone};
pub use math::{qcp::Qcp, Iso};
pub use skeleton::{Segment, ShadowSkeleton, WorkingBone};
pub use solver::IkSolver;
pub use state::{
    BoneState, ConstraintState, SkeletonState, TargetAxes, TargetState, TransformState,
};

use thiserror::Error;

// ============================================================================
// 错误类型
// ============================================================================

/// 引擎错误
///
/// 结构性缺陷在注册/校验阶段作为硬错误报告，阻止影子骨架构建；
/// 数值退化情形不报错，在 epsilon 保护下退化为恒等变换。
#[derive(Error, Debug)]
pub enum IkError {
    /// 没有根骨骼
    #[error("skeleton has no root bone")]
    MissingRoot,

    /// 多于一个根骨骼
    #[error("skeleton has multiple root bones: '{0}' and '{1}'")]
    MultipleRoots(String, String),

    /// 悬空引用（外键无法解析）
    #[error("dangling {kind} reference '{id}'")]
    DanglingRef {
        /// 引用种类（bone/transform/target/constraint）
        kind: &'static str,
        /// 无法解析的 id
        id: String,
    },

    /// 骨骼变换的父级与父骨骼的变换不一致
    #[error("transform hierarchy mismatch for bone '{0}'")]
    TransformHierarchyMismatch(String),

    /// 骨骼树存在环
    #[error("cycle detected in bone hierarchy at '{0}'")]
    Cycle(String),

    /// 约束挂在根骨骼上
    #[error("constraint '{0}' attached to root bone")]
    ConstraintOnRoot(String),

    /// 目标记录非法（权重非正 / 变换未直接挂在骨架空间下）
    #[error("invalid target '{id}': {reason}")]
    InvalidTarget {
        /// 目标 id
        id: String,
        /// 非法原因
        reason: String,
    },

    /// 尚未注册骨架状态
    #[error("no skeleton state registered")]
    NotRegistered,
}

/// 引擎 Result 别名
pub type Result<T> = std::result::Result<T, IkError>;
