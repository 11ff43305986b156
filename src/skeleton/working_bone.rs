//! 逐骨骼求解数据
//!
//! WorkingBone 缓存单根骨骼在一轮求解里用到的全部只读量：仿真帧
//! 下标、约束参考帧、阻尼角、回拉衰减表。旋转/平移的实际施加在
//! ShadowSkeleton 里进行，这里只放数据和 heading 采集的纯函数。

use std::f32::consts::PI;

use glam::Vec3;

use crate::math::Iso;
use crate::skeleton::frame::FrameArena;
use crate::skeleton::segment::SegmentEffector;
use crate::state::{SkeletonState, TargetAxes};

/// 一根可求解骨骼的工作数据
#[derive(Clone, Debug)]
pub struct WorkingBone {
    /// 烘焙骨骼下标
    pub bone: usize,
    /// 所属段（段数组下标）
    pub segment: usize,
    /// 骨骼仿真帧
    pub sim_frame: usize,
    /// 约束摆动参考帧
    pub swing_frame: Option<usize>,
    /// 约束扭转参考帧（缺省与摆动帧同帧）
    pub twist_frame: Option<usize>,
    /// 约束记录下标
    pub constraint: Option<usize>,
    /// 本骨骼单步最大旋转角
    pub dampening: f32,
    /// 回拉角表，按外层迭代下标衰减
    pub pullback_angles: Vec<f32>,
    /// 自由全局根：允许 QCP 平移分量
    pub may_translate: bool,
}

impl WorkingBone {
    /// 单步角度上限：min(全局阻尼, 逐骨骼阻尼)
    ///
    /// 逐骨骼阻尼无父骨骼取 π，有父骨骼按刚度折减全局阻尼。
    pub fn compute_dampening(has_parent: bool, stiffness: f32, global: f32) -> f32 {
        let per_bone = if has_parent {
            (1.0 - stiffness.clamp(0.0, 1.0)) * global
        } else {
            PI
        };
        global.min(per_bone)
    }

    /// 回拉角表：痛感 × 骨骼阻尼 × ((n-i)/n)²，随迭代递减到 0
    pub fn compute_pullback_angles(
        painfulness: f32,
        dampening: f32,
        iterations: usize,
    ) -> Vec<f32> {
        let n = iterations.max(1) as f32;
        (0..iterations.max(1))
            .map(|i| {
                let falloff = (n - i as f32) / n;
                painfulness * dampening * falloff * falloff
            })
            .collect()
    }
}

/// heading 采集来源
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadingSource {
    /// 效应器骨骼的当前位姿
    Tip,
    /// 效应器目标的位姿
    Target,
}

/// 采集一段的 heading 向量组，顺序与 Segment::weights 对应
///
/// 每个效应器：1 个原点差向量；每个启用轴再加 ± 两个基向量端点，
/// 轴长按 (1 + 骨骼原点到目标的距离) 缩放，保证远目标的朝向项
/// 与位置项量纲可比。`scaled=false` 用于稳定化的偏差度量。
#[allow(clippy::too_many_arguments)]
pub fn collect_headings(
    frames: &FrameArena,
    state: &SkeletonState,
    origin: Vec3,
    effectors: &[SegmentEffector],
    bone_sim_frame: &[usize],
    target_frames: &[Option<usize>],
    source: HeadingSource,
    scaled: bool,
    out: &mut Vec<Vec3>,
) {
    out.clear();
    for e in effectors {
        let Some(tf) = target_frames[e.target] else {
            continue;
        };
        let target_iso = frames.global(tf);
        let frame_iso: &Iso = match source {
            HeadingSource::Tip => frames.global(bone_sim_frame[e.bone]),
            HeadingSource::Target => target_iso,
        };
        let scale = if scaled {
            1.0 + (target_iso.translation - origin).length()
        } else {
            1.0
        };

        out.push(frame_iso.translation - origin);
        let t = state.target(e.target);
        let mode = t.mode();
        for (axis, flag) in [TargetAxes::X_DIR, TargetAxes::Y_DIR, TargetAxes::Z_DIR]
            .into_iter()
            .enumerate()
        {
            if mode.contains(flag) {
                let dir = frame_iso.basis(axis) * scale;
                out.push(frame_iso.translation + dir - origin);
                out.push(frame_iso.translation - dir - origin);
            }
        }
    }
}

/// 加权均方偏差
pub fn weighted_msd(tips: &[Vec3], targets: &[Vec3], weights: &[f32]) -> f32 {
    let mut sum = 0.0;
    let mut wsum = 0.0;
    for i in 0..tips.len().min(targets.len()).min(weights.len()) {
        sum += weights[i] * (tips[i] - targets[i]).length_squared();
        wsum += weights[i];
    }
    if wsum > 0.0 {
        sum / wsum
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_4;

    #[test]
    fn test_dampening_rules() {
        let d = WorkingBone::compute_dampening(true, 0.5, FRAC_PI_4);
        assert!((d - FRAC_PI_4 * 0.5).abs() < 1e-6);
        // 无父骨骼：min(全局, π)
        assert!(
            (WorkingBone::compute_dampening(false, 0.9, FRAC_PI_4) - FRAC_PI_4).abs() < 1e-6
        );
        assert!((WorkingBone::compute_dampening(false, 0.0, 4.0) - PI).abs() < 1e-6);
        // 刚度 1 完全锁死
        assert_eq!(WorkingBone::compute_dampening(true, 1.0, FRAC_PI_4), 0.0);
    }

    #[test]
    fn test_pullback_angles_decay() {
        let angles = WorkingBone::compute_pullback_angles(0.5, 0.2, 4);
        assert_eq!(angles.len(), 4);
        // 首项 = 痛感 × 阻尼，随后二次衰减
        assert!((angles[0] - 0.1).abs() < 1e-6);
        for w in angles.windows(2) {
            assert!(w[1] < w[0]);
        }
        assert!((angles[3] - 0.1 * (0.25f32 * 0.25)).abs() < 1e-7);
    }

    #[test]
    fn test_weighted_msd() {
        let tips = [Vec3::ZERO, Vec3::X];
        let targets = [Vec3::ZERO, Vec3::new(3.0, 0.0, 0.0)];
        let weights = [1.0, 1.0];
        // (0 + 4) / 2
        assert!((weighted_msd(&tips, &targets, &weights) - 2.0).abs() < 1e-6);
        // 权重偏向已对齐的点
        let skew = [3.0, 1.0];
        assert!(weighted_msd(&tips, &targets, &skew) < 2.0);
    }
}
