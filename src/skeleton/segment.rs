//! 链段划分
//!
//! 把烘焙后的骨骼树切成可独立求解的链段：边界落在带目标的骨骼、
//! 以及拥有多于一个含目标子树的分叉骨骼上。段内骨骼按根→梢存放，
//! 段与段的关系分两类：
//!
//! - child_segments：边界目标 depth_falloff == 0，下游对本段不可见，
//!   子段基座视为钉住；
//! - sub_segments：边界目标 depth_falloff > 0（或边界只是分叉），
//!   下游效应器仍计入本段，权重乘衰减积。
//!
//! 段数组按后序（后代在前）填充，按下标顺序遍历即是求解顺序。

use crate::state::{SkeletonState, TargetAxes};

/// 段可达的一个钉住效应器
#[derive(Clone, Copy, Debug)]
pub struct SegmentEffector {
    /// 效应器骨骼（烘焙下标）
    pub bone: usize,
    /// 目标记录下标
    pub target: usize,
    /// 沿途 depth_falloff 的累积积
    pub falloff: f32,
}

/// 一条可求解的链段
#[derive(Clone, Debug)]
pub struct Segment {
    /// 段内骨骼，根→梢（烘焙下标）
    pub bones: Vec<usize>,
    /// 下游独立子段（段数组下标）
    pub child_segments: Vec<usize>,
    /// 下游透明子段（段数组下标）
    pub sub_segments: Vec<usize>,
    /// 本段求解时要满足的效应器
    pub effectors: Vec<SegmentEffector>,
    /// 基座钉住：父骨骼自带效应器
    pub base_pinned: bool,
    /// 祖先链上存在任何效应器骨骼
    pub has_pinned_ancestor: bool,
    /// QCP 权重，与 heading 条目一一对应
    pub weights: Vec<f32>,
}

impl Segment {
    #[inline]
    pub fn root_bone(&self) -> usize {
        self.bones[0]
    }

    #[inline]
    pub fn tip_bone(&self) -> usize {
        self.bones[self.bones.len() - 1]
    }

    /// 可达效应器个数
    #[inline]
    pub fn descendant_effector_count(&self) -> usize {
        self.effectors.len()
    }

    /// 权重数组：每个效应器 1 个位置条目 + 每个启用轴 2 个朝向条目
    fn build_weights(&mut self, state: &SkeletonState) {
        self.weights.clear();
        for e in &self.effectors {
            let t = state.target(e.target);
            let max_p = t.max_priority();
            self.weights.push(t.weight * e.falloff);
            for (axis, flag) in [TargetAxes::X_DIR, TargetAxes::Y_DIR, TargetAxes::Z_DIR]
                .into_iter()
                .enumerate()
            {
                if t.mode().contains(flag) {
                    let w = t.weight * (t.priorities[axis] / max_p) * e.falloff;
                    self.weights.push(w);
                    self.weights.push(w);
                }
            }
        }
    }
}

/// 整棵树的段划分
#[derive(Clone, Debug, Default)]
pub struct Segmentation {
    /// 后序排列：后代段在祖先段之前
    pub segments: Vec<Segment>,
    /// 根段下标（段数组末位）
    pub root_segment: usize,
}

impl Segmentation {
    pub fn build(state: &SkeletonState) -> Self {
        if state.bone_count() == 0 {
            return Self::default();
        }
        // 子树是否含启用目标（烘焙目标权重恒 > 0）
        let n = state.bone_count();
        let mut subtree_target = vec![false; n];
        for idx in (0..n).rev() {
            let own = state.baked_bone(idx).target.is_some();
            let from_children = state
                .baked_children(idx)
                .iter()
                .any(|&c| subtree_target[c]);
            subtree_target[idx] = own || from_children;
        }

        let mut segments = Vec::new();
        let root_segment =
            build_segment(state, &subtree_target, 0, false, false, &mut segments);
        Self { segments, root_segment }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// 从 start 向梢端生长一条段，递归建完下游后压入段数组，返回自身下标
fn build_segment(
    state: &SkeletonState,
    subtree_target: &[bool],
    start: usize,
    base_pinned: bool,
    has_pinned_ancestor: bool,
    segments: &mut Vec<Segment>,
) -> usize {
    let mut bones = Vec::new();
    let mut current = start;
    loop {
        bones.push(current);
        if state.baked_bone(current).target.is_some() {
            break;
        }
        let effector_children: Vec<usize> = state
            .baked_children(current)
            .iter()
            .copied()
            .filter(|&c| subtree_target[c])
            .collect();
        match effector_children.len() {
            0 => break,
            1 => current = effector_children[0],
            _ => break,
        }
    }

    let tip = *bones.last().unwrap_or(&start);
    let tip_target = state.baked_bone(tip).target;
    let tip_falloff = tip_target.map(|t| state.target(t).depth_falloff);

    // 自此向下，祖先链必然包含 tip（若 tip 带效应器则对下游为钉住）
    let child_pinned_ancestor = has_pinned_ancestor || tip_target.is_some();

    let mut child_segments = Vec::new();
    let mut sub_segments = Vec::new();
    for &child in state.baked_children(tip) {
        if !subtree_target[child] {
            continue;
        }
        let idx = build_segment(
            state,
            subtree_target,
            child,
            tip_target.is_some(),
            child_pinned_ancestor,
            segments,
        );
        match tip_falloff {
            Some(f) if f <= 0.0 => child_segments.push(idx),
            _ => sub_segments.push(idx),
        }
    }

    // 效应器集合：自身目标 + 透明子段的效应器乘边界衰减
    let mut effectors = Vec::new();
    if let Some(t) = tip_target {
        effectors.push(SegmentEffector { bone: tip, target: t, falloff: 1.0 });
    }
    let scale = tip_falloff.unwrap_or(1.0);
    if scale > 0.0 {
        for &s in &sub_segments {
            for e in &segments[s].effectors {
                effectors.push(SegmentEffector {
                    bone: e.bone,
                    target: e.target,
                    falloff: e.falloff * scale,
                });
            }
        }
    }

    let mut segment = Segment {
        bones,
        child_segments,
        sub_segments,
        effectors,
        base_pinned,
        has_pinned_ancestor,
        weights: Vec::new(),
    };
    segment.build_weights(state);
    segments.push(segment);
    segments.len() - 1
}
