//! 影子骨架
//!
//! 注册时从 SkeletonState 一次性构建：仿真帧池（骨骼帧、目标帧、
//! 约束参考帧）、段划分、以及末梢在前的遍历序。每次求解先把权威
//! 变换值刷进帧池，迭代完再写回骨骼本地变换——目标与约束帧只读。
//!
//! 单骨骼一步：采集 tip/target heading 组 → QCP 加权叠合 → 旋转
//! 钳制到骨骼阻尼 → 施加 → 约束贴合 →（自由根）平移。稳定化开启
//! 时用未缩放偏差做比较，变差即回退本步旋转。

use glam::Quat;

use crate::config::get_config;
use crate::math::{clamp_rotation, qcp::Qcp, to_shortest_axis_angle, EPSILON};
use crate::skeleton::frame::FrameArena;
use crate::skeleton::segment::Segmentation;
use crate::skeleton::working_bone::{
    collect_headings, weighted_msd, HeadingSource, WorkingBone,
};
use crate::state::SkeletonState;

pub struct ShadowSkeleton {
    segmentation: Segmentation,
    frames: FrameArena,
    /// 求解顺序：段后序 × 段内末梢在前
    traversal: Vec<WorkingBone>,
    /// 烘焙骨骼 → 仿真帧
    bone_sim_frame: Vec<usize>,
    /// 目标记录 → 仿真帧（未挂骨骼的为 None）
    target_frames: Vec<Option<usize>>,
    qcp: Qcp,
    /// 全局阻尼角
    dampening: f32,
    /// 回拉角表对应的迭代数（0 = 未生成）
    pullback_iterations: usize,
    // heading 暂存，按段复用
    tip_headings: Vec<glam::Vec3>,
    target_headings: Vec<glam::Vec3>,
}

impl ShadowSkeleton {
    /// 从烘焙完成的状态构建
    pub fn build(state: &SkeletonState, dampening: f32) -> Self {
        let mut frames = FrameArena::new();

        // 骨骼帧：烘焙序父先于子
        let mut bone_sim_frame = Vec::with_capacity(state.bone_count());
        for idx in 0..state.bone_count() {
            let parent = state.baked_bone(idx).parent.map(|p| bone_sim_frame[p]);
            bone_sim_frame.push(frames.push(state.bone_local(idx), parent));
        }

        // 目标帧：骨架空间直挂
        let mut target_frames = vec![None; state.target_count()];
        for idx in 0..state.bone_count() {
            if let Some(t) = state.baked_bone(idx).target {
                target_frames[t] = Some(frames.push(state.target_iso(t), None));
            }
        }

        let segmentation = Segmentation::build(state);

        // 遍历序 + 约束参考帧。约束帧挂在父骨骼帧下（校验已排除根约束）
        let mut traversal = Vec::new();
        let global_damp = dampening;
        for (seg_idx, segment) in segmentation.segments.iter().enumerate() {
            for &bone in segment.bones.iter().rev() {
                let baked = state.baked_bone(bone);
                let (swing_frame, twist_frame) = match baked.constraint {
                    Some(c) => {
                        let parent_sim = baked.parent.map(|p| bone_sim_frame[p]);
                        let (swing_iso, twist_iso) = state.constraint_frames(c);
                        let swing = frames.push(swing_iso, parent_sim);
                        let twist = twist_iso.map(|t| frames.push(t, parent_sim));
                        (Some(swing), twist)
                    }
                    None => (None, None),
                };
                let may_translate = bone == segment.root_bone()
                    && !segment.base_pinned
                    && !segment.has_pinned_ancestor
                    && baked.parent.is_none();
                traversal.push(WorkingBone {
                    bone,
                    segment: seg_idx,
                    sim_frame: bone_sim_frame[bone],
                    swing_frame,
                    twist_frame,
                    constraint: baked.constraint,
                    dampening: WorkingBone::compute_dampening(
                        baked.parent.is_some(),
                        baked.stiffness,
                        global_damp,
                    ),
                    pullback_angles: Vec::new(),
                    may_translate,
                });
            }
        }

        let mut shadow = Self {
            segmentation,
            frames,
            traversal,
            bone_sim_frame,
            target_frames,
            qcp: Qcp::new(),
            dampening,
            pullback_iterations: 0,
            tip_headings: Vec::new(),
            target_headings: Vec::new(),
        };
        shadow.frames.update_all();
        log::debug!(
            "[Shadow] 构建完成: {} 骨骼帧, {} 段, {} 可解骨骼",
            shadow.bone_sim_frame.len(),
            shadow.segmentation.len(),
            shadow.traversal.len()
        );
        shadow
    }

    #[inline]
    pub fn segmentation(&self) -> &Segmentation {
        &self.segmentation
    }

    #[inline]
    pub fn traversal(&self) -> &[WorkingBone] {
        &self.traversal
    }

    /// 更新全局阻尼；逐骨骼阻尼与回拉表一并重算
    pub fn set_dampening(&mut self, state: &SkeletonState, dampening: f32) {
        self.dampening = dampening;
        for wb in &mut self.traversal {
            let baked = state.baked_bone(wb.bone);
            wb.dampening = WorkingBone::compute_dampening(
                baked.parent.is_some(),
                baked.stiffness,
                dampening,
            );
        }
        self.pullback_iterations = 0;
    }

    /// 把权威变换值刷进仿真帧并重建全局缓存
    fn refresh(&mut self, state: &SkeletonState) {
        for idx in 0..state.bone_count() {
            self.frames.set_local(self.bone_sim_frame[idx], state.bone_local(idx));
        }
        for (t, frame) in self.target_frames.iter().enumerate() {
            if let Some(f) = *frame {
                self.frames.set_local(f, state.target_iso(t));
            }
        }
        for wb in &self.traversal {
            if let (Some(c), Some(sf)) = (wb.constraint, wb.swing_frame) {
                let (swing_iso, twist_iso) = state.constraint_frames(c);
                self.frames.set_local(sf, swing_iso);
                if let (Some(tf), Some(ti)) = (wb.twist_frame, twist_iso) {
                    self.frames.set_local(tf, ti);
                }
            }
        }
        self.frames.update_all();
    }

    /// 骨骼本地变换写回权威状态（目标与约束帧不回写）
    fn write_back(&mut self, state: &mut SkeletonState) {
        for idx in 0..state.bone_count() {
            let local = *self.frames.local(self.bone_sim_frame[idx]);
            let transform = state.baked_bone(idx).transform;
            state.transform_mut(transform).set_from_iso(&local);
        }
    }

    /// 迭代数变化时重建回拉角表
    fn ensure_pullback(&mut self, state: &SkeletonState, iterations: usize) {
        if self.pullback_iterations == iterations {
            return;
        }
        for wb in &mut self.traversal {
            wb.pullback_angles = match wb.constraint {
                Some(c) => {
                    let painfulness = state.constraint_state(c).painfulness;
                    if painfulness > 0.0 {
                        WorkingBone::compute_pullback_angles(
                            painfulness,
                            wb.dampening,
                            iterations,
                        )
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            };
        }
        self.pullback_iterations = iterations;
    }

    /// 一趟回拉：末梢在前，把每根弹性骨骼向舒适区推进一个衰减步
    fn pull_back_pass(&mut self, state: &SkeletonState, iteration: usize) {
        for ti in 0..self.traversal.len() {
            let (sim, constraint, swing_frame, twist_frame, angle) = {
                let wb = &self.traversal[ti];
                if wb.pullback_angles.is_empty() {
                    continue;
                }
                let i = iteration.min(wb.pullback_angles.len() - 1);
                (
                    wb.sim_frame,
                    wb.constraint,
                    wb.swing_frame,
                    wb.twist_frame,
                    wb.pullback_angles[i],
                )
            };
            let (Some(c), Some(sf)) = (constraint, swing_frame) else {
                continue;
            };
            if angle <= EPSILON {
                continue;
            }
            let bone_g = *self.frames.global(sim);
            let swing_g = *self.frames.global(sf);
            let twist_g = *self.frames.global(twist_frame.unwrap_or(sf));
            let full = state
                .constraint_state(c)
                .constraint
                .pull_back_toward_comfort(&bone_g, &swing_g, &twist_g);
            let step = clamp_rotation(full, angle);
            if !near_identity(step) {
                self.frames.rotate_by_global(sim, step);
            }
        }
    }

    /// 单骨骼一步求解
    fn solve_bone(
        &mut self,
        state: &SkeletonState,
        ti: usize,
        stabilization: usize,
        tolerance: f32,
    ) {
        let (sim, seg_idx, dampening, may_translate, constraint, swing_frame, twist_frame) = {
            let wb = &self.traversal[ti];
            (
                wb.sim_frame,
                wb.segment,
                wb.dampening,
                wb.may_translate,
                wb.constraint,
                wb.swing_frame,
                wb.twist_frame,
            )
        };
        let segment = &self.segmentation.segments[seg_idx];
        if segment.effectors.is_empty() {
            return;
        }
        // 平移骨骼不做稳定化比较
        let stabilization = if may_translate { 0 } else { stabilization };
        let origin = self.frames.global(sim).translation;

        let baseline = if stabilization > 0 {
            collect_headings(
                &self.frames,
                state,
                origin,
                &segment.effectors,
                &self.bone_sim_frame,
                &self.target_frames,
                HeadingSource::Target,
                false,
                &mut self.target_headings,
            );
            collect_headings(
                &self.frames,
                state,
                origin,
                &segment.effectors,
                &self.bone_sim_frame,
                &self.target_frames,
                HeadingSource::Tip,
                false,
                &mut self.tip_headings,
            );
            weighted_msd(&self.tip_headings, &self.target_headings, &segment.weights)
        } else {
            0.0
        };
        let prev_local_rot = self.frames.local(sim).rotation;

        collect_headings(
            &self.frames,
            state,
            origin,
            &segment.effectors,
            &self.bone_sim_frame,
            &self.target_frames,
            HeadingSource::Target,
            true,
            &mut self.target_headings,
        );
        collect_headings(
            &self.frames,
            state,
            origin,
            &segment.effectors,
            &self.bone_sim_frame,
            &self.target_frames,
            HeadingSource::Tip,
            true,
            &mut self.tip_headings,
        );

        let superpose = self.qcp.weighted_superpose(
            &self.tip_headings,
            &self.target_headings,
            &segment.weights,
            may_translate,
        );
        let rot = clamp_rotation(superpose.rotation, dampening);
        if !near_identity(rot) {
            self.frames.rotate_by_global(sim, rot);
        }

        // 约束贴合（参考帧挂在父骨骼下，不受本步旋转影响）
        if let (Some(c), Some(sf)) = (constraint, swing_frame) {
            let bone_g = *self.frames.global(sim);
            let swing_g = *self.frames.global(sf);
            let twist_g = *self.frames.global(twist_frame.unwrap_or(sf));
            let correction = state
                .constraint_state(c)
                .constraint
                .snap(&bone_g, &swing_g, &twist_g);
            if !near_identity(correction) {
                self.frames.rotate_by_global(sim, correction);
            }
        }

        if may_translate {
            self.frames.translate_by_global(sim, superpose.translation);
        }

        if stabilization > 0 {
            collect_headings(
                &self.frames,
                state,
                origin,
                &segment.effectors,
                &self.bone_sim_frame,
                &self.target_frames,
                HeadingSource::Target,
                false,
                &mut self.target_headings,
            );
            collect_headings(
                &self.frames,
                state,
                origin,
                &segment.effectors,
                &self.bone_sim_frame,
                &self.target_frames,
                HeadingSource::Tip,
                false,
                &mut self.tip_headings,
            );
            let after = weighted_msd(
                &self.tip_headings,
                &self.target_headings,
                &segment.weights,
            );
            if after > baseline + tolerance {
                // 变差：回退本步
                self.frames.set_local_rotation(sim, prev_local_rot);
            }
        }
    }

    /// 完整求解：刷新 → 一趟回拉 → iterations 轮遍历 → 写回
    ///
    /// `on_bone_solved` 在写回之后按遍历序对每根可解骨骼触发一次，
    /// 参数为烘焙骨骼下标。
    pub fn solve(
        &mut self,
        state: &mut SkeletonState,
        iterations: usize,
        stabilization: usize,
        mut on_bone_solved: Option<&mut dyn FnMut(usize)>,
    ) {
        let iterations = iterations.max(1);
        let config = get_config();
        self.refresh(state);
        self.ensure_pullback(state, iterations);
        self.pull_back_pass(state, 0);
        for _ in 0..iterations {
            for ti in 0..self.traversal.len() {
                self.solve_bone(state, ti, stabilization, config.stabilization_tolerance);
            }
        }
        self.write_back(state);
        if config.debug_log {
            log::debug!(
                "[Shadow] 求解完成: {} 轮 x {} 骨骼, 稳定化 {}",
                iterations,
                self.traversal.len(),
                stabilization
            );
        }
        if let Some(cb) = on_bone_solved.as_deref_mut() {
            for ti in 0..self.traversal.len() {
                cb(self.traversal[ti].bone);
            }
        }
    }

    /// 只做回拉：弹性骨骼逐迭代向舒适区衰减步进，不追目标
    pub fn pull_back(&mut self, state: &mut SkeletonState, iterations: usize) {
        let iterations = iterations.max(1);
        self.refresh(state);
        self.ensure_pullback(state, iterations);
        for i in 0..iterations {
            self.pull_back_pass(state, i);
        }
        self.write_back(state);
    }
}

#[inline]
fn near_identity(q: Quat) -> bool {
    let (_, angle) = to_shortest_axis_angle(q);
    angle < EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BoneState, TargetState, TransformState};
    use glam::Vec3;

    fn chain(bones: usize) -> SkeletonState {
        let mut state = SkeletonState::new();
        for i in 0..bones {
            let parent = if i == 0 { None } else { Some(format!("b{}", i - 1)) };
            state.add_transform(TransformState {
                translation: if i == 0 { [0.0; 3] } else { [0.0, 1.0, 0.0] },
                ..TransformState::identity(format!("b{i}-t"), parent.as_ref().map(|p| format!("{p}-t")))
            });
            state.add_bone(BoneState {
                id: format!("b{i}"),
                transform_id: format!("b{i}-t"),
                parent_id: parent,
                constraint_id: None,
                stiffness: 0.0,
                target_id: None,
            });
        }
        state
    }

    fn pin(state: &mut SkeletonState, bone: &str, pos: Vec3) {
        state.add_transform(TransformState {
            translation: pos.to_array(),
            ..TransformState::identity(format!("{bone}-tgt-t"), None)
        });
        state.add_target(TargetState {
            id: format!("{bone}-tgt"),
            transform_id: format!("{bone}-tgt-t"),
            bone_id: bone.into(),
            priorities: [0.0, 0.0, 0.0],
            depth_falloff: 0.0,
            weight: 1.0,
        });
    }

    fn tip_position(state: &SkeletonState, id: &str) -> Vec3 {
        // 沿烘焙父链组合本地变换
        let mut idx = state.find_baked_bone(id).unwrap();
        let mut iso = state.bone_local(idx);
        while let Some(p) = state.baked_bone(idx).parent {
            iso = state.bone_local(p).mul(&iso);
            idx = p;
        }
        iso.translation
    }

    #[test]
    fn test_free_root_reaches_target() {
        let mut state = chain(2);
        pin(&mut state, "b1", Vec3::new(1.0, 0.5, 0.0));
        state.bake(true).unwrap();

        let mut shadow = ShadowSkeleton::build(&state, std::f32::consts::PI / 10.0);
        shadow.solve(&mut state, 10, 0, None);
        let tip = tip_position(&state, "b1");
        assert!(
            (tip - Vec3::new(1.0, 0.5, 0.0)).length() < 1e-2,
            "tip = {tip:?}"
        );
    }

    #[test]
    fn test_pinned_root_stays_put() {
        let mut state = chain(3);
        pin(&mut state, "b0", Vec3::ZERO);
        pin(&mut state, "b2", Vec3::new(1.0, 1.0, 0.0));
        state.bake(true).unwrap();

        let mut shadow = ShadowSkeleton::build(&state, std::f32::consts::PI / 10.0);
        shadow.solve(&mut state, 30, 0, None);

        let root = tip_position(&state, "b0");
        assert!(root.length() < 1e-3, "root drifted to {root:?}");
        let tip = tip_position(&state, "b2");
        assert!(
            (tip - Vec3::new(1.0, 1.0, 0.0)).length() < 5e-2,
            "tip = {tip:?}"
        );
    }

    #[test]
    fn test_traversal_tip_first() {
        let mut state = chain(3);
        pin(&mut state, "b0", Vec3::ZERO);
        pin(&mut state, "b2", Vec3::new(1.0, 1.0, 0.0));
        state.bake(true).unwrap();

        let shadow = ShadowSkeleton::build(&state, 0.1);
        // 段后序：手臂段 (b2, b1) 在根段 (b0) 之前，段内末梢在前
        let order: Vec<usize> = shadow.traversal().iter().map(|wb| wb.bone).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_callback_fires_once_per_bone() {
        let mut state = chain(2);
        pin(&mut state, "b1", Vec3::new(0.0, 2.0, 0.0));
        state.bake(true).unwrap();

        let mut shadow = ShadowSkeleton::build(&state, 0.2);
        let mut seen = Vec::new();
        let mut cb = |bone: usize| seen.push(bone);
        shadow.solve(&mut state, 3, 1, Some(&mut cb));
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_solve_msd_never_worse_with_stabilization() {
        let mut state = chain(3);
        pin(&mut state, "b0", Vec3::ZERO);
        pin(&mut state, "b2", Vec3::new(1.5, 0.5, 0.0));
        state.bake(true).unwrap();

        let target = Vec3::new(1.5, 0.5, 0.0);
        let before = (tip_position(&state, "b2") - target).length();
        let mut shadow = ShadowSkeleton::build(&state, std::f32::consts::PI / 10.0);
        let mut last = before;
        for _ in 0..5 {
            shadow.solve(&mut state, 1, 1, None);
            let d = (tip_position(&state, "b2") - target).length();
            assert!(d <= last + 1e-3, "deviation rose from {last} to {d}");
            last = d;
        }
    }
}
