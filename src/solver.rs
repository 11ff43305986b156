//! 求解器门面
//!
//! 持有权威 SkeletonState 与对应的影子骨架。注册是唯一的结构性
//! 入口：校验 → 烘焙 → 剪除 → 构建影子。两次求解之间调用方直接
//! 改 `state_mut()` 里的变换数值即可，结构不变就无需重新注册。

use crate::config::get_config;
use crate::skeleton::ShadowSkeleton;
use crate::state::SkeletonState;
use crate::{IkError, Result};

pub struct IkSolver {
    state: Option<SkeletonState>,
    shadow: Option<ShadowSkeleton>,
    /// 全局阻尼角（每骨骼每步旋转上限的基准）
    dampening: f32,
}

impl Default for IkSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IkSolver {
    pub fn new() -> Self {
        Self {
            state: None,
            shadow: None,
            dampening: get_config().dampening,
        }
    }

    /// 注册骨架状态，取代之前注册的任何状态
    ///
    /// `validate` 开启结构校验（生产数据建议开启；信任的管线可以
    /// 跳过换取注册速度）。无论是否校验都会剪除对任何目标无贡献
    /// 的骨骼，再构建影子骨架。
    pub fn register(&mut self, mut state: SkeletonState, validate: bool) -> Result<()> {
        state.bake(validate)?;
        let shadow = ShadowSkeleton::build(&state, self.dampening);
        log::info!(
            "[Solver] 注册骨架: {} 骨骼, {} 段",
            state.bone_count(),
            shadow.segmentation().len()
        );
        self.state = Some(state);
        self.shadow = Some(shadow);
        Ok(())
    }

    /// 当前权威状态（求解结果从这里读）
    pub fn state(&self) -> Option<&SkeletonState> {
        self.state.as_ref()
    }

    /// 可变访问：两次求解之间更新骨骼/目标变换数值
    pub fn state_mut(&mut self) -> Option<&mut SkeletonState> {
        self.state.as_mut()
    }

    /// 全局阻尼角
    pub fn dampening(&self) -> f32 {
        self.dampening
    }

    /// 调整全局阻尼角，立即对已注册的影子骨架生效
    pub fn set_dampening(&mut self, dampening: f32) {
        self.dampening = dampening.max(0.0);
        if let (Some(state), Some(shadow)) = (&self.state, &mut self.shadow) {
            shadow.set_dampening(state, self.dampening);
        }
    }

    /// 完整求解
    ///
    /// `iterations` / `stabilization` 传 0 取全局配置的缺省值。
    /// `on_bone_solved` 在写回后按遍历序（末梢在前）对每根可解
    /// 骨骼触发一次，参数为烘焙骨骼下标。
    pub fn solve(
        &mut self,
        iterations: usize,
        stabilization: usize,
        on_bone_solved: Option<&mut dyn FnMut(usize)>,
    ) -> Result<()> {
        let (Some(state), Some(shadow)) = (&mut self.state, &mut self.shadow) else {
            return Err(IkError::NotRegistered);
        };
        let config = get_config();
        let iterations = if iterations == 0 {
            config.default_iterations
        } else {
            iterations
        };
        let stabilization = if stabilization == 0 {
            config.default_stabilization_passes
        } else {
            stabilization
        };
        shadow.solve(state, iterations, stabilization, on_bone_solved);
        Ok(())
    }

    /// 按全局配置缺省参数求解
    pub fn solve_default(&mut self) -> Result<()> {
        self.solve(0, 0, None)
    }

    /// 只做回拉：弹性约束骨骼向舒适区衰减步进，不追目标
    pub fn pull_back(&mut self, iterations: usize) -> Result<()> {
        let (Some(state), Some(shadow)) = (&mut self.state, &mut self.shadow) else {
            return Err(IkError::NotRegistered);
        };
        let iterations = if iterations == 0 {
            get_config().default_iterations
        } else {
            iterations
        };
        shadow.pull_back(state, iterations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BoneState, TargetState, TransformState};

    #[test]
    fn test_unregistered_is_error() {
        let mut solver = IkSolver::new();
        assert!(matches!(solver.solve(5, 1, None), Err(IkError::NotRegistered)));
        assert!(matches!(solver.pull_back(3), Err(IkError::NotRegistered)));
    }

    #[test]
    fn test_register_then_solve() {
        let mut state = SkeletonState::new();
        state.add_transform(TransformState::identity("root-t", None));
        state.add_bone(BoneState {
            id: "root".into(),
            transform_id: "root-t".into(),
            parent_id: None,
            constraint_id: None,
            stiffness: 0.0,
            target_id: None,
        });
        state.add_transform(TransformState {
            translation: [0.0, 1.0, 0.0],
            ..TransformState::identity("tip-t", Some("root-t".into()))
        });
        state.add_bone(BoneState {
            id: "tip".into(),
            transform_id: "tip-t".into(),
            parent_id: Some("root".into()),
            constraint_id: None,
            stiffness: 0.0,
            target_id: None,
        });
        state.add_transform(TransformState {
            translation: [1.0, 0.0, 0.0],
            ..TransformState::identity("goal-t", None)
        });
        state.add_target(TargetState {
            id: "goal".into(),
            transform_id: "goal-t".into(),
            bone_id: "tip".into(),
            priorities: [0.0, 0.0, 0.0],
            depth_falloff: 0.0,
            weight: 1.0,
        });

        let mut solver = IkSolver::new();
        solver.register(state, true).unwrap();
        solver.solve_default().unwrap();

        let state = solver.state().unwrap();
        let root = state.find_baked_bone("root").unwrap();
        let tip = state.find_baked_bone("tip").unwrap();
        let tip_global = state.bone_local(root).mul(&state.bone_local(tip));
        assert!((tip_global.translation - glam::Vec3::X).length() < 1e-2);
    }
}
