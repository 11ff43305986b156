//! 仿真帧池
//!
//! 影子骨架的空间帧记账：稠密数组存本地/全局等距变换，父级存
//! 下标，子列表由邻接缓存导出。全局值通过确定性的自顶向下刷新
//! 维护（显式 update，无脏标记、无弱引用）。
//!
//! 变换计算：global = parent.global ∘ local

use glam::{Quat, Vec3};

use crate::math::Iso;

/// 单个仿真帧
#[derive(Clone, Debug)]
pub struct SimFrame {
    /// 本地变换 (local_to_parent)
    pub local: Iso,
    /// 父帧下标（None = 直接挂在骨架空间）
    pub parent: Option<usize>,
    /// 全局变换缓存 (local_to_world)
    pub global: Iso,
}

/// 仿真帧池
///
/// 约定：父帧必须先于子帧入池（下标严格递增），因此按下标顺序
/// 一次遍历即可完成全量刷新。
#[derive(Clone, Debug, Default)]
pub struct FrameArena {
    frames: Vec<SimFrame>,
    children: Vec<Vec<usize>>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入池，返回帧下标
    ///
    /// `parent` 必须小于新帧下标。
    pub fn push(&mut self, local: Iso, parent: Option<usize>) -> usize {
        let idx = self.frames.len();
        debug_assert!(parent.map_or(true, |p| p < idx));
        self.frames.push(SimFrame { local, parent, global: local });
        self.children.push(Vec::new());
        if let Some(p) = parent {
            self.children[p].push(idx);
        }
        idx
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn local(&self, idx: usize) -> &Iso {
        &self.frames[idx].local
    }

    #[inline]
    pub fn global(&self, idx: usize) -> &Iso {
        &self.frames[idx].global
    }

    #[inline]
    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.frames[idx].parent
    }

    /// 覆写本地变换（不刷新全局，调用方负责批量刷新）
    #[inline]
    pub fn set_local(&mut self, idx: usize, local: Iso) {
        self.frames[idx].local = local;
    }

    /// 父帧的全局变换（根帧为恒等骨架空间）
    #[inline]
    fn parent_global(&self, idx: usize) -> Iso {
        match self.frames[idx].parent {
            Some(p) => self.frames[p].global,
            None => Iso::IDENTITY,
        }
    }

    /// 全量自顶向下刷新（依赖父先序下标约定）
    pub fn update_all(&mut self) {
        for idx in 0..self.frames.len() {
            let pg = self.parent_global(idx);
            self.frames[idx].global = pg.mul(&self.frames[idx].local);
        }
    }

    /// 递归刷新 idx 及其整棵子树的全局变换
    pub fn update_global_recursive(&mut self, idx: usize) {
        let pg = self.parent_global(idx);
        self.frames[idx].global = pg.mul(&self.frames[idx].local);
        // 邻接缓存与帧数组分离借用
        let children = std::mem::take(&mut self.children[idx]);
        for &child in &children {
            self.update_global_recursive(child);
        }
        self.children[idx] = children;
    }

    /// 绕帧自身原点施加一个全局系旋转，并刷新子树
    pub fn rotate_by_global(&mut self, idx: usize, rot: Quat) {
        let pg_rot = self.parent_global(idx).rotation;
        let new_global_rot = (rot * self.frames[idx].global.rotation).normalize();
        self.frames[idx].local.rotation = (pg_rot.conjugate() * new_global_rot).normalize();
        self.update_global_recursive(idx);
    }

    /// 施加一个全局系平移，并刷新子树
    pub fn translate_by_global(&mut self, idx: usize, offset: Vec3) {
        let pg_rot = self.parent_global(idx).rotation;
        self.frames[idx].local.translation += pg_rot.conjugate() * offset;
        self.update_global_recursive(idx);
    }

    /// 只覆写本地旋转并刷新子树（稳定化回退用）
    pub fn set_local_rotation(&mut self, idx: usize, rotation: Quat) {
        self.frames[idx].local.rotation = rotation;
        self.update_global_recursive(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_propagation() {
        let mut arena = FrameArena::new();
        let root = arena.push(
            Iso::new(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2), Vec3::ZERO),
            None,
        );
        let child = arena.push(Iso::new(Quat::IDENTITY, Vec3::Y), Some(root));
        arena.update_all();

        // 根旋转 90°，子帧的本地 +Y 偏移应转到 -X
        let p = arena.global(child).translation;
        assert!((p - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-5);
        let _ = root;
    }

    #[test]
    fn test_rotate_by_global_keeps_origin() {
        let mut arena = FrameArena::new();
        let root = arena.push(Iso::new(Quat::from_rotation_y(0.8), Vec3::X), None);
        let child = arena.push(Iso::new(Quat::IDENTITY, Vec3::Y), Some(root));
        arena.update_all();

        let before = arena.global(child).translation;
        let origin_before = arena.global(root).translation;
        arena.rotate_by_global(root, Quat::from_rotation_x(0.5));

        // 旋转绕帧原点：自身原点不动，子帧原点移动
        assert!((arena.global(root).translation - origin_before).length() < 1e-5);
        assert!((arena.global(child).translation - before).length() > 1e-3);

        // 全局旋转确实被施加
        let expected =
            (Quat::from_rotation_x(0.5) * Quat::from_rotation_y(0.8)).normalize();
        assert!(arena.global(root).rotation.dot(expected).abs() > 1.0 - 1e-5);
    }

    #[test]
    fn test_translate_by_global() {
        let mut arena = FrameArena::new();
        let root = arena.push(
            Iso::new(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2), Vec3::ZERO),
            None,
        );
        let child = arena.push(Iso::new(Quat::IDENTITY, Vec3::Y), Some(root));
        arena.update_all();

        // 子帧沿全局 +X 平移：父帧旋了 90°，本地增量应是 -Y
        arena.translate_by_global(child, Vec3::X);
        assert!((arena.local(child).translation - Vec3::new(0.0, 0.0, 0.0)).length() < 1e-5);
        assert!((arena.global(child).translation - Vec3::new(0.0, 0.0, 0.0)).length() < 1e-5);
    }
}
