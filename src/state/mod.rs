//! 骨架状态边界
//!
//! 调用方通过记录（骨骼/变换/目标/约束）描述骨架，引擎只改写
//! 变换的数值，从不改写拓扑。注册时做一次校验（可选关闭），
//! 然后剪除无目标且无存活子骨骼的骨骼，压实为稠密整数索引数组。
//!
//! 记录之间用字符串 id 互相引用；烘焙后内部一律用稠密索引，
//! 父子关系存索引、子列表由邻接缓存导出（不需要弱引用清理）。

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use glam::{Quat, Vec3};

use crate::constraint::Constraint;
use crate::math::Iso;
use crate::{IkError, Result};

// ============================================================================
// 记录类型
// ============================================================================

/// 变换记录
///
/// 旋转为 scalar-first 的单位四元数 `[w, x, y, z]`。
/// 根变换的父级为隐式恒等的"骨架空间"（`parent_id == None`）。
/// 缩放仅作信息保留，求解器不使用也不修改。
#[derive(Clone, Debug)]
pub struct TransformState {
    pub id: String,
    pub translation: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
    pub parent_id: Option<String>,
}

impl TransformState {
    /// 恒等变换记录
    pub fn identity(id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            translation: [0.0; 3],
            rotation: [1.0, 0.0, 0.0, 0.0],
            scale: [1.0; 3],
            parent_id,
        }
    }

    /// 转为刚体等距变换（旋转归一化，退化时取恒等）
    pub fn to_iso(&self) -> Iso {
        let [w, x, y, z] = self.rotation;
        let q = Quat::from_xyzw(x, y, z, w);
        let rotation = if q.length_squared() < 1.0e-8 { Quat::IDENTITY } else { q.normalize() };
        Iso::new(rotation, Vec3::from_array(self.translation))
    }

    /// 从刚体等距变换写回数值（缩放保持不变）
    pub fn set_from_iso(&mut self, iso: &Iso) {
        self.translation = iso.translation.to_array();
        self.rotation = [iso.rotation.w, iso.rotation.x, iso.rotation.y, iso.rotation.z];
    }
}

/// 骨骼记录
///
/// 严格单父树的节点；`parent_id == None` 即根。骨长沿本地 Y。
#[derive(Clone, Debug)]
pub struct BoneState {
    pub id: String,
    pub transform_id: String,
    pub parent_id: Option<String>,
    /// 约束 id（根骨骼上不允许）
    pub constraint_id: Option<String>,
    /// 刚度 [0,1]，1 = 不可动，默认 0
    pub stiffness: f32,
    pub target_id: Option<String>,
}

bitflags! {
    /// 目标启用的朝向轴
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TargetAxes: u8 {
        const X_DIR = 1 << 0;
        const Y_DIR = 1 << 1;
        const Z_DIR = 1 << 2;
    }
}

/// 目标（效应器）记录
///
/// 逐轴优先级全零 ⇒ 纯位置目标。目标变换必须直接挂在骨架空间下。
#[derive(Clone, Debug)]
pub struct TargetState {
    pub id: String,
    pub transform_id: String,
    pub bone_id: String,
    /// 逐轴优先级 (x, y, z)，各 ≥ 0
    pub priorities: [f32; 3],
    /// 深度衰减 [0,1]，控制所属段以远的祖先可见性
    pub depth_falloff: f32,
    /// 总权重，> 0
    pub weight: f32,
}

impl TargetState {
    /// 启用的朝向轴
    pub fn mode(&self) -> TargetAxes {
        let mut mode = TargetAxes::empty();
        if self.priorities[0] > 0.0 {
            mode |= TargetAxes::X_DIR;
        }
        if self.priorities[1] > 0.0 {
            mode |= TargetAxes::Y_DIR;
        }
        if self.priorities[2] > 0.0 {
            mode |= TargetAxes::Z_DIR;
        }
        mode
    }

    /// 最大轴优先级（全零时取 1，避免除零）
    pub fn max_priority(&self) -> f32 {
        let max = self.priorities[0].max(self.priorities[1]).max(self.priorities[2]);
        if max <= 0.0 {
            1.0
        } else {
            max
        }
    }

    /// 每个效应器贡献的偏移条目数：1 个位置 + 每个启用轴 2 个
    pub fn heading_count(&self) -> usize {
        1 + 2 * self.mode().bits().count_ones() as usize
    }
}

/// 约束记录
///
/// `constraint` 是调用方具体约束对象的不透明能力引用，
/// 引擎只通过 [`Constraint`] 的操作使用它。
#[derive(Clone)]
pub struct ConstraintState {
    pub id: String,
    pub bone_id: String,
    /// 痛感 ≥ 0，驱动回拉步的渐进阻力
    pub painfulness: f32,
    /// 摆动参考系变换 id
    pub swing_transform_id: String,
    /// 扭转参考系变换 id（缺省复用摆动系）
    pub twist_transform_id: Option<String>,
    pub constraint: Rc<dyn Constraint>,
}

// ============================================================================
// 烘焙视图
// ============================================================================

/// 烘焙后的骨骼（稠密索引，父在前序）
#[derive(Clone, Debug)]
pub struct BakedBone {
    /// 原始骨骼记录下标
    pub bone: usize,
    /// 烘焙父下标
    pub parent: Option<usize>,
    /// 变换记录下标
    pub transform: usize,
    /// 目标记录下标
    pub target: Option<usize>,
    /// 约束记录下标
    pub constraint: Option<usize>,
    /// 刚度（烘焙时钳到 [0,1]）
    pub stiffness: f32,
}

// ============================================================================
// 骨架状态
// ============================================================================

/// 骨架状态（求解器唯一的 I/O 边界）
///
/// 注册是唯一的结构性操作；两次求解之间可以自由修改变换数值，
/// 无需重新注册。
#[derive(Clone, Default)]
pub struct SkeletonState {
    bones: Vec<BoneState>,
    transforms: Vec<TransformState>,
    targets: Vec<TargetState>,
    constraints: Vec<ConstraintState>,

    bone_index: HashMap<String, usize>,
    transform_index: HashMap<String, usize>,
    target_index: HashMap<String, usize>,
    constraint_index: HashMap<String, usize>,

    // 烘焙结果（validate_and_bake 之后有效）
    baked: Vec<BakedBone>,
    baked_children: Vec<Vec<usize>>,
    baked_of_bone: HashMap<usize, usize>,
}

impl SkeletonState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================
    // 记录录入
    // ========================================

    pub fn add_bone(&mut self, bone: BoneState) {
        self.bone_index.insert(bone.id.clone(), self.bones.len());
        self.bones.push(bone);
    }

    pub fn add_transform(&mut self, transform: TransformState) {
        self.transform_index.insert(transform.id.clone(), self.transforms.len());
        self.transforms.push(transform);
    }

    pub fn add_target(&mut self, target: TargetState) {
        self.target_index.insert(target.id.clone(), self.targets.len());
        self.targets.push(target);
    }

    pub fn add_constraint(&mut self, constraint: ConstraintState) {
        self.constraint_index.insert(constraint.id.clone(), self.constraints.len());
        self.constraints.push(constraint);
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.baked.len()
    }

    #[inline]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn baked_bone(&self, idx: usize) -> &BakedBone {
        &self.baked[idx]
    }

    #[inline]
    pub fn baked_bones(&self) -> &[BakedBone] {
        &self.baked
    }

    #[inline]
    pub fn baked_children(&self, idx: usize) -> &[usize] {
        &self.baked_children[idx]
    }

    #[inline]
    pub fn bone_record(&self, idx: usize) -> &BoneState {
        &self.bones[idx]
    }

    /// 按 id 改骨骼记录（须在烘焙前调用才会生效）
    pub fn bone_record_mut(&mut self, id: &str) -> Option<&mut BoneState> {
        let idx = *self.bone_index.get(id)?;
        self.bones.get_mut(idx)
    }

    #[inline]
    pub fn target(&self, idx: usize) -> &TargetState {
        &self.targets[idx]
    }

    #[inline]
    pub fn constraint_state(&self, idx: usize) -> &ConstraintState {
        &self.constraints[idx]
    }

    #[inline]
    pub fn transform(&self, idx: usize) -> &TransformState {
        &self.transforms[idx]
    }

    #[inline]
    pub fn transform_mut(&mut self, idx: usize) -> &mut TransformState {
        &mut self.transforms[idx]
    }

    /// 按 id 查变换下标
    pub fn find_transform(&self, id: &str) -> Option<usize> {
        self.transform_index.get(id).copied()
    }

    /// 按 id 查骨骼的烘焙下标（剪除的骨骼返回 None）
    pub fn find_baked_bone(&self, id: &str) -> Option<usize> {
        let record = self.bone_index.get(id)?;
        self.baked_of_bone.get(record).copied()
    }

    /// 烘焙骨骼的当前本地变换值
    pub fn bone_local(&self, baked_idx: usize) -> Iso {
        self.transforms[self.baked[baked_idx].transform].to_iso()
    }

    /// 目标的当前变换值（骨架空间）
    pub fn target_iso(&self, target_idx: usize) -> Iso {
        let t = &self.targets[target_idx];
        // 校验已保证可解析
        let ti = self.transform_index[&t.transform_id];
        self.transforms[ti].to_iso()
    }

    /// 约束参考系的当前本地变换值（摆动系，可选扭转系）
    pub fn constraint_frames(&self, constraint_idx: usize) -> (Iso, Option<Iso>) {
        let c = &self.constraints[constraint_idx];
        let swing = self.transforms[self.transform_index[&c.swing_transform_id]].to_iso();
        let twist = c
            .twist_transform_id
            .as_ref()
            .map(|id| self.transforms[self.transform_index[id]].to_iso());
        (swing, twist)
    }

    // ========================================
    // 校验 + 剪枝 + 烘焙
    // ========================================

    /// 校验、剪枝并压实为稠密数组
    ///
    /// `validate == false` 跳过结构校验（调用方自担风险），
    /// 剪枝与烘焙仍然执行。
    pub fn bake(&mut self, validate: bool) -> Result<()> {
        if validate {
            self.validate()?;
        }
        self.prune_and_compact()
    }

    /// 结构校验：唯一根、外键可解析、变换层级一致、无环、
    /// 约束不在根上、目标合法
    fn validate(&self) -> Result<()> {
        // 唯一根
        let mut root: Option<&BoneState> = None;
        for bone in &self.bones {
            if bone.parent_id.is_none() {
                if let Some(prev) = root {
                    return Err(IkError::MultipleRoots(prev.id.clone(), bone.id.clone()));
                }
                root = Some(bone);
            }
        }
        let root = root.ok_or(IkError::MissingRoot)?;

        for bone in &self.bones {
            // 外键
            let t_idx = *self.transform_index.get(&bone.transform_id).ok_or_else(|| {
                IkError::DanglingRef { kind: "transform", id: bone.transform_id.clone() }
            })?;
            if let Some(pid) = &bone.parent_id {
                let p_idx = *self.bone_index.get(pid).ok_or_else(|| IkError::DanglingRef {
                    kind: "bone",
                    id: pid.clone(),
                })?;
                // 变换层级与骨骼层级一致
                let parent_transform = &self.bones[p_idx].transform_id;
                let bone_t = &self.transforms[t_idx];
                if bone_t.parent_id.as_deref() != Some(parent_transform.as_str()) {
                    return Err(IkError::TransformHierarchyMismatch(bone.id.clone()));
                }
            } else {
                // 根变换的父级是隐式骨架空间
                if self.transforms[t_idx].parent_id.is_some() {
                    return Err(IkError::TransformHierarchyMismatch(bone.id.clone()));
                }
            }
            if let Some(cid) = &bone.constraint_id {
                if !self.constraint_index.contains_key(cid) {
                    return Err(IkError::DanglingRef { kind: "constraint", id: cid.clone() });
                }
                if bone.parent_id.is_none() {
                    return Err(IkError::ConstraintOnRoot(cid.clone()));
                }
            }
            if let Some(tid) = &bone.target_id {
                if !self.target_index.contains_key(tid) {
                    return Err(IkError::DanglingRef { kind: "target", id: tid.clone() });
                }
            }
        }

        // 无环：沿父链上行，步数超过骨骼数即有环
        for (start, bone) in self.bones.iter().enumerate() {
            let mut current = bone;
            let mut steps = 0usize;
            while let Some(pid) = &current.parent_id {
                let p_idx = self.bone_index[pid];
                current = &self.bones[p_idx];
                steps += 1;
                if steps > self.bones.len() {
                    return Err(IkError::Cycle(self.bones[start].id.clone()));
                }
            }
        }

        // 目标记录
        for target in &self.targets {
            if target.weight <= 0.0 {
                return Err(IkError::InvalidTarget {
                    id: target.id.clone(),
                    reason: "weight must be positive".into(),
                });
            }
            if !self.bone_index.contains_key(&target.bone_id) {
                return Err(IkError::DanglingRef { kind: "bone", id: target.bone_id.clone() });
            }
            let t_idx = *self.transform_index.get(&target.transform_id).ok_or_else(|| {
                IkError::DanglingRef { kind: "transform", id: target.transform_id.clone() }
            })?;
            if self.transforms[t_idx].parent_id.is_some() {
                return Err(IkError::InvalidTarget {
                    id: target.id.clone(),
                    reason: "target transform must parent directly to skeleton space".into(),
                });
            }
        }

        // 约束记录
        for c in &self.constraints {
            if !self.bone_index.contains_key(&c.bone_id) {
                return Err(IkError::DanglingRef { kind: "bone", id: c.bone_id.clone() });
            }
            if !self.transform_index.contains_key(&c.swing_transform_id) {
                return Err(IkError::DanglingRef {
                    kind: "transform",
                    id: c.swing_transform_id.clone(),
                });
            }
            if let Some(tid) = &c.twist_transform_id {
                if !self.transform_index.contains_key(tid) {
                    return Err(IkError::DanglingRef { kind: "transform", id: tid.clone() });
                }
            }
        }

        let _ = root;
        Ok(())
    }

    /// 剪除无目标且无存活子骨骼的骨骼，按父先序压实
    fn prune_and_compact(&mut self) -> Result<()> {
        let n = self.bones.len();
        if n == 0 {
            return Err(IkError::MissingRoot);
        }

        // 邻接（记录下标）
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut root_record = None;
        for (i, bone) in self.bones.iter().enumerate() {
            match &bone.parent_id {
                Some(pid) => {
                    let p = *self.bone_index.get(pid).ok_or_else(|| IkError::DanglingRef {
                        kind: "bone",
                        id: pid.clone(),
                    })?;
                    children[p].push(i);
                }
                None => root_record = Some(i),
            }
        }
        let root_record = root_record.ok_or(IkError::MissingRoot)?;

        // 目标所属骨骼集合（骨骼自身 target_id 或目标记录的 bone_id 任一即生效）
        let mut has_target = vec![false; n];
        for (i, bone) in self.bones.iter().enumerate() {
            if bone.target_id.is_some() {
                has_target[i] = true;
            }
        }
        for t in &self.targets {
            if let Some(&b) = self.bone_index.get(&t.bone_id) {
                has_target[b] = true;
            }
        }

        // 后序标记存活：有目标，或有存活子骨骼；根总是保留
        let mut keep = vec![false; n];
        fn mark(
            idx: usize,
            children: &[Vec<usize>],
            has_target: &[bool],
            keep: &mut [bool],
        ) -> bool {
            let mut alive = has_target[idx];
            for &c in &children[idx] {
                if mark(c, children, has_target, keep) {
                    alive = true;
                }
            }
            keep[idx] = alive;
            alive
        }
        mark(root_record, &children, &has_target, &mut keep);
        keep[root_record] = true;

        let pruned = keep.iter().filter(|k| !**k).count();
        if pruned > 0 {
            log::debug!("[State] 剪除 {} 根无目标末梢骨骼", pruned);
        }

        // 目标反查：目标记录声明 bone_id 与骨骼声明 target_id 等效
        let mut target_of_bone: Vec<Option<usize>> = vec![None; n];
        for (t_idx, t) in self.targets.iter().enumerate() {
            if let Some(&b) = self.bone_index.get(&t.bone_id) {
                target_of_bone[b] = Some(t_idx);
            }
        }

        // 父先序（BFS）压实
        self.baked.clear();
        self.baked_children.clear();
        self.baked_of_bone.clear();

        let mut queue = std::collections::VecDeque::new();
        queue.push_back((root_record, None::<usize>));
        while let Some((record, baked_parent)) = queue.pop_front() {
            if !keep[record] {
                continue;
            }
            let bone = &self.bones[record];
            let transform = self.transform_index[&bone.transform_id];
            let target = bone
                .target_id
                .as_ref()
                .and_then(|id| self.target_index.get(id))
                .copied()
                .or(target_of_bone[record]);
            let constraint = bone
                .constraint_id
                .as_ref()
                .and_then(|id| self.constraint_index.get(id))
                .copied();

            let baked_idx = self.baked.len();
            self.baked.push(BakedBone {
                bone: record,
                parent: baked_parent,
                transform,
                target,
                constraint,
                stiffness: bone.stiffness.clamp(0.0, 1.0),
            });
            self.baked_children.push(Vec::new());
            self.baked_of_bone.insert(record, baked_idx);
            if let Some(p) = baked_parent {
                self.baked_children[p].push(baked_idx);
            }
            for &c in &children[record] {
                queue.push_back((c, Some(baked_idx)));
            }
        }

        log::debug!(
            "[State] 烘焙完成: {} 骨骼, {} 目标, {} 约束",
            self.baked.len(),
            self.targets.len(),
            self.constraints.len()
        );
        Ok(())
    }
}
