//! 加权刚体叠合求解器 (QCP)
//!
//! 给定同一局部系下的两组加权点，返回使加权平方距离最小的
//! 旋转（可选平移）。基于四元数特征多项式方法：对 4x4 关键矩阵
//! 的最大特征值做牛顿迭代，再由伴随矩阵列提取特征向量。
//!
//! 每个骨骼级求解步都调用这里，是引擎唯一的数值拟合原语。

use glam::{Quat, Vec3};

use super::{rotation_between, EPSILON};

/// 叠合结果
#[derive(Clone, Copy, Debug)]
pub struct Superpose {
    /// 最优旋转（施加于 moved 点集）
    pub rotation: Quat,
    /// 最优平移（`translate == false` 时为零）
    pub translation: Vec3,
}

/// QCP 叠合求解器
///
/// 退化输入（空点集、全零权重、零长点云）返回恒等旋转与零平移，
/// 绝不产生 NaN。
#[derive(Clone, Debug)]
pub struct Qcp {
    /// 特征向量范数下限，低于该值换用下一个伴随矩阵列
    evec_precision: f32,
    /// 特征值牛顿迭代收敛阈值（相对）
    eval_precision: f32,
    /// 牛顿迭代上限
    max_iterations: usize,
}

impl Default for Qcp {
    fn default() -> Self {
        Self {
            evec_precision: 1.0e-6,
            eval_precision: 1.0e-7,
            max_iterations: 50,
        }
    }
}

impl Qcp {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加权叠合：求使 `Σ w·|target − R·moved (+ t)|²` 最小的 (R, t)
    ///
    /// 三个切片按索引并行，长度取最短。`translate == false` 时点集
    /// 按原样使用（调用方已把偏移列表平移到骨骼原点）。
    pub fn weighted_superpose(
        &self,
        moved: &[Vec3],
        target: &[Vec3],
        weights: &[f32],
        translate: bool,
    ) -> Superpose {
        let n = moved.len().min(target.len()).min(weights.len());
        if n == 0 {
            return Superpose { rotation: Quat::IDENTITY, translation: Vec3::ZERO };
        }

        let wsum: f32 = weights[..n].iter().sum();
        if wsum < EPSILON {
            return Superpose { rotation: Quat::IDENTITY, translation: Vec3::ZERO };
        }

        // 加权质心（仅在允许平移时去心）
        let (moved_center, target_center) = if translate {
            let mut mc = Vec3::ZERO;
            let mut tc = Vec3::ZERO;
            for i in 0..n {
                mc += moved[i] * weights[i];
                tc += target[i] * weights[i];
            }
            (mc / wsum, tc / wsum)
        } else {
            (Vec3::ZERO, Vec3::ZERO)
        };

        let rotation = if n == 1 {
            // 单点对退化为最短弧旋转
            rotation_between(moved[0] - moved_center, target[0] - target_center)
        } else {
            self.calc_rotation(moved, target, weights, n, moved_center, target_center)
        };

        let translation = if translate {
            target_center - rotation * moved_center
        } else {
            Vec3::ZERO
        };

        Superpose { rotation, translation }
    }

    /// 内积矩阵 + 特征值牛顿迭代 + 特征向量提取
    ///
    /// S_ab = Σ w · moved_a · target_b（Horn 关键矩阵的分量约定，
    /// 所得四元数把 moved 旋转到 target）。
    #[allow(clippy::too_many_lines)]
    fn calc_rotation(
        &self,
        moved: &[Vec3],
        target: &[Vec3],
        weights: &[f32],
        n: usize,
        moved_center: Vec3,
        target_center: Vec3,
    ) -> Quat {
        let (mut sxx, mut sxy, mut sxz) = (0.0f32, 0.0f32, 0.0f32);
        let (mut syx, mut syy, mut syz) = (0.0f32, 0.0f32, 0.0f32);
        let (mut szx, mut szy, mut szz) = (0.0f32, 0.0f32, 0.0f32);
        let mut g1 = 0.0f32;
        let mut g2 = 0.0f32;

        for i in 0..n {
            let w = weights[i];
            if w <= 0.0 {
                continue;
            }
            let m = moved[i] - moved_center;
            let t = target[i] - target_center;

            g1 += w * m.length_squared();
            g2 += w * t.length_squared();

            let wm = m * w;
            sxx += wm.x * t.x;
            sxy += wm.x * t.y;
            sxz += wm.x * t.z;
            syx += wm.y * t.x;
            syy += wm.y * t.y;
            syz += wm.y * t.z;
            szx += wm.z * t.x;
            szy += wm.z * t.y;
            szz += wm.z * t.z;
        }

        let e0 = (g1 + g2) * 0.5;
        if e0 < EPSILON {
            // 零长点云
            return Quat::IDENTITY;
        }

        let sxx2 = sxx * sxx;
        let syy2 = syy * syy;
        let szz2 = szz * szz;
        let sxy2 = sxy * sxy;
        let syx2 = syx * syx;
        let sxz2 = sxz * sxz;
        let szx2 = szx * szx;
        let syz2 = syz * syz;
        let szy2 = szy * szy;

        let syz_szy_m_syy_szz2 = 2.0 * (syz * szy - syy * szz);
        let sxx2_syy2_szz2_syz2_szy2 = syy2 + szz2 - sxx2 + syz2 + szy2;

        let c2 = -2.0 * (sxx2 + syy2 + szz2 + sxy2 + syx2 + sxz2 + szx2 + syz2 + szy2);
        let c1 = 8.0
            * (sxx * syz * szy + syy * szx * sxz + szz * sxy * syx
                - sxx * syy * szz
                - syz * szx * sxy
                - szy * syx * sxz);

        let sxzpszx = sxz + szx;
        let syzpszy = syz + szy;
        let sxypsyx = sxy + syx;
        let syzmszy = syz - szy;
        let sxzmszx = sxz - szx;
        let sxymsyx = sxy - syx;
        let sxxpsyy = sxx + syy;
        let sxxmsyy = sxx - syy;

        let sxy2sxz2syx2szx2 = sxy2 + sxz2 - syx2 - szx2;

        let c0 = sxy2sxz2syx2szx2 * sxy2sxz2syx2szx2
            + (sxx2_syy2_szz2_syz2_szy2 + syz_szy_m_syy_szz2)
                * (sxx2_syy2_szz2_syz2_szy2 - syz_szy_m_syy_szz2)
            + (-sxzpszx * syzmszy + sxymsyx * (sxxmsyy - szz))
                * (-sxzmszx * syzpszy + sxymsyx * (sxxmsyy + szz))
            + (-sxzpszx * syzpszy - sxypsyx * (sxxpsyy - szz))
                * (-sxzmszx * syzmszy - sxypsyx * (sxxpsyy + szz))
            + (sxypsyx * syzpszy + sxzpszx * (sxxmsyy + szz))
                * (-sxymsyx * syzmszy + sxzpszx * (sxxpsyy + szz))
            + (sxypsyx * syzmszy + sxzmszx * (sxxmsyy - szz))
                * (-sxymsyx * syzpszy + sxzmszx * (sxxpsyy - szz));

        // 最大特征值：以 e0 为初值的牛顿迭代
        let mut mx_eigen_v = e0;
        for _ in 0..self.max_iterations {
            let old = mx_eigen_v;
            let x2 = mx_eigen_v * mx_eigen_v;
            let b = (x2 + c2) * mx_eigen_v;
            let a = b + c1;
            let denom = 2.0 * x2 * mx_eigen_v + b + a;
            if denom.abs() < EPSILON {
                break;
            }
            let delta = (a * mx_eigen_v + c0) / denom;
            mx_eigen_v -= delta;
            if (mx_eigen_v - old).abs() < (self.eval_precision * mx_eigen_v).abs() {
                break;
            }
        }

        // (K − λI) 的伴随矩阵列即特征向量；列范数过小时逐列回退
        let a11 = sxxpsyy + szz - mx_eigen_v;
        let a12 = syzmszy;
        let a13 = -sxzmszx;
        let a14 = sxymsyx;
        let a21 = syzmszy;
        let a22 = sxxmsyy - szz - mx_eigen_v;
        let a23 = sxypsyx;
        let a24 = sxzpszx;
        let a31 = a13;
        let a32 = a23;
        let a33 = syy - sxx - szz - mx_eigen_v;
        let a34 = syzpszy;
        let a41 = a14;
        let a42 = a24;
        let a43 = a34;
        let a44 = szz - sxxpsyy - mx_eigen_v;

        let a3344_4334 = a33 * a44 - a43 * a34;
        let a3244_4234 = a32 * a44 - a42 * a34;
        let a3243_4233 = a32 * a43 - a42 * a33;
        let a3143_4133 = a31 * a43 - a41 * a33;
        let a3144_4134 = a31 * a44 - a41 * a34;
        let a3142_4132 = a31 * a42 - a41 * a32;

        let mut q1 = a22 * a3344_4334 - a23 * a3244_4234 + a24 * a3243_4233;
        let mut q2 = -a21 * a3344_4334 + a23 * a3144_4134 - a24 * a3143_4133;
        let mut q3 = a21 * a3244_4234 - a22 * a3144_4134 + a24 * a3142_4132;
        let mut q4 = -a21 * a3243_4233 + a22 * a3143_4133 - a23 * a3142_4132;
        let mut qsqr = q1 * q1 + q2 * q2 + q3 * q3 + q4 * q4;

        if qsqr < self.evec_precision {
            q1 = a12 * a3344_4334 - a13 * a3244_4234 + a14 * a3243_4233;
            q2 = -a11 * a3344_4334 + a13 * a3144_4134 - a14 * a3143_4133;
            q3 = a11 * a3244_4234 - a12 * a3144_4134 + a14 * a3142_4132;
            q4 = -a11 * a3243_4233 + a12 * a3143_4133 - a13 * a3142_4132;
            qsqr = q1 * q1 + q2 * q2 + q3 * q3 + q4 * q4;

            if qsqr < self.evec_precision {
                let a1324_1423 = a13 * a24 - a14 * a23;
                let a1224_1422 = a12 * a24 - a14 * a22;
                let a1223_1322 = a12 * a23 - a13 * a22;
                let a1124_1421 = a11 * a24 - a14 * a21;
                let a1123_1321 = a11 * a23 - a13 * a21;
                let a1122_1221 = a11 * a22 - a12 * a21;

                q1 = a42 * a1324_1423 - a43 * a1224_1422 + a44 * a1223_1322;
                q2 = -a41 * a1324_1423 + a43 * a1124_1421 - a44 * a1123_1321;
                q3 = a41 * a1224_1422 - a42 * a1124_1421 + a44 * a1122_1221;
                q4 = -a41 * a1223_1322 + a42 * a1123_1321 - a43 * a1122_1221;
                qsqr = q1 * q1 + q2 * q2 + q3 * q3 + q4 * q4;

                if qsqr < self.evec_precision {
                    q1 = a32 * a1324_1423 - a33 * a1224_1422 + a34 * a1223_1322;
                    q2 = -a31 * a1324_1423 + a33 * a1124_1421 - a34 * a1123_1321;
                    q3 = a31 * a1224_1422 - a32 * a1124_1421 + a34 * a1122_1221;
                    q4 = -a31 * a1223_1322 + a32 * a1123_1321 - a33 * a1122_1221;
                    qsqr = q1 * q1 + q2 * q2 + q3 * q3 + q4 * q4;

                    if qsqr < self.evec_precision {
                        // 两点集已经重合（或完全退化），最优旋转为恒等
                        return Quat::IDENTITY;
                    }
                }
            }
        }

        let norm = qsqr.sqrt().recip();
        Quat::from_xyzw(q2 * norm, q3 * norm, q4 * norm, q1 * norm).normalize()
    }
}
