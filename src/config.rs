//! 求解器配置
//!
//! 所有参数扁平化，直接在代码中修改默认值即可。

use once_cell::sync::Lazy;
use std::f32::consts::PI;
use std::sync::RwLock;

/// 求解器配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct SolverConfig {
    // ========== 阻尼 ==========
    /// 全局阻尼角（弧度），单次扫描中每骨骼允许的最大转角，默认 π/10
    /// 越小 → 收敛越平滑，但需要更多迭代
    pub dampening: f32,

    // ========== 迭代 ==========
    /// 默认外层迭代次数，默认 10
    pub default_iterations: usize,
    /// 默认稳定化检查次数，默认 1
    /// 0 = 不做均方差比较回退，速度更快但在超约束链上可能抖动
    pub default_stabilization_passes: usize,

    // ========== 数值保护 ==========
    /// 稳定化比较容差，默认 1e-5
    /// 均方差改善小于该值视为未改善，回退本骨骼的旋转
    pub stabilization_tolerance: f32,

    // ========== 调试 ==========
    /// 是否输出数值退化回退的调试日志，默认 false
    pub debug_log: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            // ====== 阻尼 ======
            // 每骨骼每次扫描最大转角
            // 建议范围: π/30 ~ π/4，π/10 是平衡点
            dampening: PI / 10.0,

            // ====== 迭代 ======
            // 越大 → 越接近目标，但 CPU 消耗线性增长
            // 建议范围: 5~30
            default_iterations: 10,
            default_stabilization_passes: 1,

            // ====== 数值保护 ======
            stabilization_tolerance: 1.0e-5,

            // ====== 调试 ======
            debug_log: false,
        }
    }
}

/// 全局配置实例
static SOLVER_CONFIG: Lazy<RwLock<SolverConfig>> = Lazy::new(|| {
    RwLock::new(SolverConfig::default())
});

/// 获取当前配置（只读）
pub fn get_config() -> SolverConfig {
    SOLVER_CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 手动设置配置（用于运行时调试）
pub fn set_config(config: SolverConfig) {
    *SOLVER_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
}

/// 就地修改配置
pub fn with_config<F: FnOnce(&mut SolverConfig)>(f: F) {
    let mut guard = SOLVER_CONFIG.write().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

/// 重置为默认配置
pub fn reset_config() {
    *SOLVER_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = SolverConfig::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SolverConfig::default();
        assert!(config.dampening > 0.0 && config.dampening < PI);
        assert!(config.default_iterations > 0);
    }
}
