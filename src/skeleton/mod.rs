//! 影子骨架求解层
//!
//! - frame: 仿真帧池（本地/全局等距变换的稠密记账）
//! - segment: 骨骼树的链段划分与效应器收集
//! - working_bone: 逐骨骼求解数据与 heading 采集
//! - shadow: 影子骨架整体（构建、回拉、迭代求解、写回）

mod frame;
mod segment;
mod shadow;
mod working_bone;

pub use frame::{FrameArena, SimFrame};
pub use segment::{Segment, Segmentation, SegmentEffector};
pub use shadow::ShadowSkeleton;
pub use working_bone::{collect_headings, weighted_msd, HeadingSource, WorkingBone};
