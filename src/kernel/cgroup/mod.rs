//! Cgroup v2 resource governance.
//!
//! One child cgroup per job under a dedicated parent. The parent never holds
//! processes itself, so controllers can be delegated to the job cgroups.

pub mod v2;

pub use v2::{
    parse_cpu_usage_usec, parse_limit, parse_memory_events, CgroupV2, JobCgroup, MemoryEvents,
    CPU_PERIOD_USEC,
};
