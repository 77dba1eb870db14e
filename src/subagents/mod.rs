//! 子代理：内置 profile、profile 文件加载、任务路由

pub mod loader;
pub mod profile;
pub mod router;

pub use loader::{load_profiles, parse_profiles};
pub use profile::{builtin_profiles, SubagentProfile};
pub use router::TaskRouter;
