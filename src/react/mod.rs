//! 回合层：状态机主循环与调用方事件

pub mod events;
pub mod loop_;

pub use events::{coalesce_text, TurnEvent};
pub use loop_::{run_turn, TurnContext, TurnReport};
