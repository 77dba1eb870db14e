//! 会话编排器：命令通道驱动的主控循环
//!
//! 后台任务独占一个 Session，消费用户命令（Submit/Cancel/Clear/Quit）并把回合事件转发给调用方。
//! 回合进行中仍监听命令：Cancel 立即取消当前回合，其余命令排队到回合结束后处理。

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::Session;
use crate::react::TurnEvent;

/// 从前端发往编排器的用户命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 提交用户输入，触发一个回合
    Submit(String),
    /// 取消当前回合（Stop generating）
    Cancel,
    /// 清空对话
    Clear,
    /// 退出；进行中的回合会被取消
    Quit,
}

/// 启动会话任务：返回命令发送端、事件接收端与任务句柄（结束时交还 Session）
pub fn spawn_session(
    mut session: Session,
) -> (
    mpsc::UnboundedSender<Command>,
    mpsc::UnboundedReceiver<TurnEvent>,
    JoinHandle<Session>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<TurnEvent>();

    let handle = tokio::spawn(async move {
        let supervisor = session.supervisor();
        let mut queued: VecDeque<Command> = VecDeque::new();
        let mut commands_open = true;

        loop {
            let cmd = match queued.pop_front() {
                Some(cmd) => cmd,
                None => match cmd_rx.recv().await {
                    Some(cmd) => cmd,
                    None => break, // cmd_tx 已关闭，退出循环
                },
            };

            match cmd {
                Command::Submit(input) => {
                    let mut quit = false;
                    {
                        // 先换令牌再开始监听命令，紧随 Submit 的 Cancel 才能命中本回合
                        let cancel_token = supervisor.begin_turn();
                        let turn = session.run_turn_with(&input, cancel_token, Some(&event_tx));
                        tokio::pin!(turn);
                        loop {
                            tokio::select! {
                                _report = &mut turn => break,
                                next = cmd_rx.recv(), if commands_open => match next {
                                    Some(Command::Cancel) => supervisor.cancel(),
                                    Some(Command::Quit) => {
                                        supervisor.cancel();
                                        quit = true;
                                    }
                                    Some(other) => queued.push_back(other),
                                    None => commands_open = false,
                                },
                            }
                        }
                    }
                    if quit || (!commands_open && queued.is_empty()) {
                        break;
                    }
                }
                // 没有进行中的回合，忽略
                Command::Cancel => {}
                Command::Clear => {
                    session.clear();
                    tracing::info!("conversation cleared");
                }
                Command::Quit => break,
            }
        }
        session
    });

    (cmd_tx, event_rx, handle)
}
