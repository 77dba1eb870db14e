//! Hive - Rust 智能体回合编排运行时
//!
//! 入口：初始化日志、加载配置、创建会话，逐行读取 stdin 作为用户输入并打印回合事件。
//! `/clear` 清空对话，`/quit` 退出，Ctrl+C 取消当前回合。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{spawn_session, Command};
use hive::react::TurnEvent;
use hive::tools::{AutoApprove, ConfirmationChannel, DenyAll, EchoTool, ToolRegistry};
use hive::{create_agent_components, observability, Session};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    // 行模式下无法交互确认：未开启 auto_approve 时一律拒绝需确认的工具
    let confirmation: Arc<dyn ConfirmationChannel> = if cfg.tools.auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(DenyAll)
    };
    let components =
        create_agent_components(&cfg, tools, confirmation).context("Failed to create agent")?;

    let (cmd_tx, mut event_rx, handle) = spawn_session(Session::new(Arc::new(components)));

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    // 弱引用：stdin 结束后命令通道可以正常关闭
    let ctrl_c_tx = cmd_tx.downgrade();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match ctrl_c_tx.upgrade() {
                Some(tx) => {
                    let _ = tx.send(Command::Cancel);
                }
                None => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        let cmd = match line {
            "" => continue,
            "/quit" => Command::Quit,
            "/clear" => Command::Clear,
            input => Command::Submit(input.to_string()),
        };
        let quit = cmd == Command::Quit;
        if cmd_tx.send(cmd).is_err() || quit {
            break;
        }
    }
    drop(cmd_tx);

    handle.await.context("Session task failed")?;
    let _ = printer.await;
    Ok(())
}

fn print_event(event: &TurnEvent) {
    use std::io::Write;

    match event {
        TurnEvent::TurnStarted { .. } => {}
        TurnEvent::DelegationNotice { notice, .. } => println!("[{notice}]"),
        TurnEvent::TextDelta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        TurnEvent::ToolStarted { name, args, .. } => println!("\n-> {name} {args}"),
        TurnEvent::ToolFinished { result } => {
            let text: String = result.model_text().chars().take(200).collect();
            println!("<- {text}");
        }
        TurnEvent::TurnDone { notice, .. } => {
            println!();
            if let Some(notice) = notice {
                println!("[{notice}]");
            }
        }
        TurnEvent::TurnError { kind, message } => println!("\n[error: {kind}] {message}"),
        TurnEvent::TurnCancelled => println!("\n[cancelled]"),
    }
}
