//! todowa 命令行入口
//!
//! 加载配置、初始化日志、装配 Orchestrator，然后以用户 "local" 逐行处理标准输入。

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use todowa::agent::{build_orchestrator, Collaborators};
use todowa::config::load_config;

const LOCAL_USER: &str = "local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    todowa::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let orchestrator = build_orchestrator(&cfg, Collaborators::from_config(&cfg));

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout.write_all(b"> ").await?;
    stdout.flush().await?;
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if matches!(line, "quit" | "exit") {
            break;
        }
        if !line.is_empty() {
            let reply = orchestrator.process(LOCAL_USER, line).await;
            stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}
