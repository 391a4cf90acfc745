use agent_core::agent_loop::AgentLoop;
use agent_core::config::AppConfig;
use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::{Config as RlConfig, DefaultEditor};

const BANNER: &str = r#"
  mcp-agent: ask questions, the model calls tools on the server.

  Commands:
    /tools   List tools advertised by the server
    /models  List models offered by the backend
    /config  Show current config
    /help    Show this help
    /exit    Quit (also: exit, quit, Ctrl-D)
"#;

/// Run the interactive REPL until an exit sentinel or end of input.
pub async fn run(agent: &AgentLoop, config: &AppConfig) -> Result<()> {
    println!("{}", BANNER);
    println!(
        "  Model: {}  |  Server: {} ({})",
        config.provider.model,
        config.server.endpoint_url(),
        config.server.transport
    );
    println!();

    let rl_config = RlConfig::builder().auto_add_history(true).build();
    let history_path = AppConfig::data_dir().join("repl_history.txt");
    let mut rl = DefaultEditor::with_config(rl_config)?;
    let _ = rl.load_history(&history_path);

    loop {
        match rl.readline("\x1b[1;32mquery ❯\x1b[0m ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if is_exit_sentinel(input) {
                    println!("Goodbye!");
                    break;
                }

                if input.starts_with('/') {
                    if !handle_command(input, agent, config).await? {
                        break;
                    }
                    continue;
                }

                match agent.run(input).await {
                    Ok(answer) if answer.is_empty() => println!("(no response)"),
                    Ok(answer) => println!("{}", answer),
                    Err(e) => eprintln!("\x1b[0;31mError: {}\x1b[0m", e),
                }
                println!();
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = rl.save_history(&history_path);

    Ok(())
}

fn is_exit_sentinel(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

/// Handle a slash command. Returns `true` to continue the loop, `false` to exit.
async fn handle_command(input: &str, agent: &AgentLoop, config: &AppConfig) -> Result<bool> {
    let cmd = input.split_whitespace().next().unwrap_or(input);

    match cmd {
        "/exit" | "/quit" | "/q" => {
            println!("Goodbye!");
            return Ok(false);
        }
        "/tools" => {
            let tools = agent.catalog().snapshot();
            if tools.is_empty() {
                println!("  No tools advertised.");
            } else {
                println!("  Available tools ({}):", tools.len());
                for tool in tools {
                    let summary = tool.description.lines().next().unwrap_or("");
                    println!("    • {}  {}", tool.name, summary);
                }
            }
        }
        "/models" => {
            let models = agent.gateway().list_models().await;
            if models.is_empty() {
                println!("  No models reported.");
            } else {
                for model in models {
                    println!("    • {}", model);
                }
            }
        }
        "/config" => {
            let mut shown = config.clone();
            if shown.provider.api_key.is_some() {
                shown.provider.api_key = Some("********".into());
            }
            let toml_str = toml::to_string_pretty(&shown)?;
            println!("{}", toml_str);
        }
        "/help" | "/?" => println!("{}", BANNER),
        _ => {
            println!(
                "Unknown command: {}. Type /help for available commands.",
                cmd
            );
        }
    }

    Ok(true)
}
