// src/bin/penguin.rs
//
// Minimal CLI front end: parses a config path and an input message, wires an
// `Orchestrator`, streams events to stdout as newline-delimited JSON, and
// exits with the process codes from `penguin::penguin::error::exit_code`.
// Terminal/TUI rendering and real model provider wire formats are out of
// scope here (§1); this binary exists only to give the library a runnable
// entry point.

use penguin::penguin::action::ToolRegistry;
use penguin::penguin::agent::Persona;
use penguin::penguin::config::PenguinConfig;
use penguin::penguin::error::exit_code;
use penguin::penguin::orchestrator::{Orchestrator, OrchestratorConfig};
use penguin::penguin::permission::PermissionMode;
use penguin::penguin::provider::EchoProvider;
use penguin::penguin::tools::{ReadFileTool, WriteFileTool};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

fn usage() -> ! {
    eprintln!("usage: penguin <config.toml> <message> [--mode=single_turn|response|task]");
    std::process::exit(exit_code::CONFIGURATION_ERROR);
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        usage();
    }

    let config_path = PathBuf::from(&args[0]);
    let message = args[1].clone();
    let mode = args
        .iter()
        .skip(2)
        .find_map(|a| a.strip_prefix("--mode=").map(str::to_string))
        .unwrap_or_else(|| "response".to_string());

    let penguin_config = match PenguinConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(exit_code::CONFIGURATION_ERROR as u8);
        }
    };

    let orchestrator_config = OrchestratorConfig {
        session_store_root: std::env::temp_dir().join("penguin-sessions"),
        default_permission_mode: PermissionMode::from(penguin_config.security.mode),
        workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        context_window_tokens: penguin_config.model.context_window,
        category_shares: Default::default(),
        max_iterations: 5000,
        no_action_completion: true,
    };

    let (orchestrator, mut events) = match Orchestrator::new(
        orchestrator_config,
        Arc::new(EchoProvider),
        Box::new(|| ToolRegistry::new().register("read_file", Arc::new(ReadFileTool)).register("write_file", Arc::new(WriteFileTool))),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("failed to start orchestrator: {e}");
            return ExitCode::from(exit_code::UNHANDLED_ERROR as u8);
        }
    };

    orchestrator.register_agent(
        "cli",
        Persona {
            name: "cli".to_string(),
            system_prompt: "You are Penguin, an autonomous software-engineering agent.".to_string(),
            model: penguin_config.model.name.clone(),
            permission_mode: PermissionMode::from(penguin_config.security.mode),
        },
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => log::warn!("penguin: failed to serialize event: {e}"),
            }
        }
    });

    let result = orchestrator.process("cli", &mode, message).await;
    drop(orchestrator);
    let _ = printer.await;

    match result {
        Ok(_) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("run failed: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
