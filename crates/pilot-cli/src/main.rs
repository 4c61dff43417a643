use anyhow::{anyhow, Result};
use clap::Parser;
use pilot_agent::{AgentEngine, LoopEvents};
use pilot_core::AgentConfig;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pilot")]
#[command(about = "Local coding agent loop", long_about = None)]
struct Cli {
    /// Non-interactive mode: run one prompt, print the final answer, exit.
    #[arg(short = 'p', long = "print")]
    prompt: Option<String>,

    /// Session ID; turns in the same session share conversation history.
    #[arg(long, default_value = "default")]
    session: String,

    /// Workspace root the agent operates in.
    #[arg(short = 'C', long = "workspace", default_value = ".")]
    workspace: PathBuf,

    /// Override the model for this invocation.
    #[arg(long)]
    model: Option<String>,

    /// Maximum steps per turn.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Verbose logging to stderr.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli
        .workspace
        .canonicalize()
        .map_err(|e| anyhow!("workspace {}: {e}", cli.workspace.display()))?;

    let mut cfg = AgentConfig::ensure(&workspace)?;
    if let Some(model) = &cli.model {
        cfg.llm.model = model.clone();
    }
    if let Some(max_steps) = cli.max_steps {
        cfg.agent_loop.max_steps = max_steps;
    }

    let mut engine = AgentEngine::with_config(&workspace, cfg)?;
    engine.set_verbose(cli.verbose);
    engine.set_events(progress_events());

    match cli.prompt {
        Some(prompt) => {
            let reply = engine.run_once(&cli.session, &prompt)?;
            println!("{reply}");
            Ok(())
        }
        None => repl(&engine, &cli.session),
    }
}

fn progress_events() -> LoopEvents {
    LoopEvents {
        on_tool_step: Some(Arc::new(|step, tool| {
            eprintln!("[step {step}] {tool}");
        })),
        on_tool_error: Some(Arc::new(|detail| {
            eprintln!("[tool error] {detail}");
        })),
        on_verify_error: Some(Arc::new(|detail| {
            eprintln!("[verify failed] {detail}");
        })),
        on_info: Some(Arc::new(|msg| {
            eprintln!("[info] {msg}");
        })),
    }
}

fn repl(engine: &AgentEngine, session: &str) -> Result<()> {
    println!("pilot — local coding agent. /reset clears the session, /exit quits.");
    println!("Session: {session}");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "/exit" | "/quit" => break,
            "/reset" => {
                engine.store().clear(session)?;
                println!("session cleared.");
            }
            _ => match engine.run_once(session, input) {
                Ok(reply) => println!("{reply}"),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }
    Ok(())
}
