//! cmcli
//!
//! Carme command line client
#![allow(missing_docs)]

use clap::{Parser, Subcommand};
use cmclient::{KernelManager, ServerSettings};
use log::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Optional URL to use as the base for API requests
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Optional authorization token
    #[arg(short, long, value_name = "TOKEN")]
    token: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List running kernels
    List,

    /// List available kernel specs
    Specs,

    /// Start a kernel, run a line of code, and shut the kernel down
    Run {
        /// The code to execute
        code: String,

        /// The kernel spec to run it with; the server default when omitted
        #[arg(short, long)]
        kernel: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let base_url = match args.url {
        Some(url) => url,
        None => String::from("http://localhost:8888"),
    };
    let mut settings = ServerSettings::new(&base_url);
    if let Some(token) = args.token {
        settings = settings.with_token(&token);
    }

    let manager = KernelManager::new(settings);

    let result = match args.command {
        Some(Commands::List) => list_kernels(&manager).await,
        Some(Commands::Specs) => list_specs(&manager).await,
        Some(Commands::Run { code, kernel }) => run_code(&manager, &code, kernel).await,
        None => {
            eprintln!("No command specified");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn list_kernels(manager: &KernelManager) -> Result<(), cmclient::CmError> {
    let kernels = manager.list_kernels(None).await?;
    println!("{}", serde_json::to_string_pretty(&kernels).unwrap());
    Ok(())
}

async fn list_specs(manager: &KernelManager) -> Result<(), cmclient::CmError> {
    let specs = manager.kernel_specs(None).await?;
    println!("{}", serde_json::to_string_pretty(&specs).unwrap());
    Ok(())
}

async fn run_code(
    manager: &KernelManager,
    code: &str,
    kernel: Option<String>,
) -> Result<(), cmclient::CmError> {
    let name = match kernel {
        Some(name) => name,
        None => manager.kernel_specs(None).await?.default,
    };

    info!("Starting kernel from spec '{}'", name);
    let session = manager.start_kernel(&name, None).await?;
    info!(
        "Kernel {} started; session {}",
        session.id(),
        session.client_id()
    );

    let future = session.execute(serde_json::json!({ "code": code }), false)?;
    future.on_iopub(|msg| {
        if msg.header.msg_type == "stream" {
            if let Some(text) = msg.content.get("text").and_then(|t| t.as_str()) {
                print!("{}", text);
            }
        }
    });
    future.done().await;
    future.dispose();

    session.shutdown().await?;
    Ok(())
}
