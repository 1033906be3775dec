use anyhow::Result;
use clap::{Parser, Subcommand};
use rpc_lite::{CallOptions, RpcClient};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use user_rpc::proto::{CreateUserRequest, Empty, GetUserRequest, Pong, User};
use user_rpc::service::{CREATE_USER, GET_USER, PING};

/// Call the user.User RPC service.
#[derive(Parser, Debug)]
#[command(name = "user-rpc-client", version, about)]
struct Args {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Bearer token sent in the authorization metadata.
    #[arg(long)]
    token: Option<String>,

    /// Per-call deadline in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    CreateUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    GetUser {
        #[arg(long)]
        id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().parse_lossy("warn"))
        .init();

    let args = Args::parse();

    let mut options = CallOptions::new().with_timeout(Duration::from_millis(args.timeout_ms));
    if let Some(token) = &args.token {
        options = options.with_token(token);
    }

    let client = RpcClient::connect(args.addr.as_str()).await?;

    match args.command {
        Command::Ping => {
            let pong: Pong = client.unary(PING, &Empty {}, options).await?;
            println!("{}", pong.message);
        }
        Command::CreateUser { name, email } => {
            let user: User = client
                .unary(CREATE_USER, &CreateUserRequest { name, email }, options)
                .await?;
            println!("created user {}: {} <{}>", user.id, user.name, user.email);
        }
        Command::GetUser { id } => {
            let user: User = client.unary(GET_USER, &GetUserRequest { id }, options).await?;
            println!("user {}: {} <{}>", user.id, user.name, user.email);
        }
    }

    Ok(())
}
