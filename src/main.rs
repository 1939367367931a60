use anyhow::{Context, Result, bail};
use clap::Parser;
use request_dispatcher::config::DispatcherConfig;
use request_dispatcher::http::{
    CallResult, Method, RefreshPolicy, RequestBody, RequestDispatcher,
};
use request_dispatcher::oauth::{AppTokenClient, ClientCredentials};
use std::path::PathBuf;
use std::sync::Arc;

/// dispatch - issue HTTP calls through the retrying request dispatcher
///
/// Examples:
///   dispatch request get /helix/users -q login=shrum -H "Client-Id: abc"
///   dispatch token --client-id abc --client-secret xyz
#[derive(Parser, Debug)]
#[command(author, version = env!("DISPATCH_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (JSON); defaults to the user config directory
    #[arg(long, short = 'c', env = "DISPATCH_CONFIG", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Base URL, overriding the config file
    #[arg(long = "base-url", env = "DISPATCH_BASE_URL", value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Number of retries after the first attempt, overriding the config file
    #[arg(long, value_name = "N", global = true)]
    retries: Option<u32>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send one request and print the response body
    Request(RequestArgs),

    /// Fetch an app access token with the client-credentials grant
    Token(TokenArgs),
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
enum MethodArg {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<MethodArg> for Method {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Get => Method::Get,
            MethodArg::Post => Method::Post,
            MethodArg::Put => Method::Put,
            MethodArg::Patch => Method::Patch,
            MethodArg::Delete => Method::Delete,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    #[arg(value_enum, value_name = "METHOD")]
    method: MethodArg,

    /// Endpoint path appended to the base URL, e.g. /helix/users
    #[arg(value_name = "ENDPOINT")]
    endpoint: String,

    /// Query parameter as key=value (repeatable)
    #[arg(short = 'q', long = "query", value_name = "KEY=VALUE")]
    query: Vec<String>,

    /// Header line as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// Request body; parsed as JSON when it is valid JSON, sent verbatim otherwise
    #[arg(short = 'd', long = "data", value_name = "BODY")]
    data: Option<String>,

    /// Print status and response headers before the body
    #[arg(short = 'i', long)]
    include: bool,

    /// Bearer token sent as the Authorization header
    #[arg(long, env = "DISPATCH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// OAuth client ID; with a secret, expired tokens are refreshed automatically
    #[arg(long = "client-id", env = "TWITCH_CLIENT_ID")]
    client_id: Option<String>,

    /// OAuth client secret
    #[arg(long = "client-secret", env = "TWITCH_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// OAuth server URL (defaults to https://id.twitch.tv)
    #[arg(long = "oauth-url", value_name = "URL")]
    oauth_url: Option<String>,
}

impl ClientArgs {
    fn token_client(&self) -> Result<Option<AppTokenClient>> {
        match (&self.client_id, &self.client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(Some(AppTokenClient::new(
                ClientCredentials {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                },
                self.oauth_url.clone(),
            )?)),
            _ => Ok(None),
        }
    }
}

#[derive(clap::Args, Debug)]
struct TokenArgs {
    #[command(flatten)]
    client: ClientArgs,
}

fn parse_query(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("Invalid query parameter '{}'. Expected KEY=VALUE.", pair),
        })
        .collect()
}

fn parse_body(data: Option<String>) -> RequestBody {
    match data {
        None => RequestBody::Empty,
        Some(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => RequestBody::Structured(value),
            Err(_) => RequestBody::Text(text),
        },
    }
}

fn print_result(result: &CallResult, include: bool) {
    if include {
        println!("HTTP {}", result.status.unwrap_or_default());
        for (name, value) in &result.response_headers {
            println!("{}: {}", name, value);
        }
        println!();
    }
    println!("{}", result.raw_response.as_deref().unwrap_or_default());
}

async fn run_request(config: DispatcherConfig, args: RequestArgs) -> Result<()> {
    let mut dispatcher = RequestDispatcher::from_config(&config)?;

    if let Some(token) = &args.token {
        dispatcher.set_oauth_header(Some(format!("Authorization: Bearer {}", token)));
    }
    if let Some(client) = args.client.token_client()? {
        dispatcher.set_refresh_policy(
            RefreshPolicy::new(config.refresh_statuses.clone()).with_refresher(Arc::new(client)),
        );
    }

    let query = parse_query(&args.query)?;
    let query: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let headers: Vec<&str> = args.headers.iter().map(String::as_str).collect();

    let result = dispatcher
        .request(
            args.method.into(),
            &args.endpoint,
            &query,
            parse_body(args.data),
            &headers,
        )
        .await;

    match result {
        Ok(result) => {
            print_result(&result, args.include);
            Ok(())
        }
        Err(e) => {
            if let Some(body) = e.body().filter(|b| !b.is_empty()) {
                eprintln!("{}", body);
            }
            Err(e).with_context(|| {
                format!("{} {} failed", Method::from(args.method), args.endpoint)
            })
        }
    }
}

async fn run_token(args: TokenArgs) -> Result<()> {
    let Some(client) = args.client.token_client()? else {
        bail!("--client-id and --client-secret (or TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET) are required");
    };
    let token = client.fetch_token().await?;
    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let mut config = DispatcherConfig::load_or_default(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(retries) = cli.retries {
        config.num_auto_retries = retries;
    }

    match cli.command {
        Commands::Request(args) => run_request(config, args).await?,
        Commands::Token(args) => run_token(args).await?,
    }
    Ok(())
}
