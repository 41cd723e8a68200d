use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webtty_server::app::App;
use webtty_server::config::{self, Options};

/// Share your terminal as a web application.
#[derive(Parser, Debug)]
#[command(name = "webtty", version, about)]
struct Cli {
    /// Config file path (TOML); defaults to ~/.webtty when present
    #[arg(long)]
    config: Option<String>,

    /// IP address to listen on (all interfaces when omitted)
    #[arg(short, long)]
    address: Option<String>,

    /// Port number to listen on
    #[arg(short, long)]
    port: Option<String>,

    /// Permit clients to write to the TTY
    #[arg(short = 'w', long)]
    permit_write: bool,

    /// Credential for basic auth and the WebSocket auth token ("user:pass")
    #[arg(short, long)]
    credential: Option<String>,

    /// Gate every route behind HTTP basic authentication
    #[arg(long)]
    enable_basic_auth: bool,

    /// Prefix all routes with a random URL segment
    #[arg(short = 'r', long)]
    enable_random_url: bool,

    /// Length of the random URL segment
    #[arg(long)]
    random_url_length: Option<usize>,

    /// Serve this file for / instead of the embedded index
    #[arg(long)]
    index_file: Option<String>,

    /// Enable TLS termination
    #[arg(short = 't', long)]
    enable_tls: bool,

    #[arg(long)]
    tls_crt_file: Option<String>,

    #[arg(long)]
    tls_key_file: Option<String>,

    /// Require and verify client certificates
    #[arg(long)]
    enable_tls_client_auth: bool,

    #[arg(long)]
    tls_ca_crt_file: Option<String>,

    /// Window title template; placeholders: {{command}}, {{hostname}},
    /// {{remote_addr}}, {{pid}}
    #[arg(long)]
    title_format: Option<String>,

    /// Tell the front end to reconnect after a disconnect
    #[arg(long)]
    enable_reconnect: bool,

    /// Reconnect delay hint in seconds
    #[arg(long)]
    reconnect_time: Option<u32>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long)]
    max_connection: Option<i64>,

    /// Accept exactly one session, then stop listening
    #[arg(long)]
    once: bool,

    /// Shut down after this many idle seconds (0 = disabled)
    #[arg(long)]
    timeout: Option<u64>,

    /// Allow clients to append ?arg= values to the command line
    #[arg(long)]
    permit_arguments: bool,

    /// Signal number sent to the child on session teardown
    #[arg(long)]
    close_signal: Option<i32>,

    /// Run child processes as this user
    #[arg(long)]
    run_as_user: Option<String>,

    /// Initial terminal width (0 = defer to the client)
    #[arg(long)]
    width: Option<u16>,

    /// Initial terminal height (0 = defer to the client)
    #[arg(long)]
    height: Option<u16>,

    /// Command to run, with its arguments
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "webtty_server=info,webtty=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut options = Options::default();
    if let Some(path) = cli.config.clone().or_else(config::default_config_path) {
        tracing::info!(path = %path, "loading config file");
        options.apply_config_file(&path)?;
    }
    apply_cli(&mut options, &cli);

    let app = App::new(cli.command.clone(), options)?;
    app.run().await
}

/// Flags override config-file values; boolean flags only switch features on.
fn apply_cli(options: &mut Options, cli: &Cli) {
    macro_rules! set {
        ($field:ident) => {
            if let Some(value) = cli.$field.clone() {
                options.$field = value;
            }
        };
    }
    set!(address);
    set!(port);
    set!(credential);
    set!(random_url_length);
    set!(index_file);
    set!(tls_crt_file);
    set!(tls_key_file);
    set!(tls_ca_crt_file);
    set!(title_format);
    set!(reconnect_time);
    set!(max_connection);
    set!(timeout);
    set!(close_signal);
    set!(run_as_user);
    set!(width);
    set!(height);

    options.permit_write |= cli.permit_write;
    options.enable_basic_auth |= cli.enable_basic_auth;
    options.enable_random_url |= cli.enable_random_url;
    options.enable_tls |= cli.enable_tls;
    options.enable_tls_client_auth |= cli.enable_tls_client_auth;
    options.enable_reconnect |= cli.enable_reconnect;
    options.once |= cli.once;
    options.permit_arguments |= cli.permit_arguments;
}
