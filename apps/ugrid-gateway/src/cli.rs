use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ugrid-gateway",
    version,
    about = "Microgrid battery control gateway"
)]
pub struct Args {
    /// Overrides GATEWAY_HTTP_HOST.
    #[arg(long)]
    pub host: Option<String>,
    /// Overrides GATEWAY_HTTP_PORT.
    #[arg(long)]
    pub port: Option<u16>,
    /// Print the resolved configuration as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}
