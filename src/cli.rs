use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TCP port the relay should listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}
