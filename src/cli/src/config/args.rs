#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Values {
  /// Alternative configuration location
  #[arg(short, long)]
  pub config: Option<String>,

  /// Log everything down to trace level
  #[arg(long)]
  pub trace: bool,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
  /// Check the register map and exit
  Validate,

  /// Read every register once
  ReadAll,

  /// Read a single register
  Read { name: String },

  /// Write a single register
  Write { name: String, value: String },

  /// Poll registers and print changes until interrupted
  Monitor,
}

pub fn parse() -> Values {
  clap::Parser::parse()
}
