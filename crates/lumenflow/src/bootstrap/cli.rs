use clap::Parser;

#[derive(Parser, Debug)]
#[clap(
	name = "lumenflow",
	about = "Streaming pipeline for Stellar ledger data: raw ledgers in, typed events and columnar files out",
	version
)]
pub struct Cli {
	/// Console log format: pretty, json or off
	#[clap(long, default_value = "pretty", env = "CONSOLE_LOGGING")]
	pub console_logging: String,
}
