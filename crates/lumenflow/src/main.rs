use clap::Parser;

#[tokio::main]
async fn main() {
	let cli = lumenflow::bootstrap::Cli::parse();
	let exit = lumenflow::bootstrap::run(cli).await;
	std::process::exit(exit);
}
