fn main() -> Result<(), Box<dyn std::error::Error>> {
	tonic_build::configure().build_server(true).build_client(true).compile(
		&["src/protos/lumenflow.proto", "src/protos/controlplane.proto"],
		&["src/protos"],
	)?;
	Ok(())
}
