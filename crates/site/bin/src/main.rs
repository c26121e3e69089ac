//! Quill site binary.
//!
//! Runs one collaborative-editing site: the mutual-exclusion controller
//! plus the overlay network layer. The editor front-end is a separate
//! process wired to this one's stdin/stdout; every log line goes to
//! stderr so the protocol stream stays clean.

use std::path::PathBuf;

use clap::Parser;
use quill_proto::SiteId;
use quill_site::{SiteConfig, SiteRuntime};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Site command line arguments.
#[derive(Parser, Debug)]
#[command(name = "quill-site")]
#[command(about = "One quill site: mutual-exclusion controller plus overlay network")]
struct Args {
	/// Unique site identifier; generated when omitted
	#[arg(long, value_name = "ID")]
	site_id: Option<String>,

	/// Directory for the diff log and the cut store
	#[arg(short, long, value_name = "DIR", default_value = "./output")]
	output_dir: PathBuf,

	/// TCP port to listen on for peers; 0 picks a free port
	#[arg(short, long, default_value_t = 0)]
	listen_port: u16,

	/// host:port of an existing member to join through; repeatable
	#[arg(short, long = "bootstrap", value_name = "HOST:PORT")]
	bootstrap: Vec<String>,

	/// Document name; the diff log lives at <output-dir>/<filename>.log
	#[arg(short, long, default_value = "document")]
	filename: String,

	/// Verbose logging and manual commit triggers in the editor
	#[arg(short, long)]
	debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_max_level(if args.debug {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.with_writer(std::io::stderr)
		.init();

	let site_id = args.site_id.map(SiteId).unwrap_or_else(SiteId::generate);
	info!(site = %site_id, "starting quill-site");

	let config = SiteConfig {
		site_id,
		output_dir: args.output_dir,
		listen_port: args.listen_port,
		bootstrap: args.bootstrap,
		filename: args.filename,
		debug: args.debug,
	};

	let shutdown = CancellationToken::new();
	let runtime = SiteRuntime::start(
		config,
		tokio::io::stdin(),
		tokio::io::stdout(),
		shutdown.clone(),
	)
	.await?;

	runtime.wait().await;
	Ok(())
}
