use block_indexer_lib::commands::{run_batch_once, BatchArgs};
use clap::Parser;

#[tokio::main]
async fn main() {
    let args = BatchArgs::parse();
    let exit_code = run_batch_once(args, "batch").await;
    std::process::exit(exit_code);
}
