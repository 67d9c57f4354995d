use clap::Parser;
use signoz_sample::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    signoz_sample::run_main(Args::parse()).await
}
