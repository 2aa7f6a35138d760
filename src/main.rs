#[tokio::main]
async fn main() {
    let code = harvester::cli::run().await;
    std::process::exit(code);
}
