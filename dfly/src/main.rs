use dfly::bootstrap;
use dfly_util::default_logger;
use tracing::Level;

default_logger!(Level::INFO);

#[tokio::main]
async fn main() {
    bootstrap::start().await;
}
