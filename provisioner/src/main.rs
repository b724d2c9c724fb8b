use provisioner::cli::Args;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = argh::from_env::<Args>();
    if let Err(e) = args.run() {
        tracing::error!("fatal error: {e:#}");
        std::process::exit(1);
    }
}
