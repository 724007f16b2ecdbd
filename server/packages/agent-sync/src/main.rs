fn main() {
    if let Err(err) = agent_sync::cli::run_agent_sync() {
        tracing::error!(error = %err, "agent-sync failed");
        std::process::exit(1);
    }
}
