use std::process::ExitCode;

fn main() -> ExitCode {
    match bitnode_node::cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
